//! presence-hw: camera capture for the attendance station.
//!
//! V4L2 access through `v4l`, with YUYV/MJPEG/GREY/Y16 conversion to RGB
//! frames and a dark-frame check.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
