use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable person identifier shared by the classifier labels and the employee directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub i64);

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned face rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip the region to a `frame_width × frame_height` frame.
    ///
    /// Returns `None` when nothing of the region lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<FaceRegion> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(FaceRegion {
            x: self.x,
            y: self.y,
            width,
            height,
        })
    }
}

/// Raw classifier output for one face crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: EmployeeId,
    /// Distance to the nearest enrolled sample (lower = more similar).
    pub distance: f64,
}

/// One scored recognition of one region in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionSample {
    pub label: EmployeeId,
    pub raw_distance: f64,
    /// Normalized confidence in [0, 100].
    pub confidence: u8,
    pub region: FaceRegion,
    pub captured_at: NaiveDateTime,
}

/// Employee directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
    pub role: String,
    pub active: bool,
}

/// Optional geolocation attached to a clock-in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Which entry point produced an attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockInSource {
    Camera,
    Manual,
}

impl ClockInSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockInSource::Camera => "camera",
            ClockInSource::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "camera" => Some(ClockInSource::Camera),
            "manual" => Some(ClockInSource::Manual),
            _ => None,
        }
    }
}

/// Whether a check-in happened before the configured lateness cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalStatus {
    OnTime,
    Late,
}

/// An attendance event that has not been written yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttendance {
    pub employee_id: EmployeeId,
    pub name: String,
    pub role: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub location: Option<GeoPoint>,
    pub source: ClockInSource,
}

/// A committed attendance event. Immutable once written; unique per (employee, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub employee_id: EmployeeId,
    pub name: String,
    pub role: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub location: Option<GeoPoint>,
    pub source: ClockInSource,
}

impl AttendanceEvent {
    pub fn status(&self, late_after: NaiveTime) -> ArrivalStatus {
        if self.time < late_after {
            ArrivalStatus::OnTime
        } else {
            ArrivalStatus::Late
        }
    }
}
