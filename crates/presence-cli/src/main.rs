use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::detector::{DetectParams, ScrfdDetector};
use presence_core::types::EmployeeId;
use presence_hw::Camera;
use std::path::PathBuf;

mod dataset;

use dataset::{DatasetCapture, Offer};

// `#[zbus::proxy]` generates `AttendanceProxy` (async) for the daemon interface.
#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn start_stream(&self) -> zbus::Result<String>;
    async fn stop_stream(&self) -> zbus::Result<String>;
    async fn latest_frame(&self) -> zbus::Result<Vec<u8>>;
    async fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    async fn clock_in(
        &self,
        employee_id: i64,
        has_location: bool,
        latitude: f64,
        longitude: f64,
    ) -> zbus::Result<String>;
    async fn attendance_today(&self) -> zbus::Result<String>;
    async fn attendance_history(&self, limit: u32) -> zbus::Result<String>;
    async fn delete_attendance(&self, id: i64) -> zbus::Result<bool>;
    async fn register_employee(&self, id: i64, name: &str, role: &str) -> zbus::Result<String>;
    async fn list_employees(&self) -> zbus::Result<String>;
    async fn next_employee_id(&self) -> zbus::Result<i64>;
    async fn set_employee_active(&self, id: i64, active: bool) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or stop the camera recognition stream
    Stream {
        #[command(subcommand)]
        action: StreamAction,
    },
    /// Save the latest annotated frame as JPEG
    Snapshot {
        /// Output file
        out: PathBuf,
    },
    /// Recognize the face in an image file (does not record attendance)
    Recognize {
        image: PathBuf,
    },
    /// Record attendance manually for an employee
    ClockIn {
        id: i64,
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },
    /// Manage the employee directory
    Employee {
        #[command(subcommand)]
        action: EmployeeAction,
    },
    /// Query or edit attendance records
    Attendance {
        #[command(subcommand)]
        action: AttendanceAction,
    },
    /// Show daemon status
    Status,
    /// List V4L2 capture devices (bypasses the daemon)
    Devices,
    /// Capture face crops for training (bypasses the daemon)
    CaptureDataset {
        /// Employee id the samples belong to
        id: i64,
        /// Number of samples to save
        #[arg(long, default_value_t = 100)]
        count: usize,
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Output directory
        #[arg(long, default_value = "dataset")]
        out: PathBuf,
        /// Directory holding det_500m.onnx
        #[arg(long)]
        model_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum StreamAction {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum EmployeeAction {
    /// Register a new employee
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        role: String,
        /// Defaults to the next free id
        #[arg(long)]
        id: Option<i64>,
    },
    List,
    /// Print the next free employee id
    NextId,
    /// Stop recognizing an employee and refuse their clock-ins
    Deactivate {
        id: i64,
    },
    /// Undo a deactivation
    Activate {
        id: i64,
    },
}

#[derive(Subcommand)]
enum AttendanceAction {
    Today,
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Delete a record by its row id
    Delete {
        id: i64,
    },
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("presenced is not reachable; is the daemon running?")
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string())
        ),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::CaptureDataset {
            id,
            count,
            device,
            out,
            model_dir,
        } => capture_dataset(EmployeeId(id), count, &device, out, model_dir),
        command => run_remote(cli.system, command).await,
    }
}

async fn run_remote(system: bool, command: Commands) -> Result<()> {
    let proxy = connect(system).await?;

    match command {
        Commands::Stream { action: StreamAction::Start } => print_json(&proxy.start_stream().await?),
        Commands::Stream { action: StreamAction::Stop } => print_json(&proxy.stop_stream().await?),
        Commands::Snapshot { out } => {
            let jpeg = proxy.latest_frame().await?;
            std::fs::write(&out, &jpeg).with_context(|| format!("failed to write {}", out.display()))?;
            println!("Saved {} bytes to {}", jpeg.len(), out.display());
        }
        Commands::Recognize { image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
            print_json(&proxy.recognize(&bytes).await?);
        }
        Commands::ClockIn { id, lat, lon } => {
            let reply = match lat.zip(lon) {
                Some((lat, lon)) => proxy.clock_in(id, true, lat, lon).await?,
                None => proxy.clock_in(id, false, 0.0, 0.0).await?,
            };
            print_json(&reply);
        }
        Commands::Employee { action } => match action {
            EmployeeAction::Add { name, role, id } => {
                let id = match id {
                    Some(id) => id,
                    None => proxy.next_employee_id().await?,
                };
                print_json(&proxy.register_employee(id, &name, &role).await?);
            }
            EmployeeAction::List => print_json(&proxy.list_employees().await?),
            EmployeeAction::NextId => println!("{}", proxy.next_employee_id().await?),
            EmployeeAction::Deactivate { id } => set_active(&proxy, id, false).await?,
            EmployeeAction::Activate { id } => set_active(&proxy, id, true).await?,
        },
        Commands::Attendance { action } => match action {
            AttendanceAction::Today => print_json(&proxy.attendance_today().await?),
            AttendanceAction::History { limit } => print_json(&proxy.attendance_history(limit).await?),
            AttendanceAction::Delete { id } => {
                if proxy.delete_attendance(id).await? {
                    println!("Deleted attendance record {id}");
                } else {
                    bail!("no attendance record with id {id}");
                }
            }
        },
        Commands::Status => print_json(&proxy.status().await?),
        Commands::Devices | Commands::CaptureDataset { .. } => bail!("command does not use the daemon"),
    }

    Ok(())
}

async fn set_active(proxy: &AttendanceProxy<'_>, id: i64, active: bool) -> Result<()> {
    if !proxy.set_employee_active(id, active).await? {
        bail!("no employee with id {id}");
    }
    println!("Employee {id} {}", if active { "activated" } else { "deactivated" });
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn capture_dataset(employee: EmployeeId, count: usize, device: &str, out: PathBuf, model_dir: PathBuf) -> Result<()> {
    let model = model_dir.join(presence_core::DETECTOR_MODEL_FILE);
    let detector = ScrfdDetector::load(&model.to_string_lossy()).context("failed to load face detector")?;
    let camera = Camera::open(device, 640, 480)?;
    let mut stream = camera.stream()?;
    let mut capture = DatasetCapture::new(detector, DetectParams::default(), out, employee)?;

    println!("Capturing {count} samples for employee {employee}; look at the camera");
    let (mut dark, mut faceless) = (0usize, 0usize);
    let max_attempts = count * 10;

    for _ in 0..max_attempts {
        if capture.saved() >= count {
            break;
        }
        match capture.offer(&stream.next_frame()?)? {
            Offer::Saved(path) => println!("[{}/{count}] {}", capture.saved(), path.display()),
            Offer::Dark => dark += 1,
            Offer::NoFace => faceless += 1,
        }
    }

    println!(
        "Saved {} samples ({dark} dark frames, {faceless} frames without a face skipped)",
        capture.saved()
    );
    if capture.saved() < count {
        bail!("gave up after {max_attempts} frames");
    }
    Ok(())
}
