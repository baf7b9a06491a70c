use crate::engine::{EngineError, EngineHandle, LatestFrame};
use chrono::{Local, NaiveTime};
use presence_core::committer::{AttendanceCommitter, CommitError, CommitOutcome};
use presence_core::types::{AttendanceEvent, ArrivalStatus, ClockInSource, EmployeeId, GeoPoint};
use presence_store::{Store, StoreError};
use serde::Serialize;
use tokio::sync::watch;
use zbus::interface;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
pub struct PresenceService {
    engine: EngineHandle,
    store: Store,
    frames: watch::Receiver<LatestFrame>,
    late_after: NaiveTime,
}

impl PresenceService {
    pub fn new(engine: EngineHandle, store: Store, frames: watch::Receiver<LatestFrame>, late_after: NaiveTime) -> Self {
        Self {
            engine,
            store,
            frames,
            late_after,
        }
    }
}

/// An attendance row plus its on-time/late classification.
#[derive(Serialize)]
struct AttendanceView<'a> {
    #[serde(flatten)]
    event: &'a AttendanceEvent,
    status: ArrivalStatus,
}

fn attendance_json(events: &[AttendanceEvent], late_after: NaiveTime) -> zbus::fdo::Result<String> {
    let views: Vec<AttendanceView<'_>> = events
        .iter()
        .map(|event| AttendanceView {
            event,
            status: event.status(late_after),
        })
        .collect();
    to_json(&views)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::NotStreaming | EngineError::AlreadyStreaming => zbus::fdo::Error::Failed(e.to_string()),
        EngineError::Recognize(presence_core::recognize::RecognizeError::Decode(_)) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => {
            tracing::warn!(error = %other, "engine request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    match e {
        StoreError::InvalidInput(_) | StoreError::EmployeeExists(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "storage failure");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn commit_error(e: CommitError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "manual clock-in failed");
    zbus::fdo::Error::Failed(e.to_string())
}

impl PresenceService {
    /// Run a blocking store call off the D-Bus executor.
    async fn with_store<T, E, F>(&self, call: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<JoinFailed> + Send + 'static,
        F: FnOnce(Store) -> Result<T, E> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || call(store))
            .await
            .map_err(|e| E::from(JoinFailed(e.to_string())))?
    }
}

/// A store call panicked or was cancelled.
#[derive(Debug)]
struct JoinFailed(String);

impl From<JoinFailed> for zbus::fdo::Error {
    fn from(e: JoinFailed) -> Self {
        tracing::error!(error = %e.0, "store task failed");
        zbus::fdo::Error::Failed(format!("store task failed: {}", e.0))
    }
}

#[interface(name = "org.presence.Attendance1")]
impl PresenceService {
    /// Open the camera and start the debounced recognition loop.
    async fn start_stream(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_stream requested");
        let session = self.engine.start_stream().await.map_err(engine_error)?;
        Ok(serde_json::json!({ "session": session.to_string() }).to_string())
    }

    /// Stop the running stream and release the camera.
    async fn stop_stream(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_stream requested");
        let frames = self.engine.stop_stream().await.map_err(engine_error)?;
        Ok(serde_json::json!({ "frames_processed": frames }).to_string())
    }

    /// The most recent annotated frame as JPEG bytes.
    async fn latest_frame(&self) -> zbus::fdo::Result<Vec<u8>> {
        match self.frames.borrow().as_ref() {
            Some(jpeg) => Ok(jpeg.as_ref().clone()),
            None => Err(zbus::fdo::Error::Failed("no stream is running".into())),
        }
    }

    /// Recognize the largest face in an encoded image. Never records attendance.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "recognize requested");
        let result = self.engine.recognize(image).await.map_err(engine_error)?;
        to_json(&result)
    }

    /// Manual clock-in for an employee id, optionally with a location.
    async fn clock_in(
        &self,
        employee_id: i64,
        has_location: bool,
        latitude: f64,
        longitude: f64,
    ) -> zbus::fdo::Result<String> {
        let id = EmployeeId(employee_id);
        let location = has_location.then_some(GeoPoint { latitude, longitude });
        tracing::info!(employee_id = %id, has_location, "clock_in requested");

        let now = Local::now().naive_local();
        let outcome = self
            .with_store(move |store| {
                let committer = AttendanceCommitter::new(store.clone(), store.clone());
                let outcome = committer
                    .commit(id, now, location, ClockInSource::Manual)
                    .map_err(commit_error)?;
                if matches!(outcome, CommitOutcome::Committed(_)) {
                    if let Err(e) = store.log_access(id, now) {
                        tracing::warn!(employee_id = %id, error = %e, "failed to write access log");
                    }
                }
                Ok::<_, zbus::fdo::Error>(outcome)
            })
            .await?;

        let reply = match &outcome {
            CommitOutcome::Committed(event) => {
                serde_json::json!({
                    "result": "committed",
                    "event": event,
                    "status": event.status(self.late_after),
                })
            }
            CommitOutcome::AlreadyCommittedToday { existing_time } => serde_json::json!({
                "result": "already_committed_today",
                "existing_time": existing_time,
            }),
            CommitOutcome::UnknownIdentity => serde_json::json!({ "result": "unknown_identity" }),
        };
        Ok(reply.to_string())
    }

    /// Today's check-ins, earliest first.
    async fn attendance_today(&self) -> zbus::fdo::Result<String> {
        let today = Local::now().date_naive();
        let events = self
            .with_store(move |store| store.attendance_for_date(today).map_err(store_error))
            .await?;
        attendance_json(&events, self.late_after)
    }

    /// Most recent check-ins, newest first.
    async fn attendance_history(&self, limit: u32) -> zbus::fdo::Result<String> {
        let events = self
            .with_store(move |store| store.attendance_history(limit).map_err(store_error))
            .await?;
        attendance_json(&events, self.late_after)
    }

    /// Delete one attendance record by its row id.
    async fn delete_attendance(&self, id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(attendance_id = id, "delete_attendance requested");
        self.with_store(move |store| store.delete_attendance(id).map_err(store_error))
            .await
    }

    async fn register_employee(&self, id: i64, name: &str, role: &str) -> zbus::fdo::Result<String> {
        let (name, role) = (name.to_string(), role.to_string());
        let employee = self
            .with_store(move |store| {
                store
                    .register_employee(EmployeeId(id), &name, &role)
                    .map_err(store_error)
            })
            .await?;
        to_json(&employee)
    }

    async fn list_employees(&self) -> zbus::fdo::Result<String> {
        let employees = self
            .with_store(|store| store.list_employees().map_err(store_error))
            .await?;
        to_json(&employees)
    }

    /// The id to suggest for the next registration.
    async fn next_employee_id(&self) -> zbus::fdo::Result<i64> {
        let id = self
            .with_store(|store| store.next_employee_id().map_err(store_error))
            .await?;
        Ok(id.0)
    }

    /// Mark an employee active or inactive. Inactive employees are not
    /// recognized and cannot clock in. Returns false for an unknown id.
    async fn set_employee_active(&self, id: i64, active: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(employee_id = id, active, "set_employee_active requested");
        self.with_store(move |store| store.set_employee_active(EmployeeId(id), active).map_err(store_error))
            .await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self.engine.status().await.map_err(engine_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": engine,
            "late_after": self.late_after,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (PresenceService, Store) {
        let store = Store::open_in_memory().unwrap();
        let (_tx, frames) = watch::channel(None);
        let late_after = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let service = PresenceService::new(EngineHandle::detached(), store.clone(), frames, late_after);
        (service, store)
    }

    #[tokio::test]
    async fn test_deactivated_employee_cannot_clock_in() {
        let (service, store) = service();
        service.register_employee(101, "Ana", "Welder").await.unwrap();
        assert!(service.set_employee_active(101, false).await.unwrap());
        assert!(!service.set_employee_active(999, false).await.unwrap());

        let reply: serde_json::Value =
            serde_json::from_str(&service.clock_in(101, false, 0.0, 0.0).await.unwrap()).unwrap();
        assert_eq!(reply["result"], "unknown_identity");
        assert!(store.attendance_for_date(Local::now().date_naive()).unwrap().is_empty());

        assert!(service.set_employee_active(101, true).await.unwrap());
        let reply: serde_json::Value =
            serde_json::from_str(&service.clock_in(101, true, 1.5, 2.5).await.unwrap()).unwrap();
        assert_eq!(reply["result"], "committed");
        assert_eq!(store.access_log_for_date(Local::now().date_naive()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_calls_report_errors_as_dbus_errors() {
        let (service, _store) = service();
        service.register_employee(101, "Ana", "Welder").await.unwrap();
        let err = service.register_employee(101, "Ana", "Welder").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));

        let listed: serde_json::Value = serde_json::from_str(&service.list_employees().await.unwrap()).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(service.next_employee_id().await.unwrap(), 102);
    }

    #[tokio::test]
    async fn test_engine_gone_is_reported() {
        let (service, _store) = service();
        assert!(matches!(service.status().await, Err(zbus::fdo::Error::Failed(_))));
    }
}
