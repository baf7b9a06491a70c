use crate::{
    format_date, format_datetime, format_time, parse_date, parse_datetime, parse_time, Store, StoreError,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::committer::{AttendanceLedger, RecordOutcome};
use presence_core::types::{AttendanceEvent, ClockInSource, EmployeeId, GeoPoint, NewAttendance};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

const ATTENDANCE_COLUMNS: &str = "id, employee_id, name, role, date, time, latitude, longitude, source";

/// One visit seen by the camera or a manual clock-in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessLogEntry {
    pub id: i64,
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub recorded_at: NaiveDateTime,
}

fn row_to_event(row: &Row) -> rusqlite::Result<AttendanceEvent> {
    let date: String = row.get(4)?;
    let time: String = row.get(5)?;
    let latitude: Option<f64> = row.get(6)?;
    let longitude: Option<f64> = row.get(7)?;
    let source: String = row.get(8)?;

    let source = ClockInSource::parse(&source).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Text,
            format!("unknown clock-in source {source:?}").into(),
        )
    })?;

    Ok(AttendanceEvent {
        id: row.get(0)?,
        employee_id: EmployeeId(row.get(1)?),
        name: row.get(2)?,
        role: row.get(3)?,
        date: parse_date(&date, 4)?,
        time: parse_time(&time, 5)?,
        location: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| GeoPoint { latitude, longitude }),
        source,
    })
}

impl Store {
    /// Check-in time for (employee, date), if any.
    pub fn attendance_on(&self, id: EmployeeId, date: NaiveDate) -> Result<Option<NaiveTime>, StoreError> {
        let conn = self.conn()?;
        let time: Option<String> = conn
            .query_row(
                "SELECT time FROM attendance WHERE employee_id = ?1 AND date = ?2",
                params![id.0, format_date(date)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(time.map(|t| parse_time(&t, 0)).transpose()?)
    }

    /// Insert one attendance row. A second row for the same (employee, date)
    /// is never written; the existing time comes back as a duplicate instead.
    pub fn record_attendance(&self, event: &NewAttendance) -> Result<RecordOutcome, StoreError> {
        let conn = self.conn()?;
        let date = format_date(event.date);
        let changed = conn.execute(
            "INSERT INTO attendance (employee_id, name, role, date, time, latitude, longitude, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(employee_id, date) DO NOTHING",
            params![
                event.employee_id.0,
                event.name,
                event.role,
                date,
                format_time(event.time),
                event.location.map(|g| g.latitude),
                event.location.map(|g| g.longitude),
                event.source.as_str(),
            ],
        )?;

        if changed == 0 {
            let existing: String = conn.query_row(
                "SELECT time FROM attendance WHERE employee_id = ?1 AND date = ?2",
                params![event.employee_id.0, date],
                |row| row.get(0),
            )?;
            return Ok(RecordOutcome::Duplicate {
                existing_time: parse_time(&existing, 0)?,
            });
        }

        Ok(RecordOutcome::Recorded(AttendanceEvent {
            id: conn.last_insert_rowid(),
            employee_id: event.employee_id,
            name: event.name.clone(),
            role: event.role.clone(),
            date: event.date,
            time: event.time,
            location: event.location,
            source: event.source,
        }))
    }

    /// All check-ins on `date`, earliest first.
    pub fn attendance_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE date = ?1 ORDER BY time, id"
        ))?;
        let events = stmt
            .query_map(params![format_date(date)], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Most recent check-ins, newest first.
    pub fn attendance_history(&self, limit: u32) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance ORDER BY date DESC, time DESC, id DESC LIMIT ?1"
        ))?;
        let events = stmt
            .query_map(params![limit], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Returns false if the row did not exist.
    pub fn delete_attendance(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM attendance WHERE id = ?1", params![id])?;
        if changed > 0 {
            tracing::info!(attendance_id = id, "attendance record deleted");
        }
        Ok(changed > 0)
    }

    pub fn log_access(&self, id: EmployeeId, at: NaiveDateTime) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO access_log (employee_id, date, recorded_at) VALUES (?1, ?2, ?3)",
            params![id.0, format_date(at.date()), format_datetime(at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn access_log_for_date(&self, date: NaiveDate) -> Result<Vec<AccessLogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, employee_id, date, recorded_at FROM access_log WHERE date = ?1 ORDER BY recorded_at, id",
        )?;
        let entries = stmt
            .query_map(params![format_date(date)], |row| {
                let date: String = row.get(2)?;
                let recorded_at: String = row.get(3)?;
                Ok(AccessLogEntry {
                    id: row.get(0)?,
                    employee_id: EmployeeId(row.get(1)?),
                    date: parse_date(&date, 2)?,
                    recorded_at: parse_datetime(&recorded_at, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

impl AttendanceLedger for Store {
    type Error = StoreError;

    fn attendance_on(&self, id: EmployeeId, date: NaiveDate) -> Result<Option<NaiveTime>, StoreError> {
        Store::attendance_on(self, id, date)
    }

    fn record_attendance(&self, event: &NewAttendance) -> Result<RecordOutcome, StoreError> {
        Store::record_attendance(self, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::committer::{AttendanceCommitter, CommitOutcome};
    use std::sync::{Arc, Barrier};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        day(d).and_hms_opt(h, m, s).unwrap()
    }

    fn store_with_ana() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.register_employee(EmployeeId(101), "Ana", "Welder").unwrap();
        store.register_employee(EmployeeId(102), "Ben", "Ops").unwrap();
        store
    }

    fn new_event(id: i64, d: u32, time: (u32, u32, u32)) -> NewAttendance {
        NewAttendance {
            employee_id: EmployeeId(id),
            name: "Ana".into(),
            role: "Welder".into(),
            date: day(d),
            time: NaiveTime::from_hms_opt(time.0, time.1, time.2).unwrap(),
            location: None,
            source: ClockInSource::Camera,
        }
    }

    #[test]
    fn test_record_then_duplicate() {
        let store = store_with_ana();
        let first = store.record_attendance(&new_event(101, 6, (8, 15, 0))).unwrap();
        assert!(matches!(first, RecordOutcome::Recorded(_)));
        let second = store.record_attendance(&new_event(101, 6, (9, 0, 0))).unwrap();
        assert_eq!(
            second,
            RecordOutcome::Duplicate {
                existing_time: NaiveTime::from_hms_opt(8, 15, 0).unwrap()
            }
        );
        assert_eq!(store.attendance_for_date(day(6)).unwrap().len(), 1);
        assert_eq!(
            store.attendance_on(EmployeeId(101), day(6)).unwrap(),
            NaiveTime::from_hms_opt(8, 15, 0)
        );
        assert_eq!(store.attendance_on(EmployeeId(101), day(7)).unwrap(), None);
    }

    #[test]
    fn test_location_and_source_roundtrip() {
        let store = store_with_ana();
        let mut event = new_event(101, 6, (7, 0, 0));
        event.location = Some(GeoPoint { latitude: -6.2, longitude: 106.8 });
        event.source = ClockInSource::Manual;
        store.record_attendance(&event).unwrap();
        let stored = &store.attendance_for_date(day(6)).unwrap()[0];
        assert_eq!(stored.location, event.location);
        assert_eq!(stored.source, ClockInSource::Manual);
    }

    #[test]
    fn test_history_newest_first_with_limit() {
        let store = store_with_ana();
        store.record_attendance(&new_event(101, 5, (8, 0, 0))).unwrap();
        store.record_attendance(&new_event(101, 6, (8, 0, 0))).unwrap();
        store.record_attendance(&new_event(102, 6, (9, 30, 0))).unwrap();
        let history = store.attendance_history(2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].employee_id, EmployeeId(102));
        assert_eq!(history[1].date, day(6));
    }

    #[test]
    fn test_delete_allows_new_checkin() {
        let store = store_with_ana();
        let RecordOutcome::Recorded(event) = store.record_attendance(&new_event(101, 6, (8, 0, 0))).unwrap() else {
            panic!("expected a new row");
        };
        assert!(store.delete_attendance(event.id).unwrap());
        assert!(!store.delete_attendance(event.id).unwrap());
        assert!(matches!(
            store.record_attendance(&new_event(101, 6, (10, 0, 0))).unwrap(),
            RecordOutcome::Recorded(_)
        ));
    }

    #[test]
    fn test_access_log() {
        let store = store_with_ana();
        store.log_access(EmployeeId(101), at(6, 8, 0, 0)).unwrap();
        store.log_access(EmployeeId(101), at(6, 12, 0, 0)).unwrap();
        store.log_access(EmployeeId(102), at(7, 8, 0, 0)).unwrap();
        let entries = store.access_log_for_date(day(6)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].recorded_at, at(6, 12, 0, 0));
    }

    #[test]
    fn test_committer_over_store() {
        let store = store_with_ana();
        let committer = AttendanceCommitter::new(store.clone(), store.clone());
        let first = committer
            .commit(EmployeeId(101), at(6, 8, 15, 2), None, ClockInSource::Camera)
            .unwrap();
        assert!(matches!(first, CommitOutcome::Committed(_)));
        let again = committer
            .commit(EmployeeId(101), at(6, 8, 20, 0), None, ClockInSource::Camera)
            .unwrap();
        assert_eq!(
            again,
            CommitOutcome::AlreadyCommittedToday {
                existing_time: NaiveTime::from_hms_opt(8, 15, 2).unwrap()
            }
        );
        let unknown = committer
            .commit(EmployeeId(999), at(6, 8, 0, 0), None, ClockInSource::Camera)
            .unwrap();
        assert_eq!(unknown, CommitOutcome::UnknownIdentity);
    }

    #[test]
    fn test_two_connections_race_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        let setup = Store::open(&path).unwrap();
        setup.register_employee(EmployeeId(101), "Ana", "Welder").unwrap();
        drop(setup);

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    // Separate connections, as two processes would have.
                    let store = Store::open(&path).unwrap();
                    barrier.wait();
                    store.record_attendance(&new_event(101, 6, (8, 0, i))).unwrap()
                })
            })
            .collect();

        let recorded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, RecordOutcome::Recorded(_)))
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(Store::open(&path).unwrap().attendance_for_date(day(6)).unwrap().len(), 1);
    }
}
