//! Attendance committer: at most one attendance event per (employee, date).
//!
//! The check-then-write here is advisory. The authoritative guard is the
//! ledger's own uniqueness over (employee, date): `record_attendance`
//! reports a duplicate instead of writing a second row, so two commits that
//! race past `attendance_on` still produce one event.

use crate::types::{AttendanceEvent, ClockInSource, Employee, EmployeeId, GeoPoint, NewAttendance};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("employee directory lookup failed: {0}")]
    Directory(#[source] BoxError),
    #[error("attendance ledger failed: {0}")]
    Ledger(#[source] BoxError),
}

/// Read-only employee lookup.
pub trait EmployeeDirectory {
    type Error: std::error::Error + Send + Sync + 'static;

    fn lookup_employee(&self, id: EmployeeId) -> Result<Option<Employee>, Self::Error>;
}

/// Result of an attempted ledger write.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(AttendanceEvent),
    /// A row for (employee, date) already existed; nothing was written.
    Duplicate { existing_time: NaiveTime },
}

/// Append-only attendance storage with a uniqueness guarantee per (employee, date).
pub trait AttendanceLedger {
    type Error: std::error::Error + Send + Sync + 'static;

    fn attendance_on(
        &self,
        id: EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<NaiveTime>, Self::Error>;

    /// Must be atomic per (employee, date): never two rows for the same pair.
    fn record_attendance(&self, event: &NewAttendance) -> Result<RecordOutcome, Self::Error>;
}

impl<T: EmployeeDirectory> EmployeeDirectory for &T {
    type Error = T::Error;

    fn lookup_employee(&self, id: EmployeeId) -> Result<Option<Employee>, T::Error> {
        (**self).lookup_employee(id)
    }
}

impl<T: AttendanceLedger> AttendanceLedger for &T {
    type Error = T::Error;

    fn attendance_on(&self, id: EmployeeId, date: NaiveDate) -> Result<Option<NaiveTime>, T::Error> {
        (**self).attendance_on(id, date)
    }

    fn record_attendance(&self, event: &NewAttendance) -> Result<RecordOutcome, T::Error> {
        (**self).record_attendance(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(AttendanceEvent),
    AlreadyCommittedToday { existing_time: NaiveTime },
    UnknownIdentity,
}

/// Commits attendance through a directory and a ledger.
pub struct AttendanceCommitter<D, L> {
    directory: D,
    ledger: L,
}

impl<D, L> AttendanceCommitter<D, L>
where
    D: EmployeeDirectory,
    L: AttendanceLedger,
{
    pub fn new(directory: D, ledger: L) -> Self {
        Self { directory, ledger }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Active employee for `id`, or `None` if unknown or deactivated.
    pub fn resolve(&self, id: EmployeeId) -> Result<Option<Employee>, CommitError> {
        let employee = self
            .directory
            .lookup_employee(id)
            .map_err(|e| CommitError::Directory(Box::new(e)))?;
        Ok(employee.filter(|e| e.active))
    }

    pub fn commit(
        &self,
        id: EmployeeId,
        now: NaiveDateTime,
        location: Option<GeoPoint>,
        source: ClockInSource,
    ) -> Result<CommitOutcome, CommitError> {
        let Some(employee) = self.resolve(id)? else {
            tracing::info!(employee_id = %id, "commit skipped: unknown identity");
            return Ok(CommitOutcome::UnknownIdentity);
        };

        let date = now.date();
        if let Some(existing_time) = self
            .ledger
            .attendance_on(id, date)
            .map_err(|e| CommitError::Ledger(Box::new(e)))?
        {
            tracing::info!(employee_id = %id, %existing_time, "already checked in today");
            return Ok(CommitOutcome::AlreadyCommittedToday { existing_time });
        }

        let event = NewAttendance {
            employee_id: id,
            name: employee.name,
            role: employee.role,
            date,
            // Stored at whole-second resolution.
            time: now.time().with_nanosecond(0).unwrap_or_else(|| now.time()),
            location,
            source,
        };

        match self
            .ledger
            .record_attendance(&event)
            .map_err(|e| CommitError::Ledger(Box::new(e)))?
        {
            RecordOutcome::Recorded(event) => {
                tracing::info!(
                    employee_id = %id,
                    name = %event.name,
                    date = %event.date,
                    time = %event.time,
                    source = event.source.as_str(),
                    "attendance committed"
                );
                Ok(CommitOutcome::Committed(event))
            }
            RecordOutcome::Duplicate { existing_time } => {
                tracing::info!(employee_id = %id, %existing_time, "lost commit race; already checked in");
                Ok(CommitOutcome::AlreadyCommittedToday { existing_time })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("fake storage offline")]
    pub struct Offline;

    #[derive(Default)]
    pub struct FakeDirectory {
        pub employees: HashMap<EmployeeId, Employee>,
        /// Every lookup fails while set.
        pub offline: AtomicBool,
    }

    impl FakeDirectory {
        pub fn with(mut self, id: i64, name: &str, role: &str) -> Self {
            self.employees.insert(
                EmployeeId(id),
                Employee {
                    id: EmployeeId(id),
                    name: name.into(),
                    role: role.into(),
                    active: true,
                },
            );
            self
        }
    }

    impl EmployeeDirectory for FakeDirectory {
        type Error = Offline;

        fn lookup_employee(&self, id: EmployeeId) -> Result<Option<Employee>, Offline> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(Offline);
            }
            Ok(self.employees.get(&id).cloned())
        }
    }

    /// In-memory ledger keyed by (employee, date), optionally failing writes.
    #[derive(Default)]
    pub struct FakeLedger {
        pub rows: Mutex<Vec<AttendanceEvent>>,
        pub fail_writes: bool,
        /// When set, `attendance_on` always reports nothing (simulates a racing writer).
        pub blind_reads: bool,
    }

    impl FakeLedger {
        pub fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    impl AttendanceLedger for FakeLedger {
        type Error = Offline;

        fn attendance_on(&self, id: EmployeeId, date: NaiveDate) -> Result<Option<NaiveTime>, Offline> {
            if self.blind_reads {
                return Ok(None);
            }
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.employee_id == id && r.date == date)
                .map(|r| r.time))
        }

        fn record_attendance(&self, event: &NewAttendance) -> Result<RecordOutcome, Offline> {
            if self.fail_writes {
                return Err(Offline);
            }
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows
                .iter()
                .find(|r| r.employee_id == event.employee_id && r.date == event.date)
            {
                return Ok(RecordOutcome::Duplicate { existing_time: existing.time });
            }
            let stored = AttendanceEvent {
                id: rows.len() as i64 + 1,
                employee_id: event.employee_id,
                name: event.name.clone(),
                role: event.role.clone(),
                date: event.date,
                time: event.time,
                location: event.location,
                source: event.source,
            };
            rows.push(stored.clone());
            Ok(RecordOutcome::Recorded(stored))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use std::sync::Arc;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn committer() -> AttendanceCommitter<FakeDirectory, FakeLedger> {
        AttendanceCommitter::new(
            FakeDirectory::default().with(101, "Ana", "Welder"),
            FakeLedger::default(),
        )
    }

    #[test]
    fn test_commit_then_already_committed() {
        let c = committer();
        let first = c.commit(EmployeeId(101), at(6, 8, 15, 2), None, ClockInSource::Camera).unwrap();
        let CommitOutcome::Committed(event) = first else {
            panic!("expected Committed, got {first:?}");
        };
        assert_eq!(event.time, NaiveTime::from_hms_opt(8, 15, 2).unwrap());
        assert_eq!(event.name, "Ana");
        assert_eq!(event.role, "Welder");

        let second = c.commit(EmployeeId(101), at(6, 8, 15, 3), None, ClockInSource::Camera).unwrap();
        assert_eq!(
            second,
            CommitOutcome::AlreadyCommittedToday {
                existing_time: NaiveTime::from_hms_opt(8, 15, 2).unwrap()
            }
        );
        assert_eq!(c.ledger().len(), 1);
    }

    #[test]
    fn test_next_day_commits_again() {
        let c = committer();
        c.commit(EmployeeId(101), at(6, 8, 0, 0), None, ClockInSource::Camera).unwrap();
        let next = c.commit(EmployeeId(101), at(7, 8, 0, 0), None, ClockInSource::Camera).unwrap();
        assert!(matches!(next, CommitOutcome::Committed(_)));
        assert_eq!(c.ledger().len(), 2);
    }

    #[test]
    fn test_unknown_identity_writes_nothing() {
        let c = committer();
        let out = c.commit(EmployeeId(999), at(6, 8, 0, 0), None, ClockInSource::Camera).unwrap();
        assert_eq!(out, CommitOutcome::UnknownIdentity);
        assert_eq!(c.ledger().len(), 0);
    }

    #[test]
    fn test_inactive_employee_is_unknown() {
        let mut dir = FakeDirectory::default().with(101, "Ana", "Welder");
        dir.employees.get_mut(&EmployeeId(101)).unwrap().active = false;
        let c = AttendanceCommitter::new(dir, FakeLedger::default());
        let out = c.commit(EmployeeId(101), at(6, 8, 0, 0), None, ClockInSource::Manual).unwrap();
        assert_eq!(out, CommitOutcome::UnknownIdentity);
    }

    #[test]
    fn test_geolocation_and_source_are_recorded() {
        let c = committer();
        let geo = GeoPoint { latitude: -6.2, longitude: 106.8 };
        let out = c.commit(EmployeeId(101), at(6, 7, 59, 0), Some(geo), ClockInSource::Manual).unwrap();
        let CommitOutcome::Committed(event) = out else { panic!("not committed") };
        assert_eq!(event.location, Some(geo));
        assert_eq!(event.source, ClockInSource::Manual);
    }

    #[test]
    fn test_ledger_duplicate_maps_to_already_committed() {
        // The read misses, but the write-side guard still holds.
        let ledger = FakeLedger { blind_reads: true, ..FakeLedger::default() };
        let c = AttendanceCommitter::new(FakeDirectory::default().with(101, "Ana", "Welder"), ledger);
        c.commit(EmployeeId(101), at(6, 8, 0, 0), None, ClockInSource::Camera).unwrap();
        let out = c.commit(EmployeeId(101), at(6, 8, 0, 1), None, ClockInSource::Manual).unwrap();
        assert!(matches!(out, CommitOutcome::AlreadyCommittedToday { .. }));
        assert_eq!(c.ledger().len(), 1);
    }

    #[test]
    fn test_concurrent_commits_produce_one_event() {
        let dir = Arc::new(FakeDirectory::default().with(101, "Ana", "Welder"));
        let ledger = Arc::new(FakeLedger { blind_reads: true, ..FakeLedger::default() });

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = Arc::clone(&dir);
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let c = AttendanceCommitter::new(&*dir, &*ledger);
                    c.commit(EmployeeId(101), at(6, 8, 0, i), None, ClockInSource::Camera)
                        .unwrap()
                })
            })
            .collect();

        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, CommitOutcome::Committed(_)))
            .count();
        assert_eq!(committed, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_ledger_failure_surfaces() {
        let ledger = FakeLedger { fail_writes: true, ..FakeLedger::default() };
        let c = AttendanceCommitter::new(FakeDirectory::default().with(101, "Ana", "Welder"), ledger);
        let err = c.commit(EmployeeId(101), at(6, 8, 0, 0), None, ClockInSource::Camera).unwrap_err();
        assert!(matches!(err, CommitError::Ledger(_)));
    }
}
