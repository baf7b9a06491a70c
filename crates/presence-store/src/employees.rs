use crate::{format_datetime, Store, StoreError};
use chrono::Local;
use presence_core::committer::EmployeeDirectory;
use presence_core::types::{Employee, EmployeeId};
use rusqlite::{params, ErrorCode, OptionalExtension, Row};

/// First id handed out on an empty directory.
const FIRST_EMPLOYEE_ID: i64 = 101;

fn row_to_employee(row: &Row) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: EmployeeId(row.get("id")?),
        name: row.get("name")?,
        role: row.get("role")?,
        active: row.get("active")?,
    })
}

impl Store {
    /// Add an employee. Ids are assigned by the caller (see [`Store::next_employee_id`]).
    pub fn register_employee(&self, id: EmployeeId, name: &str, role: &str) -> Result<Employee, StoreError> {
        let name = name.trim();
        let role = role.trim();
        if id.0 <= 0 {
            return Err(StoreError::InvalidInput(format!("employee id must be positive, got {id}")));
        }
        if name.is_empty() {
            return Err(StoreError::InvalidInput("employee name is empty".into()));
        }

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO employees (id, name, role, active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
            params![id.0, name, role, format_datetime(Local::now().naive_local())],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::EmployeeExists(id.0));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(employee_id = %id, name, role, "employee registered");
        Ok(Employee {
            id,
            name: name.to_string(),
            role: role.to_string(),
            active: true,
        })
    }

    pub fn employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError> {
        let conn = self.conn()?;
        let employee = conn
            .query_row(
                "SELECT id, name, role, active FROM employees WHERE id = ?1",
                params![id.0],
                row_to_employee,
            )
            .optional()?;
        Ok(employee)
    }

    pub fn list_employees(&self) -> Result<Vec<Employee>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, role, active FROM employees ORDER BY id")?;
        let employees = stmt
            .query_map([], row_to_employee)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(employees)
    }

    /// Highest existing id plus one, or 101 for an empty directory.
    pub fn next_employee_id(&self) -> Result<EmployeeId, StoreError> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row("SELECT MAX(id) FROM employees", [], |row| row.get(0))?;
        Ok(EmployeeId(max.map_or(FIRST_EMPLOYEE_ID, |m| m + 1)))
    }

    /// Returns false if no such employee exists.
    pub fn set_employee_active(&self, id: EmployeeId, active: bool) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE employees SET active = ?2 WHERE id = ?1",
            params![id.0, active],
        )?;
        if changed > 0 {
            tracing::info!(employee_id = %id, active, "employee status changed");
        }
        Ok(changed > 0)
    }
}

impl EmployeeDirectory for Store {
    type Error = StoreError;

    fn lookup_employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError> {
        self.employee(id)
    }
}
