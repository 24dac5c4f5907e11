use crate::error::{Result, StoreError};
use crate::models::{Employee, NewEmployee};
use crate::store::Store;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

const EMPLOYEE_COLUMNS: &str = "id, name, email, department, position, created_at";

fn employee_from_row(row: &Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        department: row.get(3)?,
        position: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl Store {
    pub async fn insert_employee(&self, employee: NewEmployee) -> Result<Employee> {
        let name = employee.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::Invalid("employee name is required".to_string()));
        }
        self.call(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO employees (name, email, department, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, employee.email, employee.department, employee.position, now],
            )?;
            let id = conn.last_insert_rowid();
            Ok(conn.query_row(
                &format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE id = ?1"),
                params![id],
                employee_from_row,
            )?)
        })
        .await
    }

    pub async fn get_employee(&self, id: i64) -> Result<Employee> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE id = ?1"),
                params![id],
                employee_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("employee", id))
        })
        .await
    }

    pub async fn list_employees(&self) -> Result<Vec<Employee>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {EMPLOYEE_COLUMNS} FROM employees ORDER BY id"))?;
            let rows = stmt.query_map([], employee_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_get_and_list_employees() {
        let store = Store::open_in_memory().await.expect("store");
        let ada = store
            .insert_employee(NewEmployee {
                name: "  Ada ".to_string(),
                department: Some("Ops".to_string()),
                ..NewEmployee::default()
            })
            .await
            .expect("insert");
        assert_eq!(ada.name, "Ada");
        assert_eq!(ada.department.as_deref(), Some("Ops"));

        let fetched = store.get_employee(ada.id).await.expect("get");
        assert_eq!(fetched.id, ada.id);
        assert_eq!(store.list_employees().await.expect("list").len(), 1);

        let missing = store.get_employee(999).await.expect_err("missing");
        assert!(matches!(missing, StoreError::NotFound { entity: "employee", .. }));
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let store = Store::open_in_memory().await.expect("store");
        let err = store
            .insert_employee(NewEmployee::default())
            .await
            .expect_err("blank");
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
