use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::{Binding, BindingStatus, PlatformIdentity};
use crate::store::{Store, platform_column};
use bridge_channels::PlatformType;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

const BINDING_COLUMNS: &str = "id, employee_id, platform_type, platform_user_id, \
     platform_username, binding_code, code_expires_at, status, bound_at, created_at";

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<Binding> {
    Ok(Binding {
        id: row.get(0)?,
        employee_id: row.get(1)?,
        platform_type: platform_column(row, 2)?,
        platform_user_id: row.get(3)?,
        platform_username: row.get(4)?,
        binding_code: row.get(5)?,
        code_expires_at: row.get(6)?,
        status: row.get(7)?,
        bound_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn load_binding(conn: &Connection, id: i64) -> Result<Binding> {
    conn.query_row(
        &format!("SELECT {BINDING_COLUMNS} FROM bindings WHERE id = ?1"),
        params![id],
        binding_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("binding", id))
}

impl Store {
    /// Creates a PENDING binding carrying a one-time code. A code collision yields `Conflict`.
    pub async fn insert_pending_binding(
        &self,
        employee_id: i64,
        platform_type: PlatformType,
        code: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Binding> {
        let code = code.to_string();
        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO bindings (employee_id, platform_type, binding_code, code_expires_at,
                     status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    employee_id,
                    platform_type.as_str(),
                    code,
                    expires_at,
                    BindingStatus::Pending,
                    now
                ],
            );
            match inserted {
                Ok(_) => load_binding(conn, conn.last_insert_rowid()),
                Err(error) if is_unique_violation(&error) => Err(StoreError::Conflict(format!(
                    "binding code already in use: {error}"
                ))),
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    /// The PENDING binding holding `code`, expired or not.
    pub async fn find_binding_by_code(&self, code: &str) -> Result<Option<Binding>> {
        let code = code.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {BINDING_COLUMNS} FROM bindings
                         WHERE binding_code = ?1 AND status = 'PENDING'"
                    ),
                    params![code],
                    binding_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Claims a PENDING binding for a platform identity.
    ///
    /// The update only applies while the row is still PENDING with the same unexpired code, so of
    /// any number of concurrent redemptions at most one returns `Some`. An older ACTIVE binding for
    /// the same identity is revoked in the same transaction.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(binding_id = binding_id, platform = %identity.platform_type)
    )]
    pub async fn activate_binding(
        &self,
        binding_id: i64,
        code: &str,
        identity: PlatformIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<Binding>> {
        let code = code.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let revoked = tx.execute(
                "UPDATE bindings SET status = 'REVOKED'
                 WHERE platform_type = ?1 AND platform_user_id = ?2 AND status = 'ACTIVE'
                   AND id != ?3",
                params![
                    identity.platform_type.as_str(),
                    identity.platform_user_id,
                    binding_id
                ],
            )?;
            let claimed = tx.execute(
                "UPDATE bindings
                 SET status = 'ACTIVE', platform_type = ?1, platform_user_id = ?2,
                     platform_username = ?3, binding_code = NULL, bound_at = ?4
                 WHERE id = ?5 AND status = 'PENDING' AND binding_code = ?6
                   AND code_expires_at > ?4",
                params![
                    identity.platform_type.as_str(),
                    identity.platform_user_id,
                    identity.platform_username,
                    now,
                    binding_id,
                    code
                ],
            )?;
            if claimed == 0 {
                // Dropping the transaction rolls back the revocation above.
                return Ok(None);
            }
            let binding = load_binding(&tx, binding_id)?;
            tx.commit()?;
            if revoked > 0 {
                tracing::info!(revoked, "superseded previous active binding");
            }
            Ok(Some(binding))
        })
        .await
    }

    pub async fn find_active_binding(
        &self,
        platform_type: PlatformType,
        platform_user_id: &str,
    ) -> Result<Option<Binding>> {
        let platform_user_id = platform_user_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {BINDING_COLUMNS} FROM bindings
                         WHERE platform_type = ?1 AND platform_user_id = ?2 AND status = 'ACTIVE'"
                    ),
                    params![platform_type.as_str(), platform_user_id],
                    binding_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn get_binding(&self, id: i64) -> Result<Binding> {
        self.call(move |conn| load_binding(conn, id)).await
    }

    pub async fn list_bindings(&self, employee_id: Option<i64>) -> Result<Vec<Binding>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BINDING_COLUMNS} FROM bindings
                 WHERE (?1 IS NULL OR employee_id = ?1)
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(params![employee_id], binding_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Marks a binding REVOKED; revoking twice is a no-op. A pending code is voided as well.
    pub async fn revoke_binding(&self, id: i64) -> Result<Binding> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE bindings SET status = 'REVOKED', binding_code = NULL
                 WHERE id = ?1 AND status != 'REVOKED'",
                params![id],
            )?;
            load_binding(conn, id)
        })
        .await
    }

    /// Deletes PENDING bindings whose code expired at or before `now`.
    pub async fn purge_expired_bindings(&self, now: DateTime<Utc>) -> Result<usize> {
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM bindings WHERE status = 'PENDING' AND code_expires_at <= ?1",
                params![now],
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::fixtures::store_with_employee;
    use chrono::Duration;

    fn identity(user: &str) -> PlatformIdentity {
        PlatformIdentity {
            platform_type: PlatformType::Telegram,
            platform_user_id: user.to_string(),
            platform_username: Some(format!("user_{user}")),
        }
    }

    #[tokio::test]
    async fn activation_consumes_the_code() {
        let (store, employee_id) = store_with_employee().await;
        let now = Utc::now();
        let pending = store
            .insert_pending_binding(
                employee_id,
                PlatformType::Telegram,
                "AB3C7XYZ",
                now + Duration::minutes(30),
                now,
            )
            .await
            .expect("pending");
        assert_eq!(pending.status, BindingStatus::Pending);

        let found = store.find_binding_by_code("AB3C7XYZ").await.expect("find").expect("row");
        let active = store
            .activate_binding(found.id, "AB3C7XYZ", identity("12345"), now)
            .await
            .expect("activate")
            .expect("claimed");
        assert_eq!(active.status, BindingStatus::Active);
        assert_eq!(active.binding_code, None);
        assert_eq!(active.platform_user_id.as_deref(), Some("12345"));
        assert!(active.bound_at.is_some());

        assert!(store.find_binding_by_code("AB3C7XYZ").await.expect("find").is_none());
        let again = store
            .activate_binding(found.id, "AB3C7XYZ", identity("999"), now)
            .await
            .expect("second");
        assert!(again.is_none());

        let by_identity = store
            .find_active_binding(PlatformType::Telegram, "12345")
            .await
            .expect("lookup")
            .expect("active");
        assert_eq!(by_identity.id, active.id);
    }

    #[tokio::test]
    async fn expired_code_cannot_be_activated() {
        let (store, employee_id) = store_with_employee().await;
        let now = Utc::now();
        let pending = store
            .insert_pending_binding(
                employee_id,
                PlatformType::Telegram,
                "EXPIRED2",
                now - Duration::seconds(1),
                now - Duration::minutes(31),
            )
            .await
            .expect("pending");
        let claimed = store
            .activate_binding(pending.id, "EXPIRED2", identity("1"), now)
            .await
            .expect("activate");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn duplicate_code_is_a_conflict() {
        let (store, employee_id) = store_with_employee().await;
        let now = Utc::now();
        let expires = now + Duration::minutes(30);
        store
            .insert_pending_binding(employee_id, PlatformType::Telegram, "SAMECODE", expires, now)
            .await
            .expect("first");
        let err = store
            .insert_pending_binding(employee_id, PlatformType::Telegram, "SAMECODE", expires, now)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_activation_has_one_winner() {
        let (store, employee_id) = store_with_employee().await;
        let now = Utc::now();
        let pending = store
            .insert_pending_binding(
                employee_id,
                PlatformType::Telegram,
                "RACE2345",
                now + Duration::minutes(30),
                now,
            )
            .await
            .expect("pending");

        let mut handles = Vec::new();
        for user in 0..12 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .activate_binding(pending.id, "RACE2345", identity(&user.to_string()), now)
                    .await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").expect("activate").is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let active = store
            .list_bindings(Some(employee_id))
            .await
            .expect("list")
            .into_iter()
            .filter(|binding| binding.status == BindingStatus::Active)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn rebinding_an_identity_revokes_the_previous_binding() {
        let (store, employee_id) = store_with_employee().await;
        let now = Utc::now();
        let expires = now + Duration::minutes(30);
        let first = store
            .insert_pending_binding(employee_id, PlatformType::Telegram, "FIRST234", expires, now)
            .await
            .expect("first");
        let second = store
            .insert_pending_binding(employee_id, PlatformType::Telegram, "SECOND23", expires, now)
            .await
            .expect("second");
        store
            .activate_binding(first.id, "FIRST234", identity("42"), now)
            .await
            .expect("activate first")
            .expect("claimed");
        store
            .activate_binding(second.id, "SECOND23", identity("42"), now)
            .await
            .expect("activate second")
            .expect("claimed");

        assert_eq!(
            store.get_binding(first.id).await.expect("first").status,
            BindingStatus::Revoked
        );
        let active = store
            .find_active_binding(PlatformType::Telegram, "42")
            .await
            .expect("lookup")
            .expect("active");
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_purge_removes_only_expired_pending() {
        let (store, employee_id) = store_with_employee().await;
        let now = Utc::now();
        let live = store
            .insert_pending_binding(
                employee_id,
                PlatformType::Telegram,
                "LIVE2345",
                now + Duration::minutes(5),
                now,
            )
            .await
            .expect("live");
        store
            .insert_pending_binding(
                employee_id,
                PlatformType::Wechat,
                "STALE234",
                now - Duration::minutes(1),
                now - Duration::minutes(31),
            )
            .await
            .expect("stale");

        assert_eq!(store.purge_expired_bindings(now).await.expect("purge"), 1);
        assert_eq!(store.list_bindings(None).await.expect("list").len(), 1);

        let revoked = store.revoke_binding(live.id).await.expect("revoke");
        assert_eq!(revoked.status, BindingStatus::Revoked);
        assert_eq!(revoked.binding_code, None);
        let again = store.revoke_binding(live.id).await.expect("revoke again");
        assert_eq!(again.status, BindingStatus::Revoked);
        assert!(matches!(
            store.revoke_binding(404).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
