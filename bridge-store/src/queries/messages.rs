use crate::error::{Result, StoreError};
use crate::models::{
    MessageDirection, MessageFilter, MessageLog, NewMessageLog, Page, ProcessingStatus,
};
use crate::store::{Store, message_type_column, platform_column};
use bridge_channels::StoredFile;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

const MESSAGE_COLUMNS: &str = "id, binding_id, platform_type, platform_user_id, \
     platform_message_id, direction, content, message_type, file_path, file_name, file_type, \
     processing_status, error_message, processed_at, created_at";

const MAX_PAGE_SIZE: u32 = 200;

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageLog> {
    Ok(MessageLog {
        id: row.get(0)?,
        binding_id: row.get(1)?,
        platform_type: platform_column(row, 2)?,
        platform_user_id: row.get(3)?,
        platform_message_id: row.get(4)?,
        direction: row.get(5)?,
        content: row.get(6)?,
        message_type: message_type_column(row, 7)?,
        file_path: row.get(8)?,
        file_name: row.get(9)?,
        file_type: row.get(10)?,
        processing_status: row.get(11)?,
        error_message: row.get(12)?,
        processed_at: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn load_message(conn: &Connection, id: i64) -> Result<MessageLog> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM message_logs WHERE id = ?1"),
        params![id],
        message_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("message", id))
}

impl Store {
    pub async fn insert_message_log(&self, message: NewMessageLog) -> Result<MessageLog> {
        self.call(move |conn| {
            let (file_path, file_name, file_type) = match message.file {
                Some(file) => (
                    Some(file.relative_path),
                    Some(file.file_name),
                    Some(file.file_type),
                ),
                None => (None, None, None),
            };
            let processed_at = message
                .processing_status
                .is_terminal()
                .then_some(message.created_at);
            conn.execute(
                "INSERT INTO message_logs (binding_id, platform_type, platform_user_id,
                     platform_message_id, direction, content, message_type, file_path,
                     file_name, file_type, processing_status, error_message, processed_at,
                     created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    message.binding_id,
                    message.platform_type.as_str(),
                    message.platform_user_id,
                    message.platform_message_id,
                    message.direction,
                    message.content,
                    message.message_type.as_str(),
                    file_path,
                    file_name,
                    file_type,
                    message.processing_status,
                    message.error_message,
                    processed_at,
                    message.created_at,
                ],
            )?;
            load_message(conn, conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_message_log(&self, id: i64) -> Result<MessageLog> {
        self.call(move |conn| load_message(conn, id)).await
    }

    pub async fn set_message_binding(&self, id: i64, binding_id: i64) -> Result<()> {
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE message_logs SET binding_id = ?1 WHERE id = ?2",
                params![binding_id, id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("message", id));
            }
            Ok(())
        })
        .await
    }

    /// Records a downloaded attachment on an already logged message.
    pub async fn set_message_file(&self, id: i64, file: StoredFile) -> Result<()> {
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE message_logs SET file_path = ?1, file_name = ?2, file_type = ?3
                 WHERE id = ?4",
                params![file.relative_path, file.file_name, file.file_type, id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("message", id));
            }
            Ok(())
        })
        .await
    }

    /// Moves a message to `status`. Terminal states stamp `processed_at`.
    pub async fn update_message_status(
        &self,
        id: i64,
        status: ProcessingStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MessageLog> {
        let error_message = error_message.map(ToOwned::to_owned);
        self.call(move |conn| {
            let processed_at = status.is_terminal().then_some(now);
            let updated = conn.execute(
                "UPDATE message_logs
                 SET processing_status = ?1, error_message = ?2, processed_at = ?3
                 WHERE id = ?4",
                params![status, error_message, processed_at, id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("message", id));
            }
            load_message(conn, id)
        })
        .await
    }

    /// PENDING to PROCESSING; `false` when another consumer already claimed the row.
    pub async fn mark_message_processing(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let claimed = conn.execute(
                "UPDATE message_logs SET processing_status = 'PROCESSING'
                 WHERE id = ?1 AND processing_status = 'PENDING'",
                params![id],
            )?;
            if claimed == 0 {
                load_message(conn, id)?;
            }
            Ok(claimed == 1)
        })
        .await
    }

    /// PROCESSING to COMPLETED for an INBOUND row ahead of delivering a reply. Only one caller
    /// gets `true`; undo with [`Store::release_message_reply`] if delivery fails.
    pub async fn claim_message_reply(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        self.call(move |conn| {
            let claimed = conn.execute(
                "UPDATE message_logs SET processing_status = 'COMPLETED', error_message = NULL,
                     processed_at = ?2
                 WHERE id = ?1 AND direction = 'INBOUND' AND processing_status = 'PROCESSING'",
                params![id, now],
            )?;
            if claimed == 0 {
                load_message(conn, id)?;
            }
            Ok(claimed == 1)
        })
        .await
    }

    /// Returns a claimed reply to PROCESSING so the client can retry.
    pub async fn release_message_reply(&self, id: i64) -> Result<MessageLog> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE message_logs SET processing_status = 'PROCESSING', processed_at = NULL
                 WHERE id = ?1 AND processing_status = 'COMPLETED'",
                params![id],
            )?;
            load_message(conn, id)
        })
        .await
    }

    /// INBOUND rows for `binding_id` created at or after `since`, excluding `exclude_id`.
    pub async fn count_inbound_since(
        &self,
        binding_id: i64,
        since: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> Result<u64> {
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM message_logs
                 WHERE binding_id = ?1 AND direction = 'INBOUND' AND created_at >= ?2
                   AND (?3 IS NULL OR id != ?3)",
                params![binding_id, since, exclude_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Newest-first page of message logs. `page` is zero-based.
    pub async fn list_message_logs(
        &self,
        filter: MessageFilter,
        page: u32,
        size: u32,
    ) -> Result<Page<MessageLog>> {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        self.call(move |conn| {
            let platform = filter.platform_type.map(|platform| platform.as_str());
            let where_clause = "WHERE (?1 IS NULL OR platform_type = ?1)
                   AND (?2 IS NULL OR processing_status = ?2)
                   AND (?3 IS NULL OR direction = ?3)
                   AND (?4 IS NULL OR binding_id = ?4)";
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM message_logs {where_clause}"),
                params![platform, filter.status, filter.direction, filter.binding_id],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM message_logs {where_clause}
                 ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6"
            ))?;
            let offset = i64::from(page) * i64::from(size);
            let rows = stmt.query_map(
                params![
                    platform,
                    filter.status,
                    filter.direction,
                    filter.binding_id,
                    size,
                    offset
                ],
                message_from_row,
            )?;
            Ok(Page {
                items: rows.collect::<rusqlite::Result<Vec<_>>>()?,
                page,
                size,
                total: total.max(0) as u64,
            })
        })
        .await
    }

    /// Oldest-first INBOUND messages awaiting an AI reply.
    pub async fn list_pending_messages(&self, limit: u32) -> Result<Vec<MessageLog>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM message_logs
                 WHERE processing_status = ?1 AND direction = ?2
                 ORDER BY created_at ASC, id ASC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![ProcessingStatus::Pending, MessageDirection::Inbound, limit],
                message_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
