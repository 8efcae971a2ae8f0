use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{MailConnection, Mailbox, StoredAttachment, StoredEmail, VisibilityRecord};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

/// Field set for inserting a new deduplicated email row.
/// The row id and first_seen_at are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub message_key: String,
    pub provider_id: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references_chain: Option<String>,
    pub direction: models::Direction,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub to_addresses: Vec<Mailbox>,
    pub cc_addresses: Vec<Mailbox>,
    pub bcc_addresses: Vec<Mailbox>,
    pub received_at: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_connections: i64,
    pub active_connections: i64,
    pub total_emails: i64,
    pub total_visibility_records: i64,
    pub total_processed_markers: i64,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailfeed").join("mailfeed.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- connections ---

    pub fn insert_connection(&self, connection: &MailConnection) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO connections (
                id, user_id, email_address, access_token, refresh_token, token_expires_at,
                history_cursor, last_synced_at, active, last_error, last_error_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                connection.id,
                connection.user_id,
                connection.email_address,
                connection.access_token,
                connection.refresh_token,
                connection.token_expires_at.to_rfc3339(),
                connection.history_cursor,
                connection.last_synced_at,
                connection.active,
                connection.last_error,
                connection.last_error_at,
            ],
        )?;

        Ok(())
    }

    pub fn get_connection(&self, id: &str) -> Result<Option<MailConnection>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, email_address, access_token, refresh_token, token_expires_at,
                   history_cursor, last_synced_at, active, last_error, last_error_at
            FROM connections
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(MailConnection::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_connections(&self, active_only: bool) -> Result<Vec<MailConnection>, DbError> {
        let mut sql = String::from(
            r#"
            SELECT id, user_id, email_address, access_token, refresh_token, token_expires_at,
                   history_cursor, last_synced_at, active, last_error, last_error_at
            FROM connections
            "#,
        );
        if active_only {
            sql.push_str(" WHERE active = true");
        }
        sql.push_str(" ORDER BY email_address ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let connections = stmt
            .query_map([], MailConnection::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(connections)
    }

    /// Persist a refreshed access token before any further provider calls.
    pub fn update_connection_token(
        &self,
        id: &str,
        access_token: &str,
        expires_at: &chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE connections SET access_token = ?, token_expires_at = ? WHERE id = ?",
            params![access_token, expires_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Record the end of a successful pass: new cursor, sync timestamp,
    /// and any prior error cleared. Called once per connection per pass.
    pub fn complete_connection_pass(&self, id: &str, cursor: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE connections SET
                history_cursor = ?,
                last_synced_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                last_error = NULL,
                last_error_at = NULL
            WHERE id = ?
            "#,
            params![cursor, id],
        )?;
        Ok(())
    }

    /// Record a pass that failed before making progress. The stored cursor
    /// is left alone so the next pass retries the same window.
    pub fn record_connection_error(&self, id: &str, error: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE connections SET
                last_error = ?,
                last_error_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![error, id],
        )?;
        Ok(())
    }

    pub fn deactivate_connection(&self, id: &str) -> Result<usize, DbError> {
        let updated = self
            .conn
            .execute("UPDATE connections SET active = false WHERE id = ?", [id])?;
        Ok(updated)
    }

    // --- emails ---

    pub fn find_email_by_key(&self, message_key: &str) -> Result<Option<StoredEmail>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, message_key, provider_id, thread_id, in_reply_to, references_chain,
                   direction, subject, body_text, body_html, snippet, from_address, from_name,
                   to_addresses, cc_addresses, bcc_addresses, received_at, labels, first_seen_at
            FROM emails
            WHERE message_key = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([message_key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(StoredEmail::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Insert a new email row, or converge on the existing row when another
    /// pass won the race on `message_key`. Returns the row id and whether
    /// this call performed the insert. The uniqueness constraint is the
    /// single source of truth; there is no check-then-insert window.
    pub fn insert_or_get_email(&self, email: &NewEmail) -> Result<(i64, bool), DbError> {
        let to_addresses = serde_json::to_string(&email.to_addresses)?;
        let cc_addresses = serde_json::to_string(&email.cc_addresses)?;
        let bcc_addresses = serde_json::to_string(&email.bcc_addresses)?;
        let labels = serde_json::to_string(&email.labels)?;

        let inserted = self.conn.execute(
            r#"
            INSERT INTO emails (
                message_key, provider_id, thread_id, in_reply_to, references_chain,
                direction, subject, body_text, body_html, snippet, from_address, from_name,
                to_addresses, cc_addresses, bcc_addresses, received_at, labels
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_key) DO NOTHING
            "#,
            params![
                email.message_key,
                email.provider_id,
                email.thread_id,
                email.in_reply_to,
                email.references_chain,
                email.direction.to_string(),
                email.subject,
                email.body_text,
                email.body_html,
                email.snippet,
                email.from_address,
                email.from_name,
                to_addresses,
                cc_addresses,
                bcc_addresses,
                email.received_at,
                labels,
            ],
        )?;

        if inserted > 0 {
            return Ok((self.conn.last_insert_rowid(), true));
        }

        let id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM emails WHERE message_key = ? LIMIT 1",
                [&email.message_key],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                DbError::Config(format!(
                    "email row for key '{}' vanished after conflict",
                    email.message_key
                ))
            })?;
        Ok((id, false))
    }

    // --- visibility ---

    pub fn upsert_visibility(&self, record: &VisibilityRecord) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO email_visibility (email_id, user_id, folder, is_read)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(email_id, user_id) DO UPDATE SET
                folder = excluded.folder,
                is_read = excluded.is_read
            "#,
            params![
                record.email_id,
                record.user_id,
                record.folder,
                record.is_read
            ],
        )?;
        Ok(())
    }

    pub fn get_visibility(
        &self,
        email_id: i64,
        user_id: &str,
    ) -> Result<Option<VisibilityRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT email_id, user_id, folder, is_read
            FROM email_visibility
            WHERE email_id = ? AND user_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query(params![email_id, user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(VisibilityRecord::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    // --- attachments ---

    pub fn upsert_attachment(&self, attachment: &StoredAttachment) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO email_attachments (email_id, provider_attachment_id, filename, mime_type, size_bytes)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(email_id, provider_attachment_id) DO UPDATE SET
                filename = excluded.filename,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes
            "#,
            params![
                attachment.email_id,
                attachment.provider_attachment_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size_bytes,
            ],
        )?;
        Ok(())
    }

    pub fn list_attachments(&self, email_id: i64) -> Result<Vec<StoredAttachment>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT email_id, provider_attachment_id, filename, mime_type, size_bytes
            FROM email_attachments
            WHERE email_id = ?
            ORDER BY provider_attachment_id ASC
            "#,
        )?;

        let attachments = stmt
            .query_map([email_id], StoredAttachment::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    // --- processed markers ---

    pub fn is_processed(&self, message_key: &str) -> Result<bool, DbError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT message_key FROM processed_messages WHERE message_key = ? LIMIT 1",
                [message_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_processed(&self, message_key: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO processed_messages (message_key)
            VALUES (?)
            ON CONFLICT(message_key) DO NOTHING
            "#,
            [message_key],
        )?;
        Ok(())
    }

    // --- stats ---

    pub fn get_stats(&self) -> Result<StoreStats, DbError> {
        let total_connections: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))?;
        let active_connections: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM connections WHERE active = true",
            [],
            |row| row.get(0),
        )?;
        let total_emails: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
        let total_visibility_records: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM email_visibility",
            [],
            |row| row.get(0),
        )?;
        let total_processed_markers: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM processed_messages",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            total_connections,
            active_connections,
            total_emails,
            total_visibility_records,
            total_processed_markers,
        })
    }
}
