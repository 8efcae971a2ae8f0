use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            email_address TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_expires_at TEXT NOT NULL,
            history_cursor TEXT,
            last_synced_at TEXT,
            active BOOLEAN NOT NULL DEFAULT true,
            last_error TEXT,
            last_error_at TEXT
        );

        CREATE TABLE IF NOT EXISTS emails (
            id INTEGER PRIMARY KEY,
            message_key TEXT NOT NULL UNIQUE,
            provider_id TEXT NOT NULL,
            thread_id TEXT,
            in_reply_to TEXT,
            references_chain TEXT,
            direction TEXT NOT NULL CHECK(direction IN ('inbound', 'outbound')),
            subject TEXT NOT NULL,
            body_text TEXT NOT NULL,
            body_html TEXT,
            snippet TEXT,
            from_address TEXT,
            from_name TEXT,
            to_addresses TEXT,
            cc_addresses TEXT,
            bcc_addresses TEXT,
            received_at TEXT NOT NULL,
            labels TEXT,
            first_seen_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS email_visibility (
            email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            folder TEXT NOT NULL,
            is_read BOOLEAN NOT NULL DEFAULT false,
            UNIQUE(email_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS email_attachments (
            email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            provider_attachment_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            mime_type TEXT,
            size_bytes INTEGER,
            UNIQUE(email_id, provider_attachment_id)
        );

        CREATE TABLE IF NOT EXISTS processed_messages (
            message_key TEXT PRIMARY KEY,
            processed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_connections_user_id ON connections(user_id);
        CREATE INDEX IF NOT EXISTS idx_emails_thread_id ON emails(thread_id);
        CREATE INDEX IF NOT EXISTS idx_emails_received_at ON emails(received_at);
        CREATE INDEX IF NOT EXISTS idx_visibility_user_id ON email_visibility(user_id);
        "#,
    )?;

    Ok(())
}
