use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// Whether the owning account sent or received a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("invalid direction: {other}")),
        }
    }
}

/// An `{email, display name}` pair from an address header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mailbox {
    pub email: String,
    pub name: Option<String>,
}

/// One authorized link between a local user and an external mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailConnection {
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub history_cursor: Option<String>,
    pub last_synced_at: Option<String>,
    pub active: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
}

/// The durable, deduplicated message record shared across all connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEmail {
    pub id: i64,
    pub message_key: String,
    pub provider_id: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references_chain: Option<String>,
    pub direction: Direction,
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
    pub first_seen_at: Option<String>,
}

/// Per-user view of a shared email: folder context and read state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisibilityRecord {
    pub email_id: i64,
    pub user_id: String,
    pub folder: String,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredAttachment {
    pub email_id: i64,
    pub provider_attachment_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Vec<T> {
    raw.and_then(|s| serde_json::from_str::<Vec<T>>(&s).ok())
        .unwrap_or_default()
}

fn conversion_failure(raw: &str, detail: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            detail.to_string(),
        )),
    )
}

impl MailConnection {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let expires_raw: String = row.get("token_expires_at")?;
        let token_expires_at = DateTime::parse_from_rfc3339(&expires_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_failure(&expires_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            email_address: row.get("email_address")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            token_expires_at,
            history_cursor: row.get("history_cursor")?,
            last_synced_at: row.get("last_synced_at")?,
            active: row.get("active")?,
            last_error: row.get("last_error")?,
            last_error_at: row.get("last_error_at")?,
        })
    }
}

impl StoredEmail {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let direction_raw: String = row.get("direction")?;
        let direction = Direction::from_str(&direction_raw)
            .map_err(|e| conversion_failure(&direction_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            message_key: row.get("message_key")?,
            provider_id: row.get("provider_id")?,
            thread_id: row.get("thread_id")?,
            in_reply_to: row.get("in_reply_to")?,
            references_chain: row.get("references_chain")?,
            direction,
            subject: row.get("subject")?,
            body_text: row.get("body_text")?,
            body_html: row.get("body_html")?,
            snippet: row.get("snippet")?,
            from_address: row.get("from_address")?,
            from_name: row.get("from_name")?,
            to_addresses: parse_json_list(row.get("to_addresses")?),
            cc_addresses: parse_json_list(row.get("cc_addresses")?),
            bcc_addresses: parse_json_list(row.get("bcc_addresses")?),
            received_at: row.get("received_at")?,
            labels: parse_json_list(row.get("labels")?),
            first_seen_at: row.get("first_seen_at")?,
        })
    }
}

impl VisibilityRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            email_id: row.get("email_id")?,
            user_id: row.get("user_id")?,
            folder: row.get("folder")?,
            is_read: row.get("is_read")?,
        })
    }
}

impl StoredAttachment {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            email_id: row.get("email_id")?,
            provider_attachment_id: row.get("provider_attachment_id")?,
            filename: row.get("filename")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Direction, MailConnection, Mailbox};

    #[test]
    fn direction_display_and_parse() {
        assert_eq!(Direction::Inbound.to_string(), "inbound");
        assert_eq!(
            "outbound".parse::<Direction>().expect("parse direction"),
            Direction::Outbound
        );
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn serde_round_trip_connection() {
        let connection = MailConnection {
            id: "conn-1".to_string(),
            user_id: "user-1".to_string(),
            email_address: "owner@example.com".to_string(),
            access_token: "tok".to_string(),
            refresh_token: "refresh".to_string(),
            token_expires_at: Utc::now(),
            history_cursor: Some("100".to_string()),
            last_synced_at: None,
            active: true,
            last_error: None,
            last_error_at: None,
        };

        let json = serde_json::to_string(&connection).expect("serialize connection");
        let _: MailConnection = serde_json::from_str(&json).expect("deserialize connection");
    }

    #[test]
    fn mailbox_list_json_round_trip() {
        let boxes = vec![
            Mailbox {
                email: "a@example.com".to_string(),
                name: Some("A".to_string()),
            },
            Mailbox {
                email: "b@example.com".to_string(),
                name: None,
            },
        ];

        let json = serde_json::to_string(&boxes).expect("serialize mailboxes");
        let back: Vec<Mailbox> = serde_json::from_str(&json).expect("deserialize mailboxes");
        assert_eq!(back, boxes);
    }
}
