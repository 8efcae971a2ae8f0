use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Direction, Mailbox};
use crate::provider::{MessagePart, RawMessage};

pub mod address;

pub use address::{parse_address, parse_recipients, Recipient, RecipientRole};

const MISSING_SUBJECT: &str = "no subject";
const HTML_RENDER_WIDTH: usize = 120;

/// Attachment metadata from a part carrying an out-of-line content
/// reference. Binary content is fetched separately and is not handled here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

/// Normalized result of parsing one fetched provider message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedEmail {
    /// Stable, provider-independent dedup key: the `Message-ID` header,
    /// falling back to the provider's internal id when absent.
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
    pub sender: Option<Mailbox>,
    pub recipients: Vec<Recipient>,
    pub received_at: DateTime<Utc>,
    pub labels: Vec<String>,
    pub attachments: Vec<AttachmentMeta>,
}

/// Parse a raw provider message into a `ParsedEmail`. Total: every field
/// degrades to a default rather than an error, so one malformed message
/// can never take down a sync batch on the parsing side.
pub fn parse_message(raw: &RawMessage, owner_email: &str) -> ParsedEmail {
    let subject =
        header_value(&raw.payload, "Subject").unwrap_or_else(|| MISSING_SUBJECT.to_string());
    let sender = header_value(&raw.payload, "From").map(|value| parse_address(&value));
    let in_reply_to = header_value(&raw.payload, "In-Reply-To");
    let references_chain = header_value(&raw.payload, "References");

    let mut recipients = Vec::new();
    for (name, role) in [
        ("To", RecipientRole::To),
        ("Cc", RecipientRole::Cc),
        ("Bcc", RecipientRole::Bcc),
    ] {
        if let Some(value) = header_value(&raw.payload, name) {
            recipients.extend(parse_recipients(&value, role));
        }
    }

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    collect_parts(&raw.payload, &mut body_text, &mut body_html, &mut attachments);

    // A message with only an HTML part still gets a usable text body.
    if body_text.is_none() {
        body_text = body_html.as_deref().and_then(html_to_text);
    }

    let labels = raw.label_ids.clone().unwrap_or_default();
    let direction = derive_direction(&labels, sender.as_ref(), owner_email);

    let message_key = header_value(&raw.payload, "Message-ID")
        .or_else(|| header_value(&raw.payload, "Message-Id"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| raw.id.clone());

    let received_at = derive_received_at(raw);
    let snippet = raw
        .snippet
        .as_deref()
        .map(decode_html_entities)
        .filter(|s| !s.is_empty());

    ParsedEmail {
        message_key,
        provider_id: raw.id.clone(),
        thread_id: raw.thread_id.clone(),
        in_reply_to,
        references_chain,
        direction,
        subject,
        body_text: body_text.unwrap_or_default(),
        body_html,
        snippet,
        sender,
        recipients,
        received_at,
        labels,
        attachments,
    }
}

/// Folder context a connection observed a message in, from provider labels.
pub fn folder_for_labels(labels: &[String]) -> String {
    if labels.iter().any(|l| l == "INBOX") {
        "inbox".to_string()
    } else if labels.iter().any(|l| l == "SENT") {
        "sent".to_string()
    } else if labels.iter().any(|l| l == "DRAFT" || l == "DRAFTS") {
        "drafts".to_string()
    } else if labels.iter().any(|l| l == "TRASH") {
        "trash".to_string()
    } else if labels.iter().any(|l| l == "SPAM") {
        "spam".to_string()
    } else {
        "other".to_string()
    }
}

pub fn is_read(labels: &[String]) -> bool {
    !labels.iter().any(|l| l == "UNREAD")
}

fn header_value(payload: &MessagePart, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Depth-first walk over the part tree. The first `text/plain` and first
/// `text/html` leaves win independently; parts are not assumed to arrive
/// in any canonical order, and containers are recursed into regardless of
/// their declared type. Attachment parts contribute metadata only.
fn collect_parts(
    part: &MessagePart,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentMeta>,
) {
    if let Some(attachment) = attachment_meta(part) {
        attachments.push(attachment);
        return;
    }

    let mime_type = part.mime_type.as_deref().unwrap_or("").to_ascii_lowercase();

    if let Some(body) = &part.body {
        if let Some(data) = body.data.as_deref().filter(|d| !d.is_empty()) {
            if let Some(decoded) = decode_part_data(data) {
                if mime_type == "text/plain" && body_text.is_none() {
                    *body_text = Some(decoded);
                } else if mime_type == "text/html" && body_html.is_none() {
                    *body_html = Some(decoded);
                }
            }
        }
    }

    if let Some(parts) = &part.parts {
        for child in parts {
            collect_parts(child, body_text, body_html, attachments);
        }
    }
}

/// A part is an attachment when it carries a non-empty filename and an
/// out-of-line content reference instead of inline decoded bytes.
fn attachment_meta(part: &MessagePart) -> Option<AttachmentMeta> {
    let filename = part.filename.as_deref().filter(|f| !f.is_empty())?;
    let body = part.body.as_ref()?;
    let attachment_id = body.attachment_id.as_deref()?;

    Some(AttachmentMeta {
        attachment_id: attachment_id.to_string(),
        filename: filename.to_string(),
        mime_type: part.mime_type.clone(),
        size: body.size,
    })
}

/// Decode URL-safe base64 body data. Content that is not valid UTF-8 is
/// reconstituted byte-for-byte as single-byte characters instead of
/// failing the message.
fn decode_part_data(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data).ok()?;
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(err) => Some(err.into_bytes().iter().map(|&b| b as char).collect()),
    }
}

fn html_to_text(html: &str) -> Option<String> {
    let rendered = std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .ok()?;

    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

fn derive_direction(labels: &[String], sender: Option<&Mailbox>, owner_email: &str) -> Direction {
    if labels.iter().any(|l| l == "SENT") {
        return Direction::Outbound;
    }
    if sender.is_some_and(|s| s.email.eq_ignore_ascii_case(owner_email.trim())) {
        return Direction::Outbound;
    }
    Direction::Inbound
}

/// Prefer the message's `Date` header; fall back to the provider's internal
/// timestamp (epoch milliseconds), then to now.
fn derive_received_at(raw: &RawMessage) -> DateTime<Utc> {
    if let Some(date_header) = header_value(&raw.payload, "Date") {
        if let Ok(parsed) = DateTime::parse_from_rfc2822(date_header.trim()) {
            return parsed.with_timezone(&Utc);
        }
    }

    raw.internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{folder_for_labels, is_read, parse_message, RecipientRole};
    use crate::db::models::Direction;
    use crate::provider::RawMessage;

    fn raw(payload: serde_json::Value) -> RawMessage {
        serde_json::from_value(payload).expect("deserialize raw message")
    }

    fn multipart_message() -> RawMessage {
        raw(json!({
            "id": "prov-1",
            "threadId": "thread-1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Hello &amp; welcome",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    { "name": "Subject", "value": "Quarterly Review" },
                    { "name": "From", "value": "Alex Smith <alex@example.com>" },
                    { "name": "To", "value": "owner@example.com, Bob <bob@example.com>" },
                    { "name": "Cc", "value": "cc@example.com" },
                    { "name": "Message-ID", "value": "<m1@mail.example.com>" },
                    { "name": "In-Reply-To", "value": "<m0@mail.example.com>" },
                    { "name": "References", "value": "<m0@mail.example.com>" },
                    { "name": "Date", "value": "Wed, 01 Jan 2026 12:00:00 +0000" }
                ],
                "body": { "size": 0 },
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "body": { "size": 0 },
                        "parts": [
                            {
                                "mimeType": "text/plain",
                                "body": { "size": 11, "data": "SGVsbG8gdGVhbSE" }
                            },
                            {
                                "mimeType": "text/html",
                                "body": { "size": 30, "data": "PHA-SGVsbG8gPGI-dGVhbTwvYj4hPC9wPg" }
                            }
                        ]
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": { "size": 50000, "attachmentId": "att-1" }
                    }
                ]
            },
            "internalDate": "1735732800000"
        }))
    }

    #[test]
    fn multipart_message_parses_headers_bodies_and_attachments() {
        let parsed = parse_message(&multipart_message(), "owner@example.com");

        assert_eq!(parsed.message_key, "<m1@mail.example.com>");
        assert_eq!(parsed.provider_id, "prov-1");
        assert_eq!(parsed.thread_id.as_deref(), Some("thread-1"));
        assert_eq!(parsed.subject, "Quarterly Review");
        assert_eq!(parsed.in_reply_to.as_deref(), Some("<m0@mail.example.com>"));
        assert_eq!(parsed.body_text, "Hello team!");
        assert!(parsed.body_html.is_some());
        assert_eq!(parsed.snippet.as_deref(), Some("Hello & welcome"));

        let sender = parsed.sender.expect("sender");
        assert_eq!(sender.email, "alex@example.com");
        assert_eq!(sender.name.as_deref(), Some("Alex Smith"));

        assert_eq!(parsed.recipients.len(), 3);
        assert_eq!(parsed.recipients[0].mailbox.email, "owner@example.com");
        assert_eq!(parsed.recipients[0].role, RecipientRole::To);
        assert_eq!(parsed.recipients[2].role, RecipientRole::Cc);

        assert_eq!(parsed.direction, Direction::Inbound);
        assert_eq!(parsed.received_at.to_rfc3339(), "2026-01-01T12:00:00+00:00");

        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].attachment_id, "att-1");
        assert_eq!(parsed.attachments[0].filename, "report.pdf");
    }

    #[test]
    fn html_only_message_synthesizes_text_body() {
        let message = raw(json!({
            "id": "prov-2",
            "threadId": "thread-2",
            "labelIds": ["INBOX"],
            "payload": {
                "mimeType": "text/html",
                "headers": [{ "name": "From", "value": "sender@example.com" }],
                "body": { "size": 30, "data": "PHA-SGVsbG8gPGI-dGVhbTwvYj4hPC9wPg" }
            },
            "internalDate": "1735732800000"
        }));

        let parsed = parse_message(&message, "owner@example.com");
        assert!(!parsed.body_text.is_empty());
        assert!(parsed.body_text.contains("Hello"));
        assert!(!parsed.body_text.contains('<'));
        assert!(!parsed.body_text.contains('>'));
        assert!(parsed.body_html.is_some());
    }

    #[test]
    fn sender_matching_owner_is_outbound_even_without_sent_label() {
        let message = raw(json!({
            "id": "prov-3",
            "threadId": "thread-3",
            "labelIds": ["INBOX"],
            "payload": {
                "mimeType": "text/plain",
                "headers": [{ "name": "From", "value": "Owner <OWNER@Example.COM>" }],
                "body": { "size": 15, "data": "SnVzdCBwbGFpbiB0ZXh0" }
            },
            "internalDate": "1735732800000"
        }));

        let parsed = parse_message(&message, "owner@example.com");
        assert_eq!(parsed.direction, Direction::Outbound);
    }

    #[test]
    fn sent_label_alone_makes_message_outbound() {
        let message = raw(json!({
            "id": "prov-4",
            "threadId": "thread-4",
            "labelIds": ["SENT"],
            "payload": {
                "mimeType": "text/plain",
                "headers": [{ "name": "From", "value": "other@example.com" }],
                "body": { "size": 15, "data": "SnVzdCBwbGFpbiB0ZXh0" }
            },
            "internalDate": "1735732800000"
        }));

        let parsed = parse_message(&message, "owner@example.com");
        assert_eq!(parsed.direction, Direction::Outbound);
    }

    #[test]
    fn missing_headers_fall_back_to_defaults() {
        let message = raw(json!({
            "id": "prov-5",
            "threadId": "thread-5",
            "payload": {
                "mimeType": "text/plain",
                "body": { "size": 15, "data": "SnVzdCBwbGFpbiB0ZXh0" }
            },
            "internalDate": "1735732800000"
        }));

        let parsed = parse_message(&message, "owner@example.com");
        assert_eq!(parsed.subject, "no subject");
        assert_eq!(parsed.message_key, "prov-5", "stable key falls back to provider id");
        assert!(parsed.sender.is_none());
        assert!(parsed.recipients.is_empty());
        // No Date header: internalDate epoch millis win.
        assert_eq!(parsed.received_at.timestamp_millis(), 1735732800000);
    }

    #[test]
    fn invalid_utf8_body_is_reconstituted_single_byte() {
        let message = raw(json!({
            "id": "prov-6",
            "threadId": "thread-6",
            "payload": {
                "mimeType": "text/plain",
                "body": { "size": 4, "data": "__5oaQ" }
            },
            "internalDate": "1735732800000"
        }));

        let parsed = parse_message(&message, "owner@example.com");
        assert!(parsed.body_text.ends_with("hi"));
        assert_eq!(parsed.body_text.chars().count(), 4);
    }

    #[test]
    fn inline_part_with_filename_but_no_reference_is_not_an_attachment() {
        let message = raw(json!({
            "id": "prov-7",
            "threadId": "thread-7",
            "payload": {
                "mimeType": "multipart/mixed",
                "body": { "size": 0 },
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "filename": "inline.txt",
                        "body": { "size": 15, "data": "SnVzdCBwbGFpbiB0ZXh0" }
                    }
                ]
            },
            "internalDate": "1735732800000"
        }));

        let parsed = parse_message(&message, "owner@example.com");
        assert!(parsed.attachments.is_empty());
        assert_eq!(parsed.body_text, "Just plain text");
    }

    #[test]
    fn folder_and_read_state_derivation() {
        assert_eq!(
            folder_for_labels(&["INBOX".to_string(), "UNREAD".to_string()]),
            "inbox"
        );
        assert_eq!(folder_for_labels(&["SENT".to_string()]), "sent");
        assert_eq!(folder_for_labels(&["Label_1".to_string()]), "other");
        assert!(!is_read(&["INBOX".to_string(), "UNREAD".to_string()]));
        assert!(is_read(&["INBOX".to_string()]));
    }
}
