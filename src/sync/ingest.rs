use tracing::debug;

use crate::db::models::{MailConnection, Mailbox, StoredAttachment, VisibilityRecord};
use crate::db::{Database, DbError, NewEmail};
use crate::parser::{folder_for_labels, is_read, ParsedEmail, RecipientRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sighting anywhere: a new shared email row was created.
    Stored(i64),
    /// The stable key already had a row; only this user's visibility moved.
    Duplicate(i64),
    /// The key carries a processed marker and is never re-imported.
    Skipped,
}

/// Ingest one parsed message on behalf of a connection.
///
/// The shared email row is created at most once per stable key across all
/// connections; a concurrent pass that wins the insert race is converged
/// on through the store's uniqueness constraint. The per-user visibility
/// record and attachment metadata are upserted on every observing sync.
pub fn ingest(
    db: &Database,
    parsed: &ParsedEmail,
    connection: &MailConnection,
) -> Result<IngestOutcome, DbError> {
    if db.is_processed(&parsed.message_key)? {
        debug!(
            key = %parsed.message_key,
            "skipping ingestion of retired message"
        );
        return Ok(IngestOutcome::Skipped);
    }

    let (email_id, inserted) = match db.find_email_by_key(&parsed.message_key)? {
        Some(existing) => (existing.id, false),
        None => db.insert_or_get_email(&new_email_from(parsed))?,
    };

    db.upsert_visibility(&VisibilityRecord {
        email_id,
        user_id: connection.user_id.clone(),
        folder: folder_for_labels(&parsed.labels),
        is_read: is_read(&parsed.labels),
    })?;

    for attachment in &parsed.attachments {
        db.upsert_attachment(&StoredAttachment {
            email_id,
            provider_attachment_id: attachment.attachment_id.clone(),
            filename: attachment.filename.clone(),
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.size.map(|s| s as i64),
        })?;
    }

    if inserted {
        Ok(IngestOutcome::Stored(email_id))
    } else {
        Ok(IngestOutcome::Duplicate(email_id))
    }
}

fn new_email_from(parsed: &ParsedEmail) -> NewEmail {
    let addresses_with_role = |role: RecipientRole| -> Vec<Mailbox> {
        parsed
            .recipients
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.mailbox.clone())
            .collect()
    };

    NewEmail {
        message_key: parsed.message_key.clone(),
        provider_id: parsed.provider_id.clone(),
        thread_id: parsed.thread_id.clone(),
        in_reply_to: parsed.in_reply_to.clone(),
        references_chain: parsed.references_chain.clone(),
        direction: parsed.direction,
        subject: parsed.subject.clone(),
        body_text: parsed.body_text.clone(),
        body_html: parsed.body_html.clone(),
        snippet: parsed.snippet.clone(),
        from_address: parsed.sender.as_ref().map(|s| s.email.clone()),
        from_name: parsed.sender.as_ref().and_then(|s| s.name.clone()),
        to_addresses: addresses_with_role(RecipientRole::To),
        cc_addresses: addresses_with_role(RecipientRole::Cc),
        bcc_addresses: addresses_with_role(RecipientRole::Bcc),
        received_at: parsed.received_at.to_rfc3339(),
        labels: parsed.labels.clone(),
    }
}
