use std::collections::HashSet;

use tracing::{debug, warn};

use crate::db::models::MailConnection;
use crate::provider::{MailProvider, MessageRef, ProviderError};

/// Recent-message window fetched when no valid cursor exists.
pub const FULL_SYNC_WINDOW: usize = 50;

#[derive(Debug, Clone)]
pub struct HistorySyncOutcome {
    /// New message references, in the order the provider reported them.
    pub messages: Vec<MessageRef>,
    /// Cursor to persist once the messages above have been ingested.
    pub new_cursor: String,
    pub full_sync: bool,
}

/// Decide between incremental and full sync for one connection and return
/// the newly observed message references plus the cursor to store.
///
/// A cursor the provider rejects as expired is recovered from silently by
/// running the full path; every other provider error propagates to the
/// caller untouched.
pub async fn run_history_sync(
    provider: &dyn MailProvider,
    connection: &MailConnection,
    access_token: &str,
    force_full: bool,
    max_messages: usize,
) -> Result<HistorySyncOutcome, ProviderError> {
    let cursor = if force_full {
        None
    } else {
        connection.history_cursor.as_deref()
    };

    let Some(cursor) = cursor else {
        return full_sync(provider, access_token, max_messages).await;
    };

    match incremental_sync(provider, access_token, cursor, max_messages).await {
        Ok(outcome) => Ok(outcome),
        Err(ProviderError::CursorExpired) => {
            warn!(
                connection = %connection.id,
                cursor, "history cursor expired, falling back to full sync"
            );
            full_sync(provider, access_token, max_messages).await
        }
        Err(other) => Err(other),
    }
}

async fn incremental_sync(
    provider: &dyn MailProvider,
    access_token: &str,
    cursor: &str,
    max_messages: usize,
) -> Result<HistorySyncOutcome, ProviderError> {
    let mut messages: Vec<MessageRef> = Vec::new();
    let mut seen = HashSet::new();
    let mut page_token: Option<String> = None;
    let mut new_cursor = cursor.to_string();

    loop {
        let page = provider
            .list_history(access_token, cursor, page_token.as_deref())
            .await?;

        let mut capped = false;
        for record in page.history.unwrap_or_default() {
            for added in record.messages_added.unwrap_or_default() {
                if seen.insert(added.message.id.clone()) {
                    messages.push(added.message);
                }
            }
            // When the per-pass cap is hit mid-stream, stop at this history
            // record's own id so the cursor never claims unfetched messages.
            if messages.len() >= max_messages {
                new_cursor = record.id.clone();
                capped = true;
                break;
            }
        }
        if capped {
            break;
        }

        new_cursor = page.history_id.clone();
        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    debug!(
        count = messages.len(),
        %new_cursor, "incremental history sync collected message references"
    );

    Ok(HistorySyncOutcome {
        messages,
        new_cursor,
        full_sync: false,
    })
}

async fn full_sync(
    provider: &dyn MailProvider,
    access_token: &str,
    max_messages: usize,
) -> Result<HistorySyncOutcome, ProviderError> {
    let profile = provider.get_profile(access_token).await?;

    let window = FULL_SYNC_WINDOW.min(max_messages.max(1));
    let listing = provider
        .list_recent_messages(access_token, window)
        .await?;
    let mut messages = listing.messages.unwrap_or_default();
    messages.truncate(window);

    debug!(
        count = messages.len(),
        cursor = %profile.history_id,
        "full sync collected recent message references"
    );

    Ok(HistorySyncOutcome {
        messages,
        new_cursor: profile.history_id,
        full_sync: true,
    })
}
