use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth;
use crate::db::models::MailConnection;
use crate::db::Database;
use crate::notifier::ClassifierHook;
use crate::parser;
use crate::provider::{MailProvider, ProviderError};

pub mod history;
pub mod ingest;

pub use history::{run_history_sync, HistorySyncOutcome, FULL_SYNC_WINDOW};
pub use ingest::{ingest, IngestOutcome};

const DEFAULT_MAX_MESSAGES_PER_CONNECTION: usize = 100;
const DEFAULT_WALL_CLOCK_BUDGET_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Restrict the pass to one connection (manual trigger).
    pub connection_id: Option<String>,
    /// Treat the stored cursor as absent for this pass only.
    pub force_full_sync: bool,
    pub max_messages_per_connection: usize,
    /// Once exceeded, no further connections are started; the one in
    /// flight finishes normally.
    pub wall_clock_budget: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            connection_id: None,
            force_full_sync: false,
            max_messages_per_connection: DEFAULT_MAX_MESSAGES_PER_CONNECTION,
            wall_clock_budget: Duration::from_secs(DEFAULT_WALL_CLOCK_BUDGET_SECS),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionReport {
    pub connection_id: String,
    pub account_email: String,
    pub synced_count: usize,
    pub new_count: usize,
    pub duplicate_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<String>,
    pub is_full_sync: bool,
}

impl ConnectionReport {
    fn new(connection: &MailConnection) -> Self {
        Self {
            connection_id: connection.id.clone(),
            account_email: connection.email_address.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRunReport {
    pub connections: Vec<ConnectionReport>,
    pub total_new: usize,
    pub total_duplicates: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
    /// Connections never started because the wall-clock budget ran out.
    pub connections_not_started: usize,
    pub duration_ms: u64,
}

/// Drive one pass over the selected connections. Each connection is
/// isolated: its credential, history, fetch, and store failures become
/// report entries and recorded connection errors, never a pass failure.
/// Only an unreachable store before any processing propagates as an error.
pub async fn run_sync_pass(
    provider: &dyn MailProvider,
    db: &Database,
    hook: &ClassifierHook,
    options: &SyncOptions,
) -> Result<SyncRunReport> {
    let started = Instant::now();

    let connections = match options.connection_id.as_deref() {
        Some(id) => {
            let connection = db
                .get_connection(id)
                .context("load targeted connection")?
                .ok_or_else(|| anyhow!("connection not found: {id}"))?;
            vec![connection]
        }
        None => db
            .list_connections(true)
            .context("load active connections")?,
    };

    let mut report = SyncRunReport::default();

    for mut connection in connections {
        if started.elapsed() > options.wall_clock_budget {
            warn!(
                connection = %connection.id,
                "wall-clock budget exhausted, not starting remaining connections"
            );
            report.connections_not_started += 1;
            continue;
        }

        let connection_report = sync_connection(provider, db, &mut connection, options).await;

        report.total_new += connection_report.new_count;
        report.total_duplicates += connection_report.duplicate_count;
        report.total_skipped += connection_report.skipped_count;
        report.total_errors += connection_report.errors.len();
        report.connections.push(connection_report);
    }

    report.duration_ms = started.elapsed().as_millis() as u64;

    if report.total_new > 0 {
        hook.fire(report.total_new);
    }

    info!(
        connections = report.connections.len(),
        new = report.total_new,
        duplicates = report.total_duplicates,
        skipped = report.total_skipped,
        errors = report.total_errors,
        duration_ms = report.duration_ms,
        "sync pass finished"
    );

    Ok(report)
}

async fn sync_connection(
    provider: &dyn MailProvider,
    db: &Database,
    connection: &mut MailConnection,
    options: &SyncOptions,
) -> ConnectionReport {
    let mut report = ConnectionReport::new(connection);

    let access_token = match auth::ensure_fresh_token(provider, db, connection).await {
        Ok(token) => token,
        Err(error) => {
            warn!(connection = %connection.id, %error, "credential refresh failed");
            record_failure(db, connection, &mut report, format!("credential: {error}"));
            return report;
        }
    };

    let outcome = match run_history_sync(
        provider,
        connection,
        &access_token,
        options.force_full_sync,
        options.max_messages_per_connection,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(connection = %connection.id, %error, "history sync failed");
            record_failure(db, connection, &mut report, format!("history: {error}"));
            return report;
        }
    };
    report.is_full_sync = outcome.full_sync;

    let mut rate_limited = false;
    for reference in &outcome.messages {
        let raw = match provider.get_message(&access_token, &reference.id).await {
            Ok(raw) => raw,
            Err(error @ ProviderError::RateLimited(_)) => {
                // Remaining work for this connection is abandoned and the
                // prior cursor kept, so the next pass retries this window.
                warn!(connection = %connection.id, %error, "rate limited mid-batch");
                report.errors.push(format!("fetch id={}: {error}", reference.id));
                rate_limited = true;
                break;
            }
            Err(error) => {
                report
                    .errors
                    .push(format!("fetch id={}: {error}", reference.id));
                continue;
            }
        };

        let parsed = parser::parse_message(&raw, &connection.email_address);
        match ingest(db, &parsed, connection) {
            Ok(IngestOutcome::Stored(_)) => {
                report.new_count += 1;
                report.synced_count += 1;
            }
            Ok(IngestOutcome::Duplicate(_)) => {
                report.duplicate_count += 1;
                report.synced_count += 1;
            }
            Ok(IngestOutcome::Skipped) => {
                report.skipped_count += 1;
                report.synced_count += 1;
            }
            Err(error) => {
                report
                    .errors
                    .push(format!("store id={}: {error}", reference.id));
            }
        }
    }

    if rate_limited {
        let message = report
            .errors
            .last()
            .cloned()
            .unwrap_or_else(|| "rate limited".to_string());
        if let Err(db_error) = db.record_connection_error(&connection.id, &message) {
            report
                .errors
                .push(format!("record connection error: {db_error}"));
        }
        return report;
    }

    // Cursor and sync timestamp move only after the batch has been
    // processed; a pass never claims messages it did not ingest.
    if let Err(db_error) = db.complete_connection_pass(&connection.id, &outcome.new_cursor) {
        report
            .errors
            .push(format!("persist cursor: {db_error}"));
    }

    report
}

fn record_failure(
    db: &Database,
    connection: &MailConnection,
    report: &mut ConnectionReport,
    message: String,
) {
    if let Err(db_error) = db.record_connection_error(&connection.id, &message) {
        report
            .errors
            .push(format!("record connection error: {db_error}"));
    }
    report.errors.push(message);
}
