use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailfeed", version, about = "Mailbox ingestion and synchronization engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over active connections
    Sync(SyncArgs),
    /// Manage mailbox connections
    Connections {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
    /// Show store statistics
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Restrict the pass to one connection id
    #[arg(long)]
    connection: Option<String>,
    /// Ignore the stored cursor for this pass
    #[arg(long, default_value_t = false)]
    full: bool,
    /// Re-run the pass every 60 seconds
    #[arg(long, default_value_t = false)]
    watch: bool,
    /// Per-connection message cap for one pass
    #[arg(long, default_value_t = 100)]
    max_messages: usize,
}

#[derive(Debug, Subcommand)]
enum ConnectionCommands {
    /// List connections
    List,
    /// Register a new mailbox connection
    Add {
        user_id: String,
        email: String,
        /// OAuth refresh token for the mailbox account
        #[arg(long, env = "MAILFEED_REFRESH_TOKEN")]
        refresh_token: String,
    },
    /// Mark a connection inactive
    Disconnect { connection_id: String },
    /// Show per-connection sync status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{Context, Result};
    use chrono::Utc;
    use uuid::Uuid;

    use mailfeed::db::models::MailConnection;
    use mailfeed::db::Database;
    use mailfeed::notifier::ClassifierHook;
    use mailfeed::provider::HttpMailProvider;
    use mailfeed::sync::{run_sync_pass, SyncOptions, SyncRunReport};

    use super::{Cli, Commands, ConnectionCommands, SyncArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Sync(args) => handle_sync(args, cli.json).await,
            Commands::Connections { command } => handle_connections(command).await,
            Commands::Stats => handle_stats(cli.json).await,
        }
    }

    fn open_default_db() -> Result<Database> {
        let db_path = Database::default_db_path().context("resolve default database path")?;
        Database::open(&db_path)
            .with_context(|| format!("open mailfeed database at {}", db_path.display()))
    }

    async fn handle_sync(args: SyncArgs, json: bool) -> Result<()> {
        let db = open_default_db()?;
        let provider =
            HttpMailProvider::from_env().context("resolve provider client credentials")?;
        let hook = ClassifierHook::from_env();

        let options = SyncOptions {
            connection_id: args.connection,
            force_full_sync: args.full,
            max_messages_per_connection: args.max_messages,
            ..SyncOptions::default()
        };

        if args.watch {
            loop {
                let report = run_sync_pass(&provider, &db, &hook, &options).await?;
                print_sync_report(&report, json)?;
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        } else {
            let report = run_sync_pass(&provider, &db, &hook, &options).await?;
            print_sync_report(&report, json)
        }
    }

    fn print_sync_report(report: &SyncRunReport, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }

        println!("Sync pass complete in {}ms", report.duration_ms);
        for connection in &report.connections {
            println!(
                "{}  {}  synced={} new={} duplicates={} skipped={} full_sync={}",
                connection.connection_id,
                connection.account_email,
                connection.synced_count,
                connection.new_count,
                connection.duplicate_count,
                connection.skipped_count,
                connection.is_full_sync,
            );
            for error in &connection.errors {
                println!("  - {error}");
            }
        }
        if report.connections_not_started > 0 {
            println!(
                "{} connection(s) not started: wall-clock budget exhausted",
                report.connections_not_started
            );
        }
        Ok(())
    }

    async fn handle_connections(command: ConnectionCommands) -> Result<()> {
        let db = open_default_db()?;

        match command {
            ConnectionCommands::List => {
                let connections = db.list_connections(false)?;
                if connections.is_empty() {
                    println!("No connections configured.");
                } else {
                    println!("Connections");
                    println!("===========");
                    for connection in connections {
                        println!(
                            "{}  {}  user={}  active={}",
                            connection.id,
                            connection.email_address,
                            connection.user_id,
                            connection.active
                        );
                    }
                }
            }
            ConnectionCommands::Add {
                user_id,
                email,
                refresh_token,
            } => {
                let connection = MailConnection {
                    id: Uuid::new_v4().to_string(),
                    user_id,
                    email_address: email.trim().to_ascii_lowercase(),
                    access_token: String::new(),
                    refresh_token,
                    // Already expired: the first pass refreshes before use.
                    token_expires_at: Utc::now(),
                    history_cursor: None,
                    last_synced_at: None,
                    active: true,
                    last_error: None,
                    last_error_at: None,
                };
                db.insert_connection(&connection)?;
                println!("Added connection: {}", connection.id);
            }
            ConnectionCommands::Disconnect { connection_id } => {
                let updated = db.deactivate_connection(&connection_id)?;
                if updated == 0 {
                    println!("No connection found: {connection_id}");
                } else {
                    println!("Disconnected: {connection_id}");
                }
            }
            ConnectionCommands::Status => {
                let connections = db.list_connections(false)?;
                if connections.is_empty() {
                    println!("No connections configured.");
                } else {
                    println!("Connection Sync Status");
                    println!("======================");
                    for connection in connections {
                        println!(
                            "{}  active={}  cursor={}  last_sync={}  last_error={}",
                            connection.id,
                            connection.active,
                            connection.history_cursor.as_deref().unwrap_or("none"),
                            connection.last_synced_at.as_deref().unwrap_or("never"),
                            connection.last_error.as_deref().unwrap_or("none"),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_stats(json: bool) -> Result<()> {
        let db = open_default_db()?;
        let stats = db.get_stats()?;

        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Connections: {} ({} active)", stats.total_connections, stats.active_connections);
            println!("Emails: {}", stats.total_emails);
            println!("Visibility records: {}", stats.total_visibility_records);
            println!("Processed markers: {}", stats.total_processed_markers);
        }
        Ok(())
    }
}
