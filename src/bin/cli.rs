use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::rolling::RollingFileAppender;
use anyhow::Result;

use playlist_reconcile_engine as lib;
use lib::analyzer::Analyzer;
use lib::config::Config;
use lib::executor::Executor;
use lib::quota::QuotaLedger;
use lib::store::{SqliteStore, Store};
use lib::vault::Vault;

#[derive(Parser)]
#[command(name = "playlist-reconcile-engine", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "config/example-config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one Analyzer pass followed by one Executor pass, then exit.
    Tick,
    /// Run both tick loops continuously until Ctrl-C.
    Serve,
    /// Validate config file and exit.
    ConfigValidate,
    /// Auth helpers.
    Auth {
        #[command(subcommand)]
        sub: AuthCommands,
    },
    /// Mapping management (local stand-in for the external mapping UI).
    Mapping {
        #[command(subcommand)]
        sub: MappingCommands,
    },
    /// Reconciliation introspection.
    Reconcile {
        #[command(subcommand)]
        sub: ReconcileCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Authorize the streaming catalog service and store tokens in the DB.
    Spotify,
    /// Authorize the video platform service and store tokens in the DB.
    Youtube,
}

#[derive(Subcommand)]
enum MappingCommands {
    /// Register a new bidirectional mapping between a playlist on each side.
    Add(MappingAddArgs),
}

#[derive(Args)]
struct MappingAddArgs {
    #[arg(long)]
    source_ref_s: String,
    #[arg(long)]
    source_ref_y: String,
    #[arg(long)]
    name_s: Option<String>,
    #[arg(long)]
    name_y: Option<String>,
    #[arg(long, default_value_t = true)]
    sync_name: bool,
    #[arg(long, default_value_t = true)]
    sync_tracks: bool,
    #[arg(long, default_value_t = 60)]
    interval_minutes: i64,
}

#[derive(Subcommand)]
enum ReconcileCommands {
    /// Print mapping due-state, queue depth by status, and quota usage.
    Status,
    /// List or clear blacklist entries.
    Blacklist {
        /// Clear the blacklist entry with this id instead of listing.
        #[arg(long)]
        clear: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_path(&cli.config)?;

    // Keep the _guard alive for the duration of the process so the
    // non-blocking writer flushes on drop.
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "reconcile.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(non_blocking)
        .init();

    match cli.command {
        Commands::Tick => {
            let (store, vault, quota) = engine_deps(&cfg)?;
            let analyzer = Analyzer::new(store.clone(), vault.clone(), &cfg);
            let executor = Executor::new(store, vault, quota, &cfg);
            analyzer.tick().await;
            executor.tick().await;
        }
        Commands::Serve => {
            let (store, vault, quota) = engine_deps(&cfg)?;
            let analyzer = Analyzer::new(store.clone(), vault.clone(), &cfg);
            let executor = Executor::new(store, vault, quota, &cfg);
            run_serve(&cfg, analyzer, executor).await;
        }
        Commands::ConfigValidate => match Config::from_path(cli.config.as_path()) {
            Ok(_) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {}", e);
                std::process::exit(2);
            }
        },
        Commands::Auth { sub } => match sub {
            AuthCommands::Spotify => lib::api::spotify_auth::run_spotify_auth(&cfg).await?,
            AuthCommands::Youtube => lib::api::youtube_auth::run_youtube_auth(&cfg).await?,
        },
        Commands::Mapping { sub } => match sub {
            MappingCommands::Add(args) => {
                let store = SqliteStore::open(&cfg.db_path)?;
                let id = store
                    .insert_mapping(
                        &args.source_ref_s,
                        &args.source_ref_y,
                        args.name_s.as_deref(),
                        args.name_y.as_deref(),
                        args.sync_name,
                        args.sync_tracks,
                        args.interval_minutes,
                    )
                    .await?;
                println!("created mapping {}", id);
            }
        },
        Commands::Reconcile { sub } => match sub {
            ReconcileCommands::Status => {
                let store = SqliteStore::open(&cfg.db_path)?;
                let quota = QuotaLedger::new(cfg.youtube_daily_quota);
                print_status(&store, &quota).await?;
            }
            ReconcileCommands::Blacklist { clear } => {
                let store = SqliteStore::open(&cfg.db_path)?;
                match clear {
                    Some(id) => {
                        store.delete_blacklist(id).await?;
                        println!("cleared blacklist entry {}", id);
                    }
                    None => {
                        for entry in store.list_blacklist().await? {
                            println!(
                                "{}\tmapping={}\t{}\t{}\treason={}\tskips={}\tlast={}",
                                entry.id,
                                entry.mapping_id.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string()),
                                entry.destination_service,
                                entry.source_track_id,
                                entry.reason.as_str(),
                                entry.skip_counter,
                                entry.last_skipped_at,
                            );
                        }
                    }
                }
            }
        },
    }

    Ok(())
}

fn engine_deps(cfg: &Config) -> Result<(Arc<dyn Store>, Arc<Vault>, Arc<QuotaLedger>)> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg.db_path)?);
    let vault = Arc::new(Vault::new(store.clone()));
    let quota = Arc::new(QuotaLedger::new(cfg.youtube_daily_quota));
    Ok((store, vault, quota))
}

async fn run_serve(cfg: &Config, analyzer: Analyzer, executor: Executor) {
    let mut analyzer_tick = tokio::time::interval(std::time::Duration::from_secs(cfg.analyzer_interval_sec));
    let mut executor_tick = tokio::time::interval(std::time::Duration::from_secs(cfg.executor_interval_sec));
    loop {
        tokio::select! {
            _ = analyzer_tick.tick() => analyzer.tick().await,
            _ = executor_tick.tick() => executor.tick().await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
        }
    }
}

async fn print_status(store: &SqliteStore, quota: &QuotaLedger) -> Result<()> {
    let mappings = store.list_mappings().await?;
    println!("mappings: {}", mappings.len());
    for m in &mappings {
        println!(
            "  #{} {} <-> {} next_analysis_at={}",
            m.id,
            m.source_playlist_ref_s,
            m.source_playlist_ref_y,
            m.next_analysis_at.as_deref().unwrap_or("never")
        );
    }

    let counts = store.queue_status_counts().await?;
    println!("queue:");
    for status in ["pending", "running", "done", "skipped"] {
        println!("  {}: {}", status, counts.get(status).copied().unwrap_or(0));
    }

    let usage = quota.usage();
    println!("youtube quota: {}/{} (resets {})", usage.used, usage.limit, usage.reset_date);

    Ok(())
}
