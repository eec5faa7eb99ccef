use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clubsync_core::ImportStatus;
use clubsync_storage::{ImportStore, PgStore};
use clubsync_sync::{ops, ImportWorker, Supervisor, SyncConfig};
use clubsync_upstream::{ClubApi, GraphqlClient};
use clubsync_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "clubsync")]
#[command(about = "Import clubs, events and members from the upstream GraphQL API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the import worker and the background triggers until interrupted.
    Worker {
        /// Only run the import worker.
        #[arg(long)]
        no_triggers: bool,
    },
    /// Serve the JSON API, optionally with the worker in the same process.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: SocketAddr,
        #[arg(long)]
        with_worker: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Queue a full import for a club.
    Submit { club_id: String },
    /// List recent import jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Drive one club import to completion in the foreground.
    ImportOnce { club_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clubsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Worker { no_triggers: false }) {
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
        }
        Commands::Worker { no_triggers } => {
            config.triggers_enabled &= !no_triggers;
            let store = store(&config).await?;
            let supervisor = Supervisor::start(store, api(&config)?, &config);
            shutdown_signal().await;
            supervisor.shutdown().await;
        }
        Commands::Serve { addr, with_worker } => {
            let store = store(&config).await?;
            let supervisor = if with_worker {
                Some(Supervisor::start(store.clone(), api(&config)?, &config))
            } else {
                None
            };
            tokio::select! {
                result = clubsync_web::serve(AppState::new(store), addr) => result?,
                _ = shutdown_signal() => {}
            }
            if let Some(supervisor) = supervisor {
                supervisor.shutdown().await;
            }
        }
        Commands::Submit { club_id } => {
            let store = store(&config).await?;
            let job = ops::submit_club_import(store.as_ref(), &club_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Jobs { limit } => {
            let store = store(&config).await?;
            for job in ops::current_jobs(store.as_ref(), limit).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    job.id,
                    job.club_id,
                    job.status,
                    job.created_at.to_rfc3339(),
                    job.error
                );
            }
        }
        Commands::ImportOnce { club_id } => {
            let store = store(&config).await?;
            import_once(store, api(&config)?, &config, &club_id).await?;
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url).await
}

async fn store(config: &SyncConfig) -> Result<Arc<dyn ImportStore>> {
    let store = connect(config).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

fn api(config: &SyncConfig) -> Result<Arc<dyn ClubApi>> {
    let client = GraphqlClient::new(config.graphql_client_config())
        .context("building upstream client")?;
    Ok(Arc::new(client))
}

/// Submit a job and tick the worker until that job leaves the pending state.
/// Other pending jobs may be advanced along the way.
async fn import_once(
    store: Arc<dyn ImportStore>,
    api: Arc<dyn ClubApi>,
    config: &SyncConfig,
    club_id: &str,
) -> Result<()> {
    let job = ops::submit_club_import(store.as_ref(), club_id).await?;
    let worker = ImportWorker::new(store.clone(), api, config);
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        interrupt.cancel();
    });

    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("interrupted; job {} stays pending and resumes later", job.id);
        }
        let report = worker.tick(&cancel).await?;
        if let Some(report) = &report {
            println!("{}", serde_json::to_string(report)?);
        }
        let current = store
            .find_job(job.id)
            .await?
            .with_context(|| format!("job {} disappeared", job.id))?;
        match current.status {
            ImportStatus::Completed => {
                info!(job_id = job.id, "import finished");
                return Ok(());
            }
            ImportStatus::Failed => anyhow::bail!("job {} failed: {}", job.id, current.error),
            ImportStatus::Pending => {
                if !report.is_some_and(|r| r.made_progress()) {
                    tokio::time::sleep(config.poll_interval).await;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
