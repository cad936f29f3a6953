//! courier - enqueue uploads and run the upload queue.
//!
//! Configuration comes from `--config <file.json>`, then `COURIER_*`
//! environment variables (a `.env` file is loaded first).

mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier_core::typed::Task;
use courier_core::{CourierConfig, DispatcherBuilder, SqliteTaskStore, TaskStore, TaskType};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::upload::{UploadMovieHandler, UploadPayload};

#[derive(Parser)]
#[command(name = "courier", about = "Persistent upload task queue")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a file for upload
    Enqueue {
        /// Path to the media file
        file: PathBuf,
        /// Display title
        #[arg(long)]
        title: String,
        /// TMDB id of the movie or show
        #[arg(long)]
        media_id: Option<u64>,
        /// Season number (episodes only)
        #[arg(long, requires = "episode")]
        season: Option<u32>,
        /// Episode number (episodes only)
        #[arg(long, requires = "season")]
        episode: Option<u32>,
        /// Upload id; defaults to the file name
        #[arg(long)]
        upload_id: Option<String>,
        /// Attempt budget; defaults to queue.defaultMaxAttempts
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Process the queue until Ctrl-C
    Run,
    /// Show queue counts and unfinished tasks
    Status,
    /// Reset stuck Processing tasks to Pending
    Recover,
    /// Delete old completed tasks
    Cleanup {
        /// Retention in days; defaults to queue.retentionDays
        #[arg(long)]
        days: Option<u32>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,courier_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CourierConfig> {
    let mut config = match path {
        Some(path) => CourierConfig::from_json_file(path)
            .with_context(|| format!("Load config from {}", path.display()))?,
        None => CourierConfig::default(),
    };
    config.apply_env().context("Apply COURIER_* overrides")?;
    config.validate()?;
    Ok(config)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

#[derive(Serialize)]
struct UnfinishedRow {
    id: i64,
    task_type: String,
    status: String,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<String>,
    created_at: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store = SqliteTaskStore::open(&config.database.path)
        .await
        .with_context(|| format!("Open queue database {}", config.database.path.display()))?;

    match cli.command {
        Commands::Enqueue {
            file,
            title,
            media_id,
            season,
            episode,
            upload_id,
            max_attempts,
        } => {
            let upload_id = upload_id.unwrap_or_else(|| {
                file.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string())
            });
            let payload = UploadPayload {
                upload_id,
                tmdb_id: media_id,
                title,
                file_path: file,
                season,
                episode,
            };
            let bytes = serde_json::to_vec(&payload).context("Serialize upload payload")?;
            let max_attempts = max_attempts.unwrap_or(config.queue.default_max_attempts);
            let id = store
                .enqueue(&TaskType::new(UploadPayload::TYPE), &bytes, max_attempts)
                .await?;
            println!("{id}");
        }
        Commands::Run => {
            let dispatcher = DispatcherBuilder::new(Arc::new(store.clone()))
                .config(config.dispatcher_config())
                .register_typed::<UploadPayload, _>(UploadMovieHandler)?
                .expect_tasks(&[UploadPayload::TYPE])
                .build()?;
            dispatcher.start().await?;

            tokio::signal::ctrl_c().await.context("Wait for Ctrl-C")?;
            info!("shutdown requested; draining workers");
            dispatcher.stop().await;
        }
        Commands::Status => {
            print_json(&store.counts_by_status().await?)?;
            let rows: Vec<UnfinishedRow> = store
                .list_unfinished()
                .await?
                .into_iter()
                .map(|task| UnfinishedRow {
                    id: task.id.get(),
                    task_type: task.task_type.to_string(),
                    status: task.status.to_string(),
                    attempts: task.attempts,
                    max_attempts: task.max_attempts,
                    last_error: task.last_error,
                    created_at: task.created_at.to_rfc3339(),
                })
                .collect();
            print_json(&rows)?;
        }
        Commands::Recover => {
            let threshold = Duration::from_secs(config.queue.stuck_threshold_secs);
            let recovered = store.recover_stuck(threshold).await?;
            println!("recovered {recovered} stuck task(s)");
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.queue.retention_days);
            let removed = store.cleanup(days).await?;
            println!("removed {removed} completed task(s) older than {days} day(s)");
        }
    }

    store.close().await;
    Ok(())
}
