mod logging;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rowsync_adapters::FieldMapping;
use rowsync_core::{JobType, ResourceType};
use rowsync_sync::{
    build_cron_driver, drive_until_idle, progress_channel, JobRequest, LogLevel, ProgressFrame,
    ProgressSender, StartOutcome, SyncConfig, DEFAULT_STREAM_CAPACITY,
};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rowsync")]
#[command(about = "Reconcile CSV files with a remote REST API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or update remote records from a CSV file.
    Import(RowsArgs),
    /// Delete the remote records a CSV file resolves to.
    Delete(RowsArgs),
    /// Write every remote record of a resource to a CSV file.
    Export(ExportArgs),
    /// Run the next chunk of the active job.
    Next,
    /// Run chunks until the active job drains, or one per cron tick.
    Drive {
        #[arg(long)]
        cron: Option<String>,
    },
    Status,
    Cancel,
    /// Create the Postgres state table.
    Migrate,
    Serve,
}

#[derive(Debug, Args)]
struct RowsArgs {
    resource: ResourceType,
    #[arg(long)]
    input: PathBuf,
    /// YAML header -> field mapping; suggested from the headers when omitted.
    #[arg(long)]
    mapping: Option<PathBuf>,
    /// Per-row results file.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
}

impl RowsArgs {
    fn into_request(self, job_type: JobType) -> Result<JobRequest> {
        let mapping = self
            .mapping
            .as_deref()
            .map(FieldMapping::load)
            .transpose()
            .context("loading mapping")?;
        Ok(JobRequest {
            job_type,
            resource: self.resource,
            input_path: Some(self.input),
            mapping,
            output_path: self.output,
            dry_run: self.dry_run,
        })
    }
}

#[derive(Debug, Args)]
struct ExportArgs {
    resource: ResourceType,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    dry_run: bool,
}

impl ExportArgs {
    fn into_request(self) -> JobRequest {
        JobRequest {
            job_type: JobType::Export,
            resource: self.resource,
            input_path: None,
            mapping: None,
            output_path: Some(self.output),
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Import(args) => start(&config, args.into_request(JobType::Import)?).await?,
        Commands::Delete(args) => start(&config, args.into_request(JobType::Delete)?).await?,
        Commands::Export(args) => start(&config, args.into_request()).await?,
        Commands::Next => {
            let scheduler = config.build_scheduler().await?;
            let outcome = with_progress(|progress| scheduler.process_next_job(progress)).await?;
            if outcome.has_more {
                println!("job {}: more chunks pending", outcome.job_id);
            } else {
                println!("job {} finished ({:?})", outcome.job_id, outcome.status);
            }
        }
        Commands::Drive { cron } => {
            let scheduler = config.build_scheduler().await?;
            match cron.or_else(|| config.driver_cron.clone()) {
                Some(cron) => {
                    let mut sched = build_cron_driver(&cron, Arc::new(scheduler)).await?;
                    sched.start().await.context("starting driver schedule")?;
                    info!(%cron, "driver running; Ctrl-C stops it");
                    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                    sched.shutdown().await.context("stopping driver schedule")?;
                }
                None => match drive_until_idle(&scheduler).await? {
                    Some(summary) => println!("job finished: {}", summary.headline()),
                    None => println!("no active job"),
                },
            }
        }
        Commands::Status => match config.build_scheduler().await?.current_job().await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => println!("no active job"),
        },
        Commands::Cancel => {
            let job = config.build_scheduler().await?.cancel_job().await?;
            println!(
                "cancelled job {} after {} of {} chunks",
                job.id,
                job.completed_chunks(),
                job.chunks.len()
            );
        }
        Commands::Migrate => {
            if config.database_url.is_none() {
                bail!("DATABASE_URL is not set; the file state store needs no migration");
            }
            config.open_state_store().await?;
            println!("rowsync_state table ready");
        }
        Commands::Serve => rowsync_web::serve(&config).await?,
    }

    Ok(())
}

async fn start(config: &SyncConfig, request: JobRequest) -> Result<()> {
    let scheduler = config.build_scheduler().await?;
    match with_progress(|progress| scheduler.start_job(request, progress)).await? {
        StartOutcome::BatchStarted { job_id, estimate } => println!(
            "batch job {job_id}: {} rows in {} chunks; run `rowsync drive` to process it",
            estimate.rows, estimate.chunks
        ),
        StartOutcome::Completed(_) => {}
    }
    Ok(())
}

/// Print frames while `run` works; Ctrl-C cancels between rows.
async fn with_progress<F, Fut, T>(run: F) -> Result<T>
where
    F: FnOnce(ProgressSender) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (progress, rx) = progress_channel(DEFAULT_STREAM_CAPACITY);
    let token = progress.cancellation_token();
    let printer = tokio::spawn(print_frames(rx));
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted; stopping after the current row");
            token.cancel();
        }
    });
    let result = run(progress).await;
    interrupt.abort();
    let _ = printer.await;
    result
}

async fn print_frames(mut rx: mpsc::Receiver<ProgressFrame>) {
    while let Some(frame) = rx.recv().await {
        println!("{}", render_frame(&frame));
    }
}

fn render_frame(frame: &ProgressFrame) -> String {
    match frame {
        ProgressFrame::Progress { message, percent } => format!("[{percent:>3}%] {message}"),
        ProgressFrame::Log {
            level,
            message,
            detail,
        } => {
            let tag = match level {
                LogLevel::Info => "info",
                LogLevel::Success => "ok",
                LogLevel::Warn => "warn",
                LogLevel::Error => "error",
            };
            match detail {
                Some(detail) => format!("{tag:>5} {message} ({detail})"),
                None => format!("{tag:>5} {message}"),
            }
        }
        ProgressFrame::Complete { summary } => format!("done: {}", summary.headline()),
        ProgressFrame::Error { message } => format!("failed: {message}"),
    }
}
