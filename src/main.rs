use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use resumable_media_upload::capture::CapturedChunk;
use resumable_media_upload::config::UploadConfig;
use resumable_media_upload::events::{QueueEvent, QueueProgress};
use resumable_media_upload::runner::RunOutcome;
use resumable_media_upload::service::{aggregate_progress, RecordingSession, UploadService};
use resumable_media_upload::QueueKind;

#[derive(Parser, Debug)]
#[command(author, version, about = "Durable, resumable chunked media uploads")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload files as the chunks of one recording and wait for the stitched object
    Upload {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Draft identifier of the recording
        #[arg(short, long)]
        draft: String,

        /// Track type
        #[arg(short, long, value_enum, default_value = "audio")]
        kind: QueueKind,

        /// Store identifier (overrides config file)
        #[arg(long)]
        store: Option<String>,

        /// Chunk files, in capture order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the recovery scan and drive every reattached queue to completion
    Resume {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Only recover this draft (default: every draft in the store)
        #[arg(short, long)]
        draft: Option<String>,

        /// Store identifier (overrides config file)
        #[arg(long)]
        store: Option<String>,
    },
    /// List persisted queues and their progress
    Status {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Store identifier (overrides config file)
        #[arg(long)]
        store: Option<String>,
    },
    /// Ask the instance driving a queue to delete it
    Flush {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Draft identifier of the recording
        #[arg(short, long)]
        draft: String,

        /// Track type
        #[arg(short, long, value_enum)]
        kind: QueueKind,

        /// Store identifier (overrides config file)
        #[arg(long)]
        store: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match args.command {
        Command::Upload {
            config,
            draft,
            kind,
            store,
            files,
        } => rt.block_on(upload(config, draft, kind, store, files)),
        Command::Resume {
            config,
            draft,
            store,
        } => rt.block_on(resume(config, draft, store)),
        Command::Status { config, store } => rt.block_on(status(config, store)),
        Command::Flush {
            config,
            draft,
            kind,
            store,
        } => rt.block_on(flush(config, draft, kind, store)),
    }
}

fn load(
    config_path: &Path,
    store: Option<String>,
) -> Result<(UploadService, String), Box<dyn std::error::Error>> {
    let config = UploadConfig::load(config_path)?;
    let store_id = store.unwrap_or_else(|| config.store_id.clone());
    Ok((UploadService::from_config(&config)?, store_id))
}

/// Print events of a session until its queue finishes
fn print_events(session: &mut RecordingSession) {
    let Some(mut events) = session.take_events() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                QueueEvent::Progress(p) => println!(
                    "[{}] {}: {}/{} bytes uploaded",
                    p.kind, p.status, p.uploaded_bytes, p.total_bytes
                ),
                QueueEvent::Error { kind, error, fatal } => eprintln!(
                    "[{}] {}{}",
                    kind,
                    error,
                    if fatal { " (giving up)" } else { "" }
                ),
                QueueEvent::Complete(object) => {
                    println!("[{}] Stitched {} -> {}", object.kind, object.path, object.url)
                }
            }
        }
    });
}

fn report_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(object) => println!("Done: {}", object.url),
        RunOutcome::Finished(status) => println!("Finished with status {}", status),
        RunOutcome::Cancelled => println!("Cancelled"),
    }
}

async fn upload(
    config_path: PathBuf,
    draft: String,
    kind: QueueKind,
    store: Option<String>,
    files: Vec<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, store_id) = load(&config_path, store)?;

    let mut chunks = Vec::with_capacity(files.len());
    for file in &files {
        let data = tokio::fs::read(file)
            .await
            .map_err(|e| format!("Failed to read chunk '{}': {}", file.display(), e))?;
        chunks.push(CapturedChunk::new(data));
    }

    let mut session = service.start_recording(&store_id, &draft, kind).await?;
    print_events(&mut session);

    let accepted = session.ingest(tokio_stream::iter(chunks)).await?;
    println!("Queued {} chunk(s) for draft {} ({})", accepted, draft, kind);
    session.stop().await?;

    let outcome = session.wait().await?;
    report_outcome(&outcome);
    Ok(())
}

async fn resume(
    config_path: PathBuf,
    draft: Option<String>,
    store: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, store_id) = load(&config_path, store)?;

    let sessions = match &draft {
        Some(draft) => service.recover(&store_id, draft).await?,
        None => service.recover_all(&store_id).await?,
    };
    if sessions.is_empty() {
        println!("Nothing to resume");
        return Ok(());
    }

    println!("Resuming {} queue(s)", sessions.len());
    for mut session in sessions {
        print_events(&mut session);
        let outcome = session.wait().await?;
        report_outcome(&outcome);
    }
    Ok(())
}

async fn status(
    config_path: PathBuf,
    store: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, store_id) = load(&config_path, store)?;
    let records = service.list_queues(&store_id).await?;
    if records.is_empty() {
        println!("No queues in store {}", store_id);
        return Ok(());
    }

    let mut drafts: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for record in &records {
        println!(
            "{:<40} {:<10} {:>4} pending  {:>12}/{:<12} bytes{}",
            record.queue_key,
            record.status,
            record.record_queue.len(),
            record.uploaded_size,
            record.total_size,
            if record.network_down { "  (network down)" } else { "" }
        );
        drafts
            .entry(record.draft_id.clone())
            .or_default()
            .push(QueueProgress {
                kind: record.kind,
                status: record.status,
                uploaded_bytes: record.uploaded_size,
                total_bytes: record.total_size,
            });
    }

    for (draft, progress) in drafts {
        if let Some(agg) = aggregate_progress(&progress) {
            println!("Draft {}: {} ({}%)", draft, agg.status, agg.percentage);
        }
    }
    Ok(())
}

async fn flush(
    config_path: PathBuf,
    draft: String,
    kind: QueueKind,
    store: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (service, store_id) = load(&config_path, store)?;
    service.request_flush(&store_id, &draft, kind).await?;
    println!("Flush requested for draft {} ({})", draft, kind);
    Ok(())
}
