use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use echoreads_uploader::auth::AuthToken;
use echoreads_uploader::config::{self, UploaderConfig};
use echoreads_uploader::errors::safe_join;
use echoreads_uploader::notifications::{notify_batch_outcome, NotificationFeed, NotificationSettings};
use echoreads_uploader::uploader::{
    scan_upload_directory, BackendClient, FileHandle, OrderingHint, QueueEvent, UploadQueue,
    UploadStatus,
};

#[derive(Parser, Debug)]
#[command(name = "echoreads-uploader", version, about = "Upload magazine pages and media to EchoReads")]
struct Cli {
    /// Destination folder on the backend, usually the magazine id
    #[arg(long)]
    folder: String,

    /// Order files by the page number in their name (page_<N>.<ext>)
    #[arg(long)]
    by_page: bool,

    /// Upload each file on its own with a generated object name and print its URL
    #[arg(long)]
    simple: bool,

    /// Path to an alternative config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bearer token (defaults to $ECHOREADS_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Files or directories to upload
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

/// Reads the files to upload. Directories contribute only uploadable files;
/// files named explicitly are kept as-is and validated on enqueue.
async fn collect_files(
    paths: &[PathBuf],
    uploader_config: &UploaderConfig,
) -> anyhow::Result<Vec<FileHandle>> {
    let mut files = Vec::new();
    for path in paths {
        let entries = if path.is_dir() {
            scan_upload_directory(path, uploader_config)
                .await
                .with_context(|| format!("Failed to scan {}", path.display()))?
        } else {
            vec![path.clone()]
        };

        for entry in entries {
            let handle = FileHandle::from_path(&entry)
                .await
                .with_context(|| format!("Failed to read {}", entry.display()))?;
            files.push(handle);
        }
    }
    Ok(files)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let uploader_config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("Failed to load configuration")?;

    env_logger::Builder::from_default_env()
        .filter_level(uploader_config.log_filter())
        .init();

    log::info!("Starting EchoReads uploader");

    let token = match &cli.token {
        Some(token) => AuthToken::new(token)?,
        None => AuthToken::from_env()?,
    };

    let files = collect_files(&cli.paths, &uploader_config).await?;
    if files.is_empty() {
        bail!("No files found to upload");
    }

    let client = BackendClient::new(uploader_config.clone(), token)?;

    if cli.simple {
        let results = client.simple_upload_all(&files, &cli.folder).await?;
        let mut failed = 0;
        for (name, result) in &results {
            match result {
                Ok(url) => println!("{} -> {}", name, url),
                Err(e) => {
                    failed += 1;
                    println!("FAILED  {} - {}", name, e.item_message());
                }
            }
        }
        if failed > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let queue = UploadQueue::with_events(Arc::new(client), uploader_config.clone(), events_tx);

    let hint = if cli.by_page {
        OrderingHint::PageNumber
    } else {
        OrderingHint::InsertionOrder
    };
    queue.enqueue(files, hint)?;

    let cancel_handle = queue.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if cancel_handle.cancel() {
            eprintln!("Cancelling after the current file...");
        }
    }) {
        log::warn!("Failed to register Ctrl-C handler (non-critical): {}", e);
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                QueueEvent::ItemStatusChanged {
                    name,
                    to: UploadStatus::Uploading,
                    ..
                } => println!("Uploading {}", name),
                QueueEvent::ProgressUpdated { percent, .. } => println!("Progress: {}%", percent),
                QueueEvent::BatchFinished(_) => break,
                _ => {}
            }
        }
    });

    let outcome = queue.start(&cli.folder).await?;
    safe_join(printer, "event printer").await;

    for item in &outcome.items {
        match item.status {
            UploadStatus::Error => println!(
                "FAILED  {} - {}",
                item.display_name,
                item.error_message.as_deref().unwrap_or("Unknown error")
            ),
            status => println!("{:<7} {}", format!("{:?}", status).to_uppercase(), item.display_name),
        }
    }
    println!(
        "{} completed, {} failed{}",
        outcome.completed_count,
        outcome.error_count,
        if outcome.cancelled { ", cancelled" } else { "" }
    );

    if uploader_config.show_upload_notifications {
        match config::get_notifications_path() {
            Ok(path) => {
                let mut feed = NotificationFeed::load(path, NotificationSettings::default());
                notify_batch_outcome(&mut feed, &outcome, &cli.folder);
            }
            Err(e) => log::warn!("Notifications unavailable (non-critical): {}", e),
        }
    }

    if outcome.error_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}
