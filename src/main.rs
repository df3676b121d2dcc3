// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use reeldown::config::{config_path, load_config, save_config, Config};
use reeldown::download::{
    DownloadOptions, DownloadService, DownloadedAsset, MediaItem, MediaSource, MetadataStore, SimulatedEngine,
    StartRequest, TemplateResolver,
};
use reeldown::download::{AssetStore, DownloadNotice};
use reeldown::{format_error, DownloadError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - invalid input data format
    pub const DATA_ERR: i32 = 65;
    /// Service unavailable - the engine refused the job
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// I/O error - network or file operation failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - cancelled, try again later
    pub const TEMP_FAIL: i32 = 75;
}

use exit_codes::*;

/// reeldown - Download media for offline viewing.
#[derive(Parser)]
#[command(name = "reeldown")]
#[command(version = VERSION)]
#[command(about = "Download media for offline viewing.")]
#[command(long_about = "reeldown - media download orchestration\n\n\
    Download an item:    reeldown download <ID> --name <NAME>\n\
    List downloads:      reeldown list\n\
    Inspect one:         reeldown show <ID>\n\
    Remove one:          reeldown delete <ID>\n\
    Configuration:       reeldown config [show|set-downloads-dir|set-server-url]")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the downloads directory
    #[arg(long, global = true, value_name = "DIR")]
    downloads_dir: Option<PathBuf>,

    /// Override the media server URL
    #[arg(long, global = true, value_name = "URL")]
    server_url: Option<String>,

    /// Quiet mode: only log errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an item
    ///
    /// Examples:
    ///   reeldown download 6f1c2d0e --name "The Movie"
    ///   reeldown download 6f1c2d0e --name "The Movie" --audio 2 --subtitle 3
    #[command(alias = "d")]
    Download {
        /// Item id
        id: String,
        /// Item name
        #[arg(long)]
        name: String,
        /// Media source id (defaults to the item id)
        #[arg(long)]
        source: Option<String>,
        /// Audio stream index
        #[arg(long, default_value_t = 0)]
        audio: i32,
        /// Subtitle stream index
        #[arg(long)]
        subtitle: Option<i32>,
        /// Maximum streaming bitrate in bits per second
        #[arg(long)]
        max_bitrate: Option<u64>,
    },

    /// List finished downloads
    #[command(alias = "ls")]
    List,

    /// Show one finished download
    Show {
        /// Item id
        id: String,
    },

    /// Delete a finished download and its files
    #[command(alias = "rm")]
    Delete {
        /// Item id
        id: String,
    },

    /// Show or change configuration
    ///
    /// Examples:
    ///   reeldown config
    ///   reeldown config set-server-url http://media.local:8096
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Change where downloads are stored
    ///
    /// Example:
    ///   reeldown config set-downloads-dir ~/Videos/offline
    SetDownloadsDir {
        /// Downloads directory
        dir: PathBuf,
    },

    /// Change the media server URL
    ///
    /// Example:
    ///   reeldown config set-server-url http://media.local:8096
    SetServerUrl {
        /// Server base URL
        url: String,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else if quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = load_config()?;
    if let Some(dir) = cli.downloads_dir {
        config.downloads_dir = Some(dir);
    }
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }

    let code = match cli.command {
        Commands::Download {
            id,
            name,
            source,
            audio,
            subtitle,
            max_bitrate,
        } => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            let source = source.unwrap_or_else(|| id.clone());
            let options = DownloadOptions {
                media_source: MediaSource::with_id(source),
                audio_stream_index: audio,
                subtitle_stream_index: subtitle,
                max_bitrate,
            };
            let request = StartRequest::new(MediaItem::new(id, name), options);
            runtime.block_on(download(&config, request))?
        }
        Commands::List => list(&config)?,
        Commands::Show { id } => show(&config, &id)?,
        Commands::Delete { id } => delete(&config, &id)?,
        Commands::Config { command } => match command {
            None | Some(ConfigCommands::Show) => show_config(&config)?,
            Some(ConfigCommands::SetDownloadsDir { dir }) => set_downloads_dir(dir)?,
            Some(ConfigCommands::SetServerUrl { url }) => set_server_url(url)?,
        },
    };

    if code != SUCCESS {
        std::process::exit(code);
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<MetadataStore> {
    let dir = config.downloads_dir()?;
    MetadataStore::open(&dir, config.lock_timeout())
        .with_context(|| format!("Failed to open downloads directory {}", dir.display()))
}

fn report_error(title: &str, error: &DownloadError) -> i32 {
    let cause = error.to_string();
    eprintln!("{}", format_error(title, &[cause.as_str()], &error.fixes()).red());
    match error {
        DownloadError::Validation(_) | DownloadError::UnsupportedFormat { .. } => DATA_ERR,
        DownloadError::Resolution { .. } | DownloadError::Engine { .. } => SERVICE_UNAVAILABLE,
        DownloadError::Persistence { .. } => IO_ERR,
        DownloadError::ServiceStopped => ERROR,
    }
}

async fn download(config: &Config, request: StartRequest) -> Result<i32> {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    let id = request.item.id.clone().unwrap_or_default();
    let name = request.item.name.clone().unwrap_or_default();

    let engine = Arc::new(SimulatedEngine::paced_with_capacity(config.pacing(), config.event_buffer));
    let resolver = Arc::new(TemplateResolver::new(&config.server_url)?);
    let service = DownloadService::start(config, engine, resolver).await?;
    let mut notices = service.subscribe_notices();
    let mut jobs = service.watch_jobs();

    if let Err(e) = service.start_job(request).await {
        let code = report_error(&format!("Failed to download {}", id), &e);
        service.shutdown().await;
        return Ok(code);
    }

    println!("  {} Downloading {} {}", "[↓]".yellow(), name.bold(), format!("({})", id).dimmed());

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("      {spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Queued");

    let mut cancel_requested = false;
    let outcome = loop {
        tokio::select! {
            changed = jobs.changed() => {
                if changed.is_err() {
                    break None;
                }
                let job = jobs.borrow_and_update().iter().find(|j| j.id == id).cloned();
                if let Some(job) = job {
                    pb.set_position(u64::from(job.percent()));
                    pb.set_message(format!("{}s / {}s", job.seconds_downloaded, job.seconds_total));
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) if notice.id() == id && notice.is_terminal() => break Some(notice),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                pb.set_message("Cancelling...");
                service.cancel_job(&id).await?;
            }
        }
    };
    pb.finish_and_clear();
    service.shutdown().await;

    let code = match outcome {
        Some(DownloadNotice::Completed { asset }) => {
            println!("  {} {}", "[✓]".green(), format!("Saved {}", asset.path.display()));
            SUCCESS
        }
        Some(DownloadNotice::Cancelled { .. }) => {
            println!("  {} Download cancelled", "[!]".yellow());
            TEMP_FAIL
        }
        Some(notice) => {
            eprintln!("  {} {}", "[✗]".red(), notice.message());
            ERROR
        }
        None => {
            eprintln!("  {} Download service stopped unexpectedly", "[✗]".red());
            ERROR
        }
    };
    Ok(code)
}

fn print_asset(asset: &DownloadedAsset) {
    let name = asset.metadata.item.name.as_deref().unwrap_or("(untitled)");
    println!("  {} {}", asset.id.cyan(), name);
}

fn list(config: &Config) -> Result<i32> {
    let store = open_store(config)?;
    let listing = store.list_with_report()?;

    if listing.assets.is_empty() {
        println!("  No downloads yet. Try: reeldown download <ID> --name <NAME>");
    } else {
        println!("{}", format!("Downloads in {}", store.dir().display()).bold());
        for asset in &listing.assets {
            print_asset(asset);
        }
    }
    if !listing.skipped.is_empty() {
        println!(
            "  {} {} unreadable descriptor(s) skipped (run with -v for details)",
            "[!]".yellow(),
            listing.skipped.len()
        );
    }
    Ok(SUCCESS)
}

fn show(config: &Config, id: &str) -> Result<i32> {
    let store = open_store(config)?;
    match store.get(id)? {
        Some(asset) => {
            print_asset(&asset);
            println!("    path:   {}", asset.path.display());
            let source = asset.metadata.media_source.id.as_deref().unwrap_or("-");
            println!("    source: {}", source);
            println!("    audio:  {}", asset.metadata.options.audio_stream_index);
            if let Some(subtitle) = asset.metadata.options.subtitle_stream_index {
                println!("    subs:   {}", subtitle);
            }
            Ok(SUCCESS)
        }
        None => {
            eprintln!("  {} {} is not downloaded", "[✗]".red(), id);
            Ok(DATA_ERR)
        }
    }
}

fn delete(config: &Config, id: &str) -> Result<i32> {
    let store = open_store(config)?;
    if store.delete(id)? {
        println!("  {} Deleted {}", "[✓]".green(), id);
    } else {
        println!("  {} {} was not downloaded", "[!]".yellow(), id);
    }
    Ok(SUCCESS)
}

fn show_config(config: &Config) -> Result<i32> {
    println!("{}", "Configuration".bold());
    println!("  file:          {}", config_path()?.display());
    println!("  downloads_dir: {}", config.downloads_dir()?.display());
    println!("  server_url:    {}", config.server_url);
    println!("  lock_timeout:  {}ms", config.lock_timeout_ms);
    println!(
        "  simulated:     {} steps every {}ms",
        config.simulated_steps, config.simulated_step_ms
    );
    Ok(SUCCESS)
}

// Setters start from the stored file so command-line overrides are not saved.
fn set_downloads_dir(dir: PathBuf) -> Result<i32> {
    let mut stored = load_config()?;
    stored.downloads_dir = Some(dir.clone());
    save_config(&stored)?;
    println!("  {} Downloads directory set to: {}", "[✓]".green(), dir.display());
    Ok(SUCCESS)
}

fn set_server_url(url: String) -> Result<i32> {
    if let Err(e) = TemplateResolver::new(&url) {
        eprintln!("  {} {}: {}", "[✗]".red(), url, e);
        return Ok(DATA_ERR);
    }
    let mut stored = load_config()?;
    stored.server_url = url.clone();
    save_config(&stored)?;
    println!("  {} Server URL set to: {}", "[✓]".green(), url);
    Ok(SUCCESS)
}
