//! aria-downloader CLI
//!
//! Queues URLs on the download engine, drives one session to completion and
//! renders its progress. Ctrl-C cancels the running download; anything still
//! queued is reported and left alone.

mod session;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use aria_engine::job::FormatOverrides;
use aria_engine::settings::{self, settings_json_path};
use aria_engine::{
    CollectionChoice, CollectionPrompt, Engine, EventConsumer, JobOptions, OutputQuality, Settings,
    Submission,
};

#[derive(Parser, Debug)]
#[command(
    name = "aria-downloader",
    version,
    about = "Download videos and audio through yt-dlp with aria2c acceleration"
)]
struct Cli {
    /// Show debug output on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue one or more URLs and download them
    Get(GetArgs),
    /// List or manage completed downloads
    History(HistoryArgs),
    /// Print the active settings and where they live, or change them
    Settings(SettingsArgs),
}

#[derive(Args, Debug, Clone)]
struct GetArgs {
    /// URLs to download, in order
    #[arg(required = true)]
    urls: Vec<String>,

    #[command(flatten)]
    job: JobArgs,

    /// What to do with playlist URLs
    #[arg(long, value_enum, default_value_t = PlaylistMode::Ask)]
    playlist: PlaylistMode,

    /// Open the download folder when done
    #[arg(long)]
    open: bool,
}

#[derive(Args, Debug, Clone)]
struct JobArgs {
    /// Extract audio only
    #[arg(long)]
    audio: bool,

    /// Maximum video height (e.g. 720, 1080)
    #[arg(long, value_name = "HEIGHT")]
    quality: Option<u32>,

    /// Embed the thumbnail as cover art (audio only)
    #[arg(long)]
    embed_thumbnail: bool,

    /// Audio container for --audio (mp3, m4a, opus, ...)
    #[arg(long, value_name = "FORMAT")]
    audio_format: Option<String>,

    /// Raw yt-dlp format selector, replaces the derived one
    #[arg(long, value_name = "SELECTOR")]
    format: Option<String>,

    /// Download directory for this run
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Remove all entries
    #[arg(long)]
    clear: bool,

    /// Download entry N again (as numbered in the listing)
    #[arg(long, value_name = "N", conflicts_with = "clear")]
    redownload: Option<usize>,

    #[command(flatten)]
    job: JobArgs,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    /// Requeue a failed download once before giving up
    #[arg(long, value_name = "BOOL")]
    retry_failed_once: Option<bool>,

    /// Write debug logs to the log directory
    #[arg(long, value_name = "BOOL")]
    debug_logs: Option<bool>,

    /// Default download directory
    #[arg(long, value_name = "DIR")]
    download_dir: Option<PathBuf>,

    /// yt-dlp executable to run
    #[arg(long, value_name = "PATH")]
    downloader: Option<String>,

    /// Where completed downloads are recorded
    #[arg(long, value_name = "FILE")]
    history_file: Option<PathBuf>,
}

impl SettingsArgs {
    /// The changed settings, or `None` when no flag was given.
    fn changed(&self, current: &Settings) -> Option<Settings> {
        let mut next = current.clone();
        if let Some(v) = self.retry_failed_once {
            next.retry_failed_once = v;
        }
        if let Some(v) = self.debug_logs {
            next.debug_logs = v;
        }
        if let Some(dir) = &self.download_dir {
            next.download_directory = dir.to_string_lossy().to_string();
        }
        if let Some(tool) = &self.downloader {
            next.downloader_path.clone_from(tool);
        }
        if let Some(file) = &self.history_file {
            next.history_file = Some(file.to_string_lossy().to_string());
        }
        (next != *current).then_some(next)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PlaylistMode {
    /// Ask for each playlist
    Ask,
    /// The whole playlist as one download
    Entire,
    /// Only the linked video
    Single,
    /// Every entry as its own download
    Expand,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = settings::load_settings();

    let console = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    aria_engine::logging::init_with_console(settings.debug_logs, console);
    tracing::info!("aria-downloader v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Get(args) => handle_get(settings, args).await,
        Commands::History(args) => handle_history(settings, args).await,
        Commands::Settings(args) => handle_settings(settings, args).await,
    }
}

impl JobArgs {
    fn apply_to(&self, settings: &mut Settings) {
        if let Some(dir) = &self.dir {
            settings.download_directory = dir.to_string_lossy().to_string();
        }
        if let Some(q) = self.quality {
            settings.video_height_cap = q;
        }
    }

    fn options(&self, settings: &Settings) -> JobOptions {
        let mut options = JobOptions::from_settings(settings);
        options.embed_thumbnail |= self.embed_thumbnail;
        options.format_overrides = FormatOverrides {
            format_selector: self.format.clone(),
            audio_format: self.audio_format.clone(),
        };
        if self.audio {
            options = options.audio_only();
        } else if let Some(q) = self.quality {
            options.output_quality = OutputQuality::VideoHeightCap(q);
        }
        options
    }
}

async fn handle_get(mut settings: Settings, args: GetArgs) -> Result<()> {
    args.job.apply_to(&mut settings);
    if let Some(dir) = &args.job.dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }
    let options = args.job.options(&settings);
    let poll = Duration::from_millis(settings.poll_interval_ms.max(10));

    let (engine, mut consumer) = Engine::start(settings);

    // queue each URL as soon as it is resolved so the order on the command line holds
    let mut queued = 0;
    for url in &args.urls {
        let added = match engine.submit(url, &options).await {
            Ok(Submission::Ready(ready)) => engine.enqueue(ready).await?,
            Ok(Submission::Collection(prompt)) => {
                let choice = match args.playlist {
                    PlaylistMode::Ask => ask_playlist_choice(&prompt).await?,
                    PlaylistMode::Entire => CollectionChoice::EntireCollection,
                    PlaylistMode::Single => CollectionChoice::SingleItem,
                    PlaylistMode::Expand => CollectionChoice::ExpandMembers,
                };
                engine.enqueue_collection(prompt, choice).await?
            }
            Err(e) => {
                eprintln!("Skipping {url}: {e}");
                0
            }
        };
        queued += added;
    }
    if queued == 0 {
        engine.shutdown().await?;
        bail!("nothing to download");
    }

    let summary = session::drive(&engine, &mut consumer, poll).await?;
    summary.print(&consumer);

    if args.open {
        if let Err(e) = engine.open_download_folder() {
            eprintln!("Could not open download folder: {e}");
        }
    }
    engine.shutdown().await?;
    if summary.failed > 0 {
        bail!("{} download(s) failed", summary.failed);
    }
    Ok(())
}

async fn ask_playlist_choice(prompt: &CollectionPrompt) -> Result<CollectionChoice> {
    println!(
        "{} is a playlist with {} entries.",
        prompt.url(),
        prompt.members().len()
    );
    print!("Download [e]ntire playlist, [s]ingle video, or e[x]pand into separate downloads? [e] ");
    io::stdout().flush()?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await
    .context("prompt task failed")??;

    Ok(match answer.trim().to_ascii_lowercase().as_str() {
        "s" | "single" => CollectionChoice::SingleItem,
        "x" | "expand" => CollectionChoice::ExpandMembers,
        _ => CollectionChoice::EntireCollection,
    })
}

async fn handle_history(mut settings: Settings, args: HistoryArgs) -> Result<()> {
    args.job.apply_to(&mut settings);
    let options = args.job.options(&settings);
    let poll = Duration::from_millis(settings.poll_interval_ms.max(10));
    let (engine, mut consumer) = Engine::start(settings);

    if args.clear {
        consumer.clear_history()?;
        println!("History cleared.");
        return engine.shutdown().await.map_err(Into::into);
    }

    if let Some(n) = args.redownload {
        let entry = consumer
            .history()
            .newest_first()
            .nth(n.saturating_sub(1))
            .cloned()
            .with_context(|| format!("no history entry {n}"))?;
        println!("Downloading again: {} ({})", entry.title, entry.source_url);
        consumer.redownload(&entry, &options)?;
        let summary = session::drive(&engine, &mut consumer, poll).await?;
        summary.print(&consumer);
        return engine.shutdown().await.map_err(Into::into);
    }

    print_history(&consumer);
    engine.shutdown().await?;
    Ok(())
}

fn print_history(consumer: &EventConsumer) {
    let history = consumer.history();
    if history.is_empty() {
        println!("No downloads yet.");
        return;
    }
    for (i, entry) in history.newest_first().enumerate() {
        println!(
            "{:>3}. {}  {}\n     {}",
            i + 1,
            entry.completed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.title,
            entry.source_url
        );
    }
    println!("({} entries in {})", history.len(), history.path().display());
}

async fn handle_settings(settings: Settings, args: SettingsArgs) -> Result<()> {
    let settings = match args.changed(&settings) {
        Some(next) => {
            let (mut engine, mut consumer) = Engine::start(settings);
            let saved = engine.update_settings(&mut consumer, next).await;
            let active = engine.settings().clone();
            engine.shutdown().await?;
            saved.context("could not save settings")?;
            println!("Settings saved.");
            active
        }
        None => settings,
    };

    println!("# {}", settings_json_path().display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!("# history: {}", settings.history_path().display());
    println!("# logs: {}", aria_engine::logging::log_dir().display());
    Ok(())
}
