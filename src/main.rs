use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use podsync::{
    CacheStatus, EventReporter, FetchTarget, JsonFileStore, PodcastRef, ReqwestClient,
    RequestKind, RssFeedFetcher, SharedEventReporter, SubscriptionList, SyncConfig,
    SyncController, SyncDeps, SyncEvent, TargetKey, TracingReporter, feed_source_to_url,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[r] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

/// Synchronize podcast episode lists from RSS feeds
#[derive(Parser, Debug)]
#[command(name = "podsync")]
#[command(about = "Synchronize podcast episode lists from RSS feeds")]
#[command(version)]
struct Args {
    /// RSS feed URLs or paths to local RSS files
    #[arg(required = true)]
    feeds: Vec<String>,

    /// Directory to keep the synchronized episodes in between runs
    #[arg(short, long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of concurrent feed fetches
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log sync diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

/// Event reporter driving an indicatif spinner, forwarding to tracing
struct IndicatifReporter {
    bar: ProgressBar,
    tracing: TracingReporter,
}

impl IndicatifReporter {
    fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bar = ProgressBar::new_spinner();
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            tracing: TracingReporter,
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventReporter for IndicatifReporter {
    fn report(&self, event: SyncEvent) {
        match &event {
            SyncEvent::FetchStarted {
                podcast, attempt, ..
            } => {
                let retry = if *attempt > 1 {
                    format!(" (attempt {attempt})").yellow().to_string()
                } else {
                    String::new()
                };
                self.bar.set_message(format!(
                    "{SEARCH}Fetching feed: {}{retry}",
                    podcast.as_str().cyan()
                ));
            }

            SyncEvent::FetchApplied {
                podcast, changes, ..
            } => {
                self.bar.set_message(format!(
                    "{HEADPHONES}{} • {} new, {} updated, {} removed",
                    podcast.as_str().bold().green(),
                    changes.inserted.to_string().cyan(),
                    changes.updated.to_string().yellow(),
                    changes.deleted.to_string().red()
                ));
            }

            SyncEvent::FetchFailed {
                podcast,
                retry_in: Some(delay),
                ..
            } => {
                self.bar.set_message(format!(
                    "{RETRY}{} failed, retrying in {}s",
                    podcast.as_str().yellow(),
                    delay.as_secs()
                ));
            }

            _ => {}
        }

        self.bar.suspend(|| self.tracing.report(event));
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let truncated: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

fn init_tracing(args: &Args) {
    let default = if args.verbose {
        "podsync=debug"
    } else if args.quiet {
        "podsync=error"
    } else {
        "podsync=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    // A single run: refresh right away, no periodic work
    config.debounce = Duration::ZERO;
    config.background_interval = Duration::ZERO;
    config.cleanup_interval = Duration::ZERO;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podsync".bold().magenta(),
            "- Podcast Episode Sync".dimmed()
        );
    }

    let config = load_config(&args)?;

    let podcasts = args
        .feeds
        .iter()
        .map(|source| {
            feed_source_to_url(source)
                .map(PodcastRef::from_feed_url)
                .with_context(|| format!("Invalid feed source: {source}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let client = ReqwestClient::with_timeout(config.policy(RequestKind::Interactive).timeout)
        .context("Failed to create HTTP client")?;

    let indicatif = (!args.quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedEventReporter = match &indicatif {
        Some(reporter) => reporter.clone(),
        None => TracingReporter::shared(),
    };

    let mut deps = SyncDeps::new(
        Arc::new(RssFeedFetcher::new(client)),
        Arc::new(SubscriptionList::new(podcasts.clone())),
    )
    .with_reporter(reporter);
    if let Some(dir) = &args.state_dir {
        deps = deps.with_store(Arc::new(JsonFileStore::new(dir)));
    }

    let sync = SyncController::start(config, deps)
        .await
        .context("Failed to start sync engine")?;

    sync.refresh(&FetchTarget::AllSubscribed).outcome().await;
    sync.wait_idle().await;

    if let Some(reporter) = &indicatif {
        reporter.finish();
    }

    let mut synced = 0;
    let mut failed = 0;
    let mut total_episodes = 0;

    for podcast in &podcasts {
        let episodes = sync.repository().read(Some(&podcast.id)).await;
        total_episodes += episodes.len();

        match sync.status(&TargetKey::Podcast(podcast.id.clone())).await {
            CacheStatus::Error { message } => {
                failed += 1;
                if !args.quiet {
                    println!(
                        "{FAILURE}{} - {}",
                        podcast.feed_url.as_str().red(),
                        message.dimmed()
                    );
                }
            }
            _ => {
                synced += 1;
                if !args.quiet {
                    let newest = episodes
                        .first()
                        .map(|episode| format!(", newest: {}", truncate_title(&episode.title, 40)))
                        .unwrap_or_default();
                    println!(
                        "{SUCCESS}{} • {} episodes{}",
                        podcast.feed_url.as_str().cyan(),
                        episodes.len().to_string().green(),
                        newest.dimmed()
                    );
                }
            }
        }
    }

    sync.shutdown().await;

    if !args.quiet {
        println!(
            "\n{PARTY}{} {} synced, {} episodes, {} failed",
            "Sync complete:".bold().green(),
            synced.to_string().green().bold(),
            total_episodes.to_string().cyan(),
            if failed > 0 {
                failed.to_string().red().bold()
            } else {
                failed.to_string().green()
            }
        );

        if let Some(dir) = &args.state_dir {
            println!("\n{FOLDER}State: {}\n", dir.display().to_string().cyan());
        }
    }

    if failed > 0 && synced == 0 {
        std::process::exit(1);
    }

    Ok(())
}
