//! Exposes the command line application.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lazyload_service::caching::CacheError;
use lazyload_service::config::Config;
use lazyload_service::metrics;
use lazyload_service::services::{Collaborators, Loader, LoaderStats};
use lazyload_service::types::{Artifact, Callback, Handle, LoadOptions, Priority};
use tokio::sync::mpsc;

use crate::logging;

/// Lazyload commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load artifacts, print what happened to each of them and exit.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// The URLs to load. `http`, `https` and `file` URLs are supported.
    #[arg(required = true)]
    urls: Vec<String>,

    /// The scheduling tier of the fetches: `fast`, `faster` or `fastest`.
    #[arg(long, default_value_t = Priority::Fast)]
    priority: Priority,

    /// The tag to load the artifacts under.
    #[arg(long, default_value = lazyload_service::types::DEFAULT_TAG)]
    tag: String,

    /// Downsampling factor passed to the decoder.
    #[arg(long, default_value_t = 1)]
    scale: u32,

    /// How long to wait for all artifacts, e.g. `30s`.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    timeout: Duration,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "lazyload", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.as_deref().and_then(|dsn| dsn.parse().ok()),
        release: Some(concat!("lazyload@", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });

    // SAFETY: No threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, hostname);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("lazyload")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Fetch(args) => runtime.block_on(fetch(config, args)),
    }
}

/// The outcome of one load, as reported by its callback.
type Report = (String, Result<usize, CacheError>);

async fn fetch(config: Config, args: FetchArgs) -> Result<()> {
    let collaborators =
        Collaborators::from_config(&config).context("failed to set up the downloader")?;
    let loader = Loader::initialize(&config, tokio::runtime::Handle::current(), collaborators)
        .context("failed to create the storage directory")?;

    let (sender, mut receiver) = mpsc::unbounded_channel::<Report>();
    let on_failure = sender.clone();
    let callback = Callback::new(move |url, _, artifact: &Artifact| {
        sender.send((url.to_owned(), Ok(artifact.data().len()))).ok();
    })
    .with_failure(move |url, _, error| {
        on_failure.send((url.to_owned(), Err(error.clone()))).ok();
    });

    let options = LoadOptions::default()
        .priority(args.priority)
        .tag(args.tag)
        .scale(args.scale);

    // Every URL gets its own handle, so that no load supersedes another.
    let mut expected = BTreeSet::new();
    for (id, url) in args.urls.iter().enumerate() {
        expected.insert(url.as_str());
        loader.load(
            url,
            Some(Handle::new(id as u64)),
            Some(callback.clone()),
            options.clone(),
        );
    }

    let mut failures = 0;
    let collect = async {
        while !expected.is_empty() {
            let Some((url, result)) = receiver.recv().await else {
                break;
            };
            if !expected.remove(url.as_str()) {
                continue;
            }
            match result {
                Ok(bytes) => println!("{url}: {bytes} bytes"),
                Err(error) => {
                    failures += 1;
                    println!("{url}: {error}");
                }
            }
        }
    };
    if tokio::time::timeout(args.timeout, collect).await.is_err() {
        for url in &expected {
            println!("{url}: timed out");
        }
        failures += expected.len();
    }

    wait_for_writes(&loader).await;
    print_stats(&loader.stats());

    anyhow::ensure!(failures == 0, "{failures} artifact(s) could not be loaded");
    Ok(())
}

/// Waits until all fetched artifacts are stored, so that the next run finds them.
async fn wait_for_writes(loader: &Arc<Loader>) {
    while loader.stats().pending_writes > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn print_stats(stats: &LoaderStats) {
    tracing::info!(
        requests = stats.requests,
        memory_entries = stats.memory_entries,
        memory_bytes = stats.memory_bytes,
        tags = stats.tags,
        "Loader finished"
    );
}
