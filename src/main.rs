use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use feedgate::config::Config;
use feedgate::feed::{discover_feed_candidates, refresh_feed, SafeFetcher};
use feedgate::import::{parse_import_file, ImportEntry, Importer};
use feedgate::ratelimit::{RouteLimiter, SlidingWindowLimiter};
use feedgate::storage::{Database, FeedRepository, StoreError};

#[derive(Parser, Debug)]
#[command(name = "feedgate", version, about = "Safe feed fetching, discovery and bulk import")]
struct Args {
    /// Config file (default: ~/.config/feedgate/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// User the subscriptions belong to
    #[arg(long, global = true, default_value_t = 1)]
    user: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an OPML file or a plain list of URLs
    Import {
        file: PathBuf,
        /// Take the first feed when a site offers several
        #[arg(long)]
        first_candidate: bool,
        /// Override the batch deadline
        #[arg(long, value_name = "MS")]
        deadline_ms: Option<u64>,
    },
    /// Subscribe to a single feed or website
    Add {
        url: String,
        /// Folder to file the feed under (repeatable)
        #[arg(long = "folder", value_name = "NAME")]
        folders: Vec<String>,
        #[arg(long)]
        title: Option<String>,
    },
    /// List candidate feeds for a website without subscribing
    Discover { url: String },
    /// Re-fetch one stored feed
    Refresh { feed_id: i64 },
}

impl Command {
    fn route(&self) -> Option<&'static str> {
        match self {
            Command::Import { .. } => Some("import"),
            Command::Add { .. } => Some("add"),
            Command::Discover { .. } => Some("discover"),
            Command::Refresh { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_path().context("HOME environment variable not set")?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    tracing::debug!(config = ?config, "Configuration");

    if let Some(route) = args.command.route() {
        let redis_url = config.rate_limit.resolved_redis_url();
        let limiter = Arc::new(SlidingWindowLimiter::new(redis_url.as_ref()));
        let routes = RouteLimiter::new(limiter, config.rate_limit.requests, config.rate_limit.window());
        // No proxy in front of the CLI, so the address is always "unknown"
        let decision = routes.check(route, args.user, &HeaderMap::new()).await;
        if !decision.allowed {
            bail!(
                "Rate limit exceeded for '{route}', retry in {} seconds",
                decision.retry_after_secs
            );
        }
    }

    let fetcher = SafeFetcher::new(config.fetch.to_settings()).context("Failed to build HTTP client")?;

    match args.command {
        Command::Discover { url } => {
            let found = discover_feed_candidates(&fetcher, &url)
                .await
                .with_context(|| format!("Discovery failed for {url}"))?;
            print_json(&found)
        }
        Command::Add {
            url,
            folders,
            title,
        } => {
            let importer = Importer::new(open_db(&config).await?, fetcher, config.import.to_settings());
            let row = importer
                .add_feed_for_user(args.user, ImportEntry { url, folders, title })
                .await
                .context("Subscribe failed")?;
            print_json(&row)
        }
        Command::Import {
            file,
            first_candidate,
            deadline_ms,
        } => {
            let entries = parse_import_file(&checked_import_path(&file)?).await?;
            let settings = config.import.to_settings();
            let deadline = deadline_ms.map_or(settings.deadline, Duration::from_millis);
            let skip_multi = settings.skip_multiple_candidates && !first_candidate;

            let importer = Importer::new(open_db(&config).await?, fetcher, settings);
            let rows = importer
                .import_feed_entries_for_user(args.user, entries, skip_multi, deadline)
                .await
                .context("Import failed")?;
            print_json(&rows)
        }
        Command::Refresh { feed_id } => {
            let db = open_db(&config).await?;
            let outcome = refresh_feed(db.as_ref(), &fetcher, args.user, feed_id)
                .await
                .with_context(|| format!("Refresh of feed {feed_id} failed"))?;
            print_json(&outcome)
        }
    }
}

/// Resolves symlinks and requires a regular file.
fn checked_import_path(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve import file: {}", path.display()))?;
    let metadata = std::fs::metadata(&canonical)?;
    if !metadata.is_file() {
        bail!("Import path must be a regular file");
    }
    Ok(canonical)
}

async fn open_db(config: &Config) -> Result<Arc<dyn FeedRepository>> {
    let db_path = config.database_path();
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
            // User-only access to the directory holding the database
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to set data directory permissions");
                }
            }
        }
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(db_path_str).await {
        Ok(db) => Ok(Arc::new(db)),
        Err(StoreError::InstanceLocked) => {
            bail!("The database is locked by another feedgate process; try again shortly")
        }
        Err(e) => Err(e).context("Failed to open database"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}
