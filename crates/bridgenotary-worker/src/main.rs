//! Command-line host for the Bridge Notary offline worker.
//!
//! Runs the worker against SQLite-backed caches and queue under the
//! configured data directory, with real HTTP underneath.
//!
//! ## Usage
//!
//! ```bash
//! # Pre-cache the shell and activate
//! bridgenotary-worker activate
//!
//! # Fetch through the worker
//! bridgenotary-worker fetch https://bridgenotary.com/images/logo.png
//!
//! # Queue a form and replay it later
//! bridgenotary-worker enqueue form.json
//! bridgenotary-worker sync
//! ```

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bridgenotary_core::{init_logging, LogConfig, LogFormat, WorkerConfig};
use bridgenotary_net::{Fetcher, HttpFetcher, LoaderConfig, Request};
use bridgenotary_store::{
    CacheStorage, Payload, QueueStore, SqliteCacheStorage, SqliteQueueStore,
};
use bridgenotary_sw::{ServiceWorker, WorkerHandles};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http::{header, HeaderValue, Method};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

#[derive(Parser)]
#[command(name = "bridgenotary-worker")]
#[command(about = "Offline worker host for the Bridge Notary site")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pre-cache the app shell into the static partition
    Install,

    /// Install, then delete stale partitions and take control
    Activate,

    /// Fetch a URL through the worker
    Fetch {
        /// Absolute URL
        url: Url,
        /// HTTP method
        #[arg(short, long, default_value = "GET", value_parser = parse_method)]
        method: Method,
        /// Request body, sent as JSON
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Queue a JSON form payload for the next sync
    Enqueue {
        /// Payload file, or `-` for stdin
        file: PathBuf,
    },

    /// Replay queued submissions to the relay
    Sync {
        /// Sync tag; defaults to the configured one
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// List queued submissions, one JSON object per line
    Pending,

    /// List cache partitions
    Partitions,
}

fn parse_method(s: &str) -> Result<Method, String> {
    Method::from_bytes(s.to_ascii_uppercase().as_bytes()).map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct PartitionRow {
    name: String,
    entries: usize,
    current: bool,
}

#[derive(Serialize)]
struct FetchSummary<'a> {
    url: &'a str,
    status: u16,
    from_cache: bool,
    intercepted: bool,
    bytes: usize,
}

struct Host {
    config: WorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    queue: Arc<dyn QueueStore>,
}

impl Host {
    fn new(config: WorkerConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(LoaderConfig {
            timeout: config.network_timeout(),
            ..Default::default()
        })?;
        debug!(data_dir = %config.data_dir.display(), "Using data directory");
        Ok(Self {
            caches: Arc::new(SqliteCacheStorage::new(config.cache_db_path())),
            queue: Arc::new(SqliteQueueStore::new(config.queue_db_path())),
            fetcher: Arc::new(fetcher),
            config,
        })
    }

    fn worker(&self) -> Result<ServiceWorker> {
        let handles = WorkerHandles {
            fetcher: self.fetcher.clone(),
            caches: self.caches.clone(),
            queue: self.queue.clone(),
        };
        // Events are surfaced through logs in this host.
        let (worker, _events) = ServiceWorker::new(&self.config, handles)?;
        Ok(worker)
    }
}

/// An explicit `--config` must exist; without one the defaults apply.
fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let config = match path {
        Some(path) => {
            WorkerConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => WorkerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn read_payload(file: &Path) -> Result<Payload> {
    let mut text = String::new();
    if file == Path::new("-") {
        std::io::stdin().read_to_string(&mut text)?;
    } else {
        text = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
    }

    let text = text.trim();
    serde_json::from_str::<serde_json::Value>(text).context("payload is not valid JSON")?;
    Ok(Payload::new(text))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    let log_config = if cli.json_logs {
        LogConfig {
            format: LogFormat::Json,
            ..log_config
        }
    } else {
        log_config
    };
    init_logging(log_config);

    let host = Host::new(load_config(cli.config.as_deref())?)?;

    match cli.command {
        Commands::Install => {
            let report = host.worker()?.install().await?;
            print_json(&report)?;
        }

        Commands::Activate => {
            let (installed, activated) = host.worker()?.start().await?;
            print_json(&serde_json::json!({
                "install": installed,
                "activate": activated,
            }))?;
        }

        Commands::Fetch { url, method, body } => {
            let worker = host.worker()?;
            worker.start().await?;

            let mut request = Request::new(method, url.clone());
            if let Some(body) = body {
                request.body = Some(Bytes::from(body));
                request = request.header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }

            let (response, intercepted) = match worker.handle_fetch(request.clone()).await {
                Some(response) => (response, true),
                None => {
                    info!(url = %url, "Not intercepted, fetching directly");
                    (host.fetcher.fetch(request).await?, false)
                }
            };

            let summary = FetchSummary {
                url: url.as_str(),
                status: response.status.as_u16(),
                from_cache: response.from_cache,
                intercepted,
                bytes: response.body.len(),
            };
            eprintln!("{}", serde_json::to_string(&summary)?);
            std::io::stdout().write_all(&response.body)?;
        }

        Commands::Enqueue { file } => {
            let payload = read_payload(&file)?;
            let submission = host.worker()?.enqueue_submission(payload).await?;
            info!(id = %submission.id, "Queued submission");
            print_json(&submission)?;
        }

        Commands::Sync { tag } => {
            let worker = host.worker()?;
            let tag = tag.unwrap_or_else(|| worker.sync_tag().to_string());
            match worker.handle_sync(&tag).await? {
                Some(report) => {
                    print_json(&report)?;
                    if report.failed > 0 {
                        bail!("{} submission(s) still pending", report.failed);
                    }
                }
                None => bail!("unknown sync tag: {tag}"),
            }
        }

        Commands::Pending => {
            for submission in host.queue.get_all().await? {
                println!("{}", serde_json::to_string(&submission)?);
            }
        }

        Commands::Partitions => {
            let worker = host.worker()?;
            let partitions = worker.partitions();
            for name in host.caches.keys().await? {
                let row = PartitionRow {
                    entries: host.caches.len(&name).await?,
                    current: partitions.is_current(&name),
                    name,
                };
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }

    Ok(())
}
