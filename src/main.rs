//! Oil event analyzer: binary entrypoint.
//! Runs analysis batches, daily summaries, the read API and store maintenance.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oil_event_analyzer::{
    api::{self, AppState},
    build_client, build_pipeline,
    config::{PipelineConfig, MAX_DAYS_BACK},
    metrics::Metrics,
    news::load_news,
    summary::DailySummarizer,
    BatchError, EventStore, Scheduler, SqliteEventStore,
};

#[derive(Parser, Debug)]
#[command(name = "oil-events", version, about = "Oil news event analysis pipeline")]
struct Cli {
    /// Config file (TOML or JSON). Defaults to $PIPELINE_CONFIG_PATH, then config/pipeline.{toml,json}.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the SQLite database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the per-item pipeline over a JSON news list.
    Analyze {
        items: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        /// Process one item at a time.
        #[arg(long)]
        serial: bool,
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Write the Prometheus exposition here when the batch ends.
        #[arg(long)]
        metrics_out: Option<PathBuf>,
        /// Serve /metrics on this address while the batch runs.
        #[arg(long)]
        metrics_addr: Option<String>,
    },
    /// Generate the daily risk summary from stored events.
    Summary {
        /// Last day of the window (YYYY-MM-DD). Defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        days_back: Option<u32>,
        #[arg(long)]
        max_events: Option<usize>,
        #[arg(long)]
        top_n: Option<usize>,
        /// Write the JSON summary here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the read-only HTTP API.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
    /// Delete every stored record.
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

/// compact logs by default, JSON when LOG_FORMAT=json.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("oil_event_analyzer=info,oil_events=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut cfg = match &cli.config {
        Some(p) => PipelineConfig::load_from(p)?,
        None => PipelineConfig::load_default()?,
    };
    if let Some(db) = &cli.db {
        cfg.database_path = db.clone();
    }
    Ok(cfg)
}

fn open_store(cfg: &PipelineConfig) -> Result<Arc<SqliteEventStore>> {
    let store = SqliteEventStore::open(&cfg.database_path)
        .with_context(|| format!("opening event store at {}", cfg.database_path.display()))?;
    Ok(Arc::new(store))
}

/// Expose `/metrics` in the background for the lifetime of a batch.
async fn spawn_metrics_server(metrics: &Metrics, addr: &str) -> Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    info!(addr = %addr, "metrics listening");
    let app = metrics.router();
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "metrics listener stopped");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut cfg = load_config(&cli)?;

    match cli.command {
        Command::Analyze {
            items,
            workers,
            serial,
            deadline_secs,
            metrics_out,
            metrics_addr,
        } => {
            if let Some(n) = workers {
                cfg.max_workers = n.max(1);
            }
            if serial {
                cfg.parallel = false;
            }
            if deadline_secs.is_some() {
                cfg.deadline_secs = deadline_secs;
            }
            if !cfg.model.has_api_key() {
                warn!("no model API key configured; every model call will be rejected");
            }
            let news = load_news(&items)?;
            info!(items = news.len(), path = %items.display(), "news list loaded");

            // Recorder first, so the pipeline's series are captured from the first call.
            let metrics = Metrics::install()?;
            let exporter = match &metrics_addr {
                Some(addr) => Some(spawn_metrics_server(&metrics, addr).await?),
                None => None,
            };

            let store: Arc<dyn EventStore> = open_store(&cfg)?;
            let client = build_client(&cfg)?;
            let pipeline = build_pipeline(&cfg, client, store)?;
            let scheduler = Scheduler::from_config(pipeline, &cfg);

            let outcome = scheduler.run_batch(news).await;
            if let Some(path) = &metrics_out {
                metrics.write_snapshot(path)?;
                info!(path = %path.display(), "metrics snapshot written");
            }
            if let Some(task) = exporter {
                task.abort();
            }

            match outcome {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(BatchError::StoreUnavailable { source, report }) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    bail!("batch aborted, event store unavailable: {source}");
                }
            }
        }
        Command::Summary {
            date,
            days_back,
            max_events,
            top_n,
            out,
        } => {
            if let Some(v) = days_back {
                cfg.summary.days_back = v.min(MAX_DAYS_BACK);
            }
            if let Some(v) = max_events {
                cfg.summary.max_events = v.max(1);
            }
            if let Some(v) = top_n {
                cfg.summary.top_n = v.max(1);
            }
            let store: Arc<dyn EventStore> = open_store(&cfg)?;
            let client = build_client(&cfg)?;
            let summarizer = DailySummarizer::new(client, store, cfg.summary.clone());
            let as_of = date.unwrap_or_else(|| Utc::now().date_naive());
            let summary = summarizer.summarize(as_of).await?;
            let text = serde_json::to_string_pretty(&summary)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("writing summary to {}", path.display()))?;
                    info!(path = %path.display(), "summary written");
                }
                None => println!("{text}"),
            }
        }
        Command::Serve { addr } => {
            let store: Arc<dyn EventStore> = open_store(&cfg)?;
            let metrics = Metrics::install()?;
            let app = api::create_router(AppState::new(store).with_metrics(metrics));
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            info!(addr = %addr, "read API listening");
            axum::serve(listener, app).await?;
        }
        Command::Purge { yes } => {
            if !yes {
                bail!("refusing to purge without --yes");
            }
            let store = open_store(&cfg)?;
            let removed = tokio::time::timeout(Duration::from_secs(60), store.clear())
                .await
                .context("purge timed out")??;
            info!(removed, db = %store.path().display(), "event store purged");
        }
    }
    Ok(())
}
