// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::path::Path;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Finalized pipeline runs by status.");
        describe_counter!("stage_calls_total", "Model calls issued per stage, retries included.");
        describe_counter!("stage_failures_total", "Stages that ended in a terminal error.");
        describe_counter!(
            "analysis_retries_total",
            "Model call retries by reason (transient|schema)."
        );
        describe_counter!(
            "analysis_memo_hits_total",
            "Model responses served from the per-run memo table."
        );
        describe_counter!("store_upsert_errors_total", "Failed record upserts.");
        describe_histogram!("stage_duration_ms", "Wall time per stage in milliseconds.");
        describe_gauge!(
            "scheduler_batch_last_run_ts",
            "Unix ts when the last batch finished."
        );
    });
}

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder for this process and describe all series.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_described();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the current exposition to `path`, for runs that exit before anything scrapes them.
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, self.render())
            .with_context(|| format!("writing metrics snapshot to {}", path.display()))
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
