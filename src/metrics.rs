use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the pipeline series.
    pub fn init(check_interval_secs: u64) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        describe();
        gauge!("scheduler_check_interval_secs").set(check_interval_secs as f64);

        Ok(Self { handle })
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

fn describe() {
    crate::ingest::ensure_metrics_described();
    describe_counter!("ingest_runs_total", "Completed batches.");
    describe_counter!("ingest_items_dropped_total", "Feed items without a usable link.");
    describe_gauge!("ingest_last_run_ts", "Unix time of the last finished batch.");
    describe_counter!(
        "dispatch_outcomes_total",
        "Per-destination outcomes, labelled by destination and status."
    );
    describe_counter!("dispatch_duplicates_total", "Items skipped as duplicates for every requested destination.");
    describe_counter!("dispatch_items_failed_total", "Items that failed before reaching any destination.");
    describe_counter!("media_downloads_total", "Media download attempts.");
    describe_counter!("media_download_failures_total", "Media URLs given up on after every attempt.");
    describe_counter!("media_transform_failures_total", "Downloaded media that could not be decoded or re-encoded.");
    describe_counter!("media_cache_hits_total", "Processed media served from cache.");
    describe_counter!("media_watermark_failures_total", "Watermark compositing failures (asset kept).");
    describe_counter!("enrich_calls_total", "Enrichment provider calls.");
    describe_counter!("enrich_limited_total", "Enrichment calls refused by the daily limit.");
    describe_counter!("price_refresh_total", "Price refreshes, labelled by the source that answered.");
    describe_counter!("scheduler_ticks_total", "Scheduler ticks.");
}
