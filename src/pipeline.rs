// src/pipeline.rs
//! One batch: fetch every active source, then dispatch its items one by one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::dispatch::{DestinationSet, DispatchRequest, ItemOutcome, Orchestrator};
use crate::ingest::extract::{canonical_link, extract};
use crate::ingest::types::{FeedProvider, FeedSource, RawItem};
use crate::progress::ProgressTracker;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub sources: usize,
    /// Sources that returned nothing (down, malformed, or empty).
    pub unavailable_sources: usize,
    pub fetched: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Successful destination publishes across all items.
    pub published: usize,
    /// Destination-level errors across all items.
    pub destination_errors: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchReport {
    fn tally(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::DuplicateSkip { .. } => self.duplicates += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
            ItemOutcome::Processed { outcomes, .. } => {
                self.processed += 1;
                for o in outcomes.values() {
                    if o.success {
                        self.published += 1;
                    } else if o.error.is_some() {
                        self.destination_errors += 1;
                    }
                }
            }
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} new, {} duplicate, {} failed ({} published, {} destination errors)",
            self.processed, self.duplicates, self.failed, self.published, self.destination_errors
        )
    }
}

/// Clears the in-flight flag however the batch ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Pipeline {
    settings: Arc<Settings>,
    feeds: Arc<dyn FeedProvider>,
    orchestrator: Arc<Orchestrator>,
    tracker: ProgressTracker,
    running: AtomicBool,
    publish_interval: Duration,
}

impl Pipeline {
    pub fn new(
        settings: Arc<Settings>,
        feeds: Arc<dyn FeedProvider>,
        orchestrator: Arc<Orchestrator>,
        tracker: ProgressTracker,
    ) -> Self {
        Self {
            publish_interval: settings.publish_interval(),
            settings,
            feeds,
            orchestrator,
            tracker,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one batch unless one is already in flight (then `None`).
    pub async fn try_run_batch(&self) -> Option<BatchReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(target: "ingest", "batch already running; trigger ignored");
            return None;
        }
        let _guard = RunGuard(&self.running);
        Some(self.run_batch().await)
    }

    async fn run_batch(&self) -> BatchReport {
        let mut report = BatchReport {
            started_at: Some(Utc::now()),
            ..BatchReport::default()
        };
        self.tracker.start_run("checking feeds");

        let sources = self.settings.active_sources();
        report.sources = sources.len();

        let mut queue: Vec<(FeedSource, DestinationSet, RawItem)> = Vec::new();
        for source in sources {
            let targets = self.settings.destinations_for(&source);
            if targets.is_empty() {
                info!(target: "ingest", source = %source.label(), "no enabled destination for source; skipped");
                continue;
            }
            let items = self
                .feeds
                .fetch_latest(&source, self.settings.max_items_per_feed)
                .await;
            if items.is_empty() {
                report.unavailable_sources += 1;
            }
            queue.extend(items.into_iter().map(|raw| (source.clone(), targets, raw)));
        }
        report.fetched = queue.len();

        self.tracker.begin_processing(queue.len());
        let total = queue.len();
        for (i, (source, targets, raw)) in queue.into_iter().enumerate() {
            let outcome = self.process_one(&source, targets, raw).await;
            report.tally(&outcome);
            self.tracker
                .advance(i + 1, format!("processed {} of {total}", i + 1));

            // Pace destination calls; duplicates never hit a destination.
            let published = matches!(outcome, ItemOutcome::Processed { .. });
            if published && i + 1 < total && !self.publish_interval.is_zero() {
                tokio::time::sleep(self.publish_interval).await;
            }
        }

        report.finished_at = Some(Utc::now());
        counter!("ingest_runs_total").increment(1);
        gauge!("ingest_last_run_ts").set(Utc::now().timestamp() as f64);
        info!(target: "ingest", fetched = report.fetched, processed = report.processed, duplicates = report.duplicates, failed = report.failed, "batch finished");
        self.tracker.complete(report.summary());
        report
    }

    async fn process_one(
        &self,
        source: &FeedSource,
        targets: DestinationSet,
        raw: RawItem,
    ) -> ItemOutcome {
        let link = raw.link.as_deref().map(canonical_link);
        match extract(raw, source) {
            Ok(item) => {
                let req = DispatchRequest::new(targets, self.settings.mode);
                self.orchestrator.dispatch(&item, &req).await
            }
            Err(e) => match link.filter(|l| !l.is_empty()) {
                Some(link) => {
                    warn!(target: "ingest", link = %link, error = %e, "item could not be normalized");
                    self.orchestrator
                        .record_failure(&link, source, targets, &e)
                        .await
                }
                None => {
                    warn!(target: "ingest", source = %source.label(), error = %e, "item without link dropped");
                    counter!("ingest_items_dropped_total").increment(1);
                    ItemOutcome::Failed {
                        link: String::new(),
                        error: e.to_string(),
                    }
                }
            },
        }
    }
}
