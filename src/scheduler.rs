// src/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;

use crate::pipeline::Pipeline;

/// Recurring batch trigger. While it lives, the progress tracker reports the
/// scheduler as armed (`isRunning`).
pub struct SchedulerHandle {
    task: JoinHandle<()>,
    pipeline: Arc<Pipeline>,
}

impl SchedulerHandle {
    /// Disarm and stop. A batch already in flight is cut at its next
    /// suspension point; outcomes recorded so far stay in the log.
    pub fn stop(self) {
        self.task.abort();
        self.pipeline.tracker().set_scheduler_armed(false);
        tracing::info!(target: "ingest", "scheduler stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the recurring batch loop. The first batch starts immediately.
pub fn spawn_scheduler(pipeline: Arc<Pipeline>, interval: Duration) -> SchedulerHandle {
    pipeline.tracker().set_scheduler_armed(true);
    let worker = Arc::clone(&pipeline);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            counter!("scheduler_ticks_total").increment(1);
            match worker.try_run_batch().await {
                Some(report) => tracing::info!(target: "ingest", summary = %report.summary(), "scheduled batch done"),
                None => tracing::debug!(target: "ingest", "previous batch still running; tick skipped"),
            }
        }
    });
    tracing::info!(target: "ingest", interval_secs = interval.as_secs(), "scheduler armed");
    SchedulerHandle { task, pipeline }
}
