//! Live status of the ingestion job, read by polling.
//!
//! `idle → checking → processing → completed → idle`. The last step happens
//! on its own after a short grace window, unless the recurring scheduler is
//! armed (`is_running`), in which case the completed state stays visible.

pub mod client;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use client::{HttpStateEndpoint, LocalStateEndpoint, ProgressPoller, StateEndpoint};

pub const RESET_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Checking,
    Processing,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub is_checking: bool,
    pub is_processing: bool,
    /// Recurring scheduler armed, even between runs.
    pub is_running: bool,
    /// A run is in flight right now.
    pub is_active: bool,
    pub completed: bool,
    /// Percent, 0..=100.
    pub progress: u8,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    /// Bumped on every change; lets pollers drop out-of-order responses.
    pub seq: u64,
    /// Fixed per tracker instance. `seq` only orders states with the same id.
    #[serde(default)]
    pub boot_id: u64,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            is_checking: false,
            is_processing: false,
            is_running: false,
            is_active: false,
            completed: false,
            progress: 0,
            current: 0,
            total: 0,
            message: String::new(),
            phase: Phase::Idle,
            timestamp: Utc::now(),
            seq: 0,
            boot_id: 0,
        }
    }
}

impl ProgressState {
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle && !self.is_active
    }

    /// `self` is a later state of the same tracker than `other`.
    pub fn supersedes(&self, other: &ProgressState) -> bool {
        self.boot_id == other.boot_id && self.seq > other.seq
    }
}

#[derive(Default)]
struct Inner {
    state: ProgressState,
    /// Incremented per run, so a pending reset never clobbers a newer run.
    run: u64,
}

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Mutex<Inner>>,
    grace: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let inner = Inner {
            state: ProgressState {
                boot_id: rand::random(),
                ..ProgressState::default()
            },
            run: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            grace: RESET_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut ProgressState)) {
        let mut g = self.lock();
        f(&mut g.state);
        g.state.timestamp = Utc::now();
        g.state.seq += 1;
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock().state.clone()
    }

    /// Enter `checking`. Returns the run number.
    pub fn start_run(&self, message: impl Into<String>) -> u64 {
        let message = message.into();
        let mut g = self.lock();
        g.run += 1;
        let run = g.run;
        let s = &mut g.state;
        s.is_checking = true;
        s.is_processing = false;
        s.is_active = true;
        s.completed = false;
        s.progress = 0;
        s.current = 0;
        s.total = 0;
        s.message = message;
        s.phase = Phase::Checking;
        s.timestamp = Utc::now();
        s.seq += 1;
        debug!(target: "progress", run, "run started");
        run
    }

    pub fn begin_processing(&self, total: usize) {
        self.update(|s| {
            s.is_checking = false;
            s.is_processing = true;
            s.phase = Phase::Processing;
            s.total = total;
            s.current = 0;
            s.progress = 0;
            s.message = format!("processing {total} items");
        });
    }

    /// `current` items of `total` done.
    pub fn advance(&self, current: usize, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.current = current;
            s.progress = percent(s.current, s.total);
            s.message = message;
        });
    }

    /// Enter `completed` and, unless the scheduler is armed, schedule the
    /// return to `idle`. Must be called inside a Tokio runtime.
    pub fn complete(&self, message: impl Into<String>) {
        let message = message.into();
        let (run, armed) = {
            let mut g = self.lock();
            let s = &mut g.state;
            s.is_checking = false;
            s.is_processing = false;
            s.is_active = false;
            s.completed = true;
            s.progress = 100;
            s.phase = Phase::Completed;
            s.message = message;
            s.timestamp = Utc::now();
            s.seq += 1;
            let armed = s.is_running;
            (g.run, armed)
        };
        if !armed {
            self.schedule_reset(run);
        }
    }

    /// Arm or disarm the recurring scheduler flag. Disarming while a finished
    /// run is still on display schedules the usual reset.
    pub fn set_scheduler_armed(&self, armed: bool) {
        let (run, completed) = {
            let mut g = self.lock();
            g.state.is_running = armed;
            g.state.timestamp = Utc::now();
            g.state.seq += 1;
            (g.run, g.state.phase == Phase::Completed)
        };
        if !armed && completed {
            self.schedule_reset(run);
        }
    }

    /// Back to idle. Keeps the scheduler flag.
    pub fn reset(&self) {
        self.update(|s| {
            *s = ProgressState {
                is_running: s.is_running,
                seq: s.seq,
                boot_id: s.boot_id,
                ..ProgressState::default()
            };
        });
    }

    fn schedule_reset(&self, run: u64) {
        let this = self.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let stale = {
                let g = this.lock();
                g.run != run || g.state.phase != Phase::Completed || g.state.is_running
            };
            if !stale {
                debug!(target: "progress", run, "grace elapsed; back to idle");
                this.reset();
            }
        });
    }
}

fn percent(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completed_run_returns_to_idle_after_grace() {
        let t = ProgressTracker::new();
        t.start_run("checking feeds");
        let s = t.snapshot();
        assert!(s.is_checking && s.is_active);

        t.begin_processing(4);
        t.advance(1, "1/4");
        assert_eq!(t.snapshot().progress, 25);

        t.complete("done");
        assert!(t.snapshot().completed);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(t.snapshot().phase, Phase::Completed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(t.snapshot().is_idle());
        assert!(!t.snapshot().completed);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_scheduler_keeps_state_warm() {
        let t = ProgressTracker::new();
        t.set_scheduler_armed(true);
        t.start_run("run");
        t.complete("done");

        tokio::time::sleep(Duration::from_secs(10)).await;
        let s = t.snapshot();
        assert!(s.is_running);
        assert_eq!(s.phase, Phase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_reset_does_not_touch_a_newer_run() {
        let t = ProgressTracker::new();
        t.start_run("first");
        t.complete("first done");
        tokio::time::sleep(Duration::from_secs(1)).await;
        t.start_run("second");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(t.snapshot().phase, Phase::Checking);
    }

    #[test]
    fn seq_increases_on_every_change() {
        let t = ProgressTracker::new();
        let a = t.snapshot().seq;
        t.start_run("x");
        t.begin_processing(1);
        assert_eq!(t.snapshot().seq, a + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_id_survives_resets() {
        let t = ProgressTracker::new();
        let boot = t.snapshot().boot_id;
        t.start_run("x");
        t.complete("done");
        tokio::time::sleep(Duration::from_secs(3)).await;
        let s = t.snapshot();
        assert!(s.is_idle());
        assert_eq!(s.boot_id, boot);

        let restarted = ProgressState {
            seq: 1,
            boot_id: boot.wrapping_add(1),
            ..ProgressState::default()
        };
        assert!(!s.supersedes(&restarted));
    }
}
