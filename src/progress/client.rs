//! Typed polling client for the progress endpoint.
//!
//! Polls on a fixed cadence, never more often than the minimum gap, and
//! aborts the outstanding request whenever a new one starts, so an older
//! response can never overwrite a newer state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::debug;

use super::{ProgressState, ProgressTracker};
use crate::error::PipelineResult;

pub const POLL_CADENCE: Duration = Duration::from_millis(1_500);
pub const MIN_POLL_GAP: Duration = Duration::from_millis(500);

#[async_trait::async_trait]
pub trait StateEndpoint: Send + Sync + 'static {
    async fn fetch_state(&self) -> PipelineResult<ProgressState>;
}

/// `GET {base}/api/progress`.
pub struct HttpStateEndpoint {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpStateEndpoint {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/progress", base_url.trim_end_matches('/')),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait::async_trait]
impl StateEndpoint for HttpStateEndpoint {
    async fn fetch_state(&self) -> PipelineResult<ProgressState> {
        let state = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<ProgressState>()
            .await?;
        Ok(state)
    }
}

/// Reads an in-process tracker directly.
pub struct LocalStateEndpoint(pub ProgressTracker);

#[async_trait::async_trait]
impl StateEndpoint for LocalStateEndpoint {
    async fn fetch_state(&self) -> PipelineResult<ProgressState> {
        Ok(self.0.snapshot())
    }
}

#[derive(Default)]
struct PollSlot {
    inflight: Option<AbortHandle>,
    last_started: Option<Instant>,
}

pub struct ProgressPoller {
    endpoint: Arc<dyn StateEndpoint>,
    cadence: Duration,
    min_gap: Duration,
    tx: watch::Sender<Option<ProgressState>>,
    slot: Mutex<PollSlot>,
}

impl ProgressPoller {
    pub fn new(endpoint: Arc<dyn StateEndpoint>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            endpoint,
            cadence: POLL_CADENCE,
            min_gap: MIN_POLL_GAP,
            tx,
            slot: Mutex::new(PollSlot::default()),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration, min_gap: Duration) -> Self {
        self.cadence = cadence;
        self.min_gap = min_gap;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressState>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<ProgressState> {
        self.tx.borrow().clone()
    }

    /// Start one poll. Returns `false` when debounced by the minimum gap.
    pub fn poll_now(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if slot
            .last_started
            .is_some_and(|t| now.duration_since(t) < self.min_gap)
        {
            return false;
        }
        if let Some(prev) = slot.inflight.take() {
            debug!(target: "progress", "aborting superseded poll");
            prev.abort();
        }

        let endpoint = Arc::clone(&self.endpoint);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            match endpoint.fetch_state().await {
                Ok(state) => {
                    // A different boot id means the server restarted and its seq began again.
                    tx.send_if_modified(|cur| match cur {
                        Some(c) if c.supersedes(&state) => false,
                        _ => {
                            *cur = Some(state);
                            true
                        }
                    });
                }
                Err(e) => debug!(target: "progress", error = %e, "progress poll failed"),
            }
        });
        slot.inflight = Some(task.abort_handle());
        slot.last_started = Some(now);
        true
    }

    /// Poll on the configured cadence until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.cadence);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                self.poll_now();
            }
        })
    }
}

impl Drop for ProgressPoller {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = slot.inflight.take() {
            h.abort();
        }
    }
}
