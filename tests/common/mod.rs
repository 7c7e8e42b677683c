// tests/common/mod.rs
//
// Shared mocks for integration tests: sinks, media fetchers, AI clients.
#![allow(dead_code)]

use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use news_relay::dispatch::{Destination, PublishPayload, Sink};
use news_relay::enrich::{AiClient, Enricher, Prompt};
use news_relay::error::{PipelineError, PipelineResult};
use news_relay::media::{Downloaded, MediaFetcher, MediaOptions, MediaProcessor, RetryPolicy};
use news_relay::store::{LogStore, MemoryLogStore};
use news_relay::Orchestrator;

/// What a sink saw for one publish call.
#[derive(Debug, Clone)]
pub struct Published {
    pub link: String,
    pub title: String,
    pub text: String,
    pub image: Option<std::path::PathBuf>,
    pub video: Option<String>,
}

pub struct MockSink {
    pub destination: Destination,
    pub fail_with: Mutex<Option<String>>,
    pub calls: Mutex<Vec<Published>>,
}

impl MockSink {
    pub fn ok(destination: Destination) -> Arc<Self> {
        Arc::new(Self {
            destination,
            fail_with: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(destination: Destination, msg: &str) -> Arc<Self> {
        let s = Self::ok(destination);
        *s.fail_with.lock() = Some(msg.to_string());
        s
    }

    pub fn heal(&self) {
        *self.fail_with.lock() = None;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Sink for MockSink {
    fn destination(&self) -> Destination {
        self.destination
    }

    async fn publish(&self, payload: &PublishPayload<'_>) -> PipelineResult<String> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(Published {
                link: payload.item.link.clone(),
                title: payload.draft.title.clone(),
                text: payload.draft.text.clone(),
                image: payload.image_path.map(|p| p.to_path_buf()),
                video: payload.video_url.map(str::to_string),
            });
            calls.len()
        };
        if let Some(msg) = self.fail_with.lock().clone() {
            return Err(PipelineError::publish(self.destination, msg));
        }
        Ok(format!("{}-{n}", self.destination))
    }
}

/// Small PNG, decodable by the transform step.
pub fn png_bytes(w: u32, h: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(w, h, image::Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Serves the same PNG for every URL, counting calls.
pub struct CountingFetcher {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub body: Vec<u8>,
}

impl CountingFetcher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            body: png_bytes(64, 48, [200, 30, 30, 255]),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaFetcher for CountingFetcher {
    async fn fetch(&self, _url: &str) -> PipelineResult<Downloaded> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Downloaded {
            bytes: self.body.clone(),
            content_type: "image/png".into(),
        })
    }
}

/// Always fails; records when each attempt happened.
#[derive(Default)]
pub struct FailingFetcher {
    pub attempts: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait]
impl MediaFetcher for FailingFetcher {
    async fn fetch(&self, url: &str) -> PipelineResult<Downloaded> {
        self.attempts.lock().push(tokio::time::Instant::now());
        Err(PipelineError::Network(format!("{url}: HTTP 503")))
    }
}

/// Counts prompts; answers JSON prompts with a combined draft.
pub struct CountingAi {
    pub calls: AtomicUsize,
    pub answer: Option<String>,
}

impl CountingAi {
    pub fn answering() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            answer: Some(
                r#"{"telegram_summary":"<b>Short</b> summary for the channel.",
                    "website_title":"Rewritten headline",
                    "website_content":"<p>Rewritten body.</p>",
                    "seo_keywords":["alpha","beta"],
                    "title":"Rewritten headline","content":"<p>Rewritten body.</p>","keywords":["alpha"]}"#
                    .to_string(),
            ),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            answer: None,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AiClient for CountingAi {
    fn complete<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let out = match (&self.answer, prompt.json) {
            (Some(a), true) => Some(a.clone()),
            (Some(_), false) => Some("Plain <b>summary</b>.".to_string()),
            (None, _) => None,
        };
        Box::pin(async move { out })
    }

    fn provider_name(&self) -> &'static str {
        "counting"
    }
}

/// Fast retry policy for tests that are not about backoff.
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    }
}

pub struct Harness {
    pub store: Arc<dyn LogStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub fetcher: Arc<CountingFetcher>,
    pub media_dir: tempfile::TempDir,
}

/// Orchestrator over an in-memory log, a counting fetcher and the given AI.
pub fn harness(ai: Option<Arc<CountingAi>>, sinks: &[Arc<MockSink>]) -> Harness {
    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let media_dir = tempfile::tempdir().expect("tempdir");
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let media = Arc::new(
        MediaProcessor::new(fetcher.clone(), media_dir.path()).with_retry(quick_retry()),
    );
    let enricher = match ai {
        Some(ai) => Arc::new(Enricher::new(ai)),
        None => Arc::new(Enricher::disabled()),
    };
    let mut orchestrator =
        Orchestrator::new(store.clone(), media, MediaOptions::default(), enricher);
    for s in sinks {
        orchestrator = orchestrator.with_sink(s.clone());
    }
    Harness {
        store,
        orchestrator: Arc::new(orchestrator),
        fetcher,
        media_dir,
    }
}
