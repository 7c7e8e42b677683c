//! Shared Media Processor.
//!
//! `process(url, options)` downloads, resizes and optionally watermarks an
//! image at most once per (url, options) within the cache TTL. Concurrent
//! callers for the same key wait on a per-key in-flight lock and then read
//! the cached result, so every caller gets the same local file.

pub mod cache;
pub mod download;
pub mod transform;
pub mod watermark;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use metrics::counter;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
pub use cache::MediaCache;
pub use download::{download_with_retry, Downloaded, HttpMediaFetcher, MediaFetcher, RetryPolicy};
use transform::OutputFormat;
pub use watermark::Anchor;

#[derive(Debug, Clone, PartialEq)]
pub struct MediaOptions {
    pub enable_watermark: bool,
    pub watermark_path: Option<PathBuf>,
    pub anchor: Anchor,
    pub opacity: f32,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub quality: u8,
    /// Sub-folder of the media root the processed files land in.
    pub target_folder: String,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            enable_watermark: false,
            watermark_path: None,
            anchor: Anchor::TopLeft,
            opacity: 1.0,
            max_width: Some(1280),
            max_height: Some(1280),
            quality: 85,
            target_folder: "unified".to_string(),
        }
    }
}

impl MediaOptions {
    /// Every option that changes the produced bytes is part of the key.
    pub fn cache_key(&self, url: &str) -> String {
        let mut h = Sha256::new();
        h.update(url.as_bytes());
        h.update([0u8]);
        h.update([u8::from(self.enable_watermark)]);
        h.update(
            self.watermark_path
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
                .as_bytes(),
        );
        h.update([0u8]);
        h.update(format!(
            "{:?}|{:?}|{}|{:?}|{}|{}",
            self.max_width,
            self.max_height,
            self.quality,
            self.anchor,
            self.opacity,
            self.target_folder
        ));
        h.finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

type Flight = Arc<tokio::sync::Mutex<()>>;

pub struct MediaProcessor {
    fetcher: Arc<dyn MediaFetcher>,
    cache: MediaCache,
    retry: RetryPolicy,
    root: PathBuf,
    flights: Mutex<HashMap<String, Flight>>,
}

impl MediaProcessor {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, root: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            cache: MediaCache::default(),
            retry: RetryPolicy::default(),
            root: root.into(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: MediaCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &MediaCache {
        &self.cache
    }

    /// Local path of the processed asset, or `None` if it could not be
    /// produced. Never fails the caller.
    pub async fn process(&self, url: &str, opts: &MediaOptions) -> Option<PathBuf> {
        let key = opts.cache_key(url);
        if let Some(p) = self.cached(&key).await {
            return Some(p);
        }

        let flight = self.flight(&key);
        let guard = flight.lock().await;

        let result = match self.cached(&key).await {
            Some(p) => Some(p),
            None => {
                let produced = self.process_uncached(url, opts).await;
                if let Some(p) = &produced {
                    self.cache.insert(key.clone(), p.clone());
                }
                produced
            }
        };

        drop(guard);
        self.release_flight(&key, &flight);
        result
    }

    async fn cached(&self, key: &str) -> Option<PathBuf> {
        let p = self.cache.get(key)?;
        if tokio::fs::try_exists(&p).await.unwrap_or(false) {
            counter!("media_cache_hits_total").increment(1);
            Some(p)
        } else {
            None
        }
    }

    fn flight(&self, key: &str) -> Flight {
        let mut g = match self.flights.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        g.entry(key.to_string()).or_default().clone()
    }

    fn release_flight(&self, key: &str, flight: &Flight) {
        let mut g = match self.flights.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        // map + our handle; anything above means someone is still waiting.
        if g.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) && Arc::strong_count(flight) <= 2 {
            g.remove(key);
        }
    }

    async fn process_uncached(&self, url: &str, opts: &MediaOptions) -> Option<PathBuf> {
        let Some(downloaded) = download_with_retry(self.fetcher.as_ref(), url, &self.retry).await
        else {
            tracing::warn!(target: "media", url, attempts = self.retry.max_attempts, "giving up; publishing without asset");
            return None;
        };

        let format = OutputFormat::detect(url, Some(&downloaded.content_type));
        let (max_w, max_h, quality) = (opts.max_width, opts.max_height, opts.quality);
        let encoded = tokio::task::spawn_blocking(move || {
            transform::resize_and_encode(&downloaded.bytes, format, max_w, max_h, quality)
        })
        .await
        .map_err(|e| PipelineError::MediaProcessing(e.to_string()))
        .and_then(|r| r);

        let bytes = match encoded {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(target: "media", url, error = %e, "transform failed");
                counter!("media_transform_failures_total").increment(1);
                return None;
            }
        };

        let path = match self.persist(&opts.target_folder, format, bytes).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: "media", url, error = %e, "could not store processed image");
                return None;
            }
        };

        if opts.enable_watermark {
            self.watermark(&path, opts).await;
        }

        tracing::info!(target: "media", url, path = %path.display(), "media processed");
        Some(path)
    }

    async fn persist(
        &self,
        folder: &str,
        format: OutputFormat,
        bytes: Vec<u8>,
    ) -> std::io::Result<PathBuf> {
        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir).await?;
        let name = format!(
            "{folder}-{}-{:06}.{}",
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u32>() % 1_000_000,
            format.extension()
        );
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Watermark failures are logged and the plain image is kept.
    async fn watermark(&self, path: &Path, opts: &MediaOptions) {
        let Some(logo) = opts.watermark_path.clone() else {
            tracing::warn!(target: "media", "watermark enabled without a logo path; skipped");
            return;
        };
        let (target, anchor, opacity, quality) =
            (path.to_path_buf(), opts.anchor, opts.opacity, opts.quality);
        let res = tokio::task::spawn_blocking(move || {
            watermark::apply_watermark(&target, &logo, anchor, opacity, quality)
        })
        .await
        .map_err(|e| PipelineError::MediaProcessing(e.to_string()))
        .and_then(|r| r);

        if let Err(e) = res {
            tracing::warn!(target: "media", path = %path.display(), error = %e, "watermark step failed; keeping unwatermarked image");
            counter!("media_watermark_failures_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_changes_with_every_option() {
        let base = MediaOptions::default();
        let url = "https://cdn.test/a.jpg";
        let k = base.cache_key(url);
        assert_eq!(k, base.cache_key(url));
        assert_eq!(k.len(), 64);

        let variants = [
            MediaOptions { enable_watermark: true, ..base.clone() },
            MediaOptions { watermark_path: Some("logo-b.png".into()), ..base.clone() },
            MediaOptions { max_width: Some(640), ..base.clone() },
            MediaOptions { max_height: None, ..base.clone() },
            MediaOptions { quality: 70, ..base.clone() },
        ];
        for v in variants {
            assert_ne!(k, v.cache_key(url));
        }
        assert_ne!(k, base.cache_key("https://cdn.test/b.jpg"));
    }
}
