//! Persistent log of processed items.
//!
//! The durable store is an external collaborator; the pipeline only talks to it
//! through [`LogStore`]. Two implementations ship here: an in-memory store for
//! tests/dev and a JSON-file store that survives restarts.
//!
//! Entries are keyed by canonical link. A destination in `Success` is terminal
//! and is never overwritten; `Error`/`Unattempted` destinations may be
//! re-attempted by a later run and are updated in place.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{Destination, DestinationSet, SinkOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationStatus {
    #[default]
    Unattempted,
    Success,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub status: DestinationStatus,
    pub error: Option<String>,
    /// Sent-message id or created-content id.
    pub external_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedLogEntry {
    pub id: u64,
    pub link: String,
    pub title: String,
    pub source_url: String,
    pub category: String,
    pub telegram: DestinationRecord,
    pub website: DestinationRecord,
    /// How many times the link was re-encountered and skipped as a duplicate.
    #[serde(default)]
    pub duplicate_hits: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ProcessedLogEntry {
    pub fn record(&self, d: Destination) -> &DestinationRecord {
        match d {
            Destination::Telegram => &self.telegram,
            Destination::Website => &self.website,
        }
    }

    fn record_mut(&mut self, d: Destination) -> &mut DestinationRecord {
        match d {
            Destination::Telegram => &mut self.telegram,
            Destination::Website => &mut self.website,
        }
    }

    /// Destinations that already received this link successfully.
    pub fn satisfied(&self) -> DestinationSet {
        let mut set = DestinationSet::none();
        for d in Destination::ALL {
            if self.record(d).status == DestinationStatus::Success {
                set.insert(d);
            }
        }
        set
    }
}

/// Data needed to open a log entry for a non-duplicate item.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub link: String,
    pub title: String,
    pub source_url: String,
    pub category: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub destination: Option<Destination>,
    pub status: Option<DestinationStatus>,
    /// Case-insensitive substring over title and link.
    pub q: Option<String>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, e: &ProcessedLogEntry) -> bool {
        if let Some(status) = self.status {
            let hit = match self.destination {
                Some(d) => e.record(d).status == status,
                None => Destination::ALL.iter().any(|d| e.record(*d).status == status),
            };
            if !hit {
                return false;
            }
        } else if let Some(d) = self.destination {
            if e.record(d).status == DestinationStatus::Unattempted {
                return false;
            }
        }
        if let Some(q) = self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            if !e.title.to_lowercase().contains(&q) && !e.link.to_lowercase().contains(&q) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DestinationStats {
    pub success: usize,
    pub error: usize,
    pub unattempted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub entries: usize,
    pub duplicate_hits: u64,
    pub telegram: DestinationStats,
    pub website: DestinationStats,
}

#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    async fn find_by_link(&self, link: &str) -> Result<Option<ProcessedLogEntry>>;
    /// Most recent entries coming from one feed source (newest first).
    async fn recent_for_source(&self, source_url: &str, limit: usize)
        -> Result<Vec<ProcessedLogEntry>>;
    /// Open an entry for `draft.link`, or return the existing one.
    async fn begin(&self, draft: NewLogEntry) -> Result<ProcessedLogEntry>;
    async fn record_outcome(&self, id: u64, d: Destination, outcome: &SinkOutcome) -> Result<()>;
    async fn finish(&self, id: u64) -> Result<Option<ProcessedLogEntry>>;
    async fn record_duplicate(&self, id: u64) -> Result<()>;
    async fn list(&self, filter: &LogFilter) -> Result<Vec<ProcessedLogEntry>>;
    async fn delete(&self, ids: &[u64]) -> Result<usize>;
    async fn stats(&self) -> Result<LogStats>;
}

// ------------------------------------------------------------
// In-memory store
// ------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    next_id: u64,
    entries: BTreeMap<u64, ProcessedLogEntry>,
    #[serde(skip)]
    by_link: HashMap<String, u64>,
}

impl Inner {
    fn reindex(&mut self) {
        self.by_link = self
            .entries
            .values()
            .map(|e| (e.link.clone(), e.id))
            .collect();
        let max = self.entries.keys().next_back().copied().unwrap_or(0);
        self.next_id = self.next_id.max(max);
    }

    fn find_by_link(&self, link: &str) -> Option<ProcessedLogEntry> {
        self.by_link
            .get(link)
            .and_then(|id| self.entries.get(id))
            .cloned()
    }

    fn recent_for_source(&self, source_url: &str, limit: usize) -> Vec<ProcessedLogEntry> {
        self.entries
            .values()
            .rev()
            .filter(|e| e.source_url == source_url)
            .take(limit)
            .cloned()
            .collect()
    }

    fn begin(&mut self, draft: NewLogEntry) -> ProcessedLogEntry {
        if let Some(existing) = self.find_by_link(&draft.link) {
            return existing;
        }
        self.next_id += 1;
        let entry = ProcessedLogEntry {
            id: self.next_id,
            link: draft.link,
            title: draft.title,
            source_url: draft.source_url,
            category: draft.category,
            telegram: DestinationRecord::default(),
            website: DestinationRecord::default(),
            duplicate_hits: 0,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.by_link.insert(entry.link.clone(), entry.id);
        self.entries.insert(entry.id, entry.clone());
        entry
    }

    fn record_outcome(&mut self, id: u64, d: Destination, outcome: &SinkOutcome) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .with_context(|| format!("log entry {id} not found"))?;
        let rec = entry.record_mut(d);
        if rec.status == DestinationStatus::Success {
            tracing::warn!(target: "store", id, destination = %d, "refusing to overwrite a successful destination");
            return Ok(());
        }
        rec.status = if !outcome.attempted && outcome.error.is_none() {
            DestinationStatus::Unattempted
        } else if outcome.success {
            DestinationStatus::Success
        } else {
            DestinationStatus::Error
        };
        rec.error = outcome.error.clone();
        rec.external_id = outcome.external_id.clone();
        rec.updated_at = Some(Utc::now());
        Ok(())
    }

    fn stats(&self) -> LogStats {
        let mut s = LogStats {
            entries: self.entries.len(),
            ..LogStats::default()
        };
        for e in self.entries.values() {
            s.duplicate_hits += u64::from(e.duplicate_hits);
            for (rec, out) in [
                (&e.telegram, &mut s.telegram),
                (&e.website, &mut s.website),
            ] {
                match rec.status {
                    DestinationStatus::Success => out.success += 1,
                    DestinationStatus::Error => out.error += 1,
                    DestinationStatus::Unattempted => out.unattempted += 1,
                }
            }
        }
        s
    }
}

#[derive(Debug, Default)]
pub struct MemoryLogStore {
    inner: Mutex<Inner>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut g = match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        f(&mut g)
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryLogStore {
    async fn find_by_link(&self, link: &str) -> Result<Option<ProcessedLogEntry>> {
        Ok(self.with(|i| i.find_by_link(link)))
    }

    async fn recent_for_source(
        &self,
        source_url: &str,
        limit: usize,
    ) -> Result<Vec<ProcessedLogEntry>> {
        Ok(self.with(|i| i.recent_for_source(source_url, limit)))
    }

    async fn begin(&self, draft: NewLogEntry) -> Result<ProcessedLogEntry> {
        Ok(self.with(|i| i.begin(draft)))
    }

    async fn record_outcome(&self, id: u64, d: Destination, outcome: &SinkOutcome) -> Result<()> {
        self.with(|i| i.record_outcome(id, d, outcome))
    }

    async fn finish(&self, id: u64) -> Result<Option<ProcessedLogEntry>> {
        Ok(self.with(|i| {
            let e = i.entries.get_mut(&id)?;
            e.processed_at = Some(Utc::now());
            Some(e.clone())
        }))
    }

    async fn record_duplicate(&self, id: u64) -> Result<()> {
        self.with(|i| {
            if let Some(e) = i.entries.get_mut(&id) {
                e.duplicate_hits = e.duplicate_hits.saturating_add(1);
            }
        });
        Ok(())
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<ProcessedLogEntry>> {
        let limit = filter.limit.unwrap_or(100);
        Ok(self.with(|i| {
            i.entries
                .values()
                .rev()
                .filter(|e| filter.matches(e))
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn delete(&self, ids: &[u64]) -> Result<usize> {
        Ok(self.with(|i| {
            let mut removed = 0;
            for id in ids {
                if let Some(e) = i.entries.remove(id) {
                    i.by_link.remove(&e.link);
                    removed += 1;
                }
            }
            removed
        }))
    }

    async fn stats(&self) -> Result<LogStats> {
        Ok(self.with(|i| i.stats()))
    }
}

// ------------------------------------------------------------
// JSON file store
// ------------------------------------------------------------

/// Same semantics as [`MemoryLogStore`], flushed to a JSON file after every
/// mutation (tmp file + rename).
pub struct FileLogStore {
    mem: MemoryLogStore,
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileLogStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str::<Inner>(&s)
                .with_context(|| format!("parsing log store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Inner::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading log store {}", path.display()))
            }
        };
        inner.reindex();
        tracing::info!(target: "store", path = %path.display(), entries = inner.entries.len(), "log store opened");
        Ok(Self {
            mem: MemoryLogStore {
                inner: Mutex::new(inner),
            },
            path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn flush(&self) -> Result<()> {
        let _g = self.write_lock.lock().await;
        let json = self
            .mem
            .with(|i| serde_json::to_vec_pretty(&*i))
            .context("serializing log store")?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogStore for FileLogStore {
    async fn find_by_link(&self, link: &str) -> Result<Option<ProcessedLogEntry>> {
        self.mem.find_by_link(link).await
    }

    async fn recent_for_source(
        &self,
        source_url: &str,
        limit: usize,
    ) -> Result<Vec<ProcessedLogEntry>> {
        self.mem.recent_for_source(source_url, limit).await
    }

    async fn begin(&self, draft: NewLogEntry) -> Result<ProcessedLogEntry> {
        let e = self.mem.begin(draft).await?;
        self.flush().await?;
        Ok(e)
    }

    async fn record_outcome(&self, id: u64, d: Destination, outcome: &SinkOutcome) -> Result<()> {
        self.mem.record_outcome(id, d, outcome).await?;
        self.flush().await
    }

    async fn finish(&self, id: u64) -> Result<Option<ProcessedLogEntry>> {
        let e = self.mem.finish(id).await?;
        self.flush().await?;
        Ok(e)
    }

    async fn record_duplicate(&self, id: u64) -> Result<()> {
        self.mem.record_duplicate(id).await?;
        self.flush().await
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<ProcessedLogEntry>> {
        self.mem.list(filter).await
    }

    async fn delete(&self, ids: &[u64]) -> Result<usize> {
        let n = self.mem.delete(ids).await?;
        self.flush().await?;
        Ok(n)
    }

    async fn stats(&self) -> Result<LogStats> {
        self.mem.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(link: &str) -> NewLogEntry {
        NewLogEntry {
            link: link.into(),
            title: "t".into(),
            source_url: "https://feed.test/rss".into(),
            category: "economy".into(),
        }
    }

    #[tokio::test]
    async fn begin_is_idempotent_per_link() {
        let s = MemoryLogStore::new();
        let a = s.begin(draft("https://x.test/1")).await.unwrap();
        let b = s.begin(draft("https://x.test/1")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(s.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn success_is_terminal() {
        let s = MemoryLogStore::new();
        let e = s.begin(draft("https://x.test/1")).await.unwrap();
        s.record_outcome(e.id, Destination::Website, &SinkOutcome::ok("42"))
            .await
            .unwrap();
        s.record_outcome(e.id, Destination::Website, &SinkOutcome::failed("late"))
            .await
            .unwrap();
        let e = s.find_by_link("https://x.test/1").await.unwrap().unwrap();
        assert_eq!(e.website.status, DestinationStatus::Success);
        assert_eq!(e.website.external_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn filter_by_destination_status() {
        let s = MemoryLogStore::new();
        let a = s.begin(draft("https://x.test/a")).await.unwrap();
        let b = s.begin(draft("https://x.test/b")).await.unwrap();
        s.record_outcome(a.id, Destination::Telegram, &SinkOutcome::failed("boom"))
            .await
            .unwrap();
        s.record_outcome(b.id, Destination::Telegram, &SinkOutcome::ok("7"))
            .await
            .unwrap();
        let f = LogFilter {
            destination: Some(Destination::Telegram),
            status: Some(DestinationStatus::Error),
            ..LogFilter::default()
        };
        let rows = s.list(&f).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].link, "https://x.test/a");
    }
}
