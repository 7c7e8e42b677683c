use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub const MEDIA_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    inserted_at: Instant,
}

/// key -> processed local path. Expired entries are dropped lazily on insert;
/// there is no background sweep.
#[derive(Debug)]
pub struct MediaCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for MediaCache {
    fn default() -> Self {
        Self::new(MEDIA_CACHE_TTL)
    }
}

impl MediaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Fresh entry for `key`, if any. Stale entries are reported as misses but
    /// left in place until the next insert.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let g = self.lock();
        let e = g.get(key)?;
        (e.inserted_at.elapsed() < self.ttl).then(|| e.path.clone())
    }

    pub fn insert(&self, key: String, path: PathBuf) {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut g = self.lock();
        g.retain(|_, e| now.duration_since(e.inserted_at) < ttl);
        g.insert(
            key,
            CacheEntry {
                path,
                inserted_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_evicted_on_insert() {
        let cache = MediaCache::new(Duration::from_secs(10));
        cache.insert("a".into(), PathBuf::from("/tmp/a.jpg"));
        assert!(cache.get("a").is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 1, "no background sweep");

        cache.insert("b".into(), PathBuf::from("/tmp/b.jpg"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_some());
    }
}
