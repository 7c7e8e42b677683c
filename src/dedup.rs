//! Duplicate Checker.
//!
//! Exact canonical-link match against the log is authoritative. Fuzzy title
//! matching is opt-in and limited to entries from the same feed source.

use std::sync::Arc;

use anyhow::Result;

use crate::dispatch::DestinationSet;
use crate::ingest::normalize_title;
use crate::store::{LogStore, ProcessedLogEntry};

/// How many recent entries of a source are compared by title.
const FUZZY_WINDOW: usize = 200;
const FUZZY_MIN_PREFIX_CHARS: usize = 20;
const FUZZY_MIN_SIMILARITY: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactLink,
    SimilarTitle,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Destinations that already received this item successfully.
    pub satisfied: DestinationSet,
    /// Log entry for this exact link, if one exists.
    pub existing: Option<ProcessedLogEntry>,
    pub matched_by: Option<MatchKind>,
}

impl Classification {
    pub fn is_full_duplicate(&self, requested: DestinationSet) -> bool {
        requested.minus(self.satisfied).is_empty()
    }
}

#[derive(Clone)]
pub struct DuplicateChecker {
    store: Arc<dyn LogStore>,
    fuzzy: bool,
}

impl DuplicateChecker {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            fuzzy: false,
        }
    }

    pub fn with_fuzzy(mut self, enabled: bool) -> Self {
        self.fuzzy = enabled;
        self
    }

    pub async fn classify(
        &self,
        link: &str,
        title: &str,
        source_url: &str,
    ) -> Result<Classification> {
        if let Some(entry) = self.store.find_by_link(link).await? {
            return Ok(Classification {
                satisfied: entry.satisfied(),
                existing: Some(entry),
                matched_by: Some(MatchKind::ExactLink),
            });
        }

        if self.fuzzy {
            let recent = self.store.recent_for_source(source_url, FUZZY_WINDOW).await?;
            if let Some(hit) = recent.iter().find(|e| titles_match(title, &e.title)) {
                tracing::debug!(target: "dedup", link, matched = %hit.link, "similar title already logged");
                return Ok(Classification {
                    satisfied: hit.satisfied(),
                    existing: None,
                    matched_by: Some(MatchKind::SimilarTitle),
                });
            }
        }

        Ok(Classification::default())
    }
}

/// Normalized titles equal, a long-enough prefix of one another, or close by
/// normalized Levenshtein similarity.
pub fn titles_match(a: &str, b: &str) -> bool {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (&a, &b)
    } else {
        (&b, &a)
    };
    if short.chars().count() > FUZZY_MIN_PREFIX_CHARS && long.starts_with(short.as_str()) {
        return true;
    }
    strsim::normalized_levenshtein(&a, &b) >= FUZZY_MIN_SIMILARITY
}
