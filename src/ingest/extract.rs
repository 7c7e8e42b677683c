//! Content Extractor: raw feed/page item -> [`CanonicalItem`].

use url::Url;

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::normalize_text;
use crate::ingest::types::{CanonicalItem, FeedSource, RawItem};

/// Query parameters that only identify the referrer or campaign.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "yclid", "igshid", "mc_cid", "mc_eid", "ref_src",
];

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Canonical link: trimmed, fragment and tracking parameters dropped, the
/// remaining query kept in order. Non-URL links are kept trimmed.
pub fn canonical_link(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut u) = Url::parse(raw) else {
        return raw.to_string();
    };
    u.set_fragment(None);
    if u.query().is_some() {
        let kept: Vec<(String, String)> = u
            .query_pairs()
            .filter(|(k, _)| !is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            u.set_query(None);
        } else {
            u.query_pairs_mut().clear().extend_pairs(kept);
        }
    }
    u.to_string()
}

fn absolute_http(url: Option<String>) -> Option<String> {
    let url = url?;
    let u = Url::parse(url.trim()).ok()?;
    matches!(u.scheme(), "http" | "https").then(|| u.to_string())
}

/// Normalize one raw item. Items without a link, or without both title and
/// body, cannot be published or deduplicated.
pub fn extract(raw: RawItem, source: &FeedSource) -> PipelineResult<CanonicalItem> {
    let link = raw
        .link
        .as_deref()
        .map(canonical_link)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| PipelineError::UpstreamFormat("item has no link".into()))?;

    let body = raw
        .content
        .as_deref()
        .or(raw.description.as_deref())
        .map(normalize_text)
        .unwrap_or_default();
    let mut title = raw.title.as_deref().map(normalize_text).unwrap_or_default();
    if title.is_empty() {
        title = crate::ingest::truncate_chars(&body, 120);
    }
    if title.is_empty() {
        return Err(PipelineError::UpstreamFormat(format!(
            "item {link} has neither title nor body"
        )));
    }

    Ok(CanonicalItem {
        title,
        link,
        published_at: raw.published_at,
        body,
        image_url: absolute_http(raw.image_url),
        video_url: absolute_http(raw.video_url),
        source_url: source.url.clone(),
        category: source.category.clone(),
        summary: None,
        keywords: Vec::new(),
    })
}
