// src/ingest/mod.rs
pub mod extract;
pub mod feed;
pub mod page;
pub mod types;

use metrics::{describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use regex::Regex;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_items_total", "Items parsed from feeds.");
        describe_counter!(
            "ingest_source_unavailable_total",
            "Feed fetches that yielded nothing (timeout, HTTP error, malformed)."
        );
        describe_counter!("ingest_pages_scraped_total", "Article pages fetched.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
    });
}

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|</?[^>]+>").unwrap())
}

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Plain text from a feed/page fragment: decode entities, strip tags,
/// collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // Tags first: encoded markup (`&lt;p&gt;`) decodes into tags we strip again.
    let stripped = re_tags().replace_all(s, " ");
    let decoded = html_escape::decode_html_entities(&stripped);
    let stripped = re_tags().replace_all(&decoded, " ");
    re_ws().replace_all(&stripped, " ").trim().to_string()
}

/// Key used for title comparison: lowercase, letters/digits only, Arabic
/// letter variants folded to their Persian forms.
pub fn normalize_title(s: &str) -> String {
    let text = normalize_text(s);
    let mut out = String::with_capacity(text.len());
    let mut prev_space = true;
    for ch in text.chars() {
        let ch = match ch {
            'ي' | 'ى' => 'ی',
            'ك' => 'ک',
            'ة' => 'ه',
            c => c,
        };
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            prev_space = false;
        } else if !prev_space {
            out.push(' ');
            prev_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Truncate to at most `max` chars, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_markup_and_entities() {
        let s = "  <p>Hello,&nbsp;&nbsp; <b>world</b></p>  ";
        assert_eq!(normalize_text(s), "Hello, world");
        assert_eq!(normalize_text("&lt;p&gt;encoded&lt;/p&gt;"), "encoded");
    }

    #[test]
    fn normalize_title_folds_case_and_punctuation() {
        assert_eq!(
            normalize_title("Gold  prices RISE, again!"),
            "gold prices rise again"
        );
        assert_eq!(normalize_title("قيمت طلا"), normalize_title("قیمت طلا"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("دلار آزاد", 4), "دلار");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
