// tests/dispatch.rs
//
// Dispatch Orchestrator end to end with mock sinks, an in-memory log and a
// counting media fetcher.
//
// Covered:
// - per-destination failure isolation and in-place retry on a later run
// - duplicate / short-body / no-image batch behavior
// - combined vs separate enrichment call counts
// - broken enrichment falls back to raw text

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, CountingAi, CountingFetcher, MockSink};
use news_relay::dispatch::{DispatchRequest, SinkOutcome};
use news_relay::enrich::Enricher;
use news_relay::ingest::types::{CanonicalItem, FeedSource};
use news_relay::media::{MediaOptions, MediaProcessor};
use news_relay::store::{
    DestinationStatus, LogFilter, LogStats, LogStore, MemoryLogStore, NewLogEntry, ProcessedLogEntry,
};
use news_relay::{Destination, DestinationSet, ItemOutcome, Orchestrator, PipelineError, ProcessingMode};

const LONG_BODY: &str = "The central bank left its benchmark rate unchanged on Tuesday, \
                         citing easing inflation and a steadier currency market.";

fn item(slug: &str) -> CanonicalItem {
    CanonicalItem {
        title: format!("Rates held steady ({slug})"),
        link: format!("https://news.example.test/economy/{slug}"),
        body: LONG_BODY.to_string(),
        source_url: "https://news.example.test/rss".into(),
        category: "economy".into(),
        ..CanonicalItem::default()
    }
}

fn both(mode: ProcessingMode) -> DispatchRequest {
    DispatchRequest::new(DestinationSet::both(), mode)
}

#[tokio::test]
async fn one_destination_failing_does_not_block_the_other() {
    let tg = MockSink::failing(Destination::Telegram, "bot was blocked");
    let web = MockSink::ok(Destination::Website);
    let h = harness(None, &[tg.clone(), web.clone()]);
    let it = item("isolation");

    let out = h.orchestrator.dispatch(&it, &both(ProcessingMode::Combined)).await;
    let tg_out = out.outcome(Destination::Telegram).unwrap();
    assert!(tg_out.attempted && !tg_out.success);
    assert_eq!(
        tg_out.error.as_deref(),
        Some("telegram publish failed: bot was blocked")
    );
    assert_eq!(
        out.outcome(Destination::Website),
        Some(&SinkOutcome::ok("website-1"))
    );

    let entry = h.store.find_by_link(&it.link).await.unwrap().unwrap();
    assert_eq!(entry.telegram.status, DestinationStatus::Error);
    assert!(entry.telegram.error.as_deref().unwrap().contains("bot was blocked"));
    assert_eq!(entry.website.status, DestinationStatus::Success);
    assert_eq!(entry.website.external_id.as_deref(), Some("website-1"));
    assert!(entry.processed_at.is_some());

    // Next run: telegram is attempted again, website is already satisfied.
    tg.heal();
    let again = h.orchestrator.dispatch(&it, &both(ProcessingMode::Combined)).await;
    match &again {
        ItemOutcome::Processed {
            entry: updated,
            outcomes,
            skipped_duplicates,
        } => {
            assert_eq!(updated.id, entry.id);
            assert_eq!(*skipped_duplicates, DestinationSet::only(Destination::Website));
            assert_eq!(outcomes.len(), 1);
            assert!(outcomes[&Destination::Telegram].success);
            assert_eq!(updated.telegram.status, DestinationStatus::Success);
            assert_eq!(updated.telegram.error, None);
            assert_eq!(updated.website.external_id.as_deref(), Some("website-1"));
        }
        other => panic!("expected Processed, got {other:?}"),
    }
    assert_eq!(tg.call_count(), 2);
    assert_eq!(web.call_count(), 1);

    // Third run: nothing left to do.
    let third = h.orchestrator.dispatch(&it, &both(ProcessingMode::Combined)).await;
    assert!(third.is_duplicate());
    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.duplicate_hits, 1);
}

#[tokio::test]
async fn batch_of_duplicate_media_and_short_items() {
    let tg = MockSink::ok(Destination::Telegram);
    let web = MockSink::ok(Destination::Website);
    let h = harness(None, &[tg.clone(), web.clone()]);

    // A: already published everywhere.
    let a = item("a");
    let entry = h
        .store
        .begin(NewLogEntry {
            link: a.link.clone(),
            title: a.title.clone(),
            source_url: a.source_url.clone(),
            category: a.category.clone(),
        })
        .await
        .unwrap();
    for d in Destination::ALL {
        h.store
            .record_outcome(entry.id, d, &SinkOutcome::ok(format!("old-{d}")))
            .await
            .unwrap();
    }
    h.store.finish(entry.id).await.unwrap();

    // B: has an image.
    let b = CanonicalItem {
        image_url: Some("https://cdn.example.test/img/b.png".into()),
        ..item("b")
    };

    // C: short body, no image.
    let c = CanonicalItem {
        title: "Parliament approves budget amendment".into(),
        body: "Developing.".into(),
        ..item("c")
    };

    let req = both(ProcessingMode::Combined);
    let out_a = h.orchestrator.dispatch(&a, &req).await;
    assert!(out_a.is_duplicate());
    assert_eq!(tg.call_count(), 0);
    assert_eq!(web.call_count(), 0);

    let out_b = h.orchestrator.dispatch(&b, &req).await;
    assert!(out_b.outcome(Destination::Telegram).unwrap().success);
    assert_eq!(h.fetcher.calls(), 1);
    let image = tg.calls.lock()[0].image.clone().expect("processed image");
    assert!(image.starts_with(h.media_dir.path()));
    assert_eq!(web.calls.lock()[0].image.as_ref(), Some(&image));

    let out_c = h.orchestrator.dispatch(&c, &req).await;
    assert!(out_c.outcome(Destination::Website).unwrap().success);
    assert_eq!(h.fetcher.calls(), 1, "no image, no download");

    let web_c = web.calls.lock()[1].clone();
    assert_eq!(web_c.link, c.link);
    assert_eq!(web_c.text, "<p>Parliament approves budget amendment</p>");
    assert!(web_c.image.is_none());
    let tg_c = tg.calls.lock()[1].clone();
    assert_eq!(tg_c.title, c.title);
    assert_eq!(tg_c.text, "");

    let a_entry = h.store.find_by_link(&a.link).await.unwrap().unwrap();
    assert_eq!(a_entry.duplicate_hits, 1);
    assert_eq!(a_entry.telegram.external_id.as_deref(), Some("old-telegram"));
}

#[tokio::test]
async fn combined_mode_uses_one_enrichment_call() {
    let ai = CountingAi::answering();
    let tg = MockSink::ok(Destination::Telegram);
    let web = MockSink::ok(Destination::Website);
    let h = harness(Some(ai.clone()), &[tg.clone(), web.clone()]);

    h.orchestrator
        .dispatch(&item("combined"), &both(ProcessingMode::Combined))
        .await;
    assert_eq!(ai.calls(), 1);

    let tg_call = tg.calls.lock()[0].clone();
    assert_eq!(tg_call.text, "<b>Short</b> summary for the channel.");
    let web_call = web.calls.lock()[0].clone();
    assert_eq!(web_call.title, "Rewritten headline");
    assert_eq!(web_call.text, "<p>Rewritten body.</p>");
}

#[tokio::test]
async fn separate_mode_uses_one_call_per_destination() {
    let ai = CountingAi::answering();
    let tg = MockSink::ok(Destination::Telegram);
    let web = MockSink::ok(Destination::Website);
    let h = harness(Some(ai.clone()), &[tg.clone(), web.clone()]);

    h.orchestrator
        .dispatch(&item("separate"), &both(ProcessingMode::Separate))
        .await;
    assert_eq!(ai.calls(), 2);
    assert_eq!(tg.calls.lock()[0].text, "Plain <b>summary</b>.");
    assert_eq!(web.calls.lock()[0].title, "Rewritten headline");
}

#[tokio::test]
async fn combined_with_one_pending_destination_makes_one_call() {
    let ai = CountingAi::answering();
    let web = MockSink::ok(Destination::Website);
    let h = harness(Some(ai.clone()), &[web.clone()]);

    let req = DispatchRequest::new(
        DestinationSet::only(Destination::Website),
        ProcessingMode::Combined,
    );
    h.orchestrator.dispatch(&item("single"), &req).await;
    assert_eq!(ai.calls(), 1);
    assert_eq!(web.calls.lock()[0].text, "<p>Rewritten body.</p>");
}

#[tokio::test]
async fn existing_metadata_skips_enrichment() {
    let ai = CountingAi::answering();
    let tg = MockSink::ok(Destination::Telegram);
    let h = harness(Some(ai.clone()), &[tg.clone()]);

    let it = CanonicalItem {
        summary: Some("Editor supplied <i>summary</i>.".into()),
        keywords: vec!["rates".into()],
        ..item("meta")
    };
    let req = DispatchRequest::new(
        DestinationSet::only(Destination::Telegram),
        ProcessingMode::Combined,
    );
    h.orchestrator.dispatch(&it, &req).await;
    assert_eq!(ai.calls(), 0);
    assert_eq!(tg.calls.lock()[0].text, "Editor supplied <i>summary</i>.");
}

#[tokio::test]
async fn broken_enrichment_falls_back_to_raw_text() {
    let ai = CountingAi::broken();
    let tg = MockSink::ok(Destination::Telegram);
    let web = MockSink::ok(Destination::Website);
    let h = harness(Some(ai.clone()), &[tg.clone(), web.clone()]);
    let it = item("broken");

    let out = h.orchestrator.dispatch(&it, &both(ProcessingMode::Combined)).await;
    assert!(out.outcome(Destination::Telegram).unwrap().success);
    assert!(out.outcome(Destination::Website).unwrap().success);
    assert_eq!(ai.calls(), 1);

    assert_eq!(tg.calls.lock()[0].text, LONG_BODY);
    assert_eq!(web.calls.lock()[0].title, it.title);
    assert_eq!(web.calls.lock()[0].text, format!("<p>{LONG_BODY}</p>"));
}

#[tokio::test]
async fn missing_sink_is_recorded_not_attempted() {
    let web = MockSink::ok(Destination::Website);
    let h = harness(None, &[web.clone()]);
    let it = item("unconfigured");

    let out = h.orchestrator.dispatch(&it, &both(ProcessingMode::Combined)).await;
    let tg = out.outcome(Destination::Telegram).unwrap();
    assert!(!tg.attempted);
    assert!(tg.error.as_deref().unwrap().contains("not configured"));
    assert!(out.outcome(Destination::Website).unwrap().success);

    let entry = h.store.find_by_link(&it.link).await.unwrap().unwrap();
    assert_eq!(entry.telegram.status, DestinationStatus::Error);
}

#[tokio::test]
async fn duplicate_check_can_be_overridden() {
    let tg = MockSink::ok(Destination::Telegram);
    let h = harness(None, &[tg.clone()]);
    let it = item("override");
    let mut req = DispatchRequest::new(
        DestinationSet::only(Destination::Telegram),
        ProcessingMode::Combined,
    );

    h.orchestrator.dispatch(&it, &req).await;
    assert!(h.orchestrator.dispatch(&it, &req).await.is_duplicate());

    req.skip_duplicate_check = true;
    let forced = h.orchestrator.dispatch(&it, &req).await;
    assert!(!forced.is_duplicate());
    assert_eq!(tg.call_count(), 2);
}

/// Log whose `finish` always fails; everything else goes to memory.
struct UnfinishableLog(MemoryLogStore);

#[async_trait::async_trait]
impl LogStore for UnfinishableLog {
    async fn find_by_link(&self, link: &str) -> anyhow::Result<Option<ProcessedLogEntry>> {
        self.0.find_by_link(link).await
    }
    async fn recent_for_source(
        &self,
        source_url: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ProcessedLogEntry>> {
        self.0.recent_for_source(source_url, limit).await
    }
    async fn begin(&self, draft: NewLogEntry) -> anyhow::Result<ProcessedLogEntry> {
        self.0.begin(draft).await
    }
    async fn record_outcome(
        &self,
        id: u64,
        d: Destination,
        outcome: &SinkOutcome,
    ) -> anyhow::Result<()> {
        self.0.record_outcome(id, d, outcome).await
    }
    async fn finish(&self, _id: u64) -> anyhow::Result<Option<ProcessedLogEntry>> {
        anyhow::bail!("disk full")
    }
    async fn record_duplicate(&self, id: u64) -> anyhow::Result<()> {
        self.0.record_duplicate(id).await
    }
    async fn list(&self, filter: &LogFilter) -> anyhow::Result<Vec<ProcessedLogEntry>> {
        self.0.list(filter).await
    }
    async fn delete(&self, ids: &[u64]) -> anyhow::Result<usize> {
        self.0.delete(ids).await
    }
    async fn stats(&self) -> anyhow::Result<LogStats> {
        self.0.stats().await
    }
}

#[tokio::test]
async fn failing_finalize_keeps_recorded_outcomes() {
    let store: Arc<dyn LogStore> = Arc::new(UnfinishableLog(MemoryLogStore::new()));
    let dir = tempfile::tempdir().unwrap();
    let media = Arc::new(MediaProcessor::new(
        CountingFetcher::new(Duration::ZERO),
        dir.path(),
    ));
    let tg = MockSink::ok(Destination::Telegram);
    let orchestrator = Orchestrator::new(
        store.clone(),
        media,
        MediaOptions::default(),
        Arc::new(Enricher::disabled()),
    )
    .with_sink(tg.clone());

    let source = FeedSource::new("https://news.example.test/rss", "economy");
    let failed = orchestrator
        .record_failure(
            "https://news.example.test/economy/broken",
            &source,
            DestinationSet::only(Destination::Telegram),
            &PipelineError::UpstreamFormat("item has neither title nor body".into()),
        )
        .await;
    assert!(matches!(failed, ItemOutcome::Failed { .. }));
    let logged = store
        .find_by_link("https://news.example.test/economy/broken")
        .await
        .unwrap()
        .expect("failure still logged");
    assert_eq!(logged.telegram.status, DestinationStatus::Error);

    let req = DispatchRequest::new(
        DestinationSet::only(Destination::Telegram),
        ProcessingMode::Separate,
    );
    let out = orchestrator.dispatch(&item("unfinished"), &req).await;
    assert!(out.outcome(Destination::Telegram).unwrap().success);
    assert_eq!(tg.call_count(), 1);
    let entry = store
        .find_by_link("https://news.example.test/economy/unfinished")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.telegram.status, DestinationStatus::Success);
}
