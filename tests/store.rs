// tests/store.rs
//
// The JSON-file log survives a restart with ids, statuses and the link index
// intact.

use news_relay::dispatch::SinkOutcome;
use news_relay::store::{DestinationStatus, FileLogStore, LogFilter, LogStore, NewLogEntry};
use news_relay::Destination;

fn draft(link: &str) -> NewLogEntry {
    NewLogEntry {
        link: link.into(),
        title: "Gold edges higher".into(),
        source_url: "https://news.example.test/rss".into(),
        category: "economy".into(),
    }
}

#[tokio::test]
async fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("processed_log.json");

    let (first_id, second_id) = {
        let store = FileLogStore::open(&path).await.unwrap();
        let a = store.begin(draft("https://n.test/a")).await.unwrap();
        store
            .record_outcome(a.id, Destination::Telegram, &SinkOutcome::ok("55"))
            .await
            .unwrap();
        store
            .record_outcome(a.id, Destination::Website, &SinkOutcome::failed("HTTP 502"))
            .await
            .unwrap();
        store.finish(a.id).await.unwrap();
        store.record_duplicate(a.id).await.unwrap();

        let b = store.begin(draft("https://n.test/b")).await.unwrap();
        (a.id, b.id)
    };
    assert!(path.exists());

    let store = FileLogStore::open(&path).await.unwrap();
    let a = store.find_by_link("https://n.test/a").await.unwrap().unwrap();
    assert_eq!(a.id, first_id);
    assert_eq!(a.telegram.status, DestinationStatus::Success);
    assert_eq!(a.telegram.external_id.as_deref(), Some("55"));
    assert_eq!(a.website.status, DestinationStatus::Error);
    assert_eq!(a.website.error.as_deref(), Some("HTTP 502"));
    assert_eq!(a.duplicate_hits, 1);
    assert!(a.processed_at.is_some());

    // Ids keep growing after a reopen.
    let c = store.begin(draft("https://n.test/c")).await.unwrap();
    assert!(c.id > second_id);

    // Success stays terminal across restarts.
    store
        .record_outcome(a.id, Destination::Telegram, &SinkOutcome::failed("late error"))
        .await
        .unwrap();
    let a = store.find_by_link("https://n.test/a").await.unwrap().unwrap();
    assert_eq!(a.telegram.status, DestinationStatus::Success);

    let deleted = store.delete(&[second_id]).await.unwrap();
    assert_eq!(deleted, 1);
    let reopened = FileLogStore::open(&path).await.unwrap();
    assert!(reopened.find_by_link("https://n.test/b").await.unwrap().is_none());
    assert_eq!(reopened.list(&LogFilter::default()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn corrupt_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = FileLogStore::open(&path).await.err().expect("corrupt store rejected");
    assert!(format!("{err:#}").contains("parsing log store"));
}
