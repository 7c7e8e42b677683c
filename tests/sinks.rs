// tests/sinks.rs
//
// Destination sinks and HTTP price sources against a local mock server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use news_relay::dispatch::telegram::TelegramSink;
use news_relay::dispatch::website::ContentStoreSink;
use news_relay::dispatch::{PublishPayload, Sink};
use news_relay::enrich::Draft;
use news_relay::ingest::types::CanonicalItem;
use news_relay::prices::{AggregatedApiSource, PriceSource, ScrapeLayout, ScrapeSource, Trend};
use news_relay::PipelineError;

#[derive(Clone, Default)]
struct Mock {
    hits: Arc<Mutex<Vec<(String, Value)>>>,
    counter: Arc<AtomicUsize>,
}

impl Mock {
    fn paths(&self) -> Vec<String> {
        self.hits.lock().iter().map(|(p, _)| p.clone()).collect()
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn parts() -> (CanonicalItem, Draft) {
    let item = CanonicalItem {
        title: "Gold edges higher".into(),
        link: "https://news.example.test/economy/gold".into(),
        body: "Gold prices rose on Tuesday as the dollar softened.".into(),
        category: "economy".into(),
        source_url: "https://news.example.test/rss".into(),
        ..CanonicalItem::default()
    };
    let draft = Draft {
        title: item.title.clone(),
        text: "<p>Gold prices rose on Tuesday.</p>".into(),
        keywords: vec!["gold".into(), "dollar".into()],
        enriched: false,
    };
    (item, draft)
}

// ------------------------------------------------------------
// Telegram
// ------------------------------------------------------------

async fn tg_message(State(m): State<Mock>, Json(body): Json<Value>) -> impl IntoResponse {
    m.hits.lock().push(("sendMessage".into(), body));
    Json(json!({"ok": true, "result": {"message_id": 777}}))
}

async fn tg_video(State(m): State<Mock>, Json(body): Json<Value>) -> impl IntoResponse {
    m.hits.lock().push(("sendVideo".into(), body));
    Json(json!({"ok": true, "result": {"message_id": 778}}))
}

async fn tg_photo_rejected(State(m): State<Mock>) -> impl IntoResponse {
    m.hits.lock().push(("sendPhoto".into(), Value::Null));
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "description": "Bad Request: wrong file identifier"})),
    )
}

async fn tg_throttled_once(State(m): State<Mock>, Json(body): Json<Value>) -> impl IntoResponse {
    m.hits.lock().push(("sendMessage".into(), body));
    if m.counter.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "ok": false,
                "description": "Too Many Requests: retry after 1",
                "parameters": {"retry_after": 1}
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"ok": true, "result": {"message_id": 901}})),
    )
}

async fn tg_chat_missing(State(m): State<Mock>, Json(body): Json<Value>) -> impl IntoResponse {
    m.hits.lock().push(("sendMessage".into(), body));
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "description": "Bad Request: chat not found"})),
    )
}

fn telegram(base: &str) -> TelegramSink {
    TelegramSink::new(reqwest::Client::new(), "T0K", "@newsroom")
        .with_api_base(base)
        .with_timeout(5)
        .with_backoff(Duration::from_millis(10))
}

#[tokio::test]
async fn text_message_returns_message_id() {
    let mock = Mock::default();
    let app = Router::new()
        .route("/botT0K/sendMessage", post(tg_message))
        .with_state(mock.clone());
    let base = serve(app).await;
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: None,
        video_url: None,
    };

    let id = telegram(&base).publish(&payload).await.unwrap();
    assert_eq!(id, "777");

    let hits = mock.hits.lock().clone();
    assert_eq!(hits.len(), 1);
    let body = &hits[0].1;
    assert_eq!(body["chat_id"], "@newsroom");
    assert_eq!(body["parse_mode"], "HTML");
    let text = body["text"].as_str().unwrap();
    assert!(text.starts_with("<b>Gold edges higher</b>"));
    assert!(text.ends_with("#economy #gold #dollar"));
}

#[tokio::test]
async fn video_is_posted_by_url() {
    let mock = Mock::default();
    let app = Router::new()
        .route("/botT0K/sendVideo", post(tg_video))
        .with_state(mock.clone());
    let base = serve(app).await;
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: None,
        video_url: Some("https://cdn.example.test/hls/master.m3u8"),
    };

    assert_eq!(telegram(&base).publish(&payload).await.unwrap(), "778");
    let hits = mock.hits.lock().clone();
    assert_eq!(hits[0].1["video"], "https://cdn.example.test/hls/master.m3u8");
    assert!(hits[0].1["caption"].as_str().unwrap().chars().count() <= 1024);
}

#[tokio::test]
async fn rejected_photo_falls_back_to_text() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("lead.jpg");
    std::fs::write(&img, b"not really a jpeg").unwrap();

    let mock = Mock::default();
    let app = Router::new()
        .route("/botT0K/sendPhoto", post(tg_photo_rejected))
        .route("/botT0K/sendMessage", post(tg_message))
        .with_state(mock.clone());
    let base = serve(app).await;
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: Some(&img),
        video_url: None,
    };

    assert_eq!(telegram(&base).publish(&payload).await.unwrap(), "777");
    assert_eq!(mock.paths(), vec!["sendPhoto", "sendMessage"]);
}

#[tokio::test]
async fn throttling_honours_retry_after() {
    let mock = Mock::default();
    let app = Router::new()
        .route("/botT0K/sendMessage", post(tg_throttled_once))
        .with_state(mock.clone());
    let base = serve(app).await;
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: None,
        video_url: None,
    };

    let started = Instant::now();
    let id = telegram(&base).publish(&payload).await.unwrap();
    assert_eq!(id, "901");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(mock.hits.lock().len(), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let mock = Mock::default();
    let app = Router::new()
        .route("/botT0K/sendMessage", post(tg_chat_missing))
        .with_state(mock.clone());
    let base = serve(app).await;
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: None,
        video_url: None,
    };

    let err = telegram(&base).publish(&payload).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "telegram publish failed: Bad Request: chat not found"
    );
    assert_eq!(mock.hits.lock().len(), 1);
}

// ------------------------------------------------------------
// Content store
// ------------------------------------------------------------

async fn cms_create(
    State(m): State<Mock>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    m.hits.lock().push((auth, body));
    (StatusCode::CREATED, Json(json!({"data": {"id": "post-42"}})))
}

async fn cms_conflict() -> impl IntoResponse {
    (StatusCode::CONFLICT, Json(json!({"error": "slug already exists"})))
}

#[tokio::test]
async fn website_post_carries_public_image_and_returns_id() {
    let media = tempfile::tempdir().unwrap();
    let img = media.path().join("unified").join("a.jpg");

    let mock = Mock::default();
    let app = Router::new()
        .route("/api/posts", post(cms_create))
        .with_state(mock.clone());
    let base = serve(app).await;

    let sink = ContentStoreSink::new(reqwest::Client::new(), &base, "cms-token")
        .with_media_root(media.path())
        .with_site_url("https://site.example.test/");
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: Some(&img),
        video_url: None,
    };

    assert_eq!(sink.publish(&payload).await.unwrap(), "post-42");

    let (auth, body) = mock.hits.lock()[0].clone();
    assert_eq!(auth, "Bearer cms-token");
    assert_eq!(body["slug"], "gold-edges-higher");
    assert_eq!(body["status"], "published");
    assert_eq!(body["image"], "https://site.example.test/unified/a.jpg");
    assert_eq!(body["excerpt"], "Gold prices rose on Tuesday.");
    assert_eq!(body["source_url"], item.link);
}

#[tokio::test]
async fn website_error_message_is_surfaced() {
    let base = serve(Router::new().route("/api/posts", post(cms_conflict))).await;
    let sink = ContentStoreSink::new(reqwest::Client::new(), &base, "cms-token");
    let (item, draft) = parts();
    let payload = PublishPayload {
        item: &item,
        draft: &draft,
        image_path: None,
        video_url: None,
    };

    match sink.publish(&payload).await {
        Err(e @ PipelineError::Publish { .. }) => {
            assert_eq!(e.to_string(), "website publish failed: slug already exists")
        }
        other => panic!("expected publish error, got {other:?}"),
    }
}

// ------------------------------------------------------------
// Price sources
// ------------------------------------------------------------

const TICKER: &str = r#"<html><body><ul class="info-bar">
    <li><h3>Gold ounce</h3><span class="info-price">2,650.75</span><span class="info-change">(0.40%)</span></li>
    <li><h3>Brent</h3><span class="info-price">۷۴٫۲۰</span><span class="info-change">0</span></li>
</ul></body></html>"#;

#[tokio::test]
async fn ticker_page_is_scraped() {
    let base = serve(Router::new().route("/", get(|| async { Html(TICKER) }))).await;
    let src = ScrapeSource::new("ticker", reqwest::Client::new(), &base, ScrapeLayout::ticker());

    let items = src.fetch().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].title, "Gold ounce");
    assert_eq!(items[0].price, "2,650.75");
    assert!((items[0].change_percent - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn unreachable_scrape_source_yields_none() {
    let src = ScrapeSource::new(
        "primary",
        reqwest::Client::new(),
        "http://127.0.0.1:9/",
        ScrapeLayout::carousel(),
    )
    .with_timeout(Duration::from_secs(2));
    assert!(src.fetch().await.is_none());
}

async fn api_symbol(axum::extract::Path(symbol): axum::extract::Path<String>) -> impl IntoResponse {
    match symbol.as_str() {
        "gold" => (
            StatusCode::OK,
            Json(json!({"current": {"p": "2,650.5", "c": "-3.5", "cp": "-0.13"}})),
        ),
        "usd" => (
            StatusCode::OK,
            Json(json!({"price": 1024500, "change": 1500, "changePercent": 0.15})),
        ),
        _ => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown"}))),
    }
}

#[tokio::test]
async fn api_source_aggregates_symbols_and_drops_missing() {
    let base = serve(Router::new().route("/data/{symbol}", get(api_symbol))).await;
    let src = AggregatedApiSource::new(reqwest::Client::new(), &base).with_symbols(vec![
        ("gold".into(), "Gold".into()),
        ("usd".into(), "Dollar".into()),
        ("nope".into(), "Missing".into()),
    ]);

    let items = src.fetch().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].title, "Gold");
    assert_eq!(items[0].trend, Trend::Minus);
    assert_eq!(items[0].price, "2,650.50");
    assert_eq!(items[1].price, "1,024,500");
    assert_eq!(items[1].trend, Trend::Plus);
}
