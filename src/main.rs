//! news-relay binary entrypoint.
//! Boots the Axum HTTP server and, when enabled, the recurring batch scheduler.

use news_relay::{api, metrics::Metrics, scheduler, Runtime, Settings};
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR SHUTTLE_ENV in {local, development, dev})
///   - NEWS_RELAY_LOG=1
fn enable_dev_tracing() {
    let dev_flag = std::env::var("NEWS_RELAY_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("SHUTTLE_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("news_relay=info,ingest=info,dispatch=info,media=info,prices=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    enable_dev_tracing();

    // Configuration problems stop the boot before any network call.
    let settings = Settings::load_default()?;
    let runtime = Runtime::from_settings(settings).await?;
    let metrics = Metrics::init(runtime.settings.check_interval_secs)?;

    runtime.enrichment_probe().await;

    if runtime.settings.scheduler_enabled {
        // Dropping the handle detaches the task; it runs for the whole process.
        let _ = scheduler::spawn_scheduler(
            runtime.pipeline.clone(),
            runtime.settings.check_interval(),
        );
    }

    let router = api::create_router(api::AppState::from_runtime(&runtime)).merge(metrics.router());

    Ok(router.into())
}
