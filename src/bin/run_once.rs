//! Run a single batch from the configured settings and print the report.
//!
//! Usage: `cargo run --bin run_once [settings.toml]`

use news_relay::{Runtime, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load_from_file(path)?,
        None => Settings::load_default()?,
    };
    let runtime = Runtime::from_settings(settings).await?;

    let Some(report) = runtime.pipeline.try_run_batch().await else {
        anyhow::bail!("a batch is already running");
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", report.summary());
    Ok(())
}
