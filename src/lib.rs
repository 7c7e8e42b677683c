// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod prices;
pub mod progress;
pub mod scheduler;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::bootstrap::Runtime;
pub use crate::config::Settings;
pub use crate::dispatch::{Destination, DestinationSet, ItemOutcome, Orchestrator, ProcessingMode};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::pipeline::{BatchReport, Pipeline};
