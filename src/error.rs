//! Error taxonomy shared by the ingestion and publishing pipeline.
//!
//! Duplicates are not errors; they end as [`crate::dispatch::ItemOutcome::DuplicateSkip`].

use thiserror::Error;

use crate::dispatch::Destination;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Timeout or connection failure talking to an upstream.
    #[error("network error: {0}")]
    Network(String),

    /// Feed or page did not have the expected shape.
    #[error("unexpected upstream format: {0}")]
    UpstreamFormat(String),

    /// A single destination rejected the item.
    #[error("{destination} publish failed: {message}")]
    Publish {
        destination: Destination,
        message: String,
    },

    /// Download, resize, re-encode or watermark failure.
    #[error("media processing failed: {0}")]
    MediaProcessing(String),

    /// Missing credentials or required settings. Checked before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn publish(destination: Destination, message: impl Into<String>) -> Self {
        Self::Publish {
            destination,
            message: message.into(),
        }
    }

    /// Short machine-friendly label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::UpstreamFormat(_) => "upstream_format",
            Self::Publish { .. } => "publish",
            Self::MediaProcessing(_) => "media",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::UpstreamFormat(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
