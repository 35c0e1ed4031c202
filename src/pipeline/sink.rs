//! Sink trait for completed series summaries
//!
//! Implementations:
//! - `HttpSink` - POST the summary as JSON to a storage service
//! - `SqliteSink` - store the summary as a row in a local database

use super::types::{Ack, SeriesSummary};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink responded with status {0}")]
    Status(u16),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Downstream consumer of completed series
///
/// `submit` returning `Ok` means the summary was durably accepted. Any error
/// leaves the series eligible for another attempt.
#[async_trait]
pub trait SeriesSink: Send + Sync {
    async fn submit(&self, summary: &SeriesSummary) -> Result<Ack, SinkError>;

    /// Sink type for logging
    fn sink_type(&self) -> &'static str;
}
