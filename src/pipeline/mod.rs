//! # Series Dispatch Pipeline
//!
//! Records arrive one at a time with no "series complete" marker. The
//! pipeline groups them by `SeriesInstanceUID` and treats a series as
//! complete once no new record arrived for `max_wait`. Each completed
//! series is summarized and submitted to a sink exactly once.
//!
//! ## Data flow
//!
//! ```text
//! RecordSource → DispatchEngine (routing) → SeriesCollector
//!     → [idle > max_wait] → CompletionPublisher → SeriesSink
//! ```
//!
//! ## Module Organization
//!
//! - `types` - Record, SeriesSummary, Ack
//! - `collector` - one in-progress series
//! - `source` - pull adapters for pending records
//! - `engine` - series registry, routing and completion scan
//! - `publisher` - exactly-once hand-off to the sink
//! - `sink`, `http_sink`, `sqlite_sink` - sink trait and implementations
//! - `retry` - backoff between failed publishes
//! - `scheduler` - the timer-driven loop
//! - `config` - environment configuration

pub mod types;
pub mod collector;
pub mod source;
pub mod engine;
pub mod publisher;
pub mod sink;
pub mod http_sink;
pub mod sqlite_sink;
pub mod retry;
pub mod scheduler;
pub mod config;

// Re-export commonly used types
pub use types::{Ack, Record, RecordError, SeriesSummary};
pub use collector::SeriesCollector;
pub use source::{ChannelSource, RecordSource, SourceError};
pub use engine::{DispatchEngine, DispatchStats, IngestOutcome, RoutingMode};
pub use publisher::{CompletionPublisher, PublishError};
pub use sink::{SeriesSink, SinkError};
pub use http_sink::HttpSink;
pub use sqlite_sink::SqliteSink;
pub use retry::RetryPolicy;
pub use scheduler::{run_dispatcher, SchedulerSettings, SharedEngine};
pub use config::{ConfigError, DispatcherConfig, SinkType};
