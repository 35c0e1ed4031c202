//! Dispatch Engine - routing of incoming records and completion scanning
//!
//! ## Architecture
//!
//! ```text
//! RecordSource (pending records)
//!     ↓
//! DispatchEngine::ingest_one()      route one record per step
//!     ↓
//! SeriesCollector (per series, accumulating)
//!     ↓  idle > max_wait
//! DispatchEngine::take_ready()      hand over, key marked in flight
//!     ↓
//! CompletionPublisher::publish()    outside the engine lock
//!     ↓
//! DispatchEngine::complete()        discard, or back into the registry
//! ```
//!
//! The engine itself is synchronous. The scheduler owns it behind a single
//! mutex, which serializes access to the registry and the source together.
//!
//! ## Routing modes
//!
//! - `PerSeries`: one active collector per series key, each timed on its
//!   own. A second series never waits behind the first.
//! - `SingleSeries`: only one series is collected at a time; records of any
//!   other series are requeued until the active one has been dispatched.

use super::collector::SeriesCollector;
use super::publisher::PublishError;
use super::retry::RetryPolicy;
use super::source::{RecordSource, SourceError};
use super::types::{Ack, Record};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    #[default]
    PerSeries,
    SingleSeries,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per_series" | "per-series" => Ok(Self::PerSeries),
            "single_series" | "single-series" => Ok(Self::SingleSeries),
            other => Err(format!("unknown routing mode '{}'", other)),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerSeries => write!(f, "per_series"),
            Self::SingleSeries => write!(f, "single_series"),
        }
    }
}

/// Result of one routing step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Nothing pending
    Idle,
    /// New collector opened for this series
    Opened(String),
    /// Record appended to the active collector of this series
    Appended(String),
    /// Record could not be routed now and went back to the source
    Requeued(String),
    /// The source could not be read; the step was skipped
    SourceUnavailable,
}

/// Running counters, logged by the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub opened: u64,
    pub appended: u64,
    pub requeued: u64,
    pub published: u64,
    pub failed_publishes: u64,
}

pub struct DispatchEngine<S: RecordSource> {
    source: S,

    /// Active (non-dispatched) collectors by series key
    active: HashMap<String, SeriesCollector>,

    /// Series keys handed to the publisher and not yet completed
    in_flight: HashSet<String>,

    mode: RoutingMode,
    max_wait: Duration,
    retry: RetryPolicy,
    stats: DispatchStats,

    /// Clock (injectable for tests)
    now_fn: Box<dyn Fn() -> Instant + Send + Sync>,
}

impl<S: RecordSource> DispatchEngine<S> {
    pub fn new(source: S, mode: RoutingMode, max_wait: Duration) -> Self {
        Self::new_with_clock(source, mode, max_wait, Box::new(Instant::now))
    }

    /// Create an engine with a custom clock
    pub fn new_with_clock(
        source: S,
        mode: RoutingMode,
        max_wait: Duration,
        now_fn: Box<dyn Fn() -> Instant + Send + Sync>,
    ) -> Self {
        Self {
            source,
            active: HashMap::new(),
            in_flight: HashSet::new(),
            mode,
            max_wait,
            retry: RetryPolicy::default(),
            stats: DispatchStats::default(),
            now_fn,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route up to `max_records` pending records
    ///
    /// Stops early once every record still pending has already been
    /// requeued during this call.
    pub fn ingest(&mut self, max_records: usize) -> Vec<IngestOutcome> {
        let mut outcomes = Vec::new();
        let mut requeued = 0;
        for _ in 0..max_records {
            match self.ingest_one() {
                IngestOutcome::Idle => break,
                outcome @ IngestOutcome::SourceUnavailable => {
                    outcomes.push(outcome);
                    break;
                }
                outcome @ IngestOutcome::Requeued(_) => {
                    outcomes.push(outcome);
                    requeued += 1;
                    if self.source.pending_len() <= requeued {
                        break;
                    }
                }
                outcome => outcomes.push(outcome),
            }
        }
        outcomes
    }

    /// Route the oldest pending record to its collector
    pub fn ingest_one(&mut self) -> IngestOutcome {
        let record = match self.source.next_pending() {
            Ok(Some(record)) => record,
            Ok(None) => return IngestOutcome::Idle,
            Err(SourceError::Disconnected) => return IngestOutcome::SourceUnavailable,
        };

        let now = (self.now_fn)();
        let key = record.series_uid().to_string();

        if self.in_flight.contains(&key) {
            log::debug!("⏸️  Series {} is being dispatched, requeueing record", key);
            return self.requeue(record);
        }

        if let Some(collector) = self.active.get_mut(&key) {
            warn_on_identity_mismatch(collector.first(), &record);

            return match collector.try_append(record, now) {
                Ok(()) => {
                    self.stats.appended += 1;
                    log::debug!("➕ Series {}: {} instances", key, collector.len());
                    IngestOutcome::Appended(key)
                }
                Err(record) => self.requeue(record),
            };
        }

        if self.mode == RoutingMode::SingleSeries && self.slot_occupied() {
            return self.requeue(record);
        }

        log::info!("🆕 Collecting new series {}", key);
        self.active.insert(key.clone(), SeriesCollector::new(record, now));
        self.stats.opened += 1;
        IngestOutcome::Opened(key)
    }

    fn requeue(&mut self, record: Record) -> IngestOutcome {
        let key = record.series_uid().to_string();
        self.source.requeue(record);
        self.stats.requeued += 1;
        IngestOutcome::Requeued(key)
    }

    fn slot_occupied(&self) -> bool {
        !self.active.is_empty() || !self.in_flight.is_empty()
    }

    /// Completion scan: take every collector that is ready to publish
    ///
    /// A taken collector leaves the registry and its key is marked in flight,
    /// so no record can be appended to it and no second scan can take it.
    /// Each taken collector must be handed back through `complete`.
    pub fn take_ready(&mut self) -> Vec<SeriesCollector> {
        let now = (self.now_fn)();

        let ready: Vec<String> = self
            .active
            .iter()
            .filter(|(_, c)| {
                !c.is_dispatched() && c.is_idle_for(self.max_wait, now) && c.is_retry_due(now)
            })
            .map(|(key, _)| key.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|key| {
                let collector = self.active.remove(&key)?;
                self.in_flight.insert(key);
                Some(collector)
            })
            .collect()
    }

    /// Report the outcome of publishing a collector taken by `take_ready`
    pub fn complete(&mut self, mut collector: SeriesCollector, result: &Result<Ack, PublishError>) {
        let key = collector.series_uid().to_string();
        self.in_flight.remove(&key);

        match result {
            Ok(_) if collector.is_dispatched() => {
                self.stats.published += 1;
            }
            Ok(_) => {
                // Sink acked but the flag is unset; keep it rather than lose it
                log::error!("❌ Series {} acknowledged but not marked dispatched", key);
                self.active.insert(key, collector);
            }
            Err(PublishError::AlreadyDispatched(_)) => {
                log::warn!("⚠️  Series {} was already dispatched, discarding", key);
            }
            Err(PublishError::Cancelled) => {
                log::info!("↩️  Series {} returned undispatched (shutdown)", key);
                self.active.insert(key, collector);
            }
            Err(e) => {
                let now = (self.now_fn)();
                let delay = self.retry.delay_for(collector.failed_attempts() + 1);
                collector.record_failure(now, delay);
                self.stats.failed_publishes += 1;

                if self.retry.is_degraded(collector.failed_attempts()) {
                    log::error!(
                        "❌ Series {} still undelivered after {} attempts: {} (retry in {:?})",
                        key,
                        collector.failed_attempts(),
                        e,
                        delay
                    );
                } else {
                    log::warn!(
                        "⚠️  Failed to dispatch series {} (attempt {}): {} (retry in {:?})",
                        key,
                        collector.failed_attempts(),
                        e,
                        delay
                    );
                }

                self.active.insert(key, collector);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.source.pending_len() > 0
    }

    pub fn pending_len(&self) -> usize {
        self.source.pending_len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn collector(&self, series_uid: &str) -> Option<&SeriesCollector> {
        self.active.get(series_uid)
    }

    /// Keys of the active collectors (unordered)
    pub fn active_series(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

/// Later members are trusted to share the first member's identity; a
/// differing patient ID is only logged.
fn warn_on_identity_mismatch(first: &Record, record: &Record) {
    let (expected, got) = (first.patient_id(), record.patient_id());
    if expected != got {
        log::warn!(
            "⚠️  Series {}: PatientID '{}' differs from first instance '{}'",
            record.series_uid(),
            got,
            expected
        );
    }
}
