//! Series collector - one in-progress series of records
//!
//! A collector is created together with its first record, grows only through
//! `try_append`, and is frozen once the publisher has marked it dispatched.

use super::types::{Record, SeriesSummary};
use tokio::time::{Duration, Instant};

/// Accumulates the records of one series (shared correlation key)
#[derive(Debug, Clone)]
pub struct SeriesCollector {
    /// Correlation key, fixed at creation
    series_uid: String,

    /// Members in arrival order (never empty)
    members: Vec<Record>,

    /// Time of the most recent successful append
    last_update: Instant,

    /// Set once the sink acknowledged the summary
    dispatched: bool,

    /// Consecutive failed publish attempts
    failed_attempts: u32,

    /// Earliest time a failed publish may be retried
    next_attempt_at: Option<Instant>,
}

impl SeriesCollector {
    pub fn new(first: Record, now: Instant) -> Self {
        Self {
            series_uid: first.series_uid().to_string(),
            members: vec![first],
            last_update: now,
            dispatched: false,
            failed_attempts: 0,
            next_attempt_at: None,
        }
    }

    /// Append a record if it belongs to this series
    ///
    /// Returns the record back as `Err` when the key does not match or the
    /// collector is already dispatched. State is untouched in that case.
    pub fn try_append(&mut self, record: Record, now: Instant) -> Result<(), Record> {
        if self.dispatched || record.series_uid() != self.series_uid {
            return Err(record);
        }

        self.members.push(record);
        self.last_update = now;
        Ok(())
    }

    /// True when no record was appended for longer than `duration`
    pub fn is_idle_for(&self, duration: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_update) > duration
    }

    /// True unless a failed publish is still waiting out its backoff
    pub fn is_retry_due(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub(crate) fn record_failure(&mut self, now: Instant, delay: Duration) {
        self.failed_attempts += 1;
        self.next_attempt_at = Some(now + delay);
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }

    /// Build the sink payload; identity fields come from the first member
    pub fn summary(&self) -> SeriesSummary {
        let first = &self.members[0];
        SeriesSummary {
            parent_key: first.study_uid(),
            patient_name: first.patient_name(),
            patient_id: first.patient_id(),
            count: self.members.len(),
            series_uid: self.series_uid.clone(),
        }
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    pub fn members(&self) -> &[Record] {
        &self.members
    }

    pub fn first(&self) -> &Record {
        &self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}
