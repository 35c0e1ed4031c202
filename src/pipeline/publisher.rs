//! Completion publisher - hand a finished series to the sink exactly once
//!
//! The dispatched flag flips only after the sink acknowledged the summary.
//! A failed or timed-out submit leaves the collector un-dispatched so it can
//! be retried; a dispatched collector is refused.

use super::collector::SeriesCollector;
use super::sink::{SeriesSink, SinkError};
use super::types::Ack;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("series {0} was already dispatched")]
    AlreadyDispatched(String),

    #[error("sink submit failed: {0}")]
    Sink(#[from] SinkError),

    #[error("sink did not answer within {0:?}")]
    Timeout(Duration),

    #[error("publish abandoned on shutdown")]
    Cancelled,
}

pub struct CompletionPublisher {
    sink: Arc<dyn SeriesSink>,
    submit_timeout: Duration,
}

impl CompletionPublisher {
    pub fn new(sink: Arc<dyn SeriesSink>, submit_timeout: Duration) -> Self {
        Self {
            sink,
            submit_timeout,
        }
    }

    pub fn sink_type(&self) -> &'static str {
        self.sink.sink_type()
    }

    /// Submit the collector's summary and mark it dispatched on success
    pub async fn publish(&self, collector: &mut SeriesCollector) -> Result<Ack, PublishError> {
        if collector.is_dispatched() {
            return Err(PublishError::AlreadyDispatched(collector.series_uid().to_string()));
        }

        let summary = collector.summary();

        let ack = tokio::time::timeout(self.submit_timeout, self.sink.submit(&summary))
            .await
            .map_err(|_| PublishError::Timeout(self.submit_timeout))??;

        collector.mark_dispatched();

        log::info!(
            "✅ Dispatched series {} ({} instances, study {}) via {} sink",
            summary.series_uid,
            summary.count,
            summary.parent_key,
            self.sink.sink_type()
        );

        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Record, SeriesSummary};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Sink failing the first `failures` submits, then accepting
    struct FlakySink {
        failures: usize,
        calls: AtomicUsize,
        accepted: Mutex<Vec<SeriesSummary>>,
    }

    impl FlakySink {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                accepted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SeriesSink for FlakySink {
        async fn submit(&self, summary: &SeriesSummary) -> Result<Ack, SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SinkError::Unavailable("connection refused".to_string()));
            }
            self.accepted.lock().unwrap().push(summary.clone());
            Ok(Ack { status: Some("201".to_string()) })
        }

        fn sink_type(&self) -> &'static str {
            "flaky"
        }
    }

    struct HangingSink;

    #[async_trait]
    impl SeriesSink for HangingSink {
        async fn submit(&self, _summary: &SeriesSummary) -> Result<Ack, SinkError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn sink_type(&self) -> &'static str {
            "hanging"
        }
    }

    fn collector(count: usize) -> SeriesCollector {
        let t0 = Instant::now();
        let make = |i: usize| {
            Record::from_json(&format!(
                r#"{{"SeriesInstanceUID":"S1","StudyInstanceUID":"ST1","PatientName":"Roe^Ann","PatientID":"P{i}"}}"#
            ))
            .unwrap()
        };
        let mut collector = SeriesCollector::new(make(0), t0);
        for i in 1..count {
            collector.try_append(make(i), t0).unwrap();
        }
        collector
    }

    #[tokio::test]
    async fn test_publish_marks_dispatched() {
        let sink = Arc::new(FlakySink::new(0));
        let publisher = CompletionPublisher::new(sink.clone(), Duration::from_secs(1));
        let mut series = collector(3);

        let ack = publisher.publish(&mut series).await.unwrap();
        assert_eq!(ack.status.as_deref(), Some("201"));
        assert!(series.is_dispatched());

        let accepted = sink.accepted.lock().unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].count, 3);
        assert_eq!(accepted[0].patient_id, "P0");
        assert_eq!(accepted[0].parent_key, "ST1");
    }

    #[tokio::test]
    async fn test_publish_at_most_once() {
        let sink = Arc::new(FlakySink::new(0));
        let publisher = CompletionPublisher::new(sink.clone(), Duration::from_secs(1));
        let mut series = collector(1);

        publisher.publish(&mut series).await.unwrap();
        let err = publisher.publish(&mut series).await.unwrap_err();

        assert!(matches!(err, PublishError::AlreadyDispatched(ref uid) if uid == "S1"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let sink = Arc::new(FlakySink::new(1));
        let publisher = CompletionPublisher::new(sink.clone(), Duration::from_secs(1));
        let mut series = collector(2);

        let err = publisher.publish(&mut series).await.unwrap_err();
        assert!(matches!(err, PublishError::Sink(SinkError::Unavailable(_))));
        assert!(!series.is_dispatched());

        publisher.publish(&mut series).await.unwrap();
        assert!(series.is_dispatched());
        assert_eq!(sink.accepted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_series_undispatched() {
        let publisher = CompletionPublisher::new(Arc::new(HangingSink), Duration::from_millis(500));
        let mut series = collector(1);

        let err = publisher.publish(&mut series).await.unwrap_err();
        assert!(matches!(err, PublishError::Timeout(d) if d == Duration::from_millis(500)));
        assert!(!series.is_dispatched());
    }
}
