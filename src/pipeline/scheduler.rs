//! Dispatcher scheduler - the timer-driven loop driving ingestion and dispatch
//!
//! Each tick:
//! 1. Ingestion: route pending records (engine locked briefly)
//! 2. Completion scan: take idle series and publish each one in its own task
//!
//! Publishing happens outside the engine lock, so a slow sink never holds up
//! routing of records that arrive in the meantime.

use super::engine::{DispatchEngine, DispatchStats, IngestOutcome};
use super::publisher::{CompletionPublisher, PublishError};
use super::collector::SeriesCollector;
use super::source::RecordSource;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Engine shared between the scheduler loop and its publish tasks
pub type SharedEngine<S> = Arc<Mutex<DispatchEngine<S>>>;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Tick cadence
    pub poll_interval: Duration,

    /// Routing steps per tick
    pub ingest_batch: usize,

    /// How often a status line is logged
    pub status_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            ingest_batch: 1,
            status_interval: Duration::from_secs(10),
        }
    }
}

fn lock<S: RecordSource>(engine: &Mutex<DispatchEngine<S>>) -> MutexGuard<'_, DispatchEngine<S>> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run the dispatcher until `cancel` fires
///
/// On cancellation the loop stops ticking, abandons in-flight publishes
/// (their series go back to the registry undispatched), waits for all
/// publish tasks and returns the final counters.
pub async fn run_dispatcher<S: RecordSource + 'static>(
    engine: SharedEngine<S>,
    publisher: Arc<CompletionPublisher>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
) -> DispatchStats {
    {
        let guard = lock(&engine);
        log::info!("⏰ Starting dispatcher");
        log::info!("   ├─ Routing mode: {}", guard.mode());
        log::info!("   ├─ Max wait: {}ms", guard.max_wait().as_millis());
        log::info!("   ├─ Poll interval: {}ms", settings.poll_interval.as_millis());
        log::info!("   ├─ Ingest batch: {} records/tick", settings.ingest_batch);
        log::info!("   └─ Sink: {}", publisher.sink_type());
    }

    let mut timer = interval(settings.poll_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut publishes: JoinSet<()> = JoinSet::new();
    let mut last_status = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        // 1. Ingestion
        {
            let mut guard = lock(&engine);
            if guard.has_pending() {
                for outcome in guard.ingest(settings.ingest_batch) {
                    if outcome == IngestOutcome::SourceUnavailable {
                        log::debug!("⚠️  Record source unavailable, skipping ingestion this tick");
                    }
                }
            }
        }

        // 2. Completion scan
        let ready = lock(&engine).take_ready();
        for collector in ready {
            log::debug!(
                "📦 Series {} idle, dispatching {} instances",
                collector.series_uid(),
                collector.len()
            );
            publishes.spawn(publish_series(
                engine.clone(),
                publisher.clone(),
                collector,
                cancel.clone(),
            ));
        }

        while let Some(joined) = publishes.try_join_next() {
            if let Err(e) = joined {
                log::error!("❌ Publish task failed: {}", e);
            }
        }

        if last_status.elapsed() >= settings.status_interval {
            let guard = lock(&engine);
            let stats = guard.stats();
            log::info!(
                "📊 Series: {} active, {} in flight | pending records: {} | published: {}, failed attempts: {}",
                guard.active_len(),
                guard.in_flight_len(),
                guard.pending_len(),
                stats.published,
                stats.failed_publishes
            );
            last_status = Instant::now();
        }
    }

    log::info!("🔄 Dispatcher stopping, waiting for {} publish task(s)...", publishes.len());
    while let Some(joined) = publishes.join_next().await {
        if let Err(e) = joined {
            log::error!("❌ Publish task failed: {}", e);
        }
    }

    let guard = lock(&engine);
    if guard.active_len() > 0 || guard.pending_len() > 0 {
        log::warn!(
            "⚠️  Stopped with {} undispatched series and {} pending records",
            guard.active_len(),
            guard.pending_len()
        );
    }
    log::info!("✅ Dispatcher stopped");
    guard.stats()
}

/// Publish one series and hand the outcome back to the engine
async fn publish_series<S: RecordSource>(
    engine: SharedEngine<S>,
    publisher: Arc<CompletionPublisher>,
    mut collector: SeriesCollector,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        biased;
        result = publisher.publish(&mut collector) => result,
        _ = cancel.cancelled() => Err(PublishError::Cancelled),
    };

    lock(&engine).complete(collector, &result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::retry::RetryPolicy;
    use crate::pipeline::sink::{SeriesSink, SinkError};
    use crate::pipeline::types::{Ack, Record, SeriesSummary};
    use crate::pipeline::engine::RoutingMode;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct TestSink {
        failures: usize,
        hang: bool,
        calls: AtomicUsize,
        accepted: Mutex<Vec<SeriesSummary>>,
    }

    impl TestSink {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                hang: false,
                calls: AtomicUsize::new(0),
                accepted: Mutex::new(Vec::new()),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                failures: 0,
                hang: true,
                calls: AtomicUsize::new(0),
                accepted: Mutex::new(Vec::new()),
            })
        }

        fn accepted(&self) -> Vec<SeriesSummary> {
            self.accepted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SeriesSink for TestSink {
        async fn submit(&self, summary: &SeriesSummary) -> Result<Ack, SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if call < self.failures {
                return Err(SinkError::Unavailable("refused".to_string()));
            }
            self.accepted.lock().unwrap().push(summary.clone());
            Ok(Ack::default())
        }

        fn sink_type(&self) -> &'static str {
            "test"
        }
    }

    fn record(series: &str) -> Record {
        Record::from_json(&format!(
            r#"{{"SeriesInstanceUID":"{series}","StudyInstanceUID":"study","PatientName":"Doe^J","PatientID":"P1"}}"#
        ))
        .unwrap()
    }

    fn start(
        mode: RoutingMode,
        records: Vec<Record>,
        sink: Arc<TestSink>,
        retry: RetryPolicy,
        submit_timeout: Duration,
    ) -> (
        SharedEngine<VecDeque<Record>>,
        CancellationToken,
        tokio::task::JoinHandle<DispatchStats>,
    ) {
        let engine = DispatchEngine::new(records.into_iter().collect(), mode, Duration::from_secs(1))
            .with_retry_policy(retry);
        let engine = Arc::new(Mutex::new(engine));
        let publisher = Arc::new(CompletionPublisher::new(sink, submit_timeout));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_dispatcher(
            engine.clone(),
            publisher,
            SchedulerSettings::default(),
            cancel.clone(),
        ));
        (engine, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_series_end_to_end() {
        let sink = TestSink::new(0);
        let (engine, cancel, handle) = start(
            RoutingMode::SingleSeries,
            vec![record("S1"), record("S1"), record("S2")],
            sink.clone(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        );

        // Ticks at 0/200/400ms route A1, A2, then requeue B1; S1 last updated at 200ms
        sleep(Duration::from_millis(1300)).await;
        {
            let guard = lock(&engine);
            assert_eq!(guard.collector("S1").map(|c| c.len()), Some(2));
            assert_eq!(guard.pending_len(), 1);
        }
        assert!(sink.accepted().is_empty());

        // Idle for more than 1s at the 1400ms tick
        sleep(Duration::from_millis(200)).await;
        let accepted = sink.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].series_uid, "S1");
        assert_eq!(accepted[0].count, 2);

        // The slot frees up for S2
        sleep(Duration::from_secs(2)).await;
        let accepted = sink.accepted();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[1].series_uid, "S2");
        assert_eq!(accepted[1].count, 1);

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_retried_after_backoff() {
        let sink = TestSink::new(1);
        let (engine, cancel, handle) = start(
            RoutingMode::PerSeries,
            vec![record("S1")],
            sink.clone(),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 5),
            Duration::from_secs(5),
        );

        // First attempt at the 1200ms tick fails
        sleep(Duration::from_millis(1300)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        {
            let guard = lock(&engine);
            let collector = guard.collector("S1").unwrap();
            assert!(!collector.is_dispatched());
            assert_eq!(collector.failed_attempts(), 1);
        }

        // Retried once the 1s backoff elapsed, not on every tick
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.accepted().len(), 1);
        assert_eq!(lock(&engine).active_len(), 0);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.failed_publishes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_inflight_publish() {
        let sink = TestSink::hanging();
        let (engine, cancel, handle) = start(
            RoutingMode::PerSeries,
            vec![record("S1"), record("S1")],
            sink.clone(),
            RetryPolicy::default(),
            Duration::from_secs(60),
        );

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&engine).in_flight_len(), 1);

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.published, 0);

        let guard = lock(&engine);
        assert_eq!(guard.in_flight_len(), 0);
        let collector = guard.collector("S1").unwrap();
        assert!(!collector.is_dispatched());
        assert_eq!(collector.len(), 2);
    }
}
