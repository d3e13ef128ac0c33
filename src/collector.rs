//! Per-airport synchronization orchestrator.
//!
//! Initializes the repository from upstream (retrying until it succeeds),
//! then runs the periodic bulk refresh and the notification listener side
//! by side until stopped.

use crate::client::{ClientError, FlightSource};
use crate::ingest::{refresh_chunks, IngestError, Ingestor, Window};
use crate::source::NotificationSource;
use crate::types::ResourceType;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Collector stopped")]
    Stopped,
}

/// Statistics for the collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    pub refreshes: AtomicU64,
    pub flights_refreshed: AtomicU64,
    pub notifications: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
    pub evicted: AtomicU64,
    pub last_refresh_ms: AtomicU64,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            flights_refreshed: self.flights_refreshed.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            last_refresh_ms: self.last_refresh_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub refreshes: u64,
    pub flights_refreshed: u64,
    pub notifications: u64,
    pub dropped: u64,
    pub errors: u64,
    pub evicted: u64,
    pub last_refresh_ms: u64,
}

/// Configuration for the collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Resident window relative to today
    pub window: Window,
    /// Days fetched per bulk request
    pub chunk_days: u32,
    /// Interval between bulk refreshes
    pub refresh_interval: Duration,
    /// Delay between failed initialization attempts and listener errors
    pub retry_delay: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window: Window::default(),
            chunk_days: 1,
            refresh_interval: Duration::from_secs(15 * 60),
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Keeps one airport's repository in sync with upstream.
pub struct Collector<S> {
    source: S,
    ingestor: Ingestor,
    config: CollectorConfig,
    stats: Arc<CollectorStats>,
    running: Arc<AtomicBool>,
    shutdown: Notify,
}

impl<S: FlightSource> Collector<S> {
    pub fn new(source: S, ingestor: Ingestor, config: CollectorConfig) -> Self {
        Self {
            source,
            ingestor,
            config,
            stats: Arc::new(CollectorStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Notify::new(),
        }
    }

    pub fn airport(&self) -> &str {
        self.ingestor.airport()
    }

    /// Get a reference to the collector stats.
    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the collector; in-flight loops exit at their next wake-up.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Initialize, then refresh and listen until stopped.
    ///
    /// Without a notification source, or once it closes, only the periodic
    /// refresh runs.
    pub async fn run(&self, source: Option<Box<dyn NotificationSource>>) -> Result<(), CollectorError> {
        self.running.store(true, Ordering::SeqCst);
        self.initialize().await?;

        // Refresh keeps running after the notification feed ends.
        let listener = async {
            if let Some(mut source) = source {
                self.listen_loop(source.as_mut()).await;
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = self.refresh_loop() => {}
            _ = listener => {}
            _ = self.shutdown.notified() => {}
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(airport = %self.airport(), "Collector stopped");
        Ok(())
    }

    /// Probe, load resource listings and run a first full refresh, retrying
    /// with a fixed delay until it succeeds or the collector is stopped.
    pub async fn initialize(&self) -> Result<(), CollectorError> {
        let mut attempt = 0u32;
        while self.is_running() {
            attempt += 1;
            match self.try_initialize().await {
                Ok(()) => {
                    tracing::info!(airport = %self.airport(), attempt, "Repository initialized");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        airport = %self.airport(),
                        attempt,
                        "Initialization failed, retrying in {:?}: {}",
                        self.config.retry_delay,
                        e
                    );
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    sleep(self.config.retry_delay).await;
                }
            }
        }
        Err(CollectorError::Stopped)
    }

    async fn try_initialize(&self) -> Result<(), CollectorError> {
        self.source.probe().await?;
        self.load_resources().await?;
        self.refresh().await?;
        Ok(())
    }

    async fn load_resources(&self) -> Result<usize, CollectorError> {
        let mut added = 0;
        for resource_type in ResourceType::ALL {
            let resources = self
                .source
                .fetch_resources(self.airport(), resource_type)
                .await?;
            added += self.ingestor.load_resources(resources);
        }
        tracing::debug!(airport = %self.airport(), added, "Loaded resources");
        Ok(added)
    }

    /// One full bulk refresh across the window, chunk by chunk.
    pub async fn refresh(&self) -> Result<usize, CollectorError> {
        let start = Instant::now();
        let today = Utc::now().date_naive();
        let chunks = refresh_chunks(today, self.config.window, self.config.chunk_days);

        let mut applied = 0;
        for (i, (from, to)) in chunks.iter().enumerate() {
            let flights = self.source.fetch_flights(self.airport(), *from, *to).await?;
            let outcome = self.ingestor.apply_bulk(flights);
            self.ingestor.report_progress(i + 1, chunks.len(), outcome.applied);
            self.stats
                .dropped
                .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
            applied += outcome.applied;
        }

        let evicted = self.ingestor.finish_refresh();
        let elapsed = start.elapsed();

        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .flights_refreshed
            .fetch_add(applied as u64, Ordering::Relaxed);
        self.stats
            .evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        self.stats
            .last_refresh_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);

        tracing::debug!(
            airport = %self.airport(),
            "Refreshed {} flights in {} chunks in {:?}",
            applied,
            chunks.len(),
            elapsed
        );
        Ok(applied)
    }

    async fn refresh_loop(&self) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        // The first tick completes immediately and initialization just refreshed.
        interval.tick().await;

        while self.is_running() {
            interval.tick().await;
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.refresh().await {
                tracing::warn!(airport = %self.airport(), "Refresh failed: {}", e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn listen_loop(&self, source: &mut dyn NotificationSource) {
        while self.is_running() {
            match source.next_message().await {
                Ok(Some(message)) => self.handle_message(&message),
                Ok(None) => {
                    tracing::warn!(
                        airport = %self.airport(),
                        "Notification source closed, continuing with periodic refresh"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(airport = %self.airport(), "Notification source error: {}", e);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn handle_message(&self, message: &str) {
        match self.ingestor.apply_message(message) {
            Ok(_) => {
                self.stats.notifications.fetch_add(1, Ordering::Relaxed);
            }
            Err(e @ IngestError::OutOfWindow { .. }) => {
                tracing::debug!(airport = %self.airport(), "{}", e);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(airport = %self.airport(), "Dropping notification: {}", e);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventStreams};
    use crate::protocol::samples::{flight_xml, notification_xml};
    use crate::source::ChannelSource;
    use crate::storage::{AirportStore, Repository, RepositoryAccess, SharedRepository};
    use crate::types::test_support::{flight_at, with_slot};
    use crate::types::{FixedResource, Flight};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use reqwest::StatusCode;
    use std::sync::atomic::AtomicU32;

    /// Serves one flight on stand R1 per requested chunk. Fails the first
    /// `fail_first` probes and, once, the fetch numbered `fail_fetch`.
    #[derive(Default)]
    struct FakeSource {
        fail_first: u32,
        fail_fetch: Option<u32>,
        probes: AtomicU32,
        fetches: AtomicU32,
    }

    #[async_trait]
    impl FlightSource for FakeSource {
        async fn probe(&self) -> Result<(), ClientError> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ClientError::AuthError);
            }
            Ok(())
        }

        async fn fetch_flights(
            &self,
            _airport: &str,
            from: NaiveDate,
            _to: NaiveDate,
        ) -> Result<Vec<Flight>, ClientError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch == Some(n) {
                return Err(ClientError::ServerError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                });
            }
            let at = from.and_hms_opt(12, 0, 0).unwrap().and_utc();
            Ok(vec![with_slot(flight_at("QF", "1", at), ResourceType::Stand, "R1")])
        }

        async fn fetch_resources(
            &self,
            _airport: &str,
            resource_type: ResourceType,
        ) -> Result<Vec<FixedResource>, ClientError> {
            Ok(vec![FixedResource::new(resource_type, "R1", None)])
        }
    }

    fn collector_with(
        source: FakeSource,
        refresh_interval: Duration,
    ) -> (Collector<FakeSource>, SharedRepository, EventStreams) {
        let repo = AirportStore::new().insert(Repository::new("SYD"));
        let (bus, streams) = EventBus::new(64);
        let ingestor = Ingestor::new(repo.clone(), Window::new(-1, 2), bus);
        let config = CollectorConfig {
            window: Window::new(-1, 2),
            chunk_days: 2,
            refresh_interval,
            retry_delay: Duration::from_millis(5),
        };
        (Collector::new(source, ingestor, config), repo, streams)
    }

    fn collector(fail_first: u32) -> (Collector<FakeSource>, SharedRepository, EventStreams) {
        let source = FakeSource {
            fail_first,
            ..Default::default()
        };
        collector_with(source, Duration::from_secs(3600))
    }

    #[test_log::test(tokio::test)]
    async fn test_initialize_retries_until_ready() {
        let (collector, repo, mut streams) = collector(2);
        collector.running.store(true, Ordering::SeqCst);
        collector.initialize().await.unwrap();

        let stats = collector.stats().snapshot();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.refreshes, 1);
        // Window -1..=2 in chunks of two days: two chunks, one flight each.
        assert_eq!(stats.flights_refreshed, 2);

        repo.with_read(|r| {
            assert!(r.is_populated());
            assert_eq!(r.len(), 2);
            assert_eq!(r.stats().resources, 5);
        });
        assert_eq!(streams.progress.recv().await.unwrap().chunks, 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_initialize_after_failed_chunk_has_no_duplicate_allocations() {
        let source = FakeSource {
            fail_fetch: Some(1),
            ..Default::default()
        };
        let (collector, repo, _streams) = collector_with(source, Duration::from_secs(3600));
        collector.running.store(true, Ordering::SeqCst);
        collector.initialize().await.unwrap();

        let stats = collector.stats().snapshot();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.refreshes, 1);
        repo.with_read(|r| {
            assert!(r.is_populated());
            assert_eq!(r.len(), 2);
            assert_eq!(r.stats().allocations, 2);
        });
    }

    #[tokio::test]
    async fn test_initialize_stops_when_not_running() {
        let (collector, _repo, _streams) = collector(0);
        assert!(matches!(collector.initialize().await, Err(CollectorError::Stopped)));
    }

    #[test_log::test(tokio::test)]
    async fn test_refresh_continues_after_source_closes() {
        let (collector, repo, mut streams) =
            collector_with(FakeSource::default(), Duration::from_millis(20));
        let collector = Arc::new(collector);
        let (tx, source) = ChannelSource::channel(8);

        let time = Utc::now().format("%Y-%m-%dT%H:00:00").to_string();
        let created = notification_xml("FlightCreatedNotification", &flight_xml("7", &time, "R1"), "");
        tx.send(created).await.unwrap();
        tx.send("<Envelope><Garbage/></Envelope>".to_string()).await.unwrap();
        drop(tx);

        let handle = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.run(Some(Box::new(source))).await })
        };

        let event = streams.created.recv().await.unwrap();
        assert_eq!(event.flight_key, format!("QF7@{time}"));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(collector.is_running());
        assert!(!handle.is_finished());
        let stats = collector.stats().snapshot();
        assert_eq!(stats.notifications, 1);
        assert_eq!(stats.dropped, 1);
        // Initialization plus at least two periodic refreshes.
        assert!(stats.refreshes >= 3, "refreshes = {}", stats.refreshes);
        repo.with_read(|r| assert!(r.get(&event.flight_key).is_some()));

        collector.stop();
        handle.await.unwrap().unwrap();
        assert!(!collector.is_running());
    }
}
