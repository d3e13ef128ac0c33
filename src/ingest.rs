//! Write path into one airport's repository.
//!
//! Every flight passes the same steps: tolerance-band check, stamping,
//! store write, allocation rebuild, event. Notifications emit one mutation
//! event each; bulk refreshes emit one progress event per chunk instead.

use crate::events::{EventBus, MutationEvent, RefreshProgress};
use crate::indexer;
use crate::protocol::{self, Notification, ParseError};
use crate::storage::{RepositoryAccess, SharedRepository};
use crate::types::{Action, FixedResource, Flight};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Slack on either side of the window inside which flights are still accepted.
pub const TOLERANCE_DAYS: i64 = 2;

/// Largest window offset, in days, that configuration may request.
pub const MAX_WINDOW_DAYS: i64 = 366;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Flight {key} scheduled {date} is outside {lower}..={upper}")]
    OutOfWindow {
        key: String,
        date: NaiveDate,
        lower: NaiveDate,
        upper: NaiveDate,
    },
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Resident window in whole days relative to today, e.g. `-1..=+2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub min_days: i64,
    pub max_days: i64,
}

impl Window {
    pub fn new(min_days: i64, max_days: i64) -> Self {
        Self { min_days, max_days }
    }

    /// Authoritative bounds `[today+min, today+max]`.
    pub fn bounds(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        (
            today + Duration::days(self.min_days),
            today + Duration::days(self.max_days),
        )
    }

    /// Acceptance band: the bounds widened by [`TOLERANCE_DAYS`].
    pub fn tolerance(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let (lower, upper) = self.bounds(today);
        (
            lower - Duration::days(TOLERANCE_DAYS),
            upper + Duration::days(TOLERANCE_DAYS),
        )
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(-1, 2)
    }
}

/// Contiguous inclusive date ranges of at most `chunk_days` days covering
/// the window.
pub fn refresh_chunks(today: NaiveDate, window: Window, chunk_days: u32) -> Vec<(NaiveDate, NaiveDate)> {
    let step = Duration::days(i64::from(chunk_days.max(1)));
    let (lower, upper) = window.bounds(today);

    let mut chunks = Vec::new();
    let mut from = lower;
    while from <= upper {
        let to = (from + step - Duration::days(1)).min(upper);
        chunks.push((from, to));
        from = to + Duration::days(1);
    }
    chunks
}

/// Tallies of one bulk batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub applied: usize,
    pub rejected: usize,
    pub allocations: usize,
}

/// Applies decoded flights to one repository.
#[derive(Debug, Clone)]
pub struct Ingestor {
    airport: String,
    repository: SharedRepository,
    window: Window,
    events: EventBus,
}

impl Ingestor {
    pub fn new(repository: SharedRepository, window: Window, events: EventBus) -> Self {
        let airport = repository.with_read(|repo| repo.airport().to_string());
        Self {
            airport,
            repository,
            window,
            events,
        }
    }

    pub fn airport(&self) -> &str {
        &self.airport
    }

    pub fn repository(&self) -> &SharedRepository {
        &self.repository
    }

    pub fn window(&self) -> Window {
        self.window
    }

    fn check_window(&self, flight: &Flight, today: NaiveDate) -> Result<(), IngestError> {
        let (lower, upper) = self.window.tolerance(today);
        if flight.scheduled_date < lower || flight.scheduled_date > upper {
            return Err(IngestError::OutOfWindow {
                key: flight.key(),
                date: flight.scheduled_date,
                lower,
                upper,
            });
        }
        Ok(())
    }

    /// Decode and apply one raw notification envelope.
    pub fn apply_message(&self, xml: &str) -> Result<MutationEvent, IngestError> {
        let notification = protocol::parse_notification(xml)?;
        self.apply_notification(notification)
    }

    pub fn apply_notification(&self, notification: Notification) -> Result<MutationEvent, IngestError> {
        self.apply_notification_at(notification, Utc::now())
    }

    pub fn apply_notification_at(
        &self,
        notification: Notification,
        now: DateTime<Utc>,
    ) -> Result<MutationEvent, IngestError> {
        let Notification { action, mut flight } = notification;
        self.check_window(&flight, now.date_naive())?;

        flight.last_update = now;
        flight.action = action;
        let key = flight.key();

        let flight = self.repository.with_write(|repo| {
            if action == Action::Delete {
                repo.remove_by_key(&key);
                indexer::purge(repo, &key);
                Arc::new(flight)
            } else {
                let shared = Arc::new(flight.clone());
                repo.upsert(flight);
                indexer::reindex(repo, &shared, false);
                shared
            }
        });

        tracing::debug!(airport = %self.airport, flight = %key, %action, "Applied notification");

        let event = MutationEvent {
            airport: self.airport.clone(),
            flight_key: key,
            action,
            flight,
        };
        self.events.publish(event.clone());
        Ok(event)
    }

    pub fn apply_bulk(&self, flights: Vec<Flight>) -> BulkOutcome {
        self.apply_bulk_at(flights, Utc::now())
    }

    /// Apply one refresh chunk. Out-of-band flights are counted and dropped.
    pub fn apply_bulk_at(&self, flights: Vec<Flight>, now: DateTime<Utc>) -> BulkOutcome {
        let (lower, upper) = self.window.tolerance(now.date_naive());
        let mut outcome = BulkOutcome::default();

        self.repository.with_write(|repo| {
            let first_population = !repo.is_populated();
            for mut flight in flights {
                if flight.scheduled_date < lower || flight.scheduled_date > upper {
                    tracing::debug!(
                        airport = %self.airport,
                        flight = %flight.key(),
                        date = %flight.scheduled_date,
                        "Refreshed flight outside window, dropped"
                    );
                    outcome.rejected += 1;
                    continue;
                }
                flight.last_update = now;
                flight.action = Action::Status;
                // A retried first cycle can meet flights it already indexed.
                let bypass_delete = first_population && repo.get(&flight.key()).is_none();
                outcome.allocations += indexer::reindex(repo, &flight, bypass_delete);
                repo.upsert(flight);
                outcome.applied += 1;
            }
        });

        outcome
    }

    pub fn report_progress(&self, chunk: usize, chunks: usize, flights: usize) {
        self.events.publish_progress(RefreshProgress {
            airport: self.airport.clone(),
            chunk,
            chunks,
            flights,
        });
    }

    pub fn finish_refresh(&self) -> Vec<String> {
        self.finish_refresh_at(Utc::now())
    }

    /// Close a refresh cycle: store the new bounds, mark the repository
    /// populated and evict everything before the lower bound.
    pub fn finish_refresh_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let (lower, upper) = self.window.bounds(now.date_naive());

        let evicted = self.repository.with_write(|repo| {
            repo.current_lower_limit = Some(lower.and_time(NaiveTime::MIN).and_utc());
            repo.current_upper_limit = upper
                .and_hms_opt(23, 59, 59)
                .map(|end| end.and_utc());
            repo.mark_populated();
            repo.evict_before(lower)
        });

        if !evicted.is_empty() {
            tracing::info!(airport = %self.airport, evicted = evicted.len(), %lower, "Evicted flights");
        }
        evicted
    }

    /// Register resources from an upstream listing. Returns how many were new.
    pub fn load_resources(&self, resources: Vec<FixedResource>) -> usize {
        self.repository.with_write(|repo| {
            resources
                .into_iter()
                .map(|r| repo.add_resource(r))
                .filter(|added| *added)
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStreams;
    use crate::storage::{AirportStore, Repository};
    use crate::types::test_support::*;
    use crate::types::ResourceType;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (Ingestor, EventStreams) {
        let mut repo = Repository::new("SYD");
        repo.add_resource(FixedResource::new(ResourceType::Stand, "A1", None));
        repo.add_resource(FixedResource::new(ResourceType::Stand, "A2", None));
        let shared = AirportStore::new().insert(repo);
        let (bus, streams) = EventBus::new(16);
        (Ingestor::new(shared, Window::new(-1, 2), bus), streams)
    }

    fn notify(action: Action, f: Flight) -> Notification {
        Notification { action, flight: f }
    }

    fn snapshot(ingestor: &Ingestor) -> (Vec<Flight>, usize) {
        ingestor.repository().with_read(|repo| {
            (repo.flights().iter().cloned().collect(), repo.stats().allocations)
        })
    }

    #[test]
    fn test_window_bands() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let w = Window::new(-1, 2);
        assert_eq!(
            w.tolerance(today),
            (
                NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 14).unwrap()
            )
        );
    }

    #[test]
    fn test_refresh_chunks_cover_window() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let chunks = refresh_chunks(today, Window::new(-1, 3), 2);
        let d = |day| NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        assert_eq!(chunks, vec![(d(9), d(10)), (d(11), d(12)), (d(13), d(13))]);

        let single = refresh_chunks(today, Window::new(0, 0), 5);
        assert_eq!(single, vec![(d(10), d(10))]);
    }

    #[test]
    fn test_create_then_update_replaces() {
        let (ingestor, mut streams) = setup();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        ingestor
            .apply_notification_at(notify(Action::Create, f.clone()), now())
            .unwrap();

        let mut updated = f.clone();
        updated.custom_fields.insert("Remark".into(), "Delayed".into());
        ingestor
            .apply_notification_at(notify(Action::Update, updated), now())
            .unwrap();

        let (flights, allocations) = snapshot(&ingestor);
        assert_eq!(flights.len(), 1);
        assert_eq!(flights[0].action, Action::Update);
        assert_eq!(flights[0].last_update, now());
        assert_eq!(flights[0].custom_fields.get("Remark").unwrap(), "Delayed");
        assert_eq!(allocations, 1);

        assert_eq!(streams.created.try_recv().unwrap().flight_key, f.key());
        assert_eq!(streams.updated.try_recv().unwrap().action, Action::Update);
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let (ingestor, _streams) = setup();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");

        ingestor
            .apply_notification_at(notify(Action::Update, f.clone()), now())
            .unwrap();
        let once = snapshot(&ingestor);
        ingestor
            .apply_notification_at(notify(Action::Update, f), now())
            .unwrap();
        assert_eq!(snapshot(&ingestor), once);
    }

    #[test]
    fn test_out_of_window_is_noop() {
        let (ingestor, mut streams) = setup();
        let before = snapshot(&ingestor);

        let far = flight("QF", "1", "2025-01-06T10:00:00");
        let err = ingestor
            .apply_notification_at(notify(Action::Create, far), now())
            .unwrap_err();
        assert!(matches!(err, IngestError::OutOfWindow { .. }));

        let old = flight("QF", "2", "2024-12-28T10:00:00");
        let outcome = ingestor.apply_bulk_at(vec![old], now());
        assert_eq!(outcome.rejected, 1);

        assert_eq!(snapshot(&ingestor), before);
        assert!(streams.created.try_recv().is_err());
    }

    #[test]
    fn test_tolerance_edge_accepted() {
        let (ingestor, _streams) = setup();
        // today - 1 day - 2 days of tolerance
        let edge = flight("QF", "1", "2024-12-29T23:00:00");
        assert!(ingestor
            .apply_notification_at(notify(Action::Create, edge), now())
            .is_ok());
    }

    #[test]
    fn test_delete_purges_allocations() {
        let (ingestor, mut streams) = setup();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        ingestor
            .apply_notification_at(notify(Action::Create, f.clone()), now())
            .unwrap();
        ingestor
            .apply_notification_at(notify(Action::Delete, f.clone()), now())
            .unwrap();

        assert_eq!(snapshot(&ingestor), (Vec::new(), 0));
        assert_eq!(streams.deleted.try_recv().unwrap().flight_key, f.key());

        // Deleting an absent flight still emits.
        ingestor
            .apply_notification_at(notify(Action::Delete, f), now())
            .unwrap();
        assert!(streams.deleted.try_recv().is_ok());
    }

    #[test]
    fn test_bulk_refresh_and_eviction() {
        let (ingestor, mut streams) = setup();
        let stale = flight("QF", "9", "2024-12-30T10:00:00");
        let current = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A2");

        let outcome = ingestor.apply_bulk_at(vec![stale, current], now());
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.allocations, 1);
        ingestor.report_progress(1, 1, outcome.applied);

        let evicted = ingestor.finish_refresh_at(now());
        assert_eq!(evicted, vec!["QF9@2024-12-30T10:00:00".to_string()]);

        ingestor.repository().with_read(|repo| {
            assert!(repo.is_populated());
            assert_eq!(
                repo.current_lower_limit,
                Some(Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap())
            );
            assert!(repo
                .flights()
                .iter()
                .all(|f| f.scheduled_date >= NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));
            assert_eq!(repo.get("QF1@2025-01-01T10:00:00").unwrap().action, Action::Status);
        });

        assert!(streams.updated.try_recv().is_err());
        assert_eq!(streams.progress.try_recv().unwrap().flights, 2);
    }

    #[test]
    fn test_second_refresh_rebuilds_allocations() {
        let (ingestor, _streams) = setup();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        ingestor.apply_bulk_at(vec![f.clone()], now());
        ingestor.finish_refresh_at(now());
        ingestor.apply_bulk_at(vec![f], now());
        assert_eq!(snapshot(&ingestor).1, 1);
    }

    #[test]
    fn test_retried_first_refresh_keeps_single_allocation() {
        let (ingestor, _streams) = setup();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        // Second cycle before any finish_refresh, as after a failed chunk.
        ingestor.apply_bulk_at(vec![f.clone()], now());
        ingestor.apply_bulk_at(vec![f], now());

        let (flights, allocations) = snapshot(&ingestor);
        assert_eq!(flights.len(), 1);
        assert_eq!(allocations, 1);
        ingestor.repository().with_read(|repo| assert!(!repo.is_populated()));
    }

    #[test]
    fn test_apply_message_rejects_malformed() {
        let (ingestor, _streams) = setup();
        assert!(matches!(
            ingestor.apply_message("<Envelope><Nothing/></Envelope>"),
            Err(IngestError::Parse(_))
        ));
    }

    #[test]
    fn test_load_resources_counts_new() {
        let (ingestor, _streams) = setup();
        let added = ingestor.load_resources(vec![
            FixedResource::new(ResourceType::Stand, "A1", None),
            FixedResource::new(ResourceType::Gate, "G1", None),
        ]);
        assert_eq!(added, 1);
    }
}
