//! Change dispatcher: matches mutation events against change subscriptions
//! and fires pushes.

use crate::delivery::{PushClient, PushTarget};
use crate::events::{EventStreams, MutationEvent};
use crate::profile::{ProfileRegistry, UserChangeSubscription};
use crate::types::{Action, ResourceType};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Flights scheduled further ahead than this are not dispatched.
pub const DEFAULT_STALENESS_HOURS: i64 = 36;

/// Why a subscription fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchReason {
    Action(Action),
    Property(String),
    Category(ResourceType),
    SlotChange(ResourceType),
    Aircraft,
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(action) => write!(f, "action {action}"),
            Self::Property(name) => write!(f, "property {name}"),
            Self::Category(t) => write!(f, "{t} change"),
            Self::SlotChange(t) => write!(f, "{t} slot change"),
            Self::Aircraft => f.write_str("aircraft change"),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub events: AtomicU64,
    pub matched: AtomicU64,
    pub skipped_stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub events: u64,
    pub matched: u64,
    pub skipped_stale: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            events: self.events.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            skipped_stale: self.skipped_stale.load(Ordering::Relaxed),
        }
    }
}

pub struct ChangeDispatcher {
    registry: Arc<ProfileRegistry>,
    push: PushClient,
    horizon: Duration,
    stats: DispatchStats,
}

impl ChangeDispatcher {
    pub fn new(registry: Arc<ProfileRegistry>, push: PushClient) -> Self {
        Self {
            registry,
            push,
            horizon: Duration::hours(DEFAULT_STALENESS_HOURS),
            stats: DispatchStats::default(),
        }
    }

    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    fn is_stale(&self, event: &MutationEvent, now: DateTime<Utc>) -> bool {
        event.flight.scheduled > now + self.horizon
    }

    /// Decide whether `subscription` fires for `event`. Checks run in a
    /// fixed order and stop at the first match.
    pub fn evaluate(
        &self,
        event: &MutationEvent,
        subscription: &UserChangeSubscription,
        now: DateTime<Utc>,
    ) -> Option<MatchReason> {
        if self.is_stale(event, now) {
            return None;
        }

        match event.action {
            Action::Create => return subscription.create.then_some(MatchReason::Action(Action::Create)),
            Action::Delete => return subscription.delete.then_some(MatchReason::Action(Action::Delete)),
            Action::Update | Action::Status if subscription.update => {
                return Some(MatchReason::Action(Action::Update))
            }
            Action::Update | Action::Status => {}
        }

        let changes = &event.flight.changes;

        if let Some(change) = changes
            .properties
            .iter()
            .find(|c| subscription.properties.iter().any(|p| *p == c.name))
        {
            return Some(MatchReason::Property(change.name.clone()));
        }

        if let Some(t) = ResourceType::ALL
            .into_iter()
            .find(|t| subscription.category(*t) && changes.contains(t.change_property()))
        {
            return Some(MatchReason::Category(t));
        }

        if let Some(t) = ResourceType::ALL
            .into_iter()
            .find(|t| subscription.category(*t) && changes.slot_changes.contains(t))
        {
            return Some(MatchReason::SlotChange(t));
        }

        if subscription.aircraft && (changes.aircraft_type || changes.aircraft_registration) {
            return Some(MatchReason::Aircraft);
        }

        None
    }

    pub fn handle(&self, event: &MutationEvent) -> usize {
        self.handle_at(event, Utc::now())
    }

    /// Evaluate every change subscription of the event's airport and spawn
    /// one delivery per match. Returns the number of deliveries started.
    pub fn handle_at(&self, event: &MutationEvent, now: DateTime<Utc>) -> usize {
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        if self.is_stale(event, now) {
            self.stats.skipped_stale.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(flight = %event.flight_key, "Flight too far ahead, not dispatched");
            return 0;
        }

        let mut fired = 0;
        for (owner, subscription) in self.registry.change_subscriptions(&event.airport) {
            let Some(reason) = self.evaluate(event, &subscription, now) else {
                continue;
            };
            tracing::debug!(
                airport = %event.airport,
                flight = %event.flight_key,
                user = %owner,
                url = %subscription.destination,
                %reason,
                "Change subscription matched"
            );

            let target = PushTarget::new(subscription.destination, subscription.headers);
            match self.push.spawn_post(target, event.flight.as_ref()) {
                Ok(_) => fired += 1,
                Err(e) => tracing::warn!(flight = %event.flight_key, "Push not sent: {}", e),
            }
        }

        self.stats.matched.fetch_add(fired as u64, Ordering::Relaxed);
        fired
    }

    /// Consume the mutation queues until every one of them has closed.
    pub async fn run(self: Arc<Self>, mut streams: EventStreams) {
        loop {
            tokio::select! {
                Some(event) = streams.created.recv() => { self.handle(&event); }
                Some(event) = streams.updated.recv() => { self.handle(&event); }
                Some(event) = streams.deleted.recv() => { self.handle(&event); }
                Some(progress) = streams.progress.recv() => {
                    tracing::debug!(
                        airport = %progress.airport,
                        "Refresh chunk {}/{} applied ({} flights)",
                        progress.chunk,
                        progress.chunks,
                        progress.flights
                    );
                }
                else => break,
            }
        }
        tracing::info!("Event queues closed, dispatcher exiting");
    }
}
