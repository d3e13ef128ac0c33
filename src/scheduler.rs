//! Time-based pushes: one job per enabled push subscription of an airport.

use crate::delivery::{DeliveryError, PushClient, PushTarget};
use crate::profile::{ProfileRegistry, PushKind, UserPushSubscription};
use crate::query::{QueryEngine, QueryError};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Query failed: {0}")]
    Query(#[from] QueryError),
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("Unknown user: {0}")]
    UnknownUser(String),
}

/// Repetition of a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum Cadence {
    /// Every `every` hours, aligned on the time of day `at` (midnight if unset).
    Hours {
        every: u32,
        #[serde(default)]
        at: Option<NaiveTime>,
    },
    Minutes {
        every: u32,
    },
}

impl Cadence {
    pub fn interval(&self) -> Duration {
        match *self {
            Self::Hours { every, .. } => Duration::hours(i64::from(every.max(1))),
            Self::Minutes { every } => Duration::minutes(i64::from(every.max(1))),
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(*self, Self::Hours { every: 0, .. } | Self::Minutes { every: 0 })
    }

    /// First firing strictly after `now`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Hours { at, .. } => {
                let anchor = now
                    .date_naive()
                    .and_time(at.unwrap_or(NaiveTime::MIN))
                    .and_utc();
                self.next_after(anchor, now)
            }
            Self::Minutes { .. } => now + self.interval(),
        }
    }

    /// Advance `from` by whole intervals until it is strictly after `now`.
    pub fn next_after(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval();
        let mut next = from;
        while next <= now {
            next += interval;
        }
        next
    }
}

/// Identity of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobTag {
    pub user: String,
    pub subscription: String,
}

#[derive(Clone)]
struct JobContext {
    airport: String,
    engine: Arc<QueryEngine>,
    push: PushClient,
    registry: Arc<ProfileRegistry>,
}

impl JobContext {
    /// Run the subscription's frozen query as its owner and push the result.
    async fn fire(&self, owner: &str, subscription: &UserPushSubscription) -> Result<(), ScheduleError> {
        let profile = self
            .registry
            .get(owner)
            .ok_or_else(|| ScheduleError::UnknownUser(owner.to_string()))?;
        let target = PushTarget::new(subscription.destination.clone(), subscription.headers.clone());

        match &subscription.kind {
            PushKind::Flights(query) => {
                let mut query = query.clone();
                query.airport = self.airport.clone();
                let response = self.engine.handle_query(&query, &profile)?;
                self.push.post_json(&target, &response).await?;
            }
            PushKind::Resources(query) => {
                let mut query = query.clone();
                query.airport = self.airport.clone();
                let response = self.engine.handle_allocation_query(&query, &profile)?;
                self.push.post_json(&target, &response).await?;
            }
        }
        Ok(())
    }

    async fn fire_logged(&self, owner: &str, subscription: &UserPushSubscription) {
        match self.fire(owner, subscription).await {
            Ok(()) => tracing::debug!(
                airport = %self.airport,
                user = %owner,
                subscription = %subscription.id,
                "Scheduled push delivered"
            ),
            Err(e) => tracing::warn!(
                airport = %self.airport,
                user = %owner,
                subscription = %subscription.id,
                url = %subscription.destination,
                "Scheduled push failed: {}",
                e
            ),
        }
    }

    async fn run_job(self, owner: String, subscription: UserPushSubscription) {
        if subscription.push_on_startup {
            self.fire_logged(&owner, &subscription).await;
        }

        let cadence = subscription.cadence;
        let mut next = cadence.first_fire(Utc::now());
        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            self.fire_logged(&owner, &subscription).await;
            // Missed firings are skipped, not replayed.
            next = cadence.next_after(next, Utc::now());
        }
    }
}

/// Push jobs of one airport.
pub struct PushScheduler {
    context: JobContext,
    jobs: Mutex<Vec<(JobTag, JoinHandle<()>)>>,
}

impl PushScheduler {
    pub fn new(
        airport: impl Into<String>,
        engine: Arc<QueryEngine>,
        push: PushClient,
        registry: Arc<ProfileRegistry>,
    ) -> Self {
        Self {
            context: JobContext {
                airport: airport.into(),
                engine,
                push,
                registry,
            },
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn airport(&self) -> &str {
        &self.context.airport
    }

    /// Spawn one job per enabled push subscription of this airport.
    pub fn start(&self) -> usize {
        let subscriptions = self.context.registry.push_subscriptions(&self.context.airport);
        let mut jobs = self.jobs.lock();
        for (owner, subscription) in subscriptions {
            let tag = JobTag {
                user: owner.clone(),
                subscription: subscription.id.clone(),
            };
            tracing::info!(
                airport = %self.context.airport,
                user = %tag.user,
                subscription = %tag.subscription,
                first = %subscription.cadence.first_fire(Utc::now()),
                "Scheduling push"
            );
            let handle = tokio::spawn(self.context.clone().run_job(owner, subscription));
            jobs.push((tag, handle));
        }
        jobs.len()
    }

    /// Fire one subscription immediately, outside its schedule.
    pub async fn fire_now(&self, owner: &str, subscription: &UserPushSubscription) -> Result<(), ScheduleError> {
        self.context.fire(owner, subscription).await
    }

    /// Cancel every job owned by `user`. Returns how many were cancelled.
    pub fn cancel_user(&self, user: &str) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|(tag, handle)| {
            if tag.user == user {
                handle.abort();
                false
            } else {
                true
            }
        });
        before - jobs.len()
    }

    pub fn cancel_all(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let count = jobs.len();
        for (_, handle) in jobs.drain(..) {
            handle.abort();
        }
        count
    }

    /// Drop every job and start over from the current profile set.
    pub fn reschedule(&self) -> usize {
        self.cancel_all();
        self.start()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl Drop for PushScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
