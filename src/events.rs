//! Mutation events emitted by ingestion and consumed by the dispatcher.
//!
//! Four bounded queues, one per event kind. Publishing never waits: a full
//! or closed queue drops the event, logs it and bumps a counter, so a slow
//! consumer can never stall ingestion.

use crate::types::{Action, Flight};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// One applied create/update/delete.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub airport: String,
    pub flight_key: String,
    pub action: Action,
    /// Flight as written to the store (as received, for deletes).
    pub flight: Arc<Flight>,
}

/// Progress of a bulk refresh, one per fetched chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshProgress {
    pub airport: String,
    /// 1-based index of the chunk just applied.
    pub chunk: usize,
    pub chunks: usize,
    pub flights: usize,
}

/// Publishing half, cheap to clone into every ingestor.
#[derive(Debug, Clone)]
pub struct EventBus {
    created: mpsc::Sender<MutationEvent>,
    updated: mpsc::Sender<MutationEvent>,
    deleted: mpsc::Sender<MutationEvent>,
    progress: mpsc::Sender<RefreshProgress>,
    dropped: Arc<AtomicU64>,
}

/// Consuming half, owned by the dispatcher.
#[derive(Debug)]
pub struct EventStreams {
    pub created: mpsc::Receiver<MutationEvent>,
    pub updated: mpsc::Receiver<MutationEvent>,
    pub deleted: mpsc::Receiver<MutationEvent>,
    pub progress: mpsc::Receiver<RefreshProgress>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, EventStreams) {
        let capacity = capacity.max(1);
        let (created_tx, created_rx) = mpsc::channel(capacity);
        let (updated_tx, updated_rx) = mpsc::channel(capacity);
        let (deleted_tx, deleted_rx) = mpsc::channel(capacity);
        let (progress_tx, progress_rx) = mpsc::channel(capacity);

        let bus = Self {
            created: created_tx,
            updated: updated_tx,
            deleted: deleted_tx,
            progress: progress_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let streams = EventStreams {
            created: created_rx,
            updated: updated_rx,
            deleted: deleted_rx,
            progress: progress_rx,
        };
        (bus, streams)
    }

    /// Route a mutation event to its kind's queue. Returns `false` if it
    /// was dropped.
    pub fn publish(&self, event: MutationEvent) -> bool {
        let (sender, queue) = match event.action {
            Action::Create => (&self.created, "created"),
            Action::Delete => (&self.deleted, "deleted"),
            Action::Update | Action::Status => (&self.updated, "updated"),
        };
        self.deliver(sender, event, queue)
    }

    pub fn publish_progress(&self, progress: RefreshProgress) -> bool {
        self.deliver(&self.progress, progress, "refresh")
    }

    /// Events dropped so far because a queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver<T>(&self, sender: &mpsc::Sender<T>, item: T, queue: &'static str) -> bool {
        match sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(queue, "Event queue full, event dropped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(queue, "Event queue closed, event dropped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
