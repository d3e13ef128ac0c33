//! In-memory airport flight replica with change and scheduled push
//! distribution.
//!
//! This library provides functionality to:
//! - Keep a time-windowed replica of flights and resource allocations per airport
//! - Apply upstream change notifications and periodic bulk refreshes
//! - Answer caller-scoped, redacted flight and allocation queries
//! - Push matching changes and scheduled query results to subscribers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │   Client    │───▶│  Protocol   │───▶│   Ingest    │───▶│   Storage   │
//! │ (SOAP/poll) │    │ (XML tree)  │    │  (+Indexer) │    │(per airport)│
//! └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘
//!        ▲                                     │                  │
//!        │                                     ▼ events           ▼
//!  ┌─────────────┐                     ┌─────────────┐    ┌─────────────┐
//!  │  Collector  │                     │  Dispatch   │    │    Query    │
//!  │ (refresh +  │                     │ (change     │    │  (authz +   │
//!  │  listener)  │                     │  pushes)    │    │  redaction) │
//!  └─────────────┘                     └─────────────┘    └─────────────┘
//!                                              │                  │
//!                                              ▼                  ▼
//!                                      ┌─────────────┐    ┌─────────────┐
//!                                      │  Delivery   │◀───│  Scheduler  │
//!                                      └─────────────┘    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use flightsync::{
//!     events::EventBus,
//!     ingest::{Ingestor, Window},
//!     query::{FlightQuery, QueryEngine},
//!     profile::UserProfile,
//!     storage::{AirportStore, Repository},
//! };
//! use std::sync::Arc;
//!
//! let mut store = AirportStore::new();
//! let repository = store.insert(Repository::new("SYD"));
//! let (bus, _streams) = EventBus::new(1024);
//!
//! let ingestor = Ingestor::new(repository, Window::new(-1, 2), bus);
//! # let xml = "";
//! ingestor.apply_message(xml).ok();
//!
//! let engine = QueryEngine::new(Arc::new(store));
//! let profile = UserProfile {
//!     name: "ops".into(),
//!     allowed_airports: vec!["SYD".into()],
//!     allowed_airlines: vec!["*".into()],
//!     ..Default::default()
//! };
//! let response = engine.handle_query(&FlightQuery::new("SYD").with_direction("D"), &profile);
//! ```

pub mod client;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod events;
pub mod indexer;
pub mod ingest;
pub mod profile;
pub mod protocol;
pub mod query;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod types;

pub use client::{AmsClient, ClientConfig, FlightSource};
pub use collector::{Collector, CollectorConfig};
pub use config::Config;
pub use dispatch::ChangeDispatcher;
pub use events::{EventBus, EventStreams, MutationEvent};
pub use ingest::{Ingestor, Window};
pub use profile::{ProfileRegistry, UserProfile};
pub use protocol::{parse_flights, parse_notification};
pub use query::{AllocationQuery, FlightQuery, QueryEngine, QueryError};
pub use scheduler::PushScheduler;
pub use storage::{AirportStore, Repository};
pub use types::{Flight, FlightKind, ResourceType};
