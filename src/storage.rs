//! In-memory airport store.
//!
//! Each airport owns one [`Repository`]: an ordered flight collection plus
//! five resource collections holding derived allocations.
//!
//! ```text
//! AirportStore
//! ├── "SYD" ─▶ Arc<RwLock<Repository>>
//! │            ├── flights: [QF1@.., VA800@.., ...]   (ordered, key-indexed)
//! │            ├── check_in: [counter ─▶ allocations]
//! │            ├── gate:     [gate    ─▶ allocations]
//! │            ├── stand:    [stand   ─▶ allocations]
//! │            ├── carousel: [belt    ─▶ allocations]
//! │            └── chute:    [chute   ─▶ allocations]
//! └── "MEL" ─▶ ...
//! ```
//!
//! Every write to a repository happens under its write guard; queries take
//! the read guard. Locks are never held across an `.await`.

use crate::types::{AllocationItem, FixedResource, Flight, ResourceType};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type SharedRepository = Arc<RwLock<Repository>>;

/// Result of a replace-or-append write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Ordered flight collection with O(1) lookup by derived key.
#[derive(Debug, Default)]
pub struct FlightCollection {
    entries: Vec<Flight>,
    index: HashMap<String, usize>,
}

impl FlightCollection {
    pub fn upsert(&mut self, flight: Flight) -> UpsertOutcome {
        let key = flight.key();
        match self.index.get(&key) {
            Some(&pos) => {
                self.entries[pos] = flight;
                UpsertOutcome::Replaced
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(flight);
                UpsertOutcome::Inserted
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Flight> {
        let pos = self.index.remove(key)?;
        let removed = self.entries.remove(pos);
        self.reindex_from(pos);
        Some(removed)
    }

    /// Remove every flight matching `pred`, returning the removed flights.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<Flight>
    where
        F: FnMut(&Flight) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for flight in self.entries.drain(..) {
            if pred(&flight) {
                removed.push(flight);
            } else {
                kept.push(flight);
            }
        }
        self.entries = kept;
        if !removed.is_empty() {
            self.index.clear();
            self.reindex_from(0);
        }
        removed
    }

    fn reindex_from(&mut self, start: usize) {
        for (pos, flight) in self.entries.iter().enumerate().skip(start) {
            self.index.insert(flight.key(), pos);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Flight> {
        self.index.get(key).map(|&pos| &self.entries[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flight> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All resources of one type at one airport.
#[derive(Debug)]
pub struct ResourceCollection {
    resource_type: ResourceType,
    resources: Vec<FixedResource>,
    by_name: HashMap<String, usize>,
}

impl ResourceCollection {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            resources: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Register a resource. Resources are append-only; a name already
    /// present is left untouched and `false` is returned.
    pub fn add_resource(&mut self, resource: FixedResource) -> bool {
        if self.by_name.contains_key(&resource.name) {
            return false;
        }
        self.by_name
            .insert(resource.name.clone(), self.resources.len());
        self.resources.push(resource);
        true
    }

    /// Append an allocation to the resource it names.
    ///
    /// Returns `false` (and drops the item) if no such resource is known.
    pub fn add_allocation(&mut self, item: AllocationItem) -> bool {
        match self.by_name.get(&item.resource) {
            Some(&pos) => {
                self.resources[pos].allocations.push(item);
                true
            }
            None => {
                tracing::debug!(
                    resource_type = %self.resource_type,
                    resource = %item.resource,
                    flight = %item.flight_key,
                    "Allocation references unknown resource, dropped"
                );
                false
            }
        }
    }

    /// Strip every allocation belonging to `flight_key` from every resource.
    pub fn remove_allocations_for_flight(&mut self, flight_key: &str) -> usize {
        let mut removed = 0;
        for resource in &mut self.resources {
            let before = resource.allocations.len();
            resource.allocations.retain(|a| a.flight_key != flight_key);
            removed += before - resource.allocations.len();
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&FixedResource> {
        self.by_name.get(name).map(|&pos| &self.resources[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixedResource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn allocation_count(&self) -> usize {
        self.resources.iter().map(|r| r.allocations.len()).sum()
    }
}

/// Per-airport state: flights, resources and the current window bounds.
#[derive(Debug)]
pub struct Repository {
    airport: String,
    flights: FlightCollection,
    check_in: ResourceCollection,
    gate: ResourceCollection,
    stand: ResourceCollection,
    carousel: ResourceCollection,
    chute: ResourceCollection,
    /// Lower bound of the resident window (`CurrentLowerLimit`).
    pub current_lower_limit: Option<DateTime<Utc>>,
    /// Upper bound of the resident window (`CurrentUpperLimit`).
    pub current_upper_limit: Option<DateTime<Utc>>,
    populated: bool,
}

impl Repository {
    pub fn new(airport: impl Into<String>) -> Self {
        Self {
            airport: airport.into(),
            flights: FlightCollection::default(),
            check_in: ResourceCollection::new(ResourceType::CheckIn),
            gate: ResourceCollection::new(ResourceType::Gate),
            stand: ResourceCollection::new(ResourceType::Stand),
            carousel: ResourceCollection::new(ResourceType::Carousel),
            chute: ResourceCollection::new(ResourceType::Chute),
            current_lower_limit: None,
            current_upper_limit: None,
            populated: false,
        }
    }

    pub fn airport(&self) -> &str {
        &self.airport
    }

    /// Replace the flight with the same key in place, or append it.
    pub fn upsert(&mut self, flight: Flight) -> UpsertOutcome {
        self.flights.upsert(flight)
    }

    pub fn remove_by_key(&mut self, key: &str) -> Option<Flight> {
        self.flights.remove(key)
    }

    /// Remove every flight scheduled before `cutoff`, together with its
    /// allocations. Returns the keys removed.
    pub fn evict_before(&mut self, cutoff: NaiveDate) -> Vec<String> {
        let evicted: Vec<String> = self
            .flights
            .remove_where(|f| f.scheduled_date < cutoff)
            .iter()
            .map(Flight::key)
            .collect();
        for key in &evicted {
            self.remove_allocations_for_flight(key);
        }
        evicted
    }

    pub fn get(&self, key: &str) -> Option<&Flight> {
        self.flights.get(key)
    }

    pub fn flights(&self) -> &FlightCollection {
        &self.flights
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    pub fn resources(&self, resource_type: ResourceType) -> &ResourceCollection {
        match resource_type {
            ResourceType::CheckIn => &self.check_in,
            ResourceType::Gate => &self.gate,
            ResourceType::Stand => &self.stand,
            ResourceType::Carousel => &self.carousel,
            ResourceType::Chute => &self.chute,
        }
    }

    pub fn resources_mut(&mut self, resource_type: ResourceType) -> &mut ResourceCollection {
        match resource_type {
            ResourceType::CheckIn => &mut self.check_in,
            ResourceType::Gate => &mut self.gate,
            ResourceType::Stand => &mut self.stand,
            ResourceType::Carousel => &mut self.carousel,
            ResourceType::Chute => &mut self.chute,
        }
    }

    pub fn add_resource(&mut self, resource: FixedResource) -> bool {
        self.resources_mut(resource.resource_type)
            .add_resource(resource)
    }

    pub fn add_allocation(&mut self, item: AllocationItem) -> bool {
        self.resources_mut(item.resource_type).add_allocation(item)
    }

    /// Remove allocations for `flight_key` across all five collections.
    pub fn remove_allocations_for_flight(&mut self, flight_key: &str) -> usize {
        ResourceType::ALL
            .into_iter()
            .map(|t| self.resources_mut(t).remove_allocations_for_flight(flight_key))
            .sum()
    }

    /// True once the first bulk refresh has completed.
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn mark_populated(&mut self) {
        self.populated = true;
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            flights: self.flights.len(),
            resources: ResourceType::ALL
                .into_iter()
                .map(|t| self.resources(t).len())
                .sum(),
            allocations: ResourceType::ALL
                .into_iter()
                .map(|t| self.resources(t).allocation_count())
                .sum(),
        }
    }
}

/// Repository statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryStats {
    pub flights: usize,
    pub resources: usize,
    pub allocations: usize,
}

/// Lock-scoped access to a shared repository.
///
/// Callers go through these helpers instead of touching the guard type, so
/// the locking strategy can change without touching them.
pub trait RepositoryAccess {
    fn with_read<R>(&self, f: impl FnOnce(&Repository) -> R) -> R;
    fn with_write<R>(&self, f: impl FnOnce(&mut Repository) -> R) -> R;
}

impl RepositoryAccess for SharedRepository {
    fn with_read<R>(&self, f: impl FnOnce(&Repository) -> R) -> R {
        let guard = self.read();
        f(&guard)
    }

    fn with_write<R>(&self, f: impl FnOnce(&mut Repository) -> R) -> R {
        let mut guard = self.write();
        f(&mut guard)
    }
}

/// All airport repositories known to this process.
#[derive(Debug, Default)]
pub struct AirportStore {
    repositories: HashMap<String, SharedRepository>,
}

impl AirportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository, returning its shared handle.
    pub fn insert(&mut self, repository: Repository) -> SharedRepository {
        let code = repository.airport().to_string();
        let shared = Arc::new(RwLock::new(repository));
        self.repositories.insert(code, Arc::clone(&shared));
        shared
    }

    pub fn find(&self, airport: &str) -> Option<SharedRepository> {
        self.repositories.get(airport).cloned()
    }

    pub fn airports(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::*;

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut repo = Repository::new("SYD");
        repo.upsert(flight("QF", "1", "2025-01-01T10:00:00"));
        repo.upsert(flight("VA", "800", "2025-01-01T11:00:00"));

        let mut updated = flight("QF", "1", "2025-01-01T10:00:00");
        updated.custom_fields.insert("Remark".into(), "Boarding".into());
        assert_eq!(repo.upsert(updated), UpsertOutcome::Replaced);

        assert_eq!(repo.len(), 2);
        let first = repo.flights().iter().next().unwrap();
        assert_eq!(first.key(), "QF1@2025-01-01T10:00:00");
        assert_eq!(first.custom_fields.get("Remark").unwrap(), "Boarding");
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut repo = Repository::new("SYD");
        repo.upsert(flight("QF", "1", "2025-01-01T10:00:00"));
        repo.upsert(flight("QF", "2", "2025-01-01T11:00:00"));
        repo.upsert(flight("QF", "3", "2025-01-01T12:00:00"));

        assert!(repo.remove_by_key("QF1@2025-01-01T10:00:00").is_some());
        assert!(repo.remove_by_key("QF1@2025-01-01T10:00:00").is_none());
        assert_eq!(repo.get("QF3@2025-01-01T12:00:00").unwrap().flight_number, "3");
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_evict_before_drops_old_flights_and_allocations() {
        let mut repo = Repository::new("SYD");
        repo.add_resource(FixedResource::new(ResourceType::Stand, "A1", None));
        let old = with_slot(flight("QF", "1", "2024-12-30T10:00:00"), ResourceType::Stand, "A1");
        let old_key = old.key();
        crate::indexer::reindex(&mut repo, &old, true);
        repo.upsert(old);
        repo.upsert(flight("QF", "2", "2025-01-01T10:00:00"));

        let evicted = repo.evict_before(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(evicted, vec![old_key]);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.stats().allocations, 0);
    }

    #[test]
    fn test_resources_are_append_only() {
        let mut collection = ResourceCollection::new(ResourceType::Gate);
        assert!(collection.add_resource(FixedResource::new(ResourceType::Gate, "G12", Some("T1".into()))));
        assert!(!collection.add_resource(FixedResource::new(ResourceType::Gate, "G12", None)));
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get("G12").unwrap().area.as_deref(), Some("T1"));
    }

    #[test]
    fn test_store_find() {
        let mut store = AirportStore::new();
        let shared = store.insert(Repository::new("SYD"));
        shared.with_write(|repo| repo.upsert(flight("QF", "1", "2025-01-01T10:00:00")));

        let found = store.find("SYD").unwrap();
        assert_eq!(found.with_read(|repo| repo.len()), 1);
        assert!(store.find("MEL").is_none());
    }
}
