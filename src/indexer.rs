//! Derives resource allocations from a flight's slots.
//!
//! Slot data arrives as a full snapshot on every write, so allocations for a
//! flight are always rebuilt as a unit: remove everything for the key, then
//! insert what the current slots describe.

use crate::storage::Repository;
use crate::types::{AllocationItem, Flight, ResourceType};

/// One allocation per slot, per resource type.
///
/// A slot without explicit start/end times falls back to the flight's
/// scheduled instant.
pub fn allocations_for(flight: &Flight) -> Vec<AllocationItem> {
    let key = flight.key();
    let route = flight.route_string();
    let airline = flight.airline.preferred().to_string();

    ResourceType::ALL
        .into_iter()
        .flat_map(move |resource_type| {
            flight
                .slots_of(resource_type)
                .iter()
                .map(move |slot| (resource_type, slot))
        })
        .map(|(resource_type, slot)| {
            let start = slot.start.unwrap_or(flight.scheduled);
            let end = slot.end.unwrap_or(flight.scheduled).max(start);
            AllocationItem {
                resource_type,
                resource: slot.resource.clone(),
                start,
                end,
                flight_key: key.clone(),
                airline: airline.clone(),
                flight_number: flight.flight_number.clone(),
                kind: flight.kind,
                route: route.clone(),
                aircraft_type: flight.aircraft_type.clone(),
                registration: flight.registration.clone(),
                last_update: flight.last_update,
            }
        })
        .collect()
}

/// Rebuild the allocation index entries for `flight`.
///
/// `bypass_delete` skips the removal pass; only valid when the repository
/// is known to hold no allocations for this flight (first population).
/// Returns the number of allocations inserted.
pub fn reindex(repo: &mut Repository, flight: &Flight, bypass_delete: bool) -> usize {
    if !bypass_delete {
        repo.remove_allocations_for_flight(&flight.key());
    }

    allocations_for(flight)
        .into_iter()
        .map(|item| repo.add_allocation(item))
        .filter(|added| *added)
        .count()
}

/// Remove every allocation of a deleted flight.
pub fn purge(repo: &mut Repository, flight_key: &str) -> usize {
    repo.remove_allocations_for_flight(flight_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::*;
    use crate::types::{FixedResource, Slot};

    fn repo_with_resources() -> Repository {
        let mut repo = Repository::new("SYD");
        for (t, name) in [
            (ResourceType::Stand, "A1"),
            (ResourceType::Stand, "A2"),
            (ResourceType::Gate, "G12"),
            (ResourceType::CheckIn, "C01"),
        ] {
            repo.add_resource(FixedResource::new(t, name, None));
        }
        repo
    }

    #[test]
    fn test_one_allocation_per_slot() {
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        let f = with_slot(f, ResourceType::Gate, "G12");
        let f = with_slot(f, ResourceType::CheckIn, "C01");

        let items = allocations_for(&f);
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.flight_key == "QF1@2025-01-01T10:00:00"));
        assert_eq!(items[0].resource_type, ResourceType::CheckIn);
    }

    #[test]
    fn test_missing_slot_times_use_schedule() {
        let mut f = flight("QF", "1", "2025-01-01T10:00:00");
        f.slots.insert(
            ResourceType::Stand,
            vec![Slot {
                resource: "A1".into(),
                start: None,
                end: None,
            }],
        );
        let items = allocations_for(&f);
        assert_eq!(items[0].start, f.scheduled);
        assert_eq!(items[0].end, f.scheduled);
    }

    #[test]
    fn test_reindex_moves_allocation() {
        let mut repo = repo_with_resources();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        assert_eq!(reindex(&mut repo, &f, true), 1);

        let moved = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A2");
        assert_eq!(reindex(&mut repo, &moved, false), 1);

        let stands = repo.resources(ResourceType::Stand);
        assert!(stands.get("A1").unwrap().allocations.is_empty());
        assert_eq!(stands.get("A2").unwrap().allocations.len(), 1);
    }

    #[test]
    fn test_reindex_twice_is_idempotent() {
        let mut repo = repo_with_resources();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Gate, "G12");
        reindex(&mut repo, &f, false);
        reindex(&mut repo, &f, false);
        assert_eq!(repo.stats().allocations, 1);
    }

    #[test]
    fn test_unknown_resource_not_counted() {
        let mut repo = repo_with_resources();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Chute, "X9");
        assert_eq!(reindex(&mut repo, &f, false), 0);
    }

    #[test]
    fn test_purge() {
        let mut repo = repo_with_resources();
        let f = with_slot(flight("QF", "1", "2025-01-01T10:00:00"), ResourceType::Stand, "A1");
        reindex(&mut repo, &f, true);
        assert_eq!(purge(&mut repo, &f.key()), 1);
        assert_eq!(repo.stats().allocations, 0);
    }
}
