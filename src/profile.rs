//! Caller profiles and their change/push subscriptions.
//!
//! Profiles are loaded from configuration and replaced wholesale on reload.
//! They live in a [`ProfileRegistry`] guarded by its own lock, independent of
//! the airport store.

use crate::query::{AllocationQuery, FieldValue, FlightQuery};
use crate::scheduler::Cadence;
use crate::types::ResourceType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const WILDCARD: &str = "*";

fn contains_or_wildcard(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v == WILDCARD || v == value)
}

fn default_true() -> bool {
    true
}

/// Access-control and query defaults for one caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    /// Credential the HTTP layer maps to this profile.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub allowed_airports: Vec<String>,
    #[serde(default)]
    pub allowed_airlines: Vec<String>,
    #[serde(default)]
    pub allowed_custom_fields: Vec<String>,
    #[serde(default)]
    pub default_airline: Option<String>,
    /// Field constraints merged into every flight query this caller makes.
    #[serde(default)]
    pub default_query_fields: Vec<FieldValue>,
    #[serde(default)]
    pub change_subscriptions: Vec<UserChangeSubscription>,
    #[serde(default)]
    pub push_subscriptions: Vec<UserPushSubscription>,
}

impl UserProfile {
    pub fn allows_airport(&self, airport: &str) -> bool {
        contains_or_wildcard(&self.allowed_airports, airport)
    }

    pub fn all_airlines(&self) -> bool {
        self.allowed_airlines.iter().any(|a| a == WILDCARD)
    }

    pub fn allows_airline(&self, airline: &str) -> bool {
        contains_or_wildcard(&self.allowed_airlines, airline)
    }

    pub fn all_custom_fields(&self) -> bool {
        self.allowed_custom_fields.iter().any(|f| f == WILDCARD)
    }

    pub fn allows_custom_field(&self, field: &str) -> bool {
        contains_or_wildcard(&self.allowed_custom_fields, field)
    }

    /// True if no custom-field visibility has been configured at all.
    pub fn custom_fields_unset(&self) -> bool {
        self.allowed_custom_fields.is_empty()
    }
}

/// Standing registration that pushes a flight as soon as a matching
/// mutation is ingested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserChangeSubscription {
    pub airport: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub destination: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub check_in: bool,
    #[serde(default)]
    pub gate: bool,
    #[serde(default)]
    pub stand: bool,
    #[serde(default)]
    pub carousel: bool,
    #[serde(default)]
    pub chute: bool,
    /// Aircraft type or registration changes.
    #[serde(default)]
    pub aircraft: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
    /// Named properties that trigger a push regardless of category.
    #[serde(default)]
    pub properties: Vec<String>,
}

impl UserChangeSubscription {
    /// Category flag for one resource type.
    pub fn category(&self, resource_type: ResourceType) -> bool {
        match resource_type {
            ResourceType::CheckIn => self.check_in,
            ResourceType::Gate => self.gate,
            ResourceType::Stand => self.stand,
            ResourceType::Carousel => self.carousel,
            ResourceType::Chute => self.chute,
        }
    }
}

/// What a push subscription replays on each firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushKind {
    Flights(FlightQuery),
    Resources(AllocationQuery),
}

/// Standing registration that re-runs a query on a schedule and pushes
/// the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPushSubscription {
    pub id: String,
    pub airport: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub destination: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub kind: PushKind,
    pub cadence: Cadence,
    #[serde(default)]
    pub push_on_startup: bool,
}

/// Process-wide profile table.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, Arc<UserProfile>>>,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<UserProfile>) -> Self {
        let registry = Self::default();
        registry.replace_all(profiles);
        registry
    }

    /// Swap in a freshly loaded profile set.
    pub fn replace_all(&self, profiles: Vec<UserProfile>) {
        let table = profiles
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        *self.profiles.write() = table;
    }

    pub fn get(&self, name: &str) -> Option<Arc<UserProfile>> {
        self.profiles.read().get(name).cloned()
    }

    pub fn find_by_token(&self, token: &str) -> Option<Arc<UserProfile>> {
        self.profiles
            .read()
            .values()
            .find(|p| p.token.as_deref() == Some(token))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }

    /// Enabled change subscriptions scoped to `airport`, tagged with the owner.
    pub fn change_subscriptions(&self, airport: &str) -> Vec<(String, UserChangeSubscription)> {
        let profiles = self.profiles.read();
        let mut subs: Vec<_> = profiles
            .values()
            .flat_map(|p| {
                p.change_subscriptions
                    .iter()
                    .filter(|s| s.enabled && s.airport == airport)
                    .map(|s| (p.name.clone(), s.clone()))
            })
            .collect();
        subs.sort_by(|a, b| a.0.cmp(&b.0));
        subs
    }

    /// Enabled push subscriptions scoped to `airport`, tagged with the owner.
    pub fn push_subscriptions(&self, airport: &str) -> Vec<(String, UserPushSubscription)> {
        let profiles = self.profiles.read();
        let mut subs: Vec<_> = profiles
            .values()
            .flat_map(|p| {
                p.push_subscriptions
                    .iter()
                    .filter(|s| s.enabled && s.airport == airport)
                    .map(|s| (p.name.clone(), s.clone()))
            })
            .collect();
        subs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        subs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> UserProfile {
        UserProfile {
            name: name.to_string(),
            token: Some(format!("{name}-token")),
            allowed_airports: vec!["SYD".into()],
            allowed_airlines: vec!["QF".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_wildcards() {
        let mut p = profile("ops");
        assert!(p.allows_airline("QF"));
        assert!(!p.allows_airline("VA"));
        p.allowed_airlines = vec![WILDCARD.into()];
        assert!(p.all_airlines());
        assert!(p.allows_airline("VA"));
        assert!(p.custom_fields_unset());
    }

    #[test]
    fn test_registry_lookup_and_reload() {
        let registry = ProfileRegistry::new(vec![profile("ops"), profile("ground")]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_token("ops-token").unwrap().name, "ops");

        registry.replace_all(vec![profile("tower")]);
        assert!(registry.get("ops").is_none());
        assert!(registry.get("tower").is_some());
    }

    #[test]
    fn test_change_subscriptions_filtered_by_airport_and_enabled() {
        let mut p = profile("ops");
        p.change_subscriptions = vec![
            UserChangeSubscription {
                airport: "SYD".into(),
                enabled: true,
                destination: "http://a".into(),
                ..Default::default()
            },
            UserChangeSubscription {
                airport: "SYD".into(),
                enabled: false,
                destination: "http://b".into(),
                ..Default::default()
            },
            UserChangeSubscription {
                airport: "MEL".into(),
                enabled: true,
                destination: "http://c".into(),
                ..Default::default()
            },
        ];
        let registry = ProfileRegistry::new(vec![p]);
        let subs = registry.change_subscriptions("SYD");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "ops");
        assert_eq!(subs[0].1.destination, "http://a");
    }
}
