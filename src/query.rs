//! Query engine: authorizes, filters and redacts store contents into a
//! caller-scoped view.
//!
//! Both query shapes validate everything before touching a repository and
//! fail fast with a [`QueryError`]; no partial results are returned on
//! error. Disallowed custom-field constraints are not errors: they are
//! dropped and reported in the response's `warnings`.

use crate::profile::UserProfile;
use crate::storage::{AirportStore, Repository, RepositoryAccess};
use crate::types::{AllocationItem, FixedResource, Flight, FlightKind, ResourceType};
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_FROM_OFFSET_HOURS: i64 = -12;
pub const DEFAULT_TO_OFFSET_HOURS: i64 = 24;

fn default_from() -> i64 {
    DEFAULT_FROM_OFFSET_HOURS
}

fn default_to() -> i64 {
    DEFAULT_TO_OFFSET_HOURS
}

/// Caller-visible query failures. All of them are `InvalidRequest`-class:
/// never retried, reported with an HTTP status by the serving layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unknown airport: {0}")]
    UnknownAirport(String),
    #[error("Airport {0} not permitted for this user")]
    AirportNotPermitted(String),
    #[error("Airline {0} not permitted for this user")]
    AirlineNotPermitted(String),
    #[error("Malformed time parameter: {0}")]
    MalformedTime(String),
}

impl QueryError {
    /// Status the serving layer should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownAirport(_) | Self::MalformedTime(_) => StatusCode::BAD_REQUEST,
            Self::AirportNotPermitted(_) | Self::AirlineNotPermitted(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Custom-field name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: String,
}

impl FieldValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Flight query parameters, as handed over by the serving layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightQuery {
    #[serde(default)]
    pub airport: String,
    /// Prefix of "Arrival"/"Departure"; empty or absent means either.
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub airline: Option<String>,
    #[serde(default)]
    pub flight_number: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default = "default_from")]
    pub from_offset_hours: i64,
    #[serde(default = "default_to")]
    pub to_offset_hours: i64,
    /// RFC 3339 instant.
    #[serde(default)]
    pub updated_since: Option<String>,
    #[serde(default)]
    pub custom_fields: Vec<FieldValue>,
}

impl FlightQuery {
    pub fn new(airport: impl Into<String>) -> Self {
        Self {
            airport: airport.into(),
            direction: None,
            airline: None,
            flight_number: None,
            route: None,
            from_offset_hours: DEFAULT_FROM_OFFSET_HOURS,
            to_offset_hours: DEFAULT_TO_OFFSET_HOURS,
            updated_since: None,
            custom_fields: Vec::new(),
        }
    }

    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    pub fn with_airline(mut self, airline: impl Into<String>) -> Self {
        self.airline = Some(airline.into());
        self
    }

    pub fn with_window(mut self, from_offset_hours: i64, to_offset_hours: i64) -> Self {
        self.from_offset_hours = from_offset_hours;
        self.to_offset_hours = to_offset_hours;
        self
    }

    pub fn with_custom_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_fields.push(FieldValue::new(name, value));
        self
    }
}

/// Allocation query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationQuery {
    #[serde(default)]
    pub airport: String,
    /// Substring of the flight designator, e.g. "QF1".
    #[serde(default)]
    pub flight: Option<String>,
    #[serde(default)]
    pub airline: Option<String>,
    #[serde(default)]
    pub resource_type: Option<ResourceType>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default = "default_from")]
    pub from_offset_hours: i64,
    #[serde(default = "default_to")]
    pub to_offset_hours: i64,
    #[serde(default)]
    pub updated_since: Option<String>,
}

impl AllocationQuery {
    pub fn new(airport: impl Into<String>) -> Self {
        Self {
            airport: airport.into(),
            flight: None,
            airline: None,
            resource_type: None,
            resource_name: None,
            from_offset_hours: DEFAULT_FROM_OFFSET_HOURS,
            to_offset_hours: DEFAULT_TO_OFFSET_HOURS,
            updated_since: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    pub fn with_window(mut self, from_offset_hours: i64, to_offset_hours: i64) -> Self {
        self.from_offset_hours = from_offset_hours;
        self.to_offset_hours = to_offset_hours;
        self
    }
}

/// How an unset (empty) allowed-field list is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsetFieldPolicy {
    AllowAll,
    AllowNone,
}

/// Redaction rules for callers without an allowed custom-field list.
///
/// The defaults keep the long-standing asymmetry: such callers see no custom
/// fields but every entry of the change list. Both are configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionPolicy {
    pub fields_when_unset: UnsetFieldPolicy,
    pub changes_when_unset: UnsetFieldPolicy,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            fields_when_unset: UnsetFieldPolicy::AllowNone,
            changes_when_unset: UnsetFieldPolicy::AllowAll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightResponse {
    pub airport: String,
    pub flights: Vec<Flight>,
    pub warnings: Vec<String>,
}

/// Allocation joined with its owning resource's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationView {
    pub resource_type: ResourceType,
    pub resource: String,
    pub area: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub flight_key: String,
    pub airline: String,
    pub flight_number: String,
    pub kind: FlightKind,
    pub route: String,
    pub aircraft_type: Option<String>,
    pub registration: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl AllocationView {
    fn new(resource: &FixedResource, item: &AllocationItem) -> Self {
        Self {
            resource_type: resource.resource_type,
            resource: resource.name.clone(),
            area: resource.area.clone(),
            start: item.start,
            end: item.end,
            flight_key: item.flight_key.clone(),
            airline: item.airline.clone(),
            flight_number: item.flight_number.clone(),
            kind: item.kind,
            route: item.route.clone(),
            aircraft_type: item.aircraft_type.clone(),
            registration: item.registration.clone(),
            last_update: item.last_update,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub airport: String,
    pub allocations: Vec<AllocationView>,
    pub warnings: Vec<String>,
}

/// Filter custom-field constraints to what the caller may query, then merge
/// the caller's defaults. Defaults win on conflict.
pub fn resolve_custom_fields(
    requested: &[FieldValue],
    profile: &UserProfile,
) -> (Vec<FieldValue>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut constraints: Vec<FieldValue> = Vec::new();

    for field in requested {
        if profile.allows_custom_field(&field.name) {
            constraints.push(field.clone());
        } else {
            warnings.push(format!(
                "Custom field '{}' is not permitted and was ignored",
                field.name
            ));
        }
    }

    for default in &profile.default_query_fields {
        match constraints.iter_mut().find(|c| c.name == default.name) {
            Some(existing) if existing.value != default.value => {
                warnings.push(format!(
                    "Custom field '{}' overridden by user default '{}'",
                    default.name, default.value
                ));
                existing.value = default.value.clone();
            }
            Some(_) => {}
            None => constraints.push(default.clone()),
        }
    }

    (constraints, warnings)
}

/// Shallow copy of `flight` holding only what `profile` may see.
pub fn prune(flight: &Flight, profile: &UserProfile, policy: &RedactionPolicy) -> Flight {
    let mut pruned = flight.clone();

    let unset = profile.custom_fields_unset();
    let copy_all_fields =
        profile.all_custom_fields() || (unset && policy.fields_when_unset == UnsetFieldPolicy::AllowAll);
    if !copy_all_fields {
        pruned
            .custom_fields
            .retain(|name, _| profile.allows_custom_field(name));
    }

    let all_changes =
        profile.all_custom_fields() || (unset && policy.changes_when_unset == UnsetFieldPolicy::AllowAll);
    if !all_changes {
        pruned
            .changes
            .properties
            .retain(|change| profile.allows_custom_field(&change.name));
    }

    pruned
}

fn parse_updated_since(value: Option<&str>) -> Result<Option<DateTime<Utc>>, QueryError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            DateTime::parse_from_rfc3339(v.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| QueryError::MalformedTime(v.to_string()))
        })
        .transpose()
}

fn window(now: DateTime<Utc>, from: i64, to: i64) -> Result<(DateTime<Utc>, DateTime<Utc>), QueryError> {
    if from > to {
        return Err(QueryError::MalformedTime(format!(
            "window start offset {from}h is after end offset {to}h"
        )));
    }
    let offset = |hours: i64| {
        Duration::try_hours(hours)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| QueryError::MalformedTime(format!("offset {hours}h is out of range")))
    };
    Ok((offset(from)?, offset(to)?))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Read-only query front end over the airport store.
pub struct QueryEngine {
    store: Arc<AirportStore>,
    policy: RedactionPolicy,
}

impl QueryEngine {
    pub fn new(store: Arc<AirportStore>) -> Self {
        Self {
            store,
            policy: RedactionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RedactionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RedactionPolicy {
        &self.policy
    }

    fn authorize(&self, airport: &str, airline: Option<&str>, profile: &UserProfile) -> Result<(), QueryError> {
        if !profile.allows_airport(airport) {
            return Err(QueryError::AirportNotPermitted(airport.to_string()));
        }
        if let Some(airline) = airline {
            if !profile.allows_airline(airline) {
                return Err(QueryError::AirlineNotPermitted(airline.to_string()));
            }
        }
        Ok(())
    }

    pub fn handle_query(&self, query: &FlightQuery, profile: &UserProfile) -> Result<FlightResponse, QueryError> {
        self.handle_query_at(query, profile, Utc::now())
    }

    pub fn handle_query_at(
        &self,
        query: &FlightQuery,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<FlightResponse, QueryError> {
        let (from, to) = window(now, query.from_offset_hours, query.to_offset_hours)?;
        let updated_since = parse_updated_since(query.updated_since.as_deref())?;
        let airline = non_empty(query.airline.as_deref()).or(profile.default_airline.as_deref());

        let repository = self
            .store
            .find(&query.airport)
            .ok_or_else(|| QueryError::UnknownAirport(query.airport.clone()))?;
        self.authorize(&query.airport, airline, profile)?;

        let (constraints, warnings) = resolve_custom_fields(&query.custom_fields, profile);
        let filter = FlightFilter {
            from,
            to,
            constraints: &constraints,
            direction: non_empty(query.direction.as_deref()),
            airline,
            route: non_empty(query.route.as_deref()),
            flight_number: non_empty(query.flight_number.as_deref()),
            updated_since,
            profile,
        };

        let mut flights = repository.with_read(|repo| {
            repo.flights()
                .iter()
                .filter(|f| filter.matches(f))
                .map(|f| prune(f, profile, &self.policy))
                .collect::<Vec<_>>()
        });
        flights.sort_by_key(|f| f.scheduled);

        tracing::debug!(
            airport = %query.airport,
            user = %profile.name,
            results = flights.len(),
            "Flight query"
        );

        Ok(FlightResponse {
            airport: query.airport.clone(),
            flights,
            warnings,
        })
    }

    pub fn handle_allocation_query(
        &self,
        query: &AllocationQuery,
        profile: &UserProfile,
    ) -> Result<AllocationResponse, QueryError> {
        self.handle_allocation_query_at(query, profile, Utc::now())
    }

    pub fn handle_allocation_query_at(
        &self,
        query: &AllocationQuery,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<AllocationResponse, QueryError> {
        let (from, to) = window(now, query.from_offset_hours, query.to_offset_hours)?;
        let updated_since = parse_updated_since(query.updated_since.as_deref())?;
        let airline = non_empty(query.airline.as_deref());

        let repository = self
            .store
            .find(&query.airport)
            .ok_or_else(|| QueryError::UnknownAirport(query.airport.clone()))?;
        self.authorize(&query.airport, airline, profile)?;

        let flight = non_empty(query.flight.as_deref());
        let resource_name = non_empty(query.resource_name.as_deref());
        let types: Vec<ResourceType> = match query.resource_type {
            Some(t) => vec![t],
            None => ResourceType::ALL.to_vec(),
        };

        let mut allocations = repository.with_read(|repo| {
            collect_allocations(repo, &types, |resource, item| {
                resource_name.map_or(true, |n| resource.name == n)
                    && item.overlaps(from, to)
                    && flight.map_or(true, |f| {
                        format!("{}{}", item.airline, item.flight_number).contains(f)
                    })
                    && airline.map_or(true, |a| item.airline.contains(a))
                    && updated_since.map_or(true, |since| item.last_update >= since)
                    && (profile.all_airlines() || profile.allows_airline(&item.airline))
            })
        });
        allocations.sort_by_key(|a| a.start);

        Ok(AllocationResponse {
            airport: query.airport.clone(),
            allocations,
            warnings: Vec::new(),
        })
    }
}

fn collect_allocations<F>(repo: &Repository, types: &[ResourceType], keep: F) -> Vec<AllocationView>
where
    F: Fn(&FixedResource, &AllocationItem) -> bool,
{
    let keep = &keep;
    types
        .iter()
        .flat_map(|t| repo.resources(*t).iter())
        .flat_map(|resource| {
            resource
                .allocations
                .iter()
                .filter(move |item| keep(resource, item))
                .map(move |item| AllocationView::new(resource, item))
        })
        .collect()
}

/// Per-flight predicate, applied in a fixed order.
struct FlightFilter<'a> {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    constraints: &'a [FieldValue],
    direction: Option<&'a str>,
    airline: Option<&'a str>,
    route: Option<&'a str>,
    flight_number: Option<&'a str>,
    updated_since: Option<DateTime<Utc>>,
    profile: &'a UserProfile,
}

impl FlightFilter<'_> {
    fn matches(&self, flight: &Flight) -> bool {
        if flight.scheduled < self.from || flight.scheduled > self.to {
            return false;
        }
        if !self
            .constraints
            .iter()
            .all(|c| flight.custom_fields.get(&c.name) == Some(&c.value))
        {
            return false;
        }
        if let Some(direction) = self.direction {
            if !flight.kind.matches_prefix(direction) {
                return false;
            }
        }
        if let Some(airline) = self.airline {
            if flight.airline.iata.as_deref() != Some(airline) && flight.airline.icao.as_deref() != Some(airline) {
                return false;
            }
        }
        if let Some(route) = self.route {
            if !flight.route_string().contains(route) {
                return false;
            }
        }
        if let Some(number) = self.flight_number {
            if !flight.flight_number.contains(number) && !flight.designator().contains(number) {
                return false;
            }
        }
        if let Some(since) = self.updated_since {
            if flight.last_update < since {
                return false;
            }
        }
        self.profile.all_airlines() || self.profile.allows_airline(flight.airline.preferred())
    }
}
