//! Core data types for flights, slots and resource allocations.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Arrival or departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightKind {
    Arrival,
    Departure,
}

impl FlightKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Arrival => "Arrival",
            Self::Departure => "Departure",
        }
    }

    /// Case-insensitive prefix match, so "D", "dep" and "Departure" all match departures.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return true;
        }
        self.as_str()
            .to_ascii_lowercase()
            .starts_with(&prefix.to_ascii_lowercase())
    }
}

impl fmt::Display for FlightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlightKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" | "a" => Ok(Self::Arrival),
            "departure" | "d" => Ok(Self::Departure),
            other => Err(format!("unknown flight kind: {other}")),
        }
    }
}

/// What happened to a flight the last time it was written.
///
/// `Status` marks records written by a bulk refresh or returned by a query,
/// where no individual mutation is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    Status,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Status => "status",
        };
        f.write_str(s)
    }
}

/// The five fixed-resource categories tracked per airport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    CheckIn,
    Gate,
    Stand,
    Carousel,
    Chute,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::CheckIn,
        ResourceType::Gate,
        ResourceType::Stand,
        ResourceType::Carousel,
        ResourceType::Chute,
    ];

    /// Element name of the resource inside a slot, e.g. `<Stand>`.
    pub const fn element(&self) -> &'static str {
        match self {
            Self::CheckIn => "CheckIn",
            Self::Gate => "Gate",
            Self::Stand => "Stand",
            Self::Carousel => "Carousel",
            Self::Chute => "Chute",
        }
    }

    /// Container element holding this type's slots on a flight.
    pub const fn slots_element(&self) -> &'static str {
        match self {
            Self::CheckIn => "CheckInSlots",
            Self::Gate => "GateSlots",
            Self::Stand => "StandSlots",
            Self::Carousel => "CarouselSlots",
            Self::Chute => "ChuteSlots",
        }
    }

    pub const fn slot_element(&self) -> &'static str {
        match self {
            Self::CheckIn => "CheckInSlot",
            Self::Gate => "GateSlot",
            Self::Stand => "StandSlot",
            Self::Carousel => "CarouselSlot",
            Self::Chute => "ChuteSlot",
        }
    }

    /// Element describing a structural change to this type's slots.
    pub const fn slots_change_element(&self) -> &'static str {
        match self {
            Self::CheckIn => "CheckInSlotsChange",
            Self::Gate => "GateSlotsChange",
            Self::Stand => "StandSlotsChange",
            Self::Carousel => "CarouselSlotsChange",
            Self::Chute => "ChuteSlotsChange",
        }
    }

    /// Property name that upstream uses in a flight's change list for this category.
    pub const fn change_property(&self) -> &'static str {
        match self {
            Self::CheckIn => "CheckInCounters",
            Self::Gate => "Gate",
            Self::Stand => "Stand",
            Self::Carousel => "Carousel",
            Self::Chute => "Chute",
        }
    }

    /// Resource-listing request name on the upstream service.
    pub const fn listing_operation(&self) -> &'static str {
        match self {
            Self::CheckIn => "GetCheckIns",
            Self::Gate => "GetGates",
            Self::Stand => "GetStands",
            Self::Carousel => "GetCarousels",
            Self::Chute => "GetChutes",
        }
    }

    pub fn from_change_property(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.change_property() == name)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkin" | "checkins" | "check-in" | "checkincounters" => Ok(Self::CheckIn),
            "gate" | "gates" => Ok(Self::Gate),
            "stand" | "stands" => Ok(Self::Stand),
            "carousel" | "carousels" => Ok(Self::Carousel),
            "chute" | "chutes" => Ok(Self::Chute),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

/// Designators for one entity in several code systems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSet {
    pub iata: Option<String>,
    pub icao: Option<String>,
}

impl CodeSet {
    pub fn iata(code: impl Into<String>) -> Self {
        Self {
            iata: Some(code.into()),
            icao: None,
        }
    }

    /// IATA code, falling back to ICAO.
    pub fn preferred(&self) -> &str {
        self.iata
            .as_deref()
            .or(self.icao.as_deref())
            .unwrap_or("")
    }
}

/// A flight's assignment to one named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub resource: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Which parts of a flight differ from its previous version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightChanges {
    pub properties: Vec<PropertyChange>,
    /// Categories whose slot structure changed.
    pub slot_changes: BTreeSet<ResourceType>,
    pub aircraft_type: bool,
    pub aircraft_registration: bool,
}

impl FlightChanges {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
            && self.slot_changes.is_empty()
            && !self.aircraft_type
            && !self.aircraft_registration
    }

    pub fn contains(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p.name == property)
    }
}

/// One scheduled arrival or departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flight {
    pub kind: FlightKind,
    pub airline: CodeSet,
    pub flight_number: String,
    pub airport: CodeSet,
    pub scheduled_date: NaiveDate,
    /// Scheduled time exactly as received; part of the flight key.
    pub scheduled_time: String,
    pub scheduled: DateTime<Utc>,
    pub route: Vec<CodeSet>,
    pub aircraft_type: Option<String>,
    pub registration: Option<String>,
    pub custom_fields: BTreeMap<String, String>,
    pub slots: BTreeMap<ResourceType, Vec<Slot>>,
    pub changes: FlightChanges,
    pub action: Action,
    pub last_update: DateTime<Utc>,
}

impl Flight {
    /// Derived identity: `<airline IATA><number>@<scheduled time>`.
    pub fn key(&self) -> String {
        format!(
            "{}{}@{}",
            self.airline.preferred(),
            self.flight_number,
            self.scheduled_time
        )
    }

    /// Short designator such as `QF1`.
    pub fn designator(&self) -> String {
        format!("{}{}", self.airline.preferred(), self.flight_number)
    }

    pub fn route_string(&self) -> String {
        self.route
            .iter()
            .map(|c| c.preferred())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn slots_of(&self, resource_type: ResourceType) -> &[Slot] {
        self.slots
            .get(&resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A named physical resource at one airport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedResource {
    pub resource_type: ResourceType,
    pub name: String,
    pub area: Option<String>,
    #[serde(default, skip_serializing)]
    pub allocations: Vec<AllocationItem>,
}

impl FixedResource {
    pub fn new(resource_type: ResourceType, name: impl Into<String>, area: Option<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
            area,
            allocations: Vec::new(),
        }
    }
}

/// Time-bounded assignment of a flight to a resource, derived from a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationItem {
    pub resource_type: ResourceType,
    pub resource: String,
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

impl AllocationItem {
    /// True if the allocation intersects `[from, to]` (inclusive).
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start <= to && self.end >= from
    }
}
