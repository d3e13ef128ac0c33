//! Decoder for upstream XML messages.
//!
//! Three message families arrive from the airport-management system:
//!
//! * change notifications (`FlightCreatedNotification`,
//!   `FlightUpdatedNotification`, `FlightDeletedNotification`), each
//!   wrapping one `Flight`;
//! * bulk flight responses, whose payload may be a nested, escaped envelope
//!   inside the SOAP result element;
//! * fixed-resource listings.
//!
//! Documents are first read into a small element tree with `quick-xml`, then
//! mapped onto domain types. Payloads missing identity fields are rejected
//! rather than decoded into empty records.

use crate::types::{
    Action, CodeSet, FixedResource, Flight, FlightChanges, FlightKind, PropertyChange,
    ResourceType, Slot,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Document is empty")]
    Empty,
    #[error("Unbalanced document")]
    Unbalanced,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("Not a flight notification: <{0}>")]
    UnknownMessage(String),
    #[error("Server returned fault: {0}")]
    ServerResponse(String),
}

/// Nested envelopes deeper than this are not unwrapped.
const MAX_NESTING: usize = 3;

/// Minimal XML element: local name, attributes, children and text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, ParseError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Depth-first search for the first element called `name`, self included.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Outermost elements called `name`; matches are not searched inside.
    pub fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        if self.name == name {
            out.push(self);
            return;
        }
        for child in &self.children {
            child.find_all(name, out);
        }
    }

    /// Value of a field written either as `<Value propertyName="x">` or `<x>`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|c| c.name == "Value" && c.attr("propertyName") == Some(name))
            .or_else(|| self.child(name))
            .map(Element::text)
            .filter(|t| !t.is_empty())
    }

    /// Code for a given `codeContext` among repeated designator elements.
    fn code(&self, element: &str, context: &str) -> Option<String> {
        self.children_named(element)
            .find(|c| c.attr("codeContext") == Some(context))
            .map(|c| c.text().to_string())
            .filter(|t| !t.is_empty())
    }

    fn code_set(&self, element: &str) -> CodeSet {
        CodeSet {
            iata: self.code(element, "IATA"),
            icao: self.code(element, "ICAO"),
        }
    }

    fn has_content(&self) -> bool {
        !self.children.is_empty() || !self.text().is_empty()
    }
}

/// Read an XML document into an element tree.
pub fn parse_document(xml: &str) -> Result<Element, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Synthetic root collects top-level elements.
    let mut stack: Vec<Element> = vec![Element::default()];

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                stack
                    .last_mut()
                    .ok_or(ParseError::Unbalanced)?
                    .children
                    .push(element);
            }
            Event::End(_) => {
                let element = stack.pop().ok_or(ParseError::Unbalanced)?;
                stack
                    .last_mut()
                    .ok_or(ParseError::Unbalanced)?
                    .children
                    .push(element);
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(ParseError::Unbalanced);
    }
    stack
        .pop()
        .and_then(|root| root.children.into_iter().next())
        .ok_or(ParseError::Empty)
}

/// Parse an upstream instant. Values without an offset are taken as UTC.
pub fn parse_instant(field: &'static str, value: &str) -> Result<DateTime<Utc>, ParseError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// A decoded change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub action: Action,
    pub flight: Flight,
}

fn notification_action(name: &str) -> Option<Action> {
    match name {
        "FlightCreatedNotification" => Some(Action::Create),
        "FlightUpdatedNotification" => Some(Action::Update),
        "FlightDeletedNotification" => Some(Action::Delete),
        _ => None,
    }
}

fn find_notification(element: &Element) -> Option<(Action, &Element)> {
    if let Some(action) = notification_action(&element.name) {
        return Some((action, element));
    }
    element.children.iter().find_map(find_notification)
}

fn check_fault(root: &Element) -> Result<(), ParseError> {
    match root.find("Fault") {
        Some(fault) => {
            let reason = fault
                .find("faultstring")
                .or_else(|| fault.find("Text"))
                .map(|e| e.text().to_string())
                .unwrap_or_else(|| "unknown fault".to_string());
            Err(ParseError::ServerResponse(reason))
        }
        None => Ok(()),
    }
}

/// Validate a response that carries no payload of interest.
pub fn check_response(xml: &str) -> Result<(), ParseError> {
    check_fault(&parse_document(xml)?)
}

/// Decode a change-notification envelope.
pub fn parse_notification(xml: &str) -> Result<Notification, ParseError> {
    let root = parse_document(xml)?;
    check_fault(&root)?;

    let (action, message) =
        find_notification(&root).ok_or_else(|| ParseError::UnknownMessage(root.name.clone()))?;
    let flight_el = message
        .child("Flight")
        .ok_or(ParseError::MissingField("Flight"))?;

    let mut flight = flight_from_element(flight_el)?;
    if let Some(changes) = message
        .child("FlightChanges")
        .or_else(|| flight_el.child("FlightChanges"))
    {
        flight.changes = changes_from_element(changes);
    }
    flight.action = action;

    Ok(Notification { action, flight })
}

/// Decode a bulk flight response. Malformed flights are skipped with a
/// warning; a missing or undecodable envelope is an error.
pub fn parse_flights(xml: &str) -> Result<Vec<Flight>, ParseError> {
    let root = parse_document(xml)?;
    check_fault(&root)?;

    let elements = find_payload(&root, "Flight", 0)?;
    let mut flights = Vec::with_capacity(elements.len());
    for element in &elements {
        match flight_from_element(element) {
            Ok(flight) => flights.push(flight),
            Err(e) => tracing::warn!("Skipping malformed flight in bulk response: {}", e),
        }
    }
    Ok(flights)
}

/// Decode a fixed-resource listing for one resource type.
pub fn parse_resources(
    xml: &str,
    resource_type: ResourceType,
) -> Result<Vec<FixedResource>, ParseError> {
    let root = parse_document(xml)?;
    check_fault(&root)?;

    let elements = find_payload(&root, "FixedResource", 0)?;
    Ok(elements
        .iter()
        .filter_map(|el| {
            let name = el.field("Name")?;
            Some(FixedResource::new(
                resource_type,
                name,
                el.field("Area").map(str::to_string),
            ))
        })
        .collect())
}

/// Collect `name` elements, unwrapping an escaped nested envelope if the
/// outer document carries its payload as text.
fn find_payload(root: &Element, name: &str, depth: usize) -> Result<Vec<Element>, ParseError> {
    let mut found = Vec::new();
    root.find_all(name, &mut found);
    if !found.is_empty() || depth >= MAX_NESTING {
        return Ok(found.into_iter().cloned().collect());
    }

    match nested_document(root) {
        Some(text) => {
            let inner = parse_document(text)?;
            check_fault(&inner)?;
            find_payload(&inner, name, depth + 1)
        }
        None => Ok(Vec::new()),
    }
}

fn nested_document(element: &Element) -> Option<&str> {
    let text = element.text();
    if text.starts_with('<') {
        return Some(text);
    }
    element.children.iter().find_map(nested_document)
}

fn flight_from_element(el: &Element) -> Result<Flight, ParseError> {
    let id = el.child("FlightId").ok_or(ParseError::MissingField("FlightId"))?;
    let state = el.child("FlightState");

    let kind_text = id
        .field("FlightKind")
        .ok_or(ParseError::MissingField("FlightKind"))?;
    let kind: FlightKind = kind_text.parse().map_err(|_| ParseError::InvalidValue {
        field: "FlightKind",
        value: kind_text.to_string(),
    })?;

    let airline = id.code_set("AirlineDesignator");
    if airline.iata.is_none() {
        return Err(ParseError::MissingField("AirlineDesignator"));
    }
    let flight_number = id
        .field("FlightNumber")
        .ok_or(ParseError::MissingField("FlightNumber"))?
        .to_string();

    let scheduled_time = state
        .and_then(|s| s.field("ScheduledTime"))
        .or_else(|| id.field("ScheduledTime"))
        .ok_or(ParseError::MissingField("ScheduledTime"))?
        .to_string();
    let scheduled = parse_instant("ScheduledTime", &scheduled_time)?;

    let scheduled_date = match id.field("ScheduledDate") {
        Some(date) => NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
            ParseError::InvalidValue {
                field: "ScheduledDate",
                value: date.to_string(),
            }
        })?,
        None => scheduled.date_naive(),
    };

    let mut flight = Flight {
        kind,
        airline,
        flight_number,
        airport: id.code_set("AirportCode"),
        scheduled_date,
        scheduled_time,
        scheduled,
        route: Vec::new(),
        aircraft_type: None,
        registration: None,
        custom_fields: BTreeMap::new(),
        slots: BTreeMap::new(),
        changes: FlightChanges::default(),
        action: Action::Status,
        last_update: Utc::now(),
    };

    if let Some(state) = state {
        fill_state(&mut flight, state)?;
    }
    Ok(flight)
}

fn fill_state(flight: &mut Flight, state: &Element) -> Result<(), ParseError> {
    for value in state.children_named("Value") {
        if let Some(name) = value.attr("propertyName") {
            if name != "ScheduledTime" {
                flight
                    .custom_fields
                    .insert(name.to_string(), value.text().to_string());
            }
        }
    }

    if let Some(route) = state.child("Route") {
        let mut points: Vec<(u32, CodeSet)> = Vec::new();
        let mut via = Vec::new();
        route.find_all("RouteViaPoint", &mut via);
        for point in via {
            let seq = point
                .attr("sequenceNumber")
                .and_then(|s| s.parse().ok())
                .unwrap_or(u32::MAX);
            points.push((seq, point.code_set("AirportCode")));
        }
        points.sort_by_key(|(seq, _)| *seq);
        flight.route = points.into_iter().map(|(_, code)| code).collect();
    }

    flight.aircraft_type = state
        .child("AircraftType")
        .and_then(|t| t.find("AircraftTypeId"))
        .and_then(|id| {
            id.code("AircraftTypeCode", "IATA")
                .or_else(|| id.code("AircraftTypeCode", "ICAO"))
        });
    flight.registration = state
        .child("Aircraft")
        .and_then(|a| a.find("Registration"))
        .map(|r| r.text().to_string())
        .filter(|r| !r.is_empty());

    for resource_type in ResourceType::ALL {
        if let Some(container) = state.child(resource_type.slots_element()) {
            let slots = container
                .children_named(resource_type.slot_element())
                .map(|slot| slot_from_element(slot, resource_type))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            if !slots.is_empty() {
                flight.slots.insert(resource_type, slots);
            }
        }
    }
    Ok(())
}

fn slot_from_element(el: &Element, resource_type: ResourceType) -> Result<Option<Slot>, ParseError> {
    let Some(resource) = el
        .child(resource_type.element())
        .and_then(|r| r.field("Name"))
    else {
        return Ok(None);
    };
    let start = el
        .field("StartTime")
        .map(|v| parse_instant("StartTime", v))
        .transpose()?;
    let end = el
        .field("EndTime")
        .map(|v| parse_instant("EndTime", v))
        .transpose()?;
    Ok(Some(Slot {
        resource: resource.to_string(),
        start,
        end,
    }))
}

fn changes_from_element(el: &Element) -> FlightChanges {
    let mut changes = FlightChanges::default();
    for change in el.children_named("Change") {
        if let Some(name) = change.attr("propertyName") {
            changes.properties.push(PropertyChange {
                name: name.to_string(),
                old_value: change.child("OldValue").map(|v| v.text().to_string()),
                new_value: change.child("NewValue").map(|v| v.text().to_string()),
            });
        }
    }
    for resource_type in ResourceType::ALL {
        if el
            .child(resource_type.slots_change_element())
            .is_some_and(Element::has_content)
        {
            changes.slot_changes.insert(resource_type);
        }
    }
    changes.aircraft_type = el.child("AircraftTypeChange").is_some_and(Element::has_content);
    changes.aircraft_registration = el.child("AircraftChange").is_some_and(Element::has_content);
    changes
}


#[cfg(test)]
mod tests {
    use super::samples::*;
    use super::*;

    #[test]
    fn test_parse_document_tree() {
        let root = parse_document(r#"<a x="1"><b>hi</b><c/></a>"#).unwrap();
        assert_eq!(root.name, "a");
        assert_eq!(root.attr("x"), Some("1"));
        assert_eq!(root.child("b").unwrap().text(), "hi");
        assert!(root.child("c").is_some());
    }

    #[test]
    fn test_parse_updated_notification() {
        let changes = r#"<FlightChanges>
            <Change propertyName="Gate"><OldValue>G1</OldValue><NewValue>G2</NewValue></Change>
            <StandSlotsChange><OldValue><StandSlot/></OldValue></StandSlotsChange>
            <AircraftTypeChange/>
        </FlightChanges>"#;
        let xml = notification_xml(
            "FlightUpdatedNotification",
            &flight_xml("1", "2025-01-01T10:00:00", "A1"),
            changes,
        );

        let n = parse_notification(&xml).unwrap();
        assert_eq!(n.action, Action::Update);
        let f = n.flight;
        assert_eq!(f.key(), "QF1@2025-01-01T10:00:00");
        assert_eq!(f.kind, FlightKind::Departure);
        assert_eq!(f.airline.icao.as_deref(), Some("QFA"));
        assert_eq!(f.route_string(), "SIN,LHR");
        assert_eq!(f.aircraft_type.as_deref(), Some("388"));
        assert_eq!(f.registration.as_deref(), Some("VH-OQA"));
        assert_eq!(f.custom_fields.get("Remark").unwrap(), "Boarding & Gate open");
        assert_eq!(f.slots_of(ResourceType::Stand)[0].resource, "A1");

        assert!(f.changes.contains("Gate"));
        assert!(f.changes.slot_changes.contains(&ResourceType::Stand));
        assert!(!f.changes.aircraft_type);
    }

    #[test]
    fn test_rejects_flight_without_identity() {
        let xml = notification_xml(
            "FlightCreatedNotification",
            "<Flight><FlightId><FlightKind>Arrival</FlightKind></FlightId></Flight>",
            "",
        );
        assert!(matches!(
            parse_notification(&xml),
            Err(ParseError::MissingField("AirlineDesignator"))
        ));
    }

    #[test]
    fn test_rejects_unknown_envelope() {
        let err = parse_notification("<Envelope><Content><Heartbeat/></Content></Envelope>");
        assert!(matches!(err, Err(ParseError::UnknownMessage(_))));
    }

    #[test]
    fn test_bulk_response_with_nested_envelope() {
        let inner = format!(
            "<Envelope><Content><Flights>{}{}</Flights></Content></Envelope>",
            flight_xml("1", "2025-01-01T10:00:00", "A1"),
            flight_xml("2", "2025-01-01T12:00:00", "A2"),
        );
        let escaped = inner
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        let soap = format!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
                <GetFlightsResponse><GetFlightsResult>{escaped}</GetFlightsResult></GetFlightsResponse>
            </s:Body></s:Envelope>"#
        );

        let flights = parse_flights(&soap).unwrap();
        assert_eq!(flights.len(), 2);
        assert_eq!(flights[1].flight_number, "2");
        assert_eq!(flights[1].custom_fields.get("Remark").unwrap(), "Boarding & Gate open");
    }

    #[test]
    fn test_bulk_response_skips_malformed_flight() {
        let xml = format!(
            "<Flights>{}<Flight><FlightId/></Flight></Flights>",
            flight_xml("1", "2025-01-01T10:00:00", "A1")
        );
        assert_eq!(parse_flights(&xml).unwrap().len(), 1);
    }

    #[test]
    fn test_fault_is_reported() {
        let xml = r#"<Envelope><Body><Fault><faultstring>Invalid token</faultstring></Fault></Body></Envelope>"#;
        match parse_flights(xml) {
            Err(ParseError::ServerResponse(reason)) => assert_eq!(reason, "Invalid token"),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_resources() {
        let xml = r#"<Envelope><Body><GetGatesResponse><GetGatesResult>
            <FixedResource><Name>G12</Name><Area>T1</Area></FixedResource>
            <FixedResource><Value propertyName="Name">G13</Value></FixedResource>
            <FixedResource><Area>T1</Area></FixedResource>
        </GetGatesResult></GetGatesResponse></Body></Envelope>"#;
        let resources = parse_resources(xml, ResourceType::Gate).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].name, "G12");
        assert_eq!(resources[0].area.as_deref(), Some("T1"));
        assert_eq!(resources[1].resource_type, ResourceType::Gate);
    }

    #[test]
    fn test_parse_instant_formats() {
        let a = parse_instant("t", "2025-01-01T10:00:00").unwrap();
        let b = parse_instant("t", "2025-01-01T20:00:00+10:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_instant("t", "tomorrow").is_err());
    }
}
