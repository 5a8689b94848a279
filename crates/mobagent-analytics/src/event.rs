//! Analytic events.
//!
//! Every event variant shares one shape (event type, timestamp, session
//! elapsed time and an attribute map) and differs only in the fixed fields
//! carried by its [`EventKind`]. Serialization, JSON emission and category
//! lookup all dispatch on the kind.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::attribute::Attribute;
use crate::codec::{self, FieldReader};
use crate::error::{AnalyticsError, Result};
use crate::validator::AttributeValidator;
use crate::value::TaggedValue;

/// Event type shared by the categorized mobile events.
pub const MOBILE_EVENT_TYPE: &str = "Mobile";
pub const REQUEST_EVENT_TYPE: &str = "MobileRequest";
pub const NETWORK_ERROR_EVENT_TYPE: &str = "MobileRequestError";
pub const USER_ACTION_EVENT_TYPE: &str = "MobileUserAction";

/// Event types owned by the agent. Generic custom events may not use them.
pub const RESERVED_EVENT_TYPES: &[&str] = &[
    MOBILE_EVENT_TYPE,
    REQUEST_EVENT_TYPE,
    NETWORK_ERROR_EVENT_TYPE,
    USER_ACTION_EVENT_TYPE,
];

pub const CATEGORY_CUSTOM: &str = "Custom";
pub const CATEGORY_INTERACTION: &str = "Interaction";
pub const CATEGORY_SESSION: &str = "Session";

/// Intrinsic attribute names injected from a distributed-tracing payload.
pub const ATTR_GUID: &str = "guid";
pub const ATTR_TRACE_ID: &str = "traceId";
pub const ATTR_PARENT_ID: &str = "nr.parentId";

pub const ATTR_INTERACTION_DURATION: &str = "interactionDuration";
pub const ATTR_SESSION_DURATION: &str = "sessionDuration";
pub const ATTR_ACTION_TYPE: &str = "actionType";

/// The closed set of event variants.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A customer-defined event type.
    Custom { event_type: String },
    /// A named `Mobile` event in the `Custom` category.
    CustomMobile { name: String },
    /// A named `Mobile` event in the `Interaction` category.
    Interaction { name: String },
    /// A `Mobile` event in the `Session` category.
    Session,
    Request,
    NetworkError,
    UserAction,
}

impl EventKind {
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::Custom { event_type } => event_type,
            EventKind::CustomMobile { .. } | EventKind::Interaction { .. } | EventKind::Session => {
                MOBILE_EVENT_TYPE
            }
            EventKind::Request => REQUEST_EVENT_TYPE,
            EventKind::NetworkError => NETWORK_ERROR_EVENT_TYPE,
            EventKind::UserAction => USER_ACTION_EVENT_TYPE,
        }
    }

    pub fn category(&self) -> Option<&'static str> {
        match self {
            EventKind::CustomMobile { .. } => Some(CATEGORY_CUSTOM),
            EventKind::Interaction { .. } => Some(CATEGORY_INTERACTION),
            EventKind::Session => Some(CATEGORY_SESSION),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            EventKind::CustomMobile { name } | EventKind::Interaction { name } => Some(name),
            _ => None,
        }
    }

    /// Whether events of this kind carry distributed-tracing intrinsics.
    pub fn is_intrinsic(&self) -> bool {
        matches!(self, EventKind::Request | EventKind::NetworkError)
    }
}

/// Distributed-tracing identifiers attached to request events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePayload {
    pub guid: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
}

impl TracePayload {
    pub fn new(guid: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            trace_id: trace_id.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A single analytic event.
///
/// Mutated through [`add_attribute`](Self::add_attribute) by its single owner
/// until it is handed to the event buffer; read-only afterwards.
#[derive(Debug, Clone)]
pub struct AnalyticEvent {
    kind: EventKind,
    timestamp_ms: u64,
    session_elapsed_secs: f64,
    attributes: HashMap<String, Attribute>,
    validator: Arc<AttributeValidator>,
}

impl AnalyticEvent {
    pub fn new(
        kind: EventKind,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
        validator: Arc<AttributeValidator>,
    ) -> Self {
        let kind = match kind {
            EventKind::Custom { event_type } => EventKind::Custom {
                event_type: codec::escape(&event_type).into_owned(),
            },
            EventKind::CustomMobile { name } => EventKind::CustomMobile {
                name: codec::escape(&name).into_owned(),
            },
            EventKind::Interaction { name } => EventKind::Interaction {
                name: codec::escape(&name).into_owned(),
            },
            other => other,
        };
        Self {
            kind,
            timestamp_ms,
            session_elapsed_secs,
            attributes: HashMap::new(),
            validator,
        }
    }

    /// Build an intrinsic event, injecting the tracing attributes before any
    /// caller-supplied attribute can be added.
    pub fn with_trace_payload(
        kind: EventKind,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
        payload: Option<&TracePayload>,
        validator: Arc<AttributeValidator>,
    ) -> Result<Self> {
        let mut event = Self::new(kind, timestamp_ms, session_elapsed_secs, validator);
        if let Some(payload) = payload {
            event.insert_attribute(Attribute::new(
                ATTR_GUID,
                TaggedValue::string(&payload.guid),
                false,
            ))?;
            event.insert_attribute(Attribute::new(
                ATTR_TRACE_ID,
                TaggedValue::string(&payload.trace_id),
                false,
            ))?;
            if let Some(parent_id) = &payload.parent_id {
                event.insert_attribute(Attribute::new(
                    ATTR_PARENT_ID,
                    TaggedValue::string(parent_id),
                    false,
                ))?;
            }
        }
        Ok(event)
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    pub fn category(&self) -> Option<&'static str> {
        self.kind.category()
    }

    pub fn name(&self) -> Option<&str> {
        self.kind.name()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn session_elapsed_secs(&self) -> f64 {
        self.session_elapsed_secs
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(&*codec::escape(name))
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Validate and add an attribute.
    ///
    /// Returns `Ok(false)` without touching the event when a predicate
    /// rejects the input. A name already present is an error.
    pub fn add_attribute(&mut self, name: &str, value: impl Into<TaggedValue>) -> Result<bool> {
        let validator = Arc::clone(&self.validator);
        let attribute = Attribute::create(
            name,
            |n| validator.name_ok(n),
            value.into(),
            |v| validator.value_ok(v),
        )?;
        match attribute {
            Some(attribute) => {
                self.insert_attribute(attribute)?;
                Ok(true)
            }
            None => {
                tracing::debug!(name, event_type = self.event_type(), "attribute rejected by validator");
                Ok(false)
            }
        }
    }

    /// Insert an already built attribute, refusing duplicates.
    pub fn insert_attribute(&mut self, attribute: Attribute) -> Result<()> {
        if self.attributes.contains_key(attribute.name()) {
            return Err(AnalyticsError::DuplicateAttribute(attribute.name().to_string()));
        }
        self.attributes.insert(attribute.name().to_string(), attribute);
        Ok(())
    }

    /// JSON object uploaded to the collector.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        for attribute in self.attributes.values() {
            object.insert(attribute.name().to_string(), attribute.value().to_json());
        }
        object.insert("eventType".into(), JsonValue::from(self.event_type()));
        object.insert("timestamp".into(), JsonValue::from(self.timestamp_ms as f64));
        object.insert(
            "timeSinceLoad".into(),
            JsonValue::from(self.session_elapsed_secs),
        );
        if let Some(category) = self.category() {
            object.insert("category".into(), JsonValue::from(category));
        }
        if let Some(name) = self.name() {
            object.insert("name".into(), JsonValue::from(name));
        }
        JsonValue::Object(object)
    }

    /// Append the text form:
    /// `eventType TAB [category TAB [name TAB]] timestamp TAB elapsed TAB (name TAB value)*`.
    pub fn serialize_to(&self, out: &mut String) {
        codec::write_field(out, self.event_type());
        if let Some(category) = self.category() {
            codec::write_field(out, category);
        }
        if let Some(name) = self.name() {
            codec::write_field(out, name);
        }
        codec::write_display(out, self.timestamp_ms);
        codec::write_display(out, self.session_elapsed_secs);

        let mut names: Vec<&String> = self.attributes.keys().collect();
        names.sort();
        for name in names {
            codec::write_field(out, name);
            self.attributes[name].value().serialize_to(out);
        }
    }

    pub fn to_serialized(&self) -> String {
        let mut out = String::new();
        self.serialize_to(&mut out);
        out
    }

    /// Rebuild an event from its text form. The leading event type selects
    /// the variant.
    pub fn deserialize(text: &str, validator: Arc<AttributeValidator>) -> Result<AnalyticEvent> {
        let mut reader = FieldReader::new(text);
        let event_type = reader.expect_field("event type")?;
        let kind = match event_type {
            MOBILE_EVENT_TYPE => match reader.expect_field("category")? {
                CATEGORY_CUSTOM => EventKind::CustomMobile {
                    name: reader.expect_field("event name")?.to_string(),
                },
                CATEGORY_INTERACTION => EventKind::Interaction {
                    name: reader.expect_field("event name")?.to_string(),
                },
                CATEGORY_SESSION => EventKind::Session,
                other => {
                    return Err(AnalyticsError::Deserialization(format!(
                        "unknown mobile event category {:?}",
                        other
                    )))
                }
            },
            REQUEST_EVENT_TYPE => EventKind::Request,
            NETWORK_ERROR_EVENT_TYPE => EventKind::NetworkError,
            USER_ACTION_EVENT_TYPE => EventKind::UserAction,
            "" => {
                return Err(AnalyticsError::Deserialization("empty event type".into()));
            }
            other => EventKind::Custom {
                event_type: other.to_string(),
            },
        };
        let timestamp_ms: u64 = reader.parse_field("timestamp")?;
        let elapsed: f64 = reader.parse_field("session elapsed time")?;

        let mut event = AnalyticEvent::new(kind, timestamp_ms, elapsed, validator);
        while let Some(name) = reader.next_field() {
            let value = TaggedValue::deserialize(&mut reader)?;
            if name.is_empty() {
                continue;
            }
            event.insert_attribute(Attribute::new(name, value, false))?;
        }
        Ok(event)
    }
}

impl PartialEq for AnalyticEvent {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.timestamp_ms == other.timestamp_ms
            && self.session_elapsed_secs == other.session_elapsed_secs
            && self.attributes == other.attributes
    }
}
