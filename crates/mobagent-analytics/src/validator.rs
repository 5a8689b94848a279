//! Injected predicates gating everything that accepts external input.

use std::fmt;
use std::sync::Arc;

use crate::attribute::{MAX_NAME_LENGTH, MAX_STRING_VALUE_LENGTH};
use crate::value::TaggedValue;

type NamePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type ValuePredicate = Arc<dyn Fn(&TaggedValue) -> bool + Send + Sync>;

/// Name, value and event-type predicates supplied once by the host.
#[derive(Clone)]
pub struct AttributeValidator {
    name: NamePredicate,
    value: ValuePredicate,
    event_type: NamePredicate,
}

impl AttributeValidator {
    pub fn new(
        name: impl Fn(&str) -> bool + Send + Sync + 'static,
        value: impl Fn(&TaggedValue) -> bool + Send + Sync + 'static,
        event_type: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Arc::new(name),
            value: Arc::new(value),
            event_type: Arc::new(event_type),
        }
    }

    /// Accept everything.
    pub fn permissive() -> Self {
        Self::new(|_| true, |_| true, |_| true)
    }

    /// The agent's stock rules.
    ///
    /// Names must be non-empty and below the name limit. String values must
    /// be non-empty and below the value limit. Event types are restricted to
    /// alphanumerics, space, `_`, `:` and `.`.
    pub fn standard() -> Self {
        Self::new(
            |name| !name.is_empty() && name.len() < MAX_NAME_LENGTH,
            |value| match value {
                TaggedValue::String(s) => !s.is_empty() && s.len() < MAX_STRING_VALUE_LENGTH,
                _ => true,
            },
            |event_type| {
                !event_type.is_empty()
                    && event_type.len() < MAX_NAME_LENGTH
                    && event_type
                        .chars()
                        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | ':' | '.'))
            },
        )
    }

    pub fn name_ok(&self, name: &str) -> bool {
        (self.name)(name)
    }

    pub fn value_ok(&self, value: &TaggedValue) -> bool {
        (self.value)(value)
    }

    pub fn event_type_ok(&self, event_type: &str) -> bool {
        (self.event_type)(event_type)
    }
}

impl Default for AttributeValidator {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for AttributeValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeValidator").finish_non_exhaustive()
    }
}
