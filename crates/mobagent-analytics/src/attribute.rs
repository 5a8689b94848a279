//! Named attributes.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::codec;
use crate::error::{AnalyticsError, Result};
use crate::value::TaggedValue;

/// Names at or above this many bytes are rejected.
pub const MAX_NAME_LENGTH: usize = 256;

/// String values at or above this many bytes are rejected.
pub const MAX_STRING_VALUE_LENGTH: usize = 4096;

/// A named value, optionally marked to survive process restarts.
///
/// The value can be replaced while other threads read it; readers always
/// observe either the old or the new value, never a torn one.
#[derive(Debug)]
pub struct Attribute {
    name: String,
    value: ArcSwap<TaggedValue>,
    persistent: bool,
}

impl Attribute {
    /// Build an attribute after running both predicates.
    ///
    /// Returns `Ok(None)` when a predicate rejects the input or the name is
    /// empty. Oversized input is a contract violation and returns an error.
    pub fn create(
        name: &str,
        name_ok: impl Fn(&str) -> bool,
        value: TaggedValue,
        value_ok: impl Fn(&TaggedValue) -> bool,
    ) -> Result<Option<Attribute>> {
        check_name_length(name)?;
        check_value_length(&value)?;
        if name.is_empty() || !name_ok(name) || !value_ok(&value) {
            return Ok(None);
        }
        Ok(Some(Attribute::new(name, value, false)))
    }

    /// Build an attribute without validation. Used for internal attributes
    /// and for records reloaded from disk.
    pub fn new(name: &str, value: TaggedValue, persistent: bool) -> Self {
        Self {
            name: codec::escape(name).into_owned(),
            value: ArcSwap::from_pointee(value),
            persistent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> Arc<TaggedValue> {
        self.value.load_full()
    }

    /// Atomically replace the value.
    pub fn set_value(&self, value: TaggedValue) {
        self.value.store(Arc::new(value));
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }
}

impl Clone for Attribute {
    /// Deep copy: the clone never shares its value cell with the original.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            value: ArcSwap::from_pointee((*self.value.load_full()).clone()),
            persistent: self.persistent,
        }
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && *self.value.load() == *other.value.load()
    }
}

fn check_name_length(name: &str) -> Result<()> {
    if name.len() >= MAX_NAME_LENGTH {
        return Err(AnalyticsError::InvalidArgument(format!(
            "attribute name exceeds {} bytes",
            MAX_NAME_LENGTH - 1
        )));
    }
    Ok(())
}

fn check_value_length(value: &TaggedValue) -> Result<()> {
    if let TaggedValue::String(s) = value {
        if s.len() >= MAX_STRING_VALUE_LENGTH {
            return Err(AnalyticsError::InvalidArgument(format!(
                "attribute value exceeds {} bytes",
                MAX_STRING_VALUE_LENGTH - 1
            )));
        }
    }
    Ok(())
}
