//! Session attributes.
//!
//! Every accepted attribute is mirrored to the duplication store. Attributes
//! flagged persistent are also mirrored to the persistent store, which is
//! reloaded when the next store is opened against the same directory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};

use crate::attribute::Attribute;
use crate::codec;
use crate::config::SharedConfig;
use crate::error::Result;
use crate::store::{DurableStore, RecordPolicy};
use crate::validator::AttributeValidator;
use crate::value::{Number, TaggedValue};

/// Prefixes owned by the agent.
pub const RESERVED_PREFIXES: &[&str] = &["newRelic", "nr.", "Public_"];

/// Names the agent emits itself; customers may not set them.
pub const RESERVED_NAMES: &[&str] = &[
    "eventType",
    "type",
    "timestamp",
    "category",
    "accountId",
    "appId",
    "appName",
    "uuid",
    "sessionDuration",
    "sessionId",
    "osName",
    "osVersion",
    "osMajorVersion",
    "deviceManufacturer",
    "deviceModel",
    "carrier",
    "memUsageMb",
    "install",
    "upgradeFrom",
    "platform",
    "platformVersion",
    "lastInteraction",
];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name) || RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

struct AttributeState {
    attributes: HashMap<String, Attribute>,
    /// Agent-internal attributes, never validated nor mirrored.
    private: HashMap<String, Attribute>,
}

pub struct SessionAttributeStore {
    state: Mutex<AttributeState>,
    duplication: DurableStore<String, TaggedValue>,
    persistent: DurableStore<String, TaggedValue>,
    config: SharedConfig,
    validator: Arc<AttributeValidator>,
}

impl SessionAttributeStore {
    pub fn open(config: SharedConfig, validator: Arc<AttributeValidator>) -> Result<Self> {
        let paths = config.get().storage_paths();
        Self::open_at(
            paths.attribute_duplication,
            paths.attribute_persistent,
            config,
            validator,
        )
    }

    /// Open both stores and restore the persistent attributes.
    pub fn open_at(
        duplication_path: impl AsRef<Path>,
        persistent_path: impl AsRef<Path>,
        config: SharedConfig,
        validator: Arc<AttributeValidator>,
    ) -> Result<Self> {
        let policy = if config.get().skip_malformed_records {
            RecordPolicy::SkipMalformed
        } else {
            RecordPolicy::Strict
        };
        let duplication =
            DurableStore::open(duplication_path, TaggedValue::from_serialized, policy)?;
        let persistent = DurableStore::open(persistent_path, TaggedValue::from_serialized, policy)?;

        let store = Self {
            state: Mutex::new(AttributeState {
                attributes: HashMap::new(),
                private: HashMap::new(),
            }),
            duplication,
            persistent,
            config,
            validator,
        };
        store.restore_persistent();
        Ok(store)
    }

    fn restore_persistent(&self) {
        let restored = match self.persistent.load() {
            Ok(restored) => restored,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %self.persistent.path().display(),
                    "failed to restore persistent attributes"
                );
                return;
            }
        };

        let limit = self.config.get().max_session_attributes as usize;
        let mut state = self.state.lock();
        for (name, value) in restored {
            if state.attributes.len() >= limit {
                tracing::warn!(name = %name, limit, "attribute limit reached while restoring");
                break;
            }
            if let Err(e) = self.duplication.store(name.clone(), value.clone()) {
                tracing::error!(error = %e, name = %name, "failed to mirror restored attribute");
            }
            state
                .attributes
                .insert(name.clone(), Attribute::new(&name, value, true));
        }
        tracing::debug!(count = state.attributes.len(), "restored persistent attributes");
    }

    pub fn validator(&self) -> &Arc<AttributeValidator> {
        &self.validator
    }

    pub fn duplication_store(&self) -> &DurableStore<String, TaggedValue> {
        &self.duplication
    }

    pub fn persistent_store(&self) -> &DurableStore<String, TaggedValue> {
        &self.persistent
    }

    /// Add or overwrite a session attribute.
    ///
    /// An overwrite does not count toward the attribute limit.
    pub fn add_session_attribute(
        &self,
        name: &str,
        value: impl Into<TaggedValue>,
        persistent: bool,
    ) -> bool {
        let value = value.into();
        match self.try_add(name, value, persistent) {
            Ok(added) => added,
            Err(e) => {
                tracing::warn!(error = %e, name, "session attribute rejected");
                false
            }
        }
    }

    fn try_add(&self, name: &str, value: TaggedValue, persistent: bool) -> Result<bool> {
        let Some(attribute) = self.build(name, value)? else {
            return Ok(false);
        };
        let mut state = self.state.lock();
        self.commit(&mut state, attribute, persistent)
    }

    /// Add `delta` to a numeric attribute, creating it when absent.
    pub fn increment_attribute(&self, name: &str, delta: Number, persistent: bool) -> bool {
        match self.try_increment(name, delta, persistent) {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, name, "session attribute increment failed");
                false
            }
        }
    }

    fn try_increment(&self, name: &str, delta: Number, persistent: bool) -> Result<bool> {
        let mut state = self.state.lock();
        let current = state
            .attributes
            .get(&*codec::escape(name))
            .map(|attribute| attribute.value());

        let next = match current {
            None => delta,
            Some(current) => {
                let Some(number) = current.as_number() else {
                    tracing::debug!(name, "cannot increment a non-numeric attribute");
                    return Ok(false);
                };
                match number.checked_add(&delta) {
                    Some(total) => total,
                    None => {
                        tracing::warn!(name, "session attribute increment overflowed");
                        return Ok(false);
                    }
                }
            }
        };

        let Some(attribute) = self.build(name, TaggedValue::Number(next))? else {
            return Ok(false);
        };
        self.commit(&mut state, attribute, persistent)
    }

    fn build(&self, name: &str, value: TaggedValue) -> Result<Option<Attribute>> {
        if is_reserved_name(name) {
            tracing::debug!(name, "reserved session attribute name rejected");
            return Ok(None);
        }
        let attribute = Attribute::create(
            name,
            |n| self.validator.name_ok(n),
            value,
            |v| self.validator.value_ok(v),
        )?;
        if attribute.is_none() {
            tracing::debug!(name, "session attribute rejected by validator");
        }
        Ok(attribute)
    }

    fn commit(
        &self,
        state: &mut AttributeState,
        mut attribute: Attribute,
        persistent: bool,
    ) -> Result<bool> {
        let key = attribute.name().to_string();
        let value = attribute.value();

        let was_persistent = match state.attributes.get_mut(&key) {
            Some(existing) => {
                let was_persistent = existing.is_persistent();
                existing.set_value((*value).clone());
                existing.set_persistent(persistent);
                was_persistent
            }
            None => {
                let limit = self.config.get().max_session_attributes as usize;
                if state.attributes.len() >= limit {
                    tracing::debug!(name = %key, limit, "session attribute limit reached");
                    return Ok(false);
                }
                attribute.set_persistent(persistent);
                state.attributes.insert(key.clone(), attribute);
                false
            }
        };

        self.duplication.store(key.clone(), (*value).clone())?;
        if persistent {
            self.persistent.store(key, (*value).clone())?;
        } else if was_persistent {
            self.persistent.remove(&key)?;
        }
        Ok(true)
    }

    pub fn remove_session_attribute(&self, name: &str) -> bool {
        let key = codec::escape(name).into_owned();
        let mut state = self.state.lock();
        let Some(removed) = state.attributes.remove(&key) else {
            return false;
        };
        let mirrored = self.duplication.remove(&key).and_then(|()| {
            if removed.is_persistent() {
                self.persistent.remove(&key)
            } else {
                Ok(())
            }
        });
        if let Err(e) = mirrored {
            tracing::error!(error = %e, name, "failed to remove mirrored session attribute");
        }
        true
    }

    /// Remove every customer attribute, persistent ones included.
    pub fn clear_session_attributes(&self) -> bool {
        let mut state = self.state.lock();
        state.attributes.clear();
        let cleared = self
            .duplication
            .clear()
            .and_then(|()| self.persistent.clear());
        match cleared {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to clear session attribute stores");
                false
            }
        }
    }

    /// Insert an agent-internal attribute, bypassing validation.
    pub fn add_nr_attribute(&self, attribute: Attribute) {
        let mut state = self.state.lock();
        state.private.insert(attribute.name().to_string(), attribute);
    }

    pub fn len(&self) -> usize {
        self.state.lock().attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaggedValue>> {
        let state = self.state.lock();
        let key = codec::escape(name);
        state
            .attributes
            .get(&*key)
            .or_else(|| state.private.get(&*key))
            .map(Attribute::value)
    }

    pub fn is_persistent(&self, name: &str) -> bool {
        self.state
            .lock()
            .attributes
            .get(&*codec::escape(name))
            .is_some_and(Attribute::is_persistent)
    }

    /// Deep copies of the customer attributes.
    pub fn attribute_set(&self) -> Vec<Attribute> {
        self.state.lock().attributes.values().cloned().collect()
    }

    /// Customer and agent-internal attributes as one JSON object.
    pub fn to_json(&self) -> JsonValue {
        let state = self.state.lock();
        let mut object = Map::new();
        for attribute in state.private.values().chain(state.attributes.values()) {
            object.insert(attribute.name().to_string(), attribute.value().to_json());
        }
        JsonValue::Object(object)
    }

    /// Attributes mirrored to disk, including those left by an earlier
    /// process. With `clear` the mirror is rotated to its backup file.
    pub fn fetch_duplicated(&self, clear: bool) -> Result<HashMap<String, TaggedValue>> {
        if clear {
            self.duplication.swap()
        } else {
            self.duplication.load()
        }
    }

    pub fn clear_duplication_store(&self) -> bool {
        match self.duplication.clear() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to clear attribute mirror");
                false
            }
        }
    }

    /// Wait until both mirror files reflect every accepted change.
    pub fn synchronize(&self) {
        self.duplication.synchronize();
        self.persistent.synchronize();
    }
}

impl std::fmt::Debug for SessionAttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAttributeStore")
            .field("len", &self.len())
            .field("duplication", &self.duplication)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}
