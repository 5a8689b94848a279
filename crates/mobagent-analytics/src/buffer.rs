//! Bounded, time-aware event buffer mirrored to a duplication store.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::SharedConfig;
use crate::error::Result;
use crate::event::{
    AnalyticEvent, EventKind, TracePayload, ATTR_INTERACTION_DURATION, RESERVED_EVENT_TYPES,
};
use crate::store::{DurableStore, RecordPolicy};
use crate::validator::AttributeValidator;

/// How a full buffer picks the event to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// `random % total_attempted_inserts`. An index past the end drops the
    /// incoming event instead, so late events are increasingly likely to be
    /// discarded.
    #[default]
    RandomOfTotalInserts,
    /// `random % len`: every buffered event is equally likely.
    RandomOfCurrentSize,
    /// The least recently inserted event.
    Lru,
}

impl EvictionStrategy {
    /// Index of the event to replace, or `None` to drop the incoming one.
    pub fn victim_index<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        len: usize,
        total_attempted_inserts: u64,
    ) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self {
            EvictionStrategy::RandomOfTotalInserts => {
                let index = rng.gen::<u64>() % total_attempted_inserts.max(1);
                usize::try_from(index).ok().filter(|&i| i < len)
            }
            EvictionStrategy::RandomOfCurrentSize => Some(rng.gen_range(0..len)),
            EvictionStrategy::Lru => Some(0),
        }
    }
}

struct BufferState {
    /// Insertion ordered; each entry carries its duplication-store key.
    events: Vec<(String, Arc<AnalyticEvent>)>,
    oldest_timestamp: u64,
    total_attempted_inserts: u64,
    next_key: u64,
    rng: StdRng,
}

/// Buffer of events awaiting the next harvest.
pub struct EventBuffer {
    state: Mutex<BufferState>,
    duplication: DurableStore<String, AnalyticEvent>,
    config: SharedConfig,
    validator: Arc<AttributeValidator>,
    key_prefix: String,
}

impl EventBuffer {
    /// Open a buffer whose duplication file lives in the configured
    /// storage directory.
    pub fn open(config: SharedConfig, validator: Arc<AttributeValidator>) -> Result<Self> {
        let path = config.get().storage_paths().event_duplication;
        Self::open_at(path, config, validator)
    }

    pub fn open_at(
        path: impl AsRef<Path>,
        config: SharedConfig,
        validator: Arc<AttributeValidator>,
    ) -> Result<Self> {
        let policy = if config.get().skip_malformed_records {
            RecordPolicy::SkipMalformed
        } else {
            RecordPolicy::Strict
        };
        let record_validator = Arc::clone(&validator);
        let duplication = DurableStore::open(
            path,
            move |text| AnalyticEvent::deserialize(text, Arc::clone(&record_validator)),
            policy,
        )?;
        Ok(Self {
            state: Mutex::new(BufferState {
                events: Vec::new(),
                oldest_timestamp: 0,
                total_attempted_inserts: 0,
                next_key: 0,
                rng: StdRng::from_entropy(),
            }),
            duplication,
            config,
            validator,
            key_prefix: format!("{:016x}", rand::random::<u64>()),
        })
    }

    /// Reseed the eviction RNG so victim selection is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn validator(&self) -> &Arc<AttributeValidator> {
        &self.validator
    }

    pub fn duplication_store(&self) -> &DurableStore<String, AnalyticEvent> {
        &self.duplication
    }

    pub fn set_max_buffer_size(&self, size: u32) -> bool {
        match self.config.set_max_buffer_size(size) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, size, "rejected buffer size");
                false
            }
        }
    }

    pub fn set_max_buffer_time_secs(&self, secs: u32) -> bool {
        match self.config.set_max_buffer_time_secs(secs) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, secs, "rejected buffer time");
                false
            }
        }
    }

    /// Buffer an event, evicting one when the buffer is full.
    ///
    /// Returns `false` only when the duplication mirror refused the event.
    /// An event dropped by the eviction strategy still returns `true`.
    pub fn add_event(&self, event: AnalyticEvent) -> bool {
        let config = self.config.get();
        let max = config.max_event_buffer_size as usize;

        let mut state = self.state.lock();
        state.total_attempted_inserts += 1;

        if state.events.len() < max {
            let was_empty = state.events.is_empty();
            let timestamp = event.timestamp_ms();
            if !self.push(&mut state, event) {
                return false;
            }
            if was_empty {
                state.oldest_timestamp = timestamp;
            }
            return true;
        }

        // Shrunk by a reconfiguration: drop the oldest overflow first.
        while state.events.len() > max {
            let (key, _) = state.events.remove(0);
            self.forget(&key);
        }

        let len = state.events.len();
        let total = state.total_attempted_inserts;
        let victim = config.eviction.victim_index(&mut state.rng, len, total);
        match victim {
            Some(index) => {
                let (key, _) = state.events.remove(index);
                self.forget(&key);
                return self.push(&mut state, event);
            }
            None => {
                tracing::debug!(
                    event_type = event.event_type(),
                    total_attempted_inserts = total,
                    "buffer full, event dropped"
                );
            }
        }
        true
    }

    fn push(&self, state: &mut BufferState, event: AnalyticEvent) -> bool {
        let key = format!("{}-{}", self.key_prefix, state.next_key);
        state.next_key += 1;
        if let Err(e) = self.duplication.store(key.clone(), event.clone()) {
            tracing::error!(error = %e, "failed to mirror event");
            return false;
        }
        state.events.push((key, Arc::new(event)));
        true
    }

    fn forget(&self, key: &String) {
        if let Err(e) = self.duplication.remove(key) {
            tracing::error!(error = %e, key = %key, "failed to remove evicted event from mirror");
        }
    }

    /// Whether the oldest buffered event has waited long enough to force a
    /// harvest.
    pub fn did_reach_max_queue_time(&self, now_ms: u64) -> bool {
        let oldest = self.state.lock().oldest_timestamp;
        if oldest == 0 {
            return false;
        }
        let max_secs = u64::from(self.config.get().max_event_buffer_time_secs);
        now_ms.saturating_sub(oldest) / 1000 >= max_secs
    }

    /// Drop every event and reset the counters.
    pub fn empty(&self) {
        let mut state = self.state.lock();
        self.empty_locked(&mut state);
    }

    fn empty_locked(&self, state: &mut BufferState) {
        state.events.clear();
        state.oldest_timestamp = 0;
        state.total_attempted_inserts = 0;
        if let Err(e) = self.duplication.clear() {
            tracing::error!(error = %e, "failed to clear event mirror");
        }
    }

    /// JSON array of the buffered events; with `clear` the buffer is emptied
    /// in the same critical section.
    pub fn to_json(&self, clear: bool) -> JsonValue {
        let mut state = self.state.lock();
        let array: Vec<JsonValue> = state.events.iter().map(|(_, e)| e.to_json()).collect();
        if clear {
            self.empty_locked(&mut state);
            tracing::debug!(events = array.len(), "event buffer harvested");
        }
        JsonValue::Array(array)
    }

    /// Events mirrored to disk, including those left by an earlier process.
    /// With `clear` the mirror is rotated to its backup file.
    pub fn fetch_duplicated(&self, clear: bool) -> Result<Vec<AnalyticEvent>> {
        let contents = if clear {
            self.duplication.swap()?
        } else {
            self.duplication.load()?
        };
        let mut events: Vec<AnalyticEvent> = contents.into_values().collect();
        events.sort_by_key(|e| e.timestamp_ms());
        Ok(events)
    }

    pub fn clear_duplication_store(&self) -> bool {
        match self.duplication.clear() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to clear event mirror");
                false
            }
        }
    }

    /// Wait until the mirror file reflects every accepted event.
    pub fn synchronize(&self) {
        self.duplication.synchronize();
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> Vec<Arc<AnalyticEvent>> {
        self.state
            .lock()
            .events
            .iter()
            .map(|(_, e)| Arc::clone(e))
            .collect()
    }

    pub fn total_attempted_inserts(&self) -> u64 {
        self.state.lock().total_attempted_inserts
    }

    pub fn oldest_timestamp(&self) -> u64 {
        self.state.lock().oldest_timestamp
    }

    pub fn new_custom_event(
        &self,
        event_type: &str,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
    ) -> Option<AnalyticEvent> {
        if RESERVED_EVENT_TYPES.contains(&event_type) {
            tracing::debug!(event_type, "reserved event type rejected");
            return None;
        }
        if !self.validator.event_type_ok(event_type) {
            tracing::debug!(event_type, "event type rejected by validator");
            return None;
        }
        Some(self.new_event(
            EventKind::Custom {
                event_type: event_type.to_string(),
            },
            timestamp_ms,
            session_elapsed_secs,
        ))
    }

    pub fn new_custom_mobile_event(
        &self,
        name: &str,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
    ) -> AnalyticEvent {
        self.new_event(
            EventKind::CustomMobile {
                name: name.to_string(),
            },
            timestamp_ms,
            session_elapsed_secs,
        )
    }

    pub fn new_interaction_event(
        &self,
        name: &str,
        duration_secs: f64,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
    ) -> Option<AnalyticEvent> {
        let mut event = self.new_event(
            EventKind::Interaction {
                name: name.to_string(),
            },
            timestamp_ms,
            session_elapsed_secs,
        );
        match event.add_attribute(ATTR_INTERACTION_DURATION, duration_secs) {
            Ok(true) => Some(event),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(error = %e, name, "failed to build interaction event");
                None
            }
        }
    }

    pub fn new_session_event(&self, timestamp_ms: u64, session_elapsed_secs: f64) -> AnalyticEvent {
        self.new_event(EventKind::Session, timestamp_ms, session_elapsed_secs)
    }

    pub fn new_request_event(
        &self,
        payload: Option<&TracePayload>,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
    ) -> Option<AnalyticEvent> {
        self.new_intrinsic_event(EventKind::Request, payload, timestamp_ms, session_elapsed_secs)
    }

    pub fn new_network_error_event(
        &self,
        payload: Option<&TracePayload>,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
    ) -> Option<AnalyticEvent> {
        self.new_intrinsic_event(
            EventKind::NetworkError,
            payload,
            timestamp_ms,
            session_elapsed_secs,
        )
    }

    pub fn new_user_action_event(
        &self,
        timestamp_ms: u64,
        session_elapsed_secs: f64,
    ) -> AnalyticEvent {
        self.new_event(EventKind::UserAction, timestamp_ms, session_elapsed_secs)
    }

    fn new_event(&self, kind: EventKind, timestamp_ms: u64, elapsed: f64) -> AnalyticEvent {
        AnalyticEvent::new(kind, timestamp_ms, elapsed, Arc::clone(&self.validator))
    }

    fn new_intrinsic_event(
        &self,
        kind: EventKind,
        payload: Option<&TracePayload>,
        timestamp_ms: u64,
        elapsed: f64,
    ) -> Option<AnalyticEvent> {
        match AnalyticEvent::with_trace_payload(
            kind,
            timestamp_ms,
            elapsed,
            payload,
            Arc::clone(&self.validator),
        ) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "failed to build intrinsic event");
                None
            }
        }
    }
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("len", &self.len())
            .field("duplication", &self.duplication)
            .finish_non_exhaustive()
    }
}
