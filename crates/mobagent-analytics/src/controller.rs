//! Entry point used by instrumentation call-sites and the harvester.
//!
//! Every public operation here reports failure as `false` or `None`. The
//! underlying error is logged and never crosses this boundary.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::attribute::Attribute;
use crate::buffer::EventBuffer;
use crate::clock::Clock;
use crate::config::SharedConfig;
use crate::error::{AnalyticsError, Result};
use crate::event::{AnalyticEvent, TracePayload, ATTR_ACTION_TYPE, ATTR_SESSION_DURATION};
use crate::request::NetworkRequest;
use crate::session::SessionAttributeStore;
use crate::validator::AttributeValidator;
use crate::value::{Number, TaggedValue};

pub struct AnalyticsController {
    events: EventBuffer,
    attributes: SessionAttributeStore,
    config: SharedConfig,
    validator: Arc<AttributeValidator>,
    clock: Arc<dyn Clock>,
    session_start_ms: u64,
}

impl AnalyticsController {
    /// Open the buffer and attribute stores under the configured storage
    /// directory. The session starts now.
    pub fn open(
        config: SharedConfig,
        validator: AttributeValidator,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let session_start_ms = clock.now_ms();
        Self::open_with_session_start(config, validator, clock, session_start_ms)
    }

    pub fn open_with_session_start(
        config: SharedConfig,
        validator: AttributeValidator,
        clock: Arc<dyn Clock>,
        session_start_ms: u64,
    ) -> Result<Self> {
        let validator = Arc::new(validator);
        let events = EventBuffer::open(config.clone(), Arc::clone(&validator))?;
        let attributes = SessionAttributeStore::open(config.clone(), Arc::clone(&validator))?;
        tracing::info!(
            storage_dir = %config.get().storage_dir.display(),
            session_start_ms,
            restored_attributes = attributes.len(),
            "analytics controller started"
        );
        Ok(Self {
            events,
            attributes,
            config,
            validator,
            clock,
            session_start_ms,
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn validator(&self) -> &Arc<AttributeValidator> {
        &self.validator
    }

    pub fn event_buffer(&self) -> &EventBuffer {
        &self.events
    }

    pub fn session_attributes(&self) -> &SessionAttributeStore {
        &self.attributes
    }

    pub fn session_start_ms(&self) -> u64 {
        self.session_start_ms
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Seconds since the session started. A clock that reads earlier than
    /// the session start is an error.
    pub fn session_elapsed_secs(&self) -> Result<f64> {
        self.elapsed_at(self.clock.now_ms())
    }

    fn elapsed_at(&self, now_ms: u64) -> Result<f64> {
        if now_ms < self.session_start_ms {
            return Err(AnalyticsError::ClockSkew {
                now_ms,
                session_start_ms: self.session_start_ms,
            });
        }
        Ok((now_ms - self.session_start_ms) as f64 / 1000.0)
    }

    fn stamp(&self) -> Option<(u64, f64)> {
        let now_ms = self.clock.now_ms();
        match self.elapsed_at(now_ms) {
            Ok(elapsed) => Some((now_ms, elapsed)),
            Err(e) => {
                tracing::error!(error = %e, "cannot timestamp event");
                None
            }
        }
    }

    pub fn set_max_buffer_size(&self, size: u32) -> bool {
        self.events.set_max_buffer_size(size)
    }

    pub fn set_max_buffer_time_secs(&self, secs: u32) -> bool {
        self.events.set_max_buffer_time_secs(secs)
    }

    pub fn did_reach_max_queue_time(&self) -> bool {
        self.events.did_reach_max_queue_time(self.clock.now_ms())
    }

    // Event factories.

    pub fn new_custom_event(&self, event_type: &str) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        self.events.new_custom_event(event_type, ts, elapsed)
    }

    pub fn new_custom_mobile_event(&self, name: &str) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        Some(self.events.new_custom_mobile_event(name, ts, elapsed))
    }

    pub fn new_interaction_event(&self, name: &str, duration_secs: f64) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        self.events.new_interaction_event(name, duration_secs, ts, elapsed)
    }

    pub fn new_session_event(&self) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        Some(self.events.new_session_event(ts, elapsed))
    }

    pub fn new_request_event(&self, payload: Option<&TracePayload>) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        self.events.new_request_event(payload, ts, elapsed)
    }

    pub fn new_network_error_event(&self, payload: Option<&TracePayload>) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        self.events.new_network_error_event(payload, ts, elapsed)
    }

    pub fn new_user_action_event(&self) -> Option<AnalyticEvent> {
        let (ts, elapsed) = self.stamp()?;
        Some(self.events.new_user_action_event(ts, elapsed))
    }

    // Recording.

    pub fn add_event(&self, event: AnalyticEvent) -> bool {
        self.events.add_event(event)
    }

    /// Apply `attributes` in order, then buffer the event. Any rejected or
    /// failing attribute drops the whole event.
    pub fn add_event_with_attributes<I, N, V>(&self, mut event: AnalyticEvent, attributes: I) -> bool
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<TaggedValue>,
    {
        for (name, value) in attributes {
            let name = name.as_ref();
            match event.add_attribute(name, value) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(name, event_type = event.event_type(), "event dropped, attribute rejected");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, name, event_type = event.event_type(), "event dropped");
                    return false;
                }
            }
        }
        self.events.add_event(event)
    }

    pub fn add_custom_event<I, N, V>(&self, event_type: &str, attributes: I) -> bool
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<TaggedValue>,
    {
        match self.new_custom_event(event_type) {
            Some(event) => self.add_event_with_attributes(event, attributes),
            None => false,
        }
    }

    pub fn add_custom_mobile_event<I, N, V>(&self, name: &str, attributes: I) -> bool
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<TaggedValue>,
    {
        match self.new_custom_mobile_event(name) {
            Some(event) => self.add_event_with_attributes(event, attributes),
            None => false,
        }
    }

    pub fn add_interaction_event(&self, name: &str, duration_secs: f64) -> bool {
        match self.new_interaction_event(name, duration_secs) {
            Some(event) => self.events.add_event(event),
            None => false,
        }
    }

    /// Record the end of the session with its duration in seconds.
    pub fn add_session_end_event(&self) -> bool {
        let Some((ts, elapsed)) = self.stamp() else {
            return false;
        };
        let event = self.events.new_session_event(ts, elapsed);
        self.add_event_with_attributes(event, [(ATTR_SESSION_DURATION, elapsed)])
    }

    pub fn add_user_action_event<I, N, V>(&self, action_type: &str, attributes: I) -> bool
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<TaggedValue>,
    {
        let Some(event) = self.new_user_action_event() else {
            return false;
        };
        let attributes = std::iter::once((ATTR_ACTION_TYPE.to_string(), TaggedValue::string(action_type)))
            .chain(
                attributes
                    .into_iter()
                    .map(|(n, v)| (n.as_ref().to_string(), v.into())),
            );
        self.add_event_with_attributes(event, attributes)
    }

    pub fn add_request_event(&self, request: &NetworkRequest, payload: Option<&TracePayload>) -> bool {
        let Some(event) = self.new_request_event(payload) else {
            return false;
        };
        self.add_request_shaped(event, request)
    }

    /// Record a request that completed with an HTTP error status.
    pub fn add_http_error_event(
        &self,
        request: &NetworkRequest,
        payload: Option<&TracePayload>,
    ) -> bool {
        if request.status_code.is_none() {
            tracing::debug!(url = %request.url, "http error without status code");
            return false;
        }
        let Some(event) = self.new_network_error_event(payload) else {
            return false;
        };
        self.add_request_shaped(event, request)
    }

    /// Record a request that failed before any response arrived.
    pub fn add_network_failure_event(
        &self,
        request: &NetworkRequest,
        payload: Option<&TracePayload>,
    ) -> bool {
        if request.network_error_code.is_none() {
            tracing::debug!(url = %request.url, "network failure without error code");
            return false;
        }
        let Some(event) = self.new_network_error_event(payload) else {
            return false;
        };
        self.add_request_shaped(event, request)
    }

    fn add_request_shaped(&self, mut event: AnalyticEvent, request: &NetworkRequest) -> bool {
        if let Err(e) = request.apply_to(&mut event) {
            tracing::warn!(error = %e, url = %request.url, "request event dropped");
            return false;
        }
        self.events.add_event(event)
    }

    // Session attributes.

    pub fn add_session_attribute(
        &self,
        name: &str,
        value: impl Into<TaggedValue>,
        persistent: bool,
    ) -> bool {
        self.attributes.add_session_attribute(name, value, persistent)
    }

    pub fn increment_session_attribute(&self, name: &str, delta: Number, persistent: bool) -> bool {
        self.attributes.increment_attribute(name, delta, persistent)
    }

    pub fn remove_session_attribute(&self, name: &str) -> bool {
        self.attributes.remove_session_attribute(name)
    }

    pub fn clear_session_attributes(&self) -> bool {
        self.attributes.clear_session_attributes()
    }

    pub fn add_nr_attribute(&self, attribute: Attribute) {
        self.attributes.add_nr_attribute(attribute)
    }

    // Harvest.

    pub fn get_events_json(&self, clear_events: bool) -> JsonValue {
        self.events.to_json(clear_events)
    }

    pub fn get_session_attribute_json(&self) -> JsonValue {
        self.attributes.to_json()
    }

    /// JSON array of the events in the duplication mirror. With `clear`
    /// the mirror is rotated away once read.
    pub fn fetch_duplicated_events(&self, clear: bool) -> Option<JsonValue> {
        match self.events.fetch_duplicated(clear) {
            Ok(events) => Some(JsonValue::Array(events.iter().map(AnalyticEvent::to_json).collect())),
            Err(e) => {
                tracing::error!(error = %e, "failed to read duplicated events");
                None
            }
        }
    }

    pub fn fetch_duplicated_attributes(&self, clear: bool) -> Option<JsonValue> {
        match self.attributes.fetch_duplicated(clear) {
            Ok(attributes) => {
                let object: Map<String, JsonValue> = attributes
                    .into_iter()
                    .map(|(name, value)| (name, value.to_json()))
                    .collect();
                Some(JsonValue::Object(object))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read duplicated attributes");
                None
            }
        }
    }

    pub fn clear_events_duplication_store(&self) -> bool {
        self.events.clear_duplication_store()
    }

    pub fn clear_attributes_duplication_store(&self) -> bool {
        self.attributes.clear_duplication_store()
    }

    /// Wait until every store file reflects every accepted change.
    pub fn synchronize(&self) {
        self.events.synchronize();
        self.attributes.synchronize();
    }
}

impl std::fmt::Debug for AnalyticsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsController")
            .field("session_start_ms", &self.session_start_ms)
            .field("events", &self.events)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AnalyticsConfig;
    use crate::event::{ATTR_GUID, ATTR_INTERACTION_DURATION};
    use crate::request::{ATTR_NETWORK_ERROR_CODE, ATTR_STATUS_CODE};

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        controller: AnalyticsController,
    }

    fn harness() -> Harness {
        mobagent_logging::try_init_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let config = SharedConfig::new(AnalyticsConfig {
            storage_dir: dir.path().to_path_buf(),
            ..AnalyticsConfig::default()
        });
        let clock = Arc::new(ManualClock::new(T0));
        let controller =
            AnalyticsController::open(config, AttributeValidator::standard(), clock.clone())
                .unwrap();
        Harness {
            _dir: dir,
            clock,
            controller,
        }
    }

    fn events(controller: &AnalyticsController) -> Vec<JsonValue> {
        match controller.get_events_json(false) {
            JsonValue::Array(events) => events,
            other => panic!("expected array, got {}", other),
        }
    }

    #[test]
    fn test_interaction_duration_scenario() {
        let h = harness();
        h.clock.set(T0 + 5_000);
        assert!(h.controller.add_interaction_event("view", 1.43));

        let events = events(&h.controller);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        let elapsed = event["timeSinceLoad"].as_f64().unwrap();
        assert!((elapsed - 5.0).abs() < 1e-9);
        assert_eq!(event[ATTR_INTERACTION_DURATION].as_f64(), Some(1.43));
        assert_eq!(event["category"], "Interaction");
        assert_eq!(event["name"], "view");
        assert_eq!(event["timestamp"].as_f64(), Some((T0 + 5_000) as f64));
    }

    #[test]
    fn test_clock_skew_fails_the_call() {
        let h = harness();
        h.clock.set(T0 - 1);
        assert!(matches!(
            h.controller.session_elapsed_secs(),
            Err(AnalyticsError::ClockSkew { .. })
        ));
        assert!(!h.controller.add_interaction_event("view", 1.0));
        assert!(h.controller.new_session_event().is_none());

        h.clock.set(T0);
        assert!(h.controller.add_interaction_event("view", 1.0));
    }

    #[test]
    fn test_duplicate_session_attribute_scenario() {
        let h = harness();
        assert!(h.controller.add_session_attribute("hello", "world", false));
        assert!(h.controller.add_session_attribute("hello", "again", false));
        let json = h.controller.get_session_attribute_json();
        assert_eq!(json.as_object().map(Map::len), Some(1));
        assert_eq!(json["hello"], "again");
    }

    #[test]
    fn test_reserved_session_attributes() {
        let h = harness();
        assert!(!h.controller.add_session_attribute("eventType", "x", false));
        assert!(!h.controller.add_session_attribute("nr.custom", "x", false));
    }

    #[test]
    fn test_custom_event_with_attributes() {
        let h = harness();
        assert!(h
            .controller
            .add_custom_event("Purchase", [("sku", TaggedValue::from("A1")), ("qty", 2i64.into())]));
        assert!(!h.controller.add_custom_event("Mobile", Vec::<(&str, TaggedValue)>::new()));
        assert!(!h.controller.add_custom_event("Purchase", [("", "v")]));

        let events = events(&h.controller);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["eventType"], "Purchase");
        assert_eq!(events[0]["qty"], 2);
    }

    #[test]
    fn test_request_events() {
        let h = harness();
        let payload = TracePayload::new("guid-1", "trace-1");
        let ok = NetworkRequest::new("https://example.com/api", "GET")
            .with_status_code(200)
            .with_transfer(0, 512)
            .with_response_time(0.1);
        assert!(h.controller.add_request_event(&ok, Some(&payload)));

        let http_error = NetworkRequest::new("https://example.com/api", "GET").with_status_code(503);
        assert!(h.controller.add_http_error_event(&http_error, None));
        assert!(!h
            .controller
            .add_http_error_event(&NetworkRequest::new("https://example.com", "GET"), None));

        let failure =
            NetworkRequest::new("https://example.com/api", "GET").with_network_error_code(-1001);
        assert!(h.controller.add_network_failure_event(&failure, None));
        assert!(!h.controller.add_network_failure_event(&ok, None));

        let events = events(&h.controller);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["eventType"], "MobileRequest");
        assert_eq!(events[0][ATTR_GUID], "guid-1");
        assert_eq!(events[0]["requestDomain"], "example.com");
        assert_eq!(events[1]["eventType"], "MobileRequestError");
        assert_eq!(events[1][ATTR_STATUS_CODE], 503);
        assert_eq!(events[2][ATTR_NETWORK_ERROR_CODE], -1001);
    }

    #[test]
    fn test_session_end_and_user_action() {
        let h = harness();
        h.clock.advance_ms(90_000);
        assert!(h.controller.add_session_end_event());
        assert!(h
            .controller
            .add_user_action_event("appLaunch", [("screen", "home")]));

        let events = events(&h.controller);
        assert_eq!(events[0]["category"], "Session");
        assert_eq!(events[0][ATTR_SESSION_DURATION].as_f64(), Some(90.0));
        assert_eq!(events[1]["eventType"], "MobileUserAction");
        assert_eq!(events[1][ATTR_ACTION_TYPE], "appLaunch");
        assert_eq!(events[1]["screen"], "home");
    }

    #[test]
    fn test_harvest_clears_buffer_and_mirror() {
        let h = harness();
        assert!(h.controller.add_interaction_event("a", 0.1));
        assert!(h.controller.add_interaction_event("b", 0.2));

        let harvested = h.controller.get_events_json(true);
        assert_eq!(harvested.as_array().map(Vec::len), Some(2));
        assert!(h.controller.event_buffer().is_empty());

        h.controller.synchronize();
        let duplicated = h.controller.fetch_duplicated_events(false).unwrap();
        assert_eq!(duplicated.as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn test_duplicates_recovered_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = SharedConfig::new(AnalyticsConfig {
            storage_dir: dir.path().to_path_buf(),
            ..AnalyticsConfig::default()
        });
        let clock = Arc::new(ManualClock::new(T0));
        {
            let controller = AnalyticsController::open(
                config.clone(),
                AttributeValidator::standard(),
                clock.clone(),
            )
            .unwrap();
            assert!(controller.add_interaction_event("before-crash", 1.0));
            assert!(controller.add_session_attribute("plan", "gold", false));
            assert!(controller.add_session_attribute("userId", "u-1", true));
        }

        let controller =
            AnalyticsController::open(config, AttributeValidator::standard(), clock).unwrap();
        assert_eq!(controller.get_session_attribute_json()["userId"], "u-1");
        assert!(controller.get_session_attribute_json().get("plan").is_none());

        let events = controller.fetch_duplicated_events(true).unwrap();
        assert_eq!(events[0]["name"], "before-crash");
        let attributes = controller.fetch_duplicated_attributes(true).unwrap();
        assert_eq!(attributes["plan"], "gold");

        assert!(controller.clear_events_duplication_store());
        assert!(controller.clear_attributes_duplication_store());
    }

    #[test]
    fn test_max_queue_time_uses_clock() {
        let h = harness();
        assert!(h.controller.set_max_buffer_time_secs(30));
        assert!(!h.controller.did_reach_max_queue_time());
        assert!(h.controller.add_interaction_event("a", 0.1));
        h.clock.advance_ms(30_000);
        assert!(h.controller.did_reach_max_queue_time());
    }

    #[test]
    fn test_increment_and_nr_attributes() {
        let h = harness();
        assert!(h.controller.increment_session_attribute("taps", Number::Long(1), false));
        assert!(h.controller.increment_session_attribute("taps", Number::Long(1), false));
        h.controller
            .add_nr_attribute(Attribute::new("nr.internal", TaggedValue::boolean(true), false));
        let json = h.controller.get_session_attribute_json();
        assert_eq!(json["taps"], 2);
        assert_eq!(json["nr.internal"], true);

        assert!(h.controller.remove_session_attribute("taps"));
        assert!(h.controller.clear_session_attributes());
        assert_eq!(h.controller.session_attributes().len(), 0);
    }
}
