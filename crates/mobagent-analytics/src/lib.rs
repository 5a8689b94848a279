//! Event and session-attribute buffering for the mobile agent.
//!
//! Instrumentation hands events and session attributes to the
//! [`AnalyticsController`]. They are held in a bounded in-memory buffer and
//! mirrored to flat files by [`DurableStore`] so that accepted data survives a
//! crash until the next harvest uploads it.
//!
//! Strings are escaped once on the way in (control characters become `\t`,
//! `^A` and similar) and are never unescaped.

pub mod attribute;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod request;
pub mod session;
pub mod store;
pub mod validator;
pub mod value;

pub use attribute::Attribute;
pub use buffer::{EventBuffer, EvictionStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnalyticsConfig, SharedConfig, StoragePaths};
pub use controller::AnalyticsController;
pub use error::{AnalyticsError, Result};
pub use event::{AnalyticEvent, EventKind, TracePayload};
pub use request::NetworkRequest;
pub use session::SessionAttributeStore;
pub use store::{DurableStore, Persist, RecordPolicy};
pub use validator::AttributeValidator;
pub use value::{Category, Number, NumberKind, TaggedValue};
