//! Analytics configuration.
//!
//! The buffer limits apply to every buffer that shares a [`SharedConfig`]
//! handle. Reconfiguring through any clone of the handle is observed by all
//! of them on their next read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::buffer::EvictionStrategy;
use crate::error::{AnalyticsError, Result};

pub const DEFAULT_MAX_EVENT_BUFFER_SIZE: u32 = 1000;
pub const DEFAULT_MAX_EVENT_BUFFER_TIME_SECS: u32 = 600;
pub const DEFAULT_MAX_SESSION_ATTRIBUTES: u32 = 128;

pub const ATTRIBUTE_DUPLICATION_FILE: &str = "attributes.duplicate";
pub const ATTRIBUTE_PERSISTENT_FILE: &str = "attributes.persistent";
pub const EVENT_DUPLICATION_FILE: &str = "events.duplicate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Maximum number of events held between harvests.
    #[serde(default = "default_max_event_buffer_size")]
    pub max_event_buffer_size: u32,

    /// Age of the oldest buffered event that should trigger a harvest.
    #[serde(default = "default_max_event_buffer_time_secs")]
    pub max_event_buffer_time_secs: u32,

    /// Maximum number of distinct session attributes.
    #[serde(default = "default_max_session_attributes")]
    pub max_session_attributes: u32,

    /// Directory holding the duplication and persistent store files.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Victim selection once the event buffer is full.
    #[serde(default)]
    pub eviction: EvictionStrategy,

    /// Drop unparseable store records instead of aborting the load.
    #[serde(default)]
    pub skip_malformed_records: bool,
}

fn default_max_event_buffer_size() -> u32 {
    DEFAULT_MAX_EVENT_BUFFER_SIZE
}

fn default_max_event_buffer_time_secs() -> u32 {
    DEFAULT_MAX_EVENT_BUFFER_TIME_SECS
}

fn default_max_session_attributes() -> u32 {
    DEFAULT_MAX_SESSION_ATTRIBUTES
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            max_event_buffer_size: default_max_event_buffer_size(),
            max_event_buffer_time_secs: default_max_event_buffer_time_secs(),
            max_session_attributes: default_max_session_attributes(),
            storage_dir: default_storage_dir(),
            eviction: EvictionStrategy::default(),
            skip_malformed_records: false,
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_event_buffer_size == 0 {
            return Err(AnalyticsError::Config(
                "max_event_buffer_size must be positive".into(),
            ));
        }
        if self.max_event_buffer_time_secs == 0 {
            return Err(AnalyticsError::Config(
                "max_event_buffer_time_secs must be positive".into(),
            ));
        }
        if self.max_session_attributes == 0 {
            return Err(AnalyticsError::Config(
                "max_session_attributes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn storage_paths(&self) -> StoragePaths {
        StoragePaths::in_dir(&self.storage_dir)
    }
}

/// The three store files of one session context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub attribute_duplication: PathBuf,
    pub attribute_persistent: PathBuf,
    pub event_duplication: PathBuf,
}

impl StoragePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            attribute_duplication: dir.join(ATTRIBUTE_DUPLICATION_FILE),
            attribute_persistent: dir.join(ATTRIBUTE_PERSISTENT_FILE),
            event_duplication: dir.join(EVENT_DUPLICATION_FILE),
        }
    }
}

/// Shared, hot-swappable configuration handle.
#[derive(Clone)]
pub struct SharedConfig {
    config: Arc<ArcSwap<AnalyticsConfig>>,
    path: Option<Arc<PathBuf>>,
}

impl SharedConfig {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            path: None,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AnalyticsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut shared = Self::from_toml_str(&text)?;
        shared.path = Some(Arc::new(path.to_path_buf()));
        Ok(shared)
    }

    /// Re-read the file this handle was loaded from, if any.
    pub fn reload(&self) -> Result<()> {
        if let Some(ref path) = self.path {
            let text = std::fs::read_to_string(path.as_path())?;
            let config: AnalyticsConfig = toml::from_str(&text)?;
            self.update(config)?;
            tracing::info!(path = %path.display(), "analytics config reloaded");
        }
        Ok(())
    }

    pub fn get(&self) -> Arc<AnalyticsConfig> {
        self.config.load_full()
    }

    pub fn update(&self, config: AnalyticsConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn set_max_buffer_size(&self, size: u32) -> Result<()> {
        self.modify(|c| c.max_event_buffer_size = size)
    }

    pub fn set_max_buffer_time_secs(&self, secs: u32) -> Result<()> {
        self.modify(|c| c.max_event_buffer_time_secs = secs)
    }

    fn modify(&self, f: impl Fn(&mut AnalyticsConfig)) -> Result<()> {
        let mut candidate = (*self.get()).clone();
        f(&mut candidate);
        candidate.validate()?;
        self.config.rcu(|current| {
            let mut next = (**current).clone();
            f(&mut next);
            next
        });
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(AnalyticsConfig::default())
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("config", &*self.get())
            .field("path", &self.path)
            .finish()
    }
}
