//! Registry configuration.

use camino::Utf8PathBuf;
use serde::Deserialize;
use storage::StorageConfig;

use crate::notifications::{EventBridge, SourceRecord};
use crate::paths::DEFAULT_ROOT;

/// Configuration for a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// The storage backend.
    pub storage: StorageConfig,

    /// The root all registry content is stored under.
    #[serde(default = "default_root")]
    pub root: Utf8PathBuf,

    /// How events describe this registry instance.
    #[serde(default)]
    pub events: Option<EventsConfig>,
}

fn default_root() -> Utf8PathBuf {
    DEFAULT_ROOT.into()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            root: default_root(),
            events: None,
        }
    }
}

/// Describes this instance in the events it produces.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EventsConfig {
    /// Base URL content is served from.
    pub base_url: String,

    /// Address of this instance.
    #[serde(default)]
    pub addr: String,

    /// Instance id of this instance.
    #[serde(default)]
    pub instance_id: String,
}

impl EventsConfig {
    /// Build the event bridge this configuration describes.
    pub fn bridge(&self) -> EventBridge {
        EventBridge::new(
            self.base_url.clone(),
            SourceRecord {
                addr: self.addr.clone(),
                instance_id: self.instance_id.clone(),
            },
        )
    }
}
