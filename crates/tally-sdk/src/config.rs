use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_codec::DataFormat;
use tally_core::{BucketLayout, EngineOptions, DEFAULT_SWEEP_INTERVAL};
use tally_events::pubsub::DEFAULT_CHANNEL_CAPACITY;
use tally_store::file::DEFAULT_EXTENSION;
use tally_store::{DataStorage, FileStorage, InMemoryStorage};

use crate::error::SdkResult;

/// Settings for a [`DataApi`](crate::DataApi). Every field has a default, so
/// an empty TOML document is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Identity of this process on the event channel. A random id is used
    /// when unset.
    pub node_id: Option<String>,
    pub format: DataFormat,
    pub owner_bucket: String,
    pub linked_prefix: String,
    pub sweep_interval_ms: u64,
    pub sweep_enabled: bool,
    pub channel_capacity: usize,
    pub storage: StorageConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        let layout = BucketLayout::default();
        Self {
            node_id: None,
            format: DataFormat::default(),
            owner_bucket: layout.owner_bucket,
            linked_prefix: layout.linked_prefix,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            sweep_enabled: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the file backend.
    pub path: PathBuf,
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("data"),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl TallyConfig {
    pub fn from_toml_str(text: &str) -> SdkResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn layout(&self) -> BucketLayout {
        BucketLayout {
            owner_bucket: self.owner_bucket.clone(),
            linked_prefix: self.linked_prefix.clone(),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            format: self.format,
            layout: self.layout(),
        }
    }

    /// Sweep period, or `None` when the sweeper is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_enabled
            .then(|| Duration::from_millis(self.sweep_interval_ms.max(1)))
    }

    /// The configured node id, or a fresh random one.
    pub fn resolve_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn open_storage(&self) -> Arc<dyn DataStorage> {
        match self.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
            StorageBackend::File => Arc::new(FileStorage::with_extension(
                self.storage.path.clone(),
                self.storage.extension.clone(),
            )),
        }
    }
}
