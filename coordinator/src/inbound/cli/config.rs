//! Coordinator configuration loaded via OrthoConfig, plus the storage
//! topology file it points at.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cap_std::{ambient_authority, fs::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{
    ConfiguredStorages, DEFAULT_BATCH_INTERVAL, DEFAULT_STALE_THRESHOLD, ListenerConfig,
};
use crate::outbound::storage::FilesystemStorages;

/// Errors raised while resolving settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// Configuration sources could not be merged.
    #[error("failed to load configuration: {message}")]
    Load { message: String },
    /// No database URL was configured.
    #[error("database URL missing: set --database-url or COORDINATOR_DATABASE_URL")]
    MissingDatabaseUrl,
    /// No topology file was configured.
    #[error("topology path missing: set COORDINATOR_TOPOLOGY_PATH")]
    MissingTopologyPath,
    /// Listener timings are inconsistent.
    #[error("invalid listener timing: {message}")]
    ListenerTiming { message: String },
    /// The HTTP listen address does not parse.
    #[error("invalid HTTP listen address {value}: {message}")]
    ListenAddr { value: String, message: String },
}

/// Address `serve` binds when none is configured.
pub const DEFAULT_HTTP_LISTEN_ADDR: &str = "127.0.0.1:9652";

/// Settings shared by every coordinator command.
#[derive(Debug, Clone, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "COORDINATOR")]
pub struct CoordinatorSettings {
    /// PostgreSQL connection URL.
    pub database_url: Option<String>,
    /// JSON file describing virtual storages and their nodes.
    pub topology_path: Option<PathBuf>,
    /// Interval between change listener pings.
    pub listener_ping_period_ms: Option<u64>,
    /// First delay before the change listener reconnects.
    pub listener_min_reconnect_ms: Option<u64>,
    /// Upper bound of the change listener reconnect delay.
    pub listener_max_reconnect_ms: Option<u64>,
    /// Age after which an in-flight replication event is reclaimed.
    pub stale_job_threshold_ms: Option<u64>,
    /// Delay between import batches.
    pub import_batch_interval_ms: Option<u64>,
    /// Address of the read-routing and metrics endpoints of `serve`.
    pub http_listen_addr: Option<String>,
    /// Judge writability by each repository's own primary instead of the
    /// virtual storage's shard primary.
    #[ortho_config(default = false)]
    pub per_repository_primary: bool,
}

impl CoordinatorSettings {
    /// Load from the configuration file and `COORDINATOR_*` variables.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from_iter([OsString::from("coordinator")]).map_err(|err| SettingsError::Load {
            message: err.to_string(),
        })
    }

    /// Database URL, preferring a non-empty `explicit` value.
    pub fn database_url(&self, explicit: Option<&str>) -> Result<String, SettingsError> {
        [explicit, self.database_url.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_owned)
            .ok_or(SettingsError::MissingDatabaseUrl)
    }

    /// Configured topology file.
    pub fn topology_path(&self) -> Result<&Path, SettingsError> {
        self.topology_path
            .as_deref()
            .ok_or(SettingsError::MissingTopologyPath)
    }

    /// Change listener timing with defaults for unset values.
    pub fn listener_config(&self) -> Result<ListenerConfig, SettingsError> {
        let defaults = ListenerConfig::default();
        let config = ListenerConfig {
            ping_period: millis_or(self.listener_ping_period_ms, defaults.ping_period),
            min_reconnect: millis_or(self.listener_min_reconnect_ms, defaults.min_reconnect),
            max_reconnect: millis_or(self.listener_max_reconnect_ms, defaults.max_reconnect),
        };
        if config.ping_period.is_zero() || config.min_reconnect.is_zero() {
            return Err(SettingsError::ListenerTiming {
                message: "ping period and reconnect delay must be positive".to_owned(),
            });
        }
        if config.min_reconnect > config.max_reconnect {
            return Err(SettingsError::ListenerTiming {
                message: format!(
                    "minimum reconnect delay {:?} exceeds maximum {:?}",
                    config.min_reconnect, config.max_reconnect
                ),
            });
        }
        Ok(config)
    }

    /// Age after which in-flight events are reclaimed.
    pub fn stale_job_threshold(&self) -> Duration {
        millis_or(self.stale_job_threshold_ms, DEFAULT_STALE_THRESHOLD)
    }

    /// Delay between import batches.
    pub fn import_batch_interval(&self) -> Duration {
        millis_or(self.import_batch_interval_ms, DEFAULT_BATCH_INTERVAL)
    }

    /// Address `serve` binds its HTTP endpoints to.
    pub fn http_listen_addr(&self) -> Result<SocketAddr, SettingsError> {
        let value = self
            .http_listen_addr
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_HTTP_LISTEN_ADDR);
        value.parse().map_err(|err: std::net::AddrParseError| SettingsError::ListenAddr {
            value: value.to_owned(),
            message: err.to_string(),
        })
    }

    /// Whether reports use the virtual storage's shard primary.
    pub fn use_virtual_storage_primary(&self) -> bool {
        !self.per_repository_primary
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

/// Errors raised while loading the topology file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("failed to read topology at {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("failed to parse topology: {message}")]
    Parse { message: String },
    #[error("topology defines no virtual storages")]
    Empty,
    #[error("virtual storage name must not be empty")]
    EmptyName,
    #[error("virtual storage {virtual_storage} has no nodes")]
    NoNodes { virtual_storage: String },
    #[error("virtual storage {virtual_storage} has a node without a storage name")]
    EmptyStorage { virtual_storage: String },
    #[error("virtual storage {virtual_storage} is defined more than once")]
    DuplicateVirtualStorage { virtual_storage: String },
    #[error("storage {storage} is listed twice in virtual storage {virtual_storage}")]
    DuplicateStorage {
        virtual_storage: String,
        storage: String,
    },
    #[error("virtual storage {virtual_storage} marks more than one node as primary")]
    MultiplePrimaries { virtual_storage: String },
}

/// One storage node and the directory it serves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub storage: String,
    pub path: PathBuf,
    /// Seed the shard primary with this node when none is elected.
    #[serde(default)]
    pub primary: bool,
}

/// A virtual storage and its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualStorageConfig {
    pub name: String,
    pub nodes: Vec<NodeConfig>,
}

/// Validated storage topology.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    pub virtual_storages: Vec<VirtualStorageConfig>,
}

impl Topology {
    /// Read and validate the topology at `path`.
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let read_error = |message: String| TopologyError::Read {
            path: path.to_path_buf(),
            message,
        };
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| read_error("path must name a file".to_owned()))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| read_error(err.to_string()))?;
        let contents = dir
            .read_to_string(Path::new(file_name))
            .map_err(|err| read_error(err.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse and validate a JSON topology.
    pub fn parse(json: &str) -> Result<Self, TopologyError> {
        let topology: Self = serde_json::from_str(json).map_err(|err| TopologyError::Parse {
            message: err.to_string(),
        })?;
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.virtual_storages.is_empty() {
            return Err(TopologyError::Empty);
        }
        let mut names = BTreeSet::new();
        for virtual_storage in &self.virtual_storages {
            let name = virtual_storage.name.trim();
            if name.is_empty() {
                return Err(TopologyError::EmptyName);
            }
            if !names.insert(name) {
                return Err(TopologyError::DuplicateVirtualStorage {
                    virtual_storage: name.to_owned(),
                });
            }
            if virtual_storage.nodes.is_empty() {
                return Err(TopologyError::NoNodes {
                    virtual_storage: name.to_owned(),
                });
            }
            let mut storages = BTreeSet::new();
            for node in &virtual_storage.nodes {
                let storage = node.storage.trim();
                if storage.is_empty() {
                    return Err(TopologyError::EmptyStorage {
                        virtual_storage: name.to_owned(),
                    });
                }
                if !storages.insert(storage) {
                    return Err(TopologyError::DuplicateStorage {
                        virtual_storage: name.to_owned(),
                        storage: storage.to_owned(),
                    });
                }
            }
            if virtual_storage.nodes.iter().filter(|node| node.primary).count() > 1 {
                return Err(TopologyError::MultiplePrimaries {
                    virtual_storage: name.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Storage names of every virtual storage.
    pub fn configured_storages(&self) -> ConfiguredStorages {
        ConfiguredStorages::new(self.virtual_storages.iter().map(|virtual_storage| {
            (
                virtual_storage.name.clone(),
                virtual_storage
                    .nodes
                    .iter()
                    .map(|node| node.storage.clone())
                    .collect(),
            )
        }))
    }

    /// Filesystem adapter serving every configured node.
    pub fn filesystem_storages(&self) -> FilesystemStorages {
        FilesystemStorages::new(self.nodes().map(|(virtual_storage, node)| {
            (
                virtual_storage.to_owned(),
                node.storage.clone(),
                node.path.clone(),
            )
        }))
    }

    /// Every node paired with its virtual storage name.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeConfig)> {
        self.virtual_storages.iter().flat_map(|virtual_storage| {
            virtual_storage
                .nodes
                .iter()
                .map(move |node| (virtual_storage.name.as_str(), node))
        })
    }

    /// Node marked as primary for `virtual_storage`, if any.
    pub fn configured_primary(&self, virtual_storage: &str) -> Option<&str> {
        self.nodes()
            .find(|(name, node)| *name == virtual_storage && node.primary)
            .map(|(_, node)| node.storage.as_str())
    }
}
