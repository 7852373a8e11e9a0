//! Storage backend configuration.
//!
//! A [`StorageConfig`] is built once at process start (from code or from a
//! property set) and hands out one [`Connector`] per logical database name.
//!
//! # Property keys
//!
//! | Key | Backend | Required |
//! |-----|---------|----------|
//! | `storage.backend` | selects `inMemory` or `diskResident` | no (`inMemory`) |
//! | `inMemory.outputFolder` | InMemory | yes |
//! | `diskResident.outputFolder` | DiskResident | yes |
//! | `diskResident.cacheSize` | DiskResident | yes |
//! | `diskResident.compressed` | DiskResident | yes |
//! | `diskResident.transacted` | DiskResident | yes |

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::connector::Connector;
use crate::disk::DiskConnector;
use crate::error;
use crate::memory::InMemoryConnector;

/// Separator used to compose logical database names.
pub const DATABASE_NAME_SEPARATOR: char = '_';

/// Characters that may not appear in a database name (reserved on common filesystems).
pub const RESERVED_CHARACTERS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Property set accepted by [`StorageConfig::configure`].
pub type Properties = BTreeMap<String, String>;

pub const BACKEND_KEY: &str = "storage.backend";
pub const IN_MEMORY_OUTPUT_FOLDER: &str = "inMemory.outputFolder";
pub const DISK_OUTPUT_FOLDER: &str = "diskResident.outputFolder";
pub const DISK_CACHE_SIZE: &str = "diskResident.cacheSize";
pub const DISK_COMPRESSED: &str = "diskResident.compressed";
pub const DISK_TRANSACTED: &str = "diskResident.transacted";

// ============================================================================
// BackendKind
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// All state in process memory, written to one file on save.
    InMemory,
    /// Big maps and snapshots in a RocksDB instance per database.
    DiskResident,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::InMemory => write!(f, "inMemory"),
            BackendKind::DiskResident => write!(f, "diskResident"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inmemory" | "in_memory" | "memory" => Ok(BackendKind::InMemory),
            "diskresident" | "disk_resident" | "disk" => Ok(BackendKind::DiskResident),
            other => Err(error::configuration(format!(
                "Unknown storage backend '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// InMemoryConfig
// ============================================================================

/// Configuration of the in-memory backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InMemoryConfig {
    /// Folder holding one snapshot file per database.
    /// Empty means the current working directory.
    pub output_folder: PathBuf,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            output_folder: PathBuf::from("./"),
        }
    }
}

impl InMemoryConfig {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            output_folder: output_folder.into(),
        }
    }

    fn configure(&mut self, properties: &Properties) -> Result<()> {
        self.output_folder = PathBuf::from(required(properties, IN_MEMORY_OUTPUT_FOLDER)?);
        Ok(())
    }
}

// ============================================================================
// DiskConfig
// ============================================================================

/// Configuration of the disk-resident backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskConfig {
    /// Folder holding one RocksDB directory per database.
    /// Empty means the current working directory.
    pub output_folder: PathBuf,

    /// Number of decoded entries kept hot per big map. `0` disables caching.
    /// Default: 10000.
    pub cache_size: usize,

    /// LZ4-compress stored values. Default: true.
    pub compressed: bool,

    /// Write-ahead log with a synced write per mutation. When off, writes skip
    /// the WAL and become durable at the next save/close. Default: false.
    pub transacted: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            output_folder: PathBuf::from("./"),
            cache_size: 10_000,
            compressed: true,
            transacted: false,
        }
    }
}

impl DiskConfig {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            output_folder: output_folder.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_compression(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_transactions(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    fn configure(&mut self, properties: &Properties) -> Result<()> {
        // Parse everything before touching self so a bad key leaves it unchanged.
        let output_folder = PathBuf::from(required(properties, DISK_OUTPUT_FOLDER)?);
        let cache_size = required(properties, DISK_CACHE_SIZE)?
            .trim()
            .parse::<usize>()
            .map_err(|e| {
                error::configuration(format!("Invalid value for {}: {}", DISK_CACHE_SIZE, e))
            })?;
        let compressed = parse_bool(DISK_COMPRESSED, required(properties, DISK_COMPRESSED)?)?;
        let transacted = parse_bool(DISK_TRANSACTED, required(properties, DISK_TRANSACTED)?)?;

        self.output_folder = output_folder;
        self.cache_size = cache_size;
        self.compressed = compressed;
        self.transacted = transacted;
        Ok(())
    }
}

// ============================================================================
// StorageConfig
// ============================================================================

/// Configuration of one storage backend; the factory for its connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "camelCase")]
pub enum StorageConfig {
    InMemory(InMemoryConfig),
    DiskResident(DiskConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::InMemory(InMemoryConfig::default())
    }
}

impl From<InMemoryConfig> for StorageConfig {
    fn from(config: InMemoryConfig) -> Self {
        StorageConfig::InMemory(config)
    }
}

impl From<DiskConfig> for StorageConfig {
    fn from(config: DiskConfig) -> Self {
        StorageConfig::DiskResident(config)
    }
}

impl StorageConfig {
    /// Default configuration for a backend kind.
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::InMemory => InMemoryConfig::default().into(),
            BackendKind::DiskResident => DiskConfig::default().into(),
        }
    }

    /// Build a configuration from a property set.
    ///
    /// The backend comes from `storage.backend` (default `inMemory`); all keys
    /// required by that backend must be present.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let kind = match properties.get(BACKEND_KEY) {
            Some(value) => value.parse::<BackendKind>()?,
            None => BackendKind::InMemory,
        };
        let mut config = Self::for_kind(kind);
        config.configure(properties)?;
        Ok(config)
    }

    /// Layer `overrides` over the default property set, then build.
    pub fn with_defaults(overrides: &Properties) -> Result<Self> {
        let kind = match overrides.get(BACKEND_KEY) {
            Some(value) => value.parse::<BackendKind>()?,
            None => BackendKind::InMemory,
        };
        let mut properties = Self::default_properties(kind);
        properties.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self::from_properties(&properties)
    }

    /// The complete default property set for a backend.
    pub fn default_properties(kind: BackendKind) -> Properties {
        let mut properties = Properties::new();
        properties.insert(BACKEND_KEY.to_string(), kind.to_string());
        match kind {
            BackendKind::InMemory => {
                let defaults = InMemoryConfig::default();
                properties.insert(
                    IN_MEMORY_OUTPUT_FOLDER.to_string(),
                    defaults.output_folder.display().to_string(),
                );
            }
            BackendKind::DiskResident => {
                let defaults = DiskConfig::default();
                properties.insert(
                    DISK_OUTPUT_FOLDER.to_string(),
                    defaults.output_folder.display().to_string(),
                );
                properties.insert(DISK_CACHE_SIZE.to_string(), defaults.cache_size.to_string());
                properties.insert(DISK_COMPRESSED.to_string(), defaults.compressed.to_string());
                properties.insert(DISK_TRANSACTED.to_string(), defaults.transacted.to_string());
            }
        }
        properties
    }

    /// Apply the keys of this backend from a property set.
    ///
    /// Fails with a configuration error if a required key is missing or
    /// unparsable; the configuration is unchanged in that case.
    pub fn configure(&mut self, properties: &Properties) -> Result<()> {
        match self {
            StorageConfig::InMemory(config) => config.configure(properties),
            StorageConfig::DiskResident(config) => config.configure(properties),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            StorageConfig::InMemory(_) => BackendKind::InMemory,
            StorageConfig::DiskResident(_) => BackendKind::DiskResident,
        }
    }

    pub fn output_folder(&self) -> &Path {
        match self {
            StorageConfig::InMemory(config) => &config.output_folder,
            StorageConfig::DiskResident(config) => &config.output_folder,
        }
    }

    /// Separator used in composed database names. Same for both backends.
    pub fn database_name_separator(&self) -> char {
        DATABASE_NAME_SEPARATOR
    }

    /// Join name components with the separator.
    pub fn compose_database_name(&self, components: &[&str]) -> Result<String> {
        if components.is_empty() {
            return Err(error::configuration("A database name needs at least one component"));
        }
        let separator = self.database_name_separator();
        for component in components {
            if component.is_empty() {
                return Err(error::configuration("Database name components must not be empty"));
            }
            if component.contains(separator) {
                return Err(error::configuration(format!(
                    "Database name component '{}' contains the separator '{}'",
                    component, separator
                )));
            }
            validate_characters(component)?;
        }
        Ok(components.join(&separator.to_string()))
    }

    /// Open a connector for a logical database.
    pub fn connector(&self, database: &str) -> Result<Connector> {
        validate_database_name(database)?;
        let connector = match self {
            StorageConfig::InMemory(config) => {
                Connector::InMemory(InMemoryConnector::new(database, config.clone()))
            }
            StorageConfig::DiskResident(config) => {
                Connector::DiskResident(DiskConnector::new(database, config.clone()))
            }
        };
        tracing::debug!(
            backend = %self.kind(),
            database,
            "[StorageConfig] Created connector"
        );
        Ok(connector)
    }
}

/// Resolve the on-disk location of a database under an output folder.
pub(crate) fn database_path(output_folder: &Path, database: &str) -> PathBuf {
    if output_folder.as_os_str().is_empty() {
        PathBuf::from(database)
    } else {
        output_folder.join(database)
    }
}

fn validate_database_name(database: &str) -> Result<()> {
    if database.is_empty() {
        return Err(error::configuration("Database name must not be empty"));
    }
    if database == "." || database == ".." {
        return Err(error::configuration(format!(
            "'{}' is not a valid database name",
            database
        )));
    }
    validate_characters(database)
}

fn validate_characters(name: &str) -> Result<()> {
    if let Some(c) = name
        .chars()
        .find(|c| RESERVED_CHARACTERS.contains(c) || c.is_control())
    {
        return Err(error::configuration(format!(
            "Name '{}' contains the reserved character {:?}",
            name, c
        )));
    }
    Ok(())
}

fn required<'a>(properties: &'a Properties, key: &str) -> Result<&'a str> {
    properties
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| error::configuration(format!("Missing required property {}", key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(error::configuration(format!(
            "Invalid value for {}: expected true or false, got '{}'",
            key, other
        ))),
    }
}
