// Storage library for kbstore
//
// Persists the learned state of trainable algorithms. A `StorageConfig` picks
// the backend (in-memory with file snapshots, or disk-resident on RocksDB) and
// hands out one `Connector` per logical database. A `KnowledgeBase` keeps an
// algorithm's model and training parameters in that database; large
// collections inside the model parameters are `BigMap`s provisioned by the
// connector.

pub mod big_map;
pub mod codec;
pub mod config;
pub mod connector;
pub mod deep_copy;
pub mod disk;
pub mod error;
pub mod knowledge_base;
pub mod lifecycle;
pub mod memory;
pub mod provision;
pub mod trainable;

pub use big_map::{BigMap, MapKey, MapValue};
pub use config::{
    BackendKind, DiskConfig, InMemoryConfig, Properties, StorageConfig, DATABASE_NAME_SEPARATOR,
};
pub use connector::{Connector, DatabaseConnector};
pub use deep_copy::DeepCopy;
pub use error::{Result, StorageError};
pub use knowledge_base::{KnowledgeBase, KnowledgeBaseState, TrainingParameters};
pub use lifecycle::LifecycleGuard;
pub use provision::{BaseModelParameters, FieldProvisioner, ModelParameters};
pub use trainable::{method_database_name, Trainable};

// Algorithms draw their randomness from the shared per-thread source.
pub use kbstore_core::random;
