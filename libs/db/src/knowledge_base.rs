//! Persistent home of an algorithm's learned state.
//!
//! A [`KnowledgeBase`] ties together a logical database, its connector, the
//! model parameters (learned state, possibly holding big maps) and the
//! training parameters (hyperparameters).
//!
//! ```text
//!   new ──► Unbound ──reinitialize/load──► Bound ──model_parameters_mut──► Trained
//!                                            ▲                                │
//!                                            │                              save
//!                                            └────model_parameters_mut───► Persisted
//!   erase (from any state) ──► Erased ──reinitialize──► Bound
//! ```

use std::fmt;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::connector::{Connector, DatabaseConnector};
use crate::deep_copy::DeepCopy;
use crate::error;
use crate::provision::{FieldProvisioner, ModelParameters};

/// Key of the snapshot holding a knowledge base.
pub const SNAPSHOT_KEY: &str = "KnowledgeBase";

/// Hyperparameters of an algorithm. Never stored in big maps.
pub trait TrainingParameters: Default + Clone + Serialize + DeserializeOwned + Send {}

impl<T> TrainingParameters for T where T: Default + Clone + Serialize + DeserializeOwned + Send {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeBaseState {
    /// Connector open, no parameters yet.
    Unbound,
    /// Parameters constructed or loaded.
    Bound,
    /// Parameters handed out for mutation since the last save.
    Trained,
    /// Last change saved.
    Persisted,
    /// Database dropped and parameters cleared.
    Erased,
}

#[derive(Serialize)]
struct SnapshotRef<'a, MP, TP> {
    model_parameters: &'a MP,
    training_parameters: &'a TP,
}

#[derive(Deserialize)]
struct Snapshot<MP, TP> {
    model_parameters: MP,
    training_parameters: TP,
}

pub struct KnowledgeBase<MP: ModelParameters, TP: TrainingParameters> {
    database: String,
    config: StorageConfig,
    connector: Connector,
    model_parameters: Option<MP>,
    training_parameters: Option<TP>,
    state: KnowledgeBaseState,
}

impl<MP: ModelParameters, TP: TrainingParameters> KnowledgeBase<MP, TP> {
    /// Open a knowledge base over `database`. Parameters stay unset until
    /// [`reinitialize`](Self::reinitialize) or [`load`](Self::load).
    pub fn new(database: &str, config: StorageConfig) -> Result<Self> {
        let connector = config.connector(database)?;
        Ok(Self {
            database: database.to_string(),
            config,
            connector,
            model_parameters: None,
            training_parameters: None,
            state: KnowledgeBaseState::Unbound,
        })
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn state(&self) -> KnowledgeBaseState {
        self.state
    }

    pub fn model_parameters(&self) -> Option<&MP> {
        self.model_parameters.as_ref()
    }

    /// Mutable access for training; marks the knowledge base as changed.
    pub fn model_parameters_mut(&mut self) -> Option<&mut MP> {
        if self.model_parameters.is_some() {
            self.state = KnowledgeBaseState::Trained;
        }
        self.model_parameters.as_mut()
    }

    pub fn training_parameters(&self) -> Option<&TP> {
        self.training_parameters.as_ref()
    }

    pub fn set_training_parameters(&mut self, training_parameters: TP) {
        self.training_parameters = Some(training_parameters);
    }

    /// Persist both parameter objects as the database's snapshot.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub fn save(&mut self) -> Result<()> {
        let model_parameters = self.model_parameters.as_ref().ok_or_else(|| {
            error::illegal_state(format!(
                "KnowledgeBase '{}' has no model parameters to save; reinitialize or load it first",
                self.database
            ))
        })?;
        let default_training;
        let training_parameters = match self.training_parameters.as_ref() {
            Some(training_parameters) => training_parameters,
            None => {
                default_training = TP::default();
                &default_training
            }
        };

        self.connector.save(
            SNAPSHOT_KEY,
            &SnapshotRef {
                model_parameters,
                training_parameters,
            },
        )?;
        self.state = KnowledgeBaseState::Persisted;
        tracing::info!(database = %self.database, "[KnowledgeBase] Saved");
        Ok(())
    }

    /// Restore parameters from the snapshot. A no-op once parameters are set.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub fn load(&mut self) -> Result<()> {
        if self.model_parameters.is_some() {
            return Ok(());
        }

        let snapshot: Snapshot<MP, TP> = self.connector.load(SNAPSHOT_KEY)?.ok_or_else(|| {
            error::illegal_state(format!(
                "KnowledgeBase '{}' could not be loaded",
                self.database
            ))
        })?;
        let Snapshot {
            mut model_parameters,
            training_parameters,
        } = snapshot;
        FieldProvisioner::rebind(&self.connector, &mut model_parameters)?;

        self.model_parameters = Some(model_parameters);
        self.training_parameters = Some(training_parameters);
        self.state = KnowledgeBaseState::Bound;
        tracing::info!(database = %self.database, "[KnowledgeBase] Loaded");
        Ok(())
    }

    /// Erase everything, then start over with fresh parameters.
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub fn reinitialize(&mut self) -> Result<()> {
        self.erase()?;

        self.connector = self.config.connector(&self.database)?;
        self.model_parameters = Some(FieldProvisioner::construct::<MP>(&self.connector)?);
        self.training_parameters = Some(TP::default());
        self.state = KnowledgeBaseState::Bound;
        Ok(())
    }

    /// Drop the database, close the connector and clear the parameters.
    /// Safe to call repeatedly and after [`close`](Self::close).
    #[tracing::instrument(skip(self), fields(database = %self.database))]
    pub fn erase(&mut self) -> Result<()> {
        if self.connector.is_closed() {
            self.connector = self.config.connector(&self.database)?;
        }
        // Parameters survive a failed drop.
        let model_parameters = self.model_parameters.take();
        if let Err(e) = self.connector.drop_database() {
            self.model_parameters = model_parameters;
            return Err(e);
        }
        drop(model_parameters);
        self.training_parameters = None;
        self.connector.close()?;
        self.state = KnowledgeBaseState::Erased;
        tracing::info!(database = %self.database, "[KnowledgeBase] Erased");
        Ok(())
    }

    /// Close the connector. Parameters stay in memory.
    pub fn close(&mut self) -> Result<()> {
        self.connector.close()
    }

    pub fn is_closed(&self) -> bool {
        self.connector.is_closed()
    }
}

impl<MP, TP> KnowledgeBase<MP, TP>
where
    MP: ModelParameters + DeepCopy,
    TP: TrainingParameters,
{
    /// Independent copies of the current parameters.
    pub fn snapshot(&self) -> Result<(MP, TP)> {
        let model_parameters = self
            .model_parameters
            .as_ref()
            .ok_or_else(|| error::illegal_state("No model parameters to copy"))?
            .deep_copy()?;
        let training_parameters = self.training_parameters.clone().unwrap_or_default();
        Ok((model_parameters, training_parameters))
    }
}

impl<MP: ModelParameters, TP: TrainingParameters> fmt::Debug for KnowledgeBase<MP, TP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("database", &self.database)
            .field("backend", &self.connector.kind())
            .field("state", &self.state)
            .field("closed", &self.connector.is_closed())
            .finish()
    }
}
