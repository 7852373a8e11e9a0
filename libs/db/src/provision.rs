//! Binding of big map fields to backend maps.
//!
//! Model parameters list their big maps explicitly:
//!
//! ```ignore
//! impl ModelParameters for NaiveBayesParameters {
//!     fn provision(&mut self, provisioner: &mut FieldProvisioner<'_>) -> Result<()> {
//!         provisioner.bind("log_priors", &mut self.log_priors)?;
//!         provisioner.bind("log_likelihoods", &mut self.log_likelihoods)
//!     }
//!     // ...
//! }
//! ```
//!
//! Parameter structs that embed others delegate to the embedded struct's
//! `provision` with the same provisioner, so names stay unique across the
//! whole value.

use std::collections::HashSet;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::big_map::{BigMap, MapKey, MapValue};
use crate::connector::{Connector, DatabaseConnector};
use crate::deep_copy::DeepCopy;
use crate::error;

/// Scalars shared by every model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseModelParameters {
    /// Number of training records.
    pub n: u64,
    /// Dimensionality of the training data.
    pub d: u64,
}

impl DeepCopy for BaseModelParameters {
    fn deep_copy(&self) -> Result<Self> {
        Ok(*self)
    }
}

/// Learned state of an algorithm.
pub trait ModelParameters: Default + Serialize + DeserializeOwned + Send {
    fn base(&self) -> &BaseModelParameters;

    fn base_mut(&mut self) -> &mut BaseModelParameters;

    /// Register every big map field with `provisioner`.
    fn provision(&mut self, provisioner: &mut FieldProvisioner<'_>) -> Result<()>;
}

/// Binds the big map fields of one model parameters value.
pub struct FieldProvisioner<'a> {
    connector: &'a Connector,
    bound: HashSet<String>,
}

impl<'a> FieldProvisioner<'a> {
    pub fn new(connector: &'a Connector) -> Self {
        Self {
            connector,
            bound: HashSet::new(),
        }
    }

    /// Default-construct model parameters with every big map bound.
    pub fn construct<MP: ModelParameters>(connector: &Connector) -> Result<MP> {
        let mut model_parameters = MP::default();
        Self::rebind(connector, &mut model_parameters)?;
        Ok(model_parameters)
    }

    /// Bind the big maps of a value decoded from a snapshot.
    pub fn rebind<MP: ModelParameters>(connector: &Connector, model_parameters: &mut MP) -> Result<()> {
        let mut provisioner = FieldProvisioner::new(connector);
        model_parameters.provision(&mut provisioner)?;
        tracing::debug!(
            database = connector.database_name(),
            maps = provisioner.bound.len(),
            "[FieldProvisioner] Bound model parameters"
        );
        Ok(())
    }

    /// Bind `map` to the backend map called `name`.
    ///
    /// Entries carried by a detached map (one decoded from a snapshot) are
    /// copied into the backend map.
    pub fn bind<K: MapKey, V: MapValue>(&mut self, name: &str, map: &mut BigMap<K, V>) -> Result<()> {
        if name.is_empty() {
            return Err(error::binding(name, "field name must not be empty"));
        }
        if !self.bound.insert(name.to_string()) {
            return Err(error::binding(name, "field name is already bound"));
        }

        let detached = map.take_detached();
        let mut backend_map: BigMap<K, V> = self
            .connector
            .get_big_map(name, false)
            .map_err(|e| error::binding(name, format!("{:#}", e)))?;

        if let Some(entries) = detached {
            let count = entries.len();
            for (key, value) in entries {
                backend_map
                    .insert(key, value)
                    .map_err(|e| error::binding(name, format!("{:#}", e)))?;
            }
            tracing::debug!(map = name, entries = count, "[FieldProvisioner] Restored entries");
        }

        *map = backend_map;
        Ok(())
    }

    /// Names bound so far.
    #[cfg(test)]
    fn bound_names(&self) -> impl Iterator<Item = &str> {
        self.bound.iter().map(String::as_str)
    }
}
