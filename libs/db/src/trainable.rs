//! Contract for algorithms that persist their state in a knowledge base.

use anyhow::Result;

use crate::config::StorageConfig;
use crate::error;
use crate::knowledge_base::{KnowledgeBase, TrainingParameters};
use crate::provision::ModelParameters;

pub trait Trainable {
    type Model: ModelParameters;
    type Training: TrainingParameters;
    /// Training input.
    type Data: ?Sized;

    fn knowledge_base(&self) -> &KnowledgeBase<Self::Model, Self::Training>;

    fn knowledge_base_mut(&mut self) -> &mut KnowledgeBase<Self::Model, Self::Training>;

    /// Update the model parameters from `data`.
    fn learn(&mut self, data: &Self::Data) -> Result<()>;

    /// Train from scratch and save: any previous state is erased first.
    fn fit(&mut self, data: &Self::Data, training: Self::Training) -> Result<()> {
        let kb = self.knowledge_base_mut();
        kb.reinitialize()?;
        kb.set_training_parameters(training);

        self.learn(data)?;
        self.knowledge_base_mut().save()
    }

    fn erase(&mut self) -> Result<()> {
        self.knowledge_base_mut().erase()
    }

    fn close(&mut self) -> Result<()> {
        self.knowledge_base_mut().close()
    }
}

/// Name of the database a method stores its knowledge base in: `base` with
/// `<separator><method>` appended, unless `base` already mentions the method.
pub fn method_database_name(config: &StorageConfig, base: &str, method: &str) -> Result<String> {
    if base.is_empty() || method.is_empty() {
        return Err(error::configuration(
            "Database and method names must not be empty",
        ));
    }
    if base.contains(method) {
        return Ok(base.to_string());
    }
    Ok(format!(
        "{}{}{}",
        base,
        config.database_name_separator(),
        method
    ))
}
