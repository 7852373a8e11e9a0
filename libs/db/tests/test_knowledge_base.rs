//! Integration tests for knowledge bases and trainable algorithms.
//!
//! A small word-counting algorithm exercises the full cycle on both backends:
//! fit (reinitialize, learn, save), close, reopen, load, compare.

use std::path::Path;

use anyhow::{anyhow, Result};
use kbstore_db::random;
use kbstore_db::{
    method_database_name, BaseModelParameters, BigMap, DatabaseConnector, DeepCopy, DiskConfig,
    FieldProvisioner, InMemoryConfig, KnowledgeBase, KnowledgeBaseState, ModelParameters,
    StorageConfig, StorageError, Trainable,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

// ============================================================================
// Word counter
// ============================================================================

#[derive(Default, Serialize, Deserialize)]
struct CountParameters {
    base: BaseModelParameters,
    counts: BigMap<String, u64>,
}

impl ModelParameters for CountParameters {
    fn base(&self) -> &BaseModelParameters {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModelParameters {
        &mut self.base
    }

    fn provision(&mut self, provisioner: &mut FieldProvisioner<'_>) -> Result<()> {
        provisioner.bind("counts", &mut self.counts)
    }
}

/// Extends the counts with a random weight per word.
#[derive(Default, Serialize, Deserialize)]
struct WeightedParameters {
    counts: CountParameters,
    weights: BigMap<String, f64>,
}

impl ModelParameters for WeightedParameters {
    fn base(&self) -> &BaseModelParameters {
        self.counts.base()
    }

    fn base_mut(&mut self) -> &mut BaseModelParameters {
        self.counts.base_mut()
    }

    fn provision(&mut self, provisioner: &mut FieldProvisioner<'_>) -> Result<()> {
        self.counts.provision(provisioner)?;
        provisioner.bind("weights", &mut self.weights)
    }
}

impl DeepCopy for WeightedParameters {
    fn deep_copy(&self) -> Result<Self> {
        Ok(Self {
            counts: CountParameters {
                base: self.counts.base.deep_copy()?,
                counts: self.counts.counts.deep_copy()?,
            },
            weights: self.weights.deep_copy()?,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct CountTraining {
    min_length: usize,
}

struct WordCounter {
    kb: KnowledgeBase<WeightedParameters, CountTraining>,
}

impl WordCounter {
    fn new(database: &str, config: StorageConfig) -> Result<Self> {
        let name = method_database_name(&config, database, "WordCounter")?;
        Ok(Self {
            kb: KnowledgeBase::new(&name, config)?,
        })
    }
}

impl Trainable for WordCounter {
    type Model = WeightedParameters;
    type Training = CountTraining;
    type Data = [&'static str];

    fn knowledge_base(&self) -> &KnowledgeBase<WeightedParameters, CountTraining> {
        &self.kb
    }

    fn knowledge_base_mut(&mut self) -> &mut KnowledgeBase<WeightedParameters, CountTraining> {
        &mut self.kb
    }

    fn learn(&mut self, data: &[&'static str]) -> Result<()> {
        let min_length = self
            .kb
            .training_parameters()
            .map(|t| t.min_length)
            .unwrap_or_default();
        let mut skipped: BigMap<String, u64> = self.kb.connector().get_big_map("skipped", true)?;

        let params = self
            .kb
            .model_parameters_mut()
            .ok_or_else(|| anyhow!("not initialized"))?;
        for word in data {
            if word.len() < min_length {
                let seen = skipped.get(&word.to_string())?.unwrap_or(0);
                skipped.insert(word.to_string(), seen + 1)?;
                continue;
            }
            let count = params.counts.counts.get(&word.to_string())?.unwrap_or(0);
            params.counts.counts.insert(word.to_string(), count + 1)?;
            if !params.weights.contains_key(&word.to_string())? {
                let weight = random::with_thread_rng(|rng| rng.gen::<f64>());
                params.weights.insert(word.to_string(), weight)?;
            }
            params.base_mut().n += 1;
        }
        params.base_mut().d = params.counts.counts.len()? as u64;

        self.kb.connector().drop_big_map("skipped", &mut skipped)
    }
}

const CORPUS: &[&str] = &["a", "spam", "ham", "spam", "eggs", "ham", "spam", "b"];

fn backends(folder: &Path) -> Vec<StorageConfig> {
    vec![
        InMemoryConfig::new(folder).into(),
        DiskConfig::new(folder).into(),
        DiskConfig::new(folder)
            .with_cache_size(0)
            .with_transactions(true)
            .into(),
    ]
}

fn sorted<K: Ord + Clone + kbstore_db::MapKey, V: kbstore_db::MapValue>(
    map: &BigMap<K, V>,
) -> Vec<(K, V)> {
    let mut entries = map.entries().unwrap();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_fit_then_load_restores_everything() {
    kbstore_core::telemetry::try_init_test_subscriber();
    let temp_dir = TempDir::new().unwrap();

    for (i, config) in backends(temp_dir.path()).into_iter().enumerate() {
        let database = format!("corpus{}", i);
        random::reseed_thread_rng(Some(7));

        let mut counter = WordCounter::new(&database, config.clone()).unwrap();
        counter
            .fit(CORPUS, CountTraining { min_length: 2 })
            .unwrap();
        assert_eq!(counter.knowledge_base().state(), KnowledgeBaseState::Persisted);
        let (expected, _) = counter.knowledge_base().snapshot().unwrap();
        Trainable::close(&mut counter).unwrap();

        let mut reopened = WordCounter::new(&database, config.clone()).unwrap();
        reopened.knowledge_base_mut().load().unwrap();
        let kb = reopened.knowledge_base();
        assert_eq!(kb.state(), KnowledgeBaseState::Bound);
        assert_eq!(kb.database_name(), format!("{}_WordCounter", database));
        assert_eq!(
            kb.training_parameters(),
            Some(&CountTraining { min_length: 2 })
        );

        let params = kb.model_parameters().unwrap();
        assert_eq!(*params.base(), BaseModelParameters { n: 6, d: 3 });
        assert!(params.counts.counts.is_bound());
        assert!(params.weights.is_bound());
        assert_eq!(
            sorted(&params.counts.counts),
            vec![
                ("eggs".to_string(), 1),
                ("ham".to_string(), 2),
                ("spam".to_string(), 3)
            ]
        );
        assert_eq!(sorted(&params.counts.counts), sorted(&expected.counts.counts));
        assert_eq!(sorted(&params.weights), sorted(&expected.weights));
        Trainable::close(&mut reopened).unwrap();
    }
}

#[test]
fn test_seeded_fits_are_reproducible() {
    let temp_dir = TempDir::new().unwrap();
    let config: StorageConfig = InMemoryConfig::new(temp_dir.path()).into();

    let mut runs = Vec::new();
    for _ in 0..2 {
        random::reseed_thread_rng(Some(1234));
        let mut counter = WordCounter::new("seeded", config.clone()).unwrap();
        counter.fit(CORPUS, CountTraining::default()).unwrap();
        let params = counter.knowledge_base().model_parameters().unwrap();
        runs.push(sorted(&params.weights));
        Trainable::close(&mut counter).unwrap();
    }
    assert_eq!(runs[0], runs[1]);
}

#[test]
fn test_load_is_noop_once_loaded() {
    let temp_dir = TempDir::new().unwrap();
    for (i, config) in backends(temp_dir.path()).into_iter().enumerate() {
        let mut counter = WordCounter::new(&format!("noop{}", i), config).unwrap();
        counter.fit(CORPUS, CountTraining::default()).unwrap();

        counter
            .knowledge_base_mut()
            .model_parameters_mut()
            .unwrap()
            .base_mut()
            .n = 100;
        counter.knowledge_base_mut().load().unwrap();
        // Unsaved in-memory state is kept.
        let kb = counter.knowledge_base();
        assert_eq!(kb.model_parameters().unwrap().base().n, 100);
        assert_eq!(kb.state(), KnowledgeBaseState::Trained);
        Trainable::close(&mut counter).unwrap();
    }
}

#[test]
fn test_reinitialize_discards_previous_state() {
    let temp_dir = TempDir::new().unwrap();
    for (i, config) in backends(temp_dir.path()).into_iter().enumerate() {
        let mut counter = WordCounter::new(&format!("reinit{}", i), config).unwrap();
        counter.fit(CORPUS, CountTraining::default()).unwrap();

        let kb = counter.knowledge_base_mut();
        kb.reinitialize().unwrap();
        let params = kb.model_parameters().unwrap();
        assert_eq!(*params.base(), BaseModelParameters::default());
        assert!(params.counts.counts.is_empty().unwrap());
        assert!(params.weights.is_empty().unwrap());
        assert_eq!(kb.training_parameters(), Some(&CountTraining::default()));
        Trainable::close(&mut counter).unwrap();
    }
}

#[test]
fn test_erase_removes_database() {
    let temp_dir = TempDir::new().unwrap();
    for (i, config) in backends(temp_dir.path()).into_iter().enumerate() {
        let database = format!("erase{}", i);
        let mut counter = WordCounter::new(&database, config.clone()).unwrap();
        counter.fit(CORPUS, CountTraining::default()).unwrap();
        let name = counter.knowledge_base().database_name().to_string();

        Trainable::erase(&mut counter).unwrap();
        assert_eq!(counter.knowledge_base().state(), KnowledgeBaseState::Erased);
        assert!(counter.knowledge_base().model_parameters().is_none());
        Trainable::erase(&mut counter).unwrap();

        let checker = config.connector(&name).unwrap();
        assert!(!checker.exists_database().unwrap());
        checker.close().unwrap();

        let mut reopened = WordCounter::new(&database, config).unwrap();
        let err = reopened.knowledge_base_mut().load().unwrap_err();
        assert!(matches!(
            StorageError::of(&err),
            Some(StorageError::IllegalState(_))
        ));
    }
}

#[test]
fn test_closed_knowledge_base_rejects_save() {
    let temp_dir = TempDir::new().unwrap();
    for (i, config) in backends(temp_dir.path()).into_iter().enumerate() {
        let mut counter = WordCounter::new(&format!("closed{}", i), config).unwrap();
        counter.fit(CORPUS, CountTraining::default()).unwrap();
        Trainable::close(&mut counter).unwrap();
        Trainable::close(&mut counter).unwrap();

        let kb = counter.knowledge_base_mut();
        assert!(kb.is_closed());
        assert!(StorageError::is_closed(&kb.save().unwrap_err()));
        // Parameters stay in memory.
        assert!(kb.model_parameters().is_some());
    }
}

#[test]
fn test_snapshot_copies_are_detached() {
    let temp_dir = TempDir::new().unwrap();
    let config: StorageConfig = DiskConfig::new(temp_dir.path()).into();
    let mut counter = WordCounter::new("copies", config).unwrap();
    counter.fit(CORPUS, CountTraining::default()).unwrap();

    let (copy, training) = counter.knowledge_base().snapshot().unwrap();
    assert_eq!(training, CountTraining::default());
    assert!(!copy.weights.is_bound());
    assert!(!copy.weights.is_disk_resident());

    Trainable::close(&mut counter).unwrap();
    // The copy outlives the connector.
    assert_eq!(copy.counts.counts.get(&"spam".to_string()).unwrap(), Some(3));
}
