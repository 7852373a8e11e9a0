//! Saved state survives an abrupt process kill.
//!
//! The test re-runs its own binary as a child process. The child saves a
//! knowledge base with unlogged map writes and aborts without running exit
//! hooks; the parent then reopens the database and checks every entry.

use std::process::Command;

use kbstore_db::{
    BaseModelParameters, BigMap, DiskConfig, FieldProvisioner, KnowledgeBase, ModelParameters,
    StorageConfig,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

const CHILD_DIR_ENV: &str = "KBSTORE_CRASH_RECOVERY_DIR";
const DATABASE: &str = "aborted";
const ENTRIES: u32 = 100;

#[derive(Default, Serialize, Deserialize)]
struct Params {
    base: BaseModelParameters,
    table: BigMap<u32, String>,
}

impl ModelParameters for Params {
    fn base(&self) -> &BaseModelParameters {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModelParameters {
        &mut self.base
    }

    fn provision(&mut self, provisioner: &mut FieldProvisioner<'_>) -> anyhow::Result<()> {
        provisioner.bind("table", &mut self.table)
    }
}

fn config(folder: &str) -> StorageConfig {
    DiskConfig::new(folder).with_transactions(false).into()
}

/// Save, then die without closing anything.
fn save_and_abort(folder: &str) -> ! {
    let mut kb = KnowledgeBase::<Params, ()>::new(DATABASE, config(folder)).unwrap();
    kb.reinitialize().unwrap();
    let params = kb.model_parameters_mut().unwrap();
    for i in 0..ENTRIES {
        params.table.insert(i, format!("value{}", i)).unwrap();
    }
    params.base_mut().n = ENTRIES as u64;
    kb.save().unwrap();
    std::process::abort();
}

#[test]
fn test_unlogged_save_survives_abort() {
    if let Ok(folder) = std::env::var(CHILD_DIR_ENV) {
        save_and_abort(&folder);
    }

    let temp_dir = TempDir::new().unwrap();
    let folder = temp_dir.path().to_str().unwrap().to_string();
    let status = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_unlogged_save_survives_abort", "--nocapture"])
        .env(CHILD_DIR_ENV, &folder)
        .status()
        .unwrap();
    assert!(!status.success(), "child process should have aborted");

    let mut kb = KnowledgeBase::<Params, ()>::new(DATABASE, config(&folder)).unwrap();
    kb.load().unwrap();
    let params = kb.model_parameters().unwrap();
    assert_eq!(params.base().n, ENTRIES as u64);
    assert_eq!(params.table.len().unwrap(), ENTRIES as usize);
    for i in [0, ENTRIES / 2, ENTRIES - 1] {
        assert_eq!(params.table.get(&i).unwrap(), Some(format!("value{}", i)));
    }
    kb.close().unwrap();
}
