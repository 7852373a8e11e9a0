//! Deep copies of model state.

use anyhow::Result;

/// A fully independent copy, including the contents of every big map.
///
/// Copies of big maps are detached in-memory maps: mutating the copy never
/// touches the original's backend and vice versa.
pub trait DeepCopy: Sized {
    fn deep_copy(&self) -> Result<Self>;
}
