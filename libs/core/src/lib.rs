//! Process-wide utilities shared by the kbstore crates.

pub mod random;
pub mod telemetry;
