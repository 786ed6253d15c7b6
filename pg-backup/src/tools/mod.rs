//! Wrappers around the external tools the orchestration drives.

pub mod process;
pub mod service;
pub mod storage;
pub mod wale;
