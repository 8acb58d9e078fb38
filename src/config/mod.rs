//! Configuration Module
//!
//! Handles process configuration and the per-region deployment table.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
