//! SlsRelay Library
//!
//! Redirects a game client's server-list lookup to a local endpoint and relays
//! game sessions to the real upstream servers through a pipeline of
//! interceptor modules.

pub mod config;
pub mod diagnostics;
pub mod hosts;
pub mod lifecycle;
pub mod modules;
pub mod relay;
pub mod serverlist;
pub mod shutdown;

pub use config::{AppConfig, RegionDescriptor};
pub use hosts::HostsOverride;
pub use lifecycle::{LifecycleCoordinator, LifecycleState, StartupError};
pub use modules::ModuleRegistry;
pub use relay::{ConnectionRelay, RelayRegistry};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
