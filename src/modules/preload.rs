//! Module Preloader
//!
//! Loads every installable module from the modules directory up front, so a
//! broken module shows up before any client connects and per-connection
//! setup only attaches already-parsed definitions.

use super::registry::MANIFEST_FILE;
use super::{ModuleDefinition, ModuleRegistry};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Leading characters marking private or hidden entries
const HIDDEN_MARKERS: [char; 2] = ['.', '_'];

pub struct ModulePreloader {
    modules_dir: PathBuf,
}

impl ModulePreloader {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
        }
    }

    /// Installable modules as `(name, manifest path)`, sorted by name
    pub fn discover(&self) -> Vec<(String, PathBuf)> {
        let entries = match std::fs::read_dir(&self.modules_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Cannot read modules directory {}: {}",
                    self.modules_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut found: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| Self::candidate(&entry.path()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// A module is a directory holding a manifest or a bare `.toml` manifest
    fn candidate(path: &Path) -> Option<(String, PathBuf)> {
        let file_name = path.file_name()?.to_str()?;
        if file_name.starts_with(HIDDEN_MARKERS) {
            debug!("Skipping hidden module entry {}", file_name);
            return None;
        }

        if path.is_dir() {
            return Some((file_name.to_string(), path.join(MANIFEST_FILE)));
        }

        if path.extension().is_some_and(|ext| ext == "toml") {
            let stem = path.file_stem()?.to_str()?;
            return Some((stem.to_string(), path.to_path_buf()));
        }

        None
    }

    /// Load every discovered module; failures are logged and skipped
    pub fn preload(&self) -> ModuleRegistry {
        info!("Preloading modules from {}", self.modules_dir.display());

        let mut registry = ModuleRegistry::new();
        for (name, manifest) in self.discover() {
            match ModuleDefinition::load(&name, &manifest) {
                Ok(definition) => {
                    debug!(module = %name, kind = ?definition.kind, "Module loaded");
                    registry.insert(definition);
                }
                Err(e) => {
                    warn!(module = %name, "Failed to load module \"{}\": {:?}", name, e);
                }
            }
        }

        info!("Preloaded {} module(s): {:?}", registry.len(), registry.names());
        registry
    }
}
