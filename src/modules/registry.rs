//! Module Registry

use super::{Direction, Interceptor};
use crate::Result;
use anyhow::{bail, Context};
use bytes::BytesMut;
use serde::Deserialize;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Manifest file name inside a module directory
pub const MANIFEST_FILE: &str = "module.toml";

/// Built-in interceptor behaviors a manifest can select
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    #[default]
    Passthrough,
    Trace,
}

/// On-disk module manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
    pub name: Option<String>,
    #[serde(default)]
    pub kind: ModuleKind,
    #[serde(default)]
    pub settings: toml::Table,
}

/// A preloaded interceptor module
pub struct ModuleDefinition {
    pub name: String,
    pub path: Option<PathBuf>,
    pub kind: ModuleKind,
    pub settings: toml::Table,
    interceptor: Arc<dyn Interceptor>,
}

impl ModuleDefinition {
    /// Read and validate a manifest, building its interceptor
    pub fn load(name: &str, manifest_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: ModuleManifest = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;

        if let Some(declared) = &manifest.name {
            if declared != name {
                bail!("manifest declares name {:?}, expected {:?}", declared, name);
            }
        }

        let interceptor: Arc<dyn Interceptor> = match manifest.kind {
            ModuleKind::Passthrough => Arc::new(Passthrough),
            ModuleKind::Trace => Arc::new(Trace::from_settings(name, &manifest.settings)?),
        };

        Ok(Self {
            name: name.to_string(),
            path: Some(manifest_path.to_path_buf()),
            kind: manifest.kind,
            settings: manifest.settings,
            interceptor,
        })
    }

    /// Wrap an in-process interceptor
    pub fn from_interceptor(name: &str, interceptor: impl Interceptor + 'static) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            kind: ModuleKind::Passthrough,
            settings: toml::Table::new(),
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn interceptor(&self) -> &dyn Interceptor {
        self.interceptor.as_ref()
    }
}

impl fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Passthrough;

impl Interceptor for Passthrough {
    fn intercept(&self, _session_id: &str, _direction: Direction, _chunk: &mut BytesMut) {}
}

/// Logs chunk sizes with a short hex preview
struct Trace {
    module: String,
    preview_bytes: usize,
}

impl Trace {
    fn from_settings(module: &str, settings: &toml::Table) -> Result<Self> {
        let preview_bytes = match settings.get("preview_bytes") {
            None => 16,
            Some(toml::Value::Integer(n)) if *n >= 0 => *n as usize,
            Some(other) => bail!("preview_bytes must be a non-negative integer, got {}", other),
        };
        Ok(Self {
            module: module.to_string(),
            preview_bytes,
        })
    }
}

impl Interceptor for Trace {
    fn intercept(&self, session_id: &str, direction: Direction, chunk: &mut BytesMut) {
        let mut preview = String::new();
        for byte in chunk.iter().take(self.preview_bytes) {
            let _ = write!(preview, "{:02x}", byte);
        }
        debug!(
            module = %self.module,
            session_id = %session_id,
            %direction,
            len = chunk.len(),
            "{}",
            preview
        );
    }
}

/// Preloaded modules in registration order, read-only once built
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<ModuleDefinition>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, replacing any earlier one with the same name
    pub fn insert(&mut self, definition: ModuleDefinition) {
        let definition = Arc::new(definition);
        match self.modules.iter_mut().find(|m| m.name == definition.name) {
            Some(slot) => *slot = definition,
            None => self.modules.push(definition),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModuleDefinition>> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModuleDefinition>> {
        self.modules.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
