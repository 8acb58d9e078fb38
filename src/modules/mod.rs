//! Interceptor Modules
//!
//! Modules are preloaded once into a [`ModuleRegistry`] and attached, in
//! registration order, to every relay session's [`Dispatch`] pipeline.

pub mod preload;
pub mod registry;

pub use preload::ModulePreloader;
pub use registry::{ModuleDefinition, ModuleKind, ModuleManifest, ModuleRegistry};

use bytes::BytesMut;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Which leg of the relay a chunk travelled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Observes or rewrites relayed traffic
///
/// Implementations may modify `chunk` in place; clearing it drops the data.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, session_id: &str, direction: Direction, chunk: &mut BytesMut);
}

/// Per-session pipeline of attached modules
#[derive(Default)]
pub struct Dispatch {
    loaded: Vec<(String, Arc<ModuleDefinition>)>,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a module to the end of the pipeline
    pub fn load(&mut self, name: &str, definition: Arc<ModuleDefinition>) {
        debug!(module = %name, "Attaching module");
        self.loaded.push((name.to_string(), definition));
    }

    /// Attach every module of the registry in order
    pub fn load_all(&mut self, registry: &ModuleRegistry) {
        for definition in registry.iter() {
            self.load(&definition.name, Arc::clone(definition));
        }
    }

    /// Names of attached modules in pipeline order
    pub fn loaded(&self) -> Vec<&str> {
        self.loaded.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    /// Pass a chunk through every attached module
    pub fn handle(&self, session_id: &str, direction: Direction, chunk: &mut BytesMut) {
        for (_, definition) in &self.loaded {
            if chunk.is_empty() {
                break;
            }
            definition.interceptor().intercept(session_id, direction, chunk);
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("loaded", &self.loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Interceptor for Upper {
        fn intercept(&self, _session_id: &str, direction: Direction, chunk: &mut BytesMut) {
            if direction == Direction::ClientToServer {
                chunk.make_ascii_uppercase();
            }
        }
    }

    struct Discard;

    impl Interceptor for Discard {
        fn intercept(&self, _session_id: &str, _direction: Direction, chunk: &mut BytesMut) {
            chunk.clear();
        }
    }

    #[test]
    fn test_pipeline_runs_in_order() {
        let mut dispatch = Dispatch::new();
        dispatch.load("upper", Arc::new(ModuleDefinition::from_interceptor("upper", Upper)));
        dispatch.load("drop", Arc::new(ModuleDefinition::from_interceptor("drop", Discard)));
        assert_eq!(dispatch.loaded(), vec!["upper", "drop"]);

        let mut chunk = BytesMut::from(&b"hello"[..]);
        dispatch.handle("s1", Direction::ClientToServer, &mut chunk);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_direction_specific_rewrite() {
        let mut dispatch = Dispatch::new();
        dispatch.load("upper", Arc::new(ModuleDefinition::from_interceptor("upper", Upper)));

        let mut up = BytesMut::from(&b"abc"[..]);
        dispatch.handle("s1", Direction::ClientToServer, &mut up);
        assert_eq!(&up[..], b"ABC");

        let mut down = BytesMut::from(&b"abc"[..]);
        dispatch.handle("s1", Direction::ServerToClient, &mut down);
        assert_eq!(&down[..], b"abc");
    }
}
