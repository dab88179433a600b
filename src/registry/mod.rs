pub mod json;
pub mod memory;
pub mod model;

use std::path::PathBuf;
use thiserror::Error;

pub use json::JsonRegistry;
pub use memory::MemoryRegistry;
pub use model::{NewService, Service, ServiceStatus, ServiceUpdate};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("service '{0}' already exists")]
    Duplicate(String),

    #[error("registry I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistent store of registered services.
///
/// Implementations must make each call atomic with respect to other calls on
/// the same store. `update` is a read-modify-write of a single record and
/// must not be interleaved with another writer.
pub trait Registry: Send + Sync {
    /// All services, ordered by id.
    fn list(&self) -> Result<Vec<Service>, RegistryError>;

    fn get(&self, id: &str) -> Result<Service, RegistryError>;

    fn insert(&self, service: Service) -> Result<(), RegistryError>;

    /// Apply `f` to the stored record and persist it. Returns the updated record.
    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Service),
    ) -> Result<Service, RegistryError>;

    fn remove(&self, id: &str) -> Result<Service, RegistryError>;
}
