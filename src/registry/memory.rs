use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Registry, RegistryError, Service};

/// Volatile registry for tests and embedding.
#[derive(Default)]
pub struct MemoryRegistry {
    services: RwLock<BTreeMap<String, Service>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: impl IntoIterator<Item = Service>) -> Self {
        let map = services.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            services: RwLock::new(map),
        }
    }
}

impl Registry for MemoryRegistry {
    fn list(&self) -> Result<Vec<Service>, RegistryError> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        Ok(services.values().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Service, RegistryError> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn insert(&self, service: Service) -> Result<(), RegistryError> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(&service.id) {
            return Err(RegistryError::Duplicate(service.id));
        }
        services.insert(service.id.clone(), service);
        Ok(())
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Service),
    ) -> Result<Service, RegistryError> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let service = services
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        f(service);
        Ok(service.clone())
    }

    fn remove(&self, id: &str) -> Result<Service, RegistryError> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}
