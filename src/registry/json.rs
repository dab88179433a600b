use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::{Registry, RegistryError, Service};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    services: Vec<Service>,
}

/// Registry persisted as a single JSON document.
///
/// Every call re-reads the file under an exclusive `flock`, so a CLI process
/// and a running server can share the same file. Writes go to a temp file
/// that is renamed over the original.
pub struct JsonRegistry {
    path: PathBuf,
    // flock is per open file description; this serialises threads within the process.
    guard: Mutex<()>,
}

impl JsonRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        debug!(path = %path.display(), "opened registry");
        Ok(Self {
            path,
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Acquire an exclusive file lock on `<file>.lock`.
    /// The lock is released when the returned handle is dropped.
    fn lock_file(&self) -> Result<std::fs::File, RegistryError> {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_file = std::fs::File::create(&lock_path).map_err(|e| self.io_err(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is valid for the lifetime of lock_file
            unsafe {
                libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX);
            }
        }

        Ok(lock_file)
    }

    fn load(&self) -> Result<BTreeMap<String, Service>, RegistryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let file: RegistryFile =
            serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(file
            .services
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect())
    }

    fn save(&self, services: &BTreeMap<String, Service>) -> Result<(), RegistryError> {
        let file = RegistryFile {
            version: FORMAT_VERSION,
            services: services.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|source| {
            RegistryError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        // Atomic write: write to tmp file then rename
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        std::fs::write(&tmp_path, content).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn with_store<T>(
        &self,
        write: bool,
        f: impl FnOnce(&mut BTreeMap<String, Service>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = self.lock_file()?;
        let mut services = self.load()?;
        let out = f(&mut services)?;
        if write {
            self.save(&services)?;
        }
        Ok(out)
    }
}

impl Registry for JsonRegistry {
    fn list(&self) -> Result<Vec<Service>, RegistryError> {
        self.with_store(false, |services| Ok(services.values().cloned().collect()))
    }

    fn get(&self, id: &str) -> Result<Service, RegistryError> {
        self.with_store(false, |services| {
            services
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))
        })
    }

    fn insert(&self, service: Service) -> Result<(), RegistryError> {
        self.with_store(true, |services| {
            if services.contains_key(&service.id) {
                return Err(RegistryError::Duplicate(service.id));
            }
            services.insert(service.id.clone(), service);
            Ok(())
        })
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Service),
    ) -> Result<Service, RegistryError> {
        self.with_store(true, |services| {
            let service = services
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            f(service);
            Ok(service.clone())
        })
    }

    fn remove(&self, id: &str) -> Result<Service, RegistryError> {
        self.with_store(true, |services| {
            services
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))
        })
    }
}
