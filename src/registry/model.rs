use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Running => "running",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_category() -> String {
    "general".to_string()
}

/// A registered developer program and the controller's last known view of
/// its process. Runtime fields are advisory and re-verified before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    /// Names or ids of services this one talks to.
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub start_command: String,
    #[serde(default)]
    pub stop_command: String,
    #[serde(default)]
    pub restart_command: String,

    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub local_url: Option<String>,
    #[serde(default)]
    pub healthcheck_url: Option<String>,
    #[serde(default)]
    pub env_overrides: BTreeMap<String, String>,

    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub process_pid: Option<u32>,
    /// OS start time of `process_pid` in seconds since the epoch.
    #[serde(default)]
    pub process_start_time: Option<u64>,
    #[serde(default)]
    pub process_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload. Everything except the name is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub start_command: String,
    #[serde(default)]
    pub stop_command: String,
    #[serde(default)]
    pub restart_command: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub local_url: Option<String>,
    #[serde(default)]
    pub healthcheck_url: Option<String>,
    #[serde(default)]
    pub env_overrides: BTreeMap<String, String>,
}

/// Metadata edit. Absent fields are left alone; for the nullable fields an
/// explicit `null` clears the value. Runtime fields are not editable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub tech_stack: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, deserialize_with = "present")]
    pub working_directory: Option<Option<PathBuf>>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub restart_command: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub port: Option<Option<u16>>,
    #[serde(default, deserialize_with = "present")]
    pub local_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub healthcheck_url: Option<Option<String>>,
    #[serde(default)]
    pub env_overrides: Option<BTreeMap<String, String>>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field (`None`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ServiceUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the edit to `svc`.
    pub fn apply(&self, svc: &mut Service) {
        if let Some(name) = &self.name {
            svc.name = name.clone();
        }
        if let Some(description) = &self.description {
            svc.description = description.clone();
        }
        if let Some(category) = &self.category {
            svc.category = if category.trim().is_empty() {
                default_category()
            } else {
                category.clone()
            };
        }
        if let Some(tags) = &self.tags {
            svc.tags = tags.clone();
        }
        if let Some(tech_stack) = &self.tech_stack {
            svc.tech_stack = tech_stack.clone();
        }
        if let Some(dependencies) = &self.dependencies {
            svc.dependencies = dependencies.clone();
        }
        if let Some(dir) = &self.working_directory {
            svc.working_directory = dir.clone();
        }
        if let Some(cmd) = &self.start_command {
            svc.start_command = cmd.clone();
        }
        if let Some(cmd) = &self.stop_command {
            svc.stop_command = cmd.clone();
        }
        if let Some(cmd) = &self.restart_command {
            svc.restart_command = cmd.clone();
        }
        if let Some(port) = self.port {
            svc.port = port;
        }
        if let Some(url) = &self.local_url {
            svc.local_url = url.clone();
        }
        if let Some(url) = &self.healthcheck_url {
            svc.healthcheck_url = url.clone();
        }
        if let Some(env) = &self.env_overrides {
            svc.env_overrides = env.clone();
        }
    }
}

impl Service {
    pub fn new(new: NewService) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            category: new
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(default_category),
            tags: new.tags,
            tech_stack: new.tech_stack,
            dependencies: new.dependencies,
            working_directory: new.working_directory,
            start_command: new.start_command,
            stop_command: new.stop_command,
            restart_command: new.restart_command,
            port: new.port,
            local_url: new.local_url,
            healthcheck_url: new.healthcheck_url,
            env_overrides: new.env_overrides,
            status: ServiceStatus::Stopped,
            process_pid: None,
            process_start_time: None,
            process_started_at: None,
            last_error: None,
            log_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_start_command(&self) -> bool {
        !self.start_command.trim().is_empty()
    }

    /// A port is needed when one is already assigned or when the command or
    /// any env override refers to `{PORT}`.
    pub fn needs_port(&self) -> bool {
        self.port.is_some()
            || self.start_command.contains("{PORT}")
            || self.env_overrides.values().any(|v| v.contains("{PORT}"))
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn clear_process(&mut self) {
        self.process_pid = None;
        self.process_start_time = None;
        self.process_started_at = None;
    }

    /// Copy the lifecycle fields from `from`, leaving metadata untouched.
    pub fn apply_runtime(&mut self, from: &Service) {
        self.status = from.status;
        self.process_pid = from.process_pid;
        self.process_start_time = from.process_start_time;
        self.process_started_at = from.process_started_at;
        self.last_error = from.last_error.clone();
        self.log_path = from.log_path.clone();
        self.updated_at = from.updated_at;
    }

    /// Copy the port-derived fields from `from`.
    pub fn apply_ports(&mut self, from: &Service) {
        self.port = from.port;
        self.local_url = from.local_url.clone();
        self.healthcheck_url = from.healthcheck_url.clone();
        self.env_overrides = from.env_overrides.clone();
        self.updated_at = from.updated_at;
    }
}
