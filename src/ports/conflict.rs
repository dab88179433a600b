use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use super::{PortAllocator, PortError};
use crate::registry::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// More than one service claims the port.
    Duplicate,
    /// A stopped service claims a port something else has bound.
    InUseOnHost,
    /// A service claims the controller's own port.
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claimant {
    pub id: String,
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortConflict {
    pub port: u16,
    pub kind: ConflictKind,
    /// Ordered so the first entry is the one that keeps the port.
    pub claimants: Vec<Claimant>,
    pub owner: Option<String>,
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.claimants.iter().map(|c| c.name.as_str()).collect();
        match self.kind {
            ConflictKind::Duplicate => write!(
                f,
                "Port {} is claimed by {} services: {}",
                self.port,
                names.len(),
                names.join(", ")
            ),
            ConflictKind::Reserved => write!(
                f,
                "Port {} claimed by '{}' is reserved for the controller",
                self.port,
                names.join(", ")
            ),
            ConflictKind::InUseOnHost => match &self.owner {
                Some(owner) => write!(
                    f,
                    "Port {} claimed by '{}' is already in use by {}",
                    self.port,
                    names.join(", "),
                    owner
                ),
                None => write!(
                    f,
                    "Port {} claimed by '{}' is already in use",
                    self.port,
                    names.join(", ")
                ),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortChange {
    pub service_id: String,
    pub name: String,
    pub reason: ConflictKind,
    pub old_port: u16,
    pub new_port: u16,
    pub local_url: Option<String>,
    /// Whether the service was running when it lost its port.
    pub was_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependentEnvUpdate {
    pub service_id: String,
    pub name: String,
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveOutcome {
    pub changes: Vec<PortChange>,
    pub dependent_env_updates: Vec<DependentEnvUpdate>,
}

impl ResolveOutcome {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.dependent_env_updates.is_empty()
    }
}

/// Running services first, then ascending id.
pub fn keeper_order(a: &Service, b: &Service) -> Ordering {
    (!a.is_running(), a.id.as_str()).cmp(&(!b.is_running(), b.id.as_str()))
}

/// Replace `old` with `new` where it appears as a port: after a colon and not
/// followed by another digit, or as the whole value.
pub fn replace_port(value: &str, old: u16, new: u16) -> String {
    let old_str = old.to_string();
    if value.trim() == old_str {
        return value.replacen(&old_str, &new.to_string(), 1);
    }
    let needle = format!(":{}", old_str);
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find(&needle) {
        let end = pos + needle.len();
        out.push_str(&rest[..pos]);
        if rest[end..].starts_with(|c: char| c.is_ascii_digit()) {
            out.push_str(&needle);
        } else {
            out.push(':');
            out.push_str(&new.to_string());
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn is_vite_app(svc: &Service) -> bool {
    svc.tech_stack.iter().any(|t| t.eq_ignore_ascii_case("vite"))
        || svc.tags.iter().any(|t| t.to_lowercase().contains("vite"))
}

const VITE_API_BASE_URL: &str = "VITE_API_BASE_URL";

impl PortAllocator {
    /// Find every port that is claimed twice, claimed while reserved, or
    /// claimed by a stopped service while something on the host binds it.
    pub fn detect_conflicts(&self, services: &[Service]) -> Result<Vec<PortConflict>, PortError> {
        let mut by_port: BTreeMap<u16, Vec<&Service>> = BTreeMap::new();
        for svc in services {
            if let Some(port) = svc.port {
                by_port.entry(port).or_default().push(svc);
            }
        }

        let mut conflicts = Vec::new();
        for (port, mut owners) in by_port {
            owners.sort_by(|a, b| keeper_order(a, b));

            let kind = if owners.len() > 1 {
                Some(ConflictKind::Duplicate)
            } else if self.is_reserved(port) {
                Some(ConflictKind::Reserved)
            } else if !owners[0].is_running() && self.in_use(port)? {
                Some(ConflictKind::InUseOnHost)
            } else {
                None
            };

            if let Some(kind) = kind {
                let owner = if kind == ConflictKind::InUseOnHost {
                    self.owner(port)
                } else {
                    None
                };
                conflicts.push(PortConflict {
                    port,
                    kind,
                    claimants: owners
                        .iter()
                        .map(|s| Claimant {
                            id: s.id.clone(),
                            name: s.name.clone(),
                            running: s.is_running(),
                        })
                        .collect(),
                    owner,
                });
            }
        }
        Ok(conflicts)
    }

    /// Reassign ports until no conflict remains.
    ///
    /// The first claimant in [`keeper_order`] keeps a duplicated port unless
    /// the port is the controller's, or the claimant is stopped while
    /// something else binds the port. Every other claimant moves to
    /// a fresh port. Moved services get their URLs and env overrides
    /// rewritten, and services depending on them get their env overrides
    /// rewritten too. Only `services` is mutated.
    pub fn resolve_conflicts(&self, services: &mut [Service]) -> Result<ResolveOutcome, PortError> {
        let conflicts = self.detect_conflicts(services)?;
        let mut outcome = ResolveOutcome::default();

        for conflict in conflicts {
            let mut movers: Vec<(String, ConflictKind)> = Vec::new();
            match conflict.kind {
                ConflictKind::Duplicate => {
                    let keeper = &conflict.claimants[0];
                    let keeper_must_move = self.is_reserved(conflict.port)
                        || (!keeper.running && self.in_use(conflict.port)?);
                    if keeper_must_move {
                        let kind = if self.is_reserved(conflict.port) {
                            ConflictKind::Reserved
                        } else {
                            ConflictKind::InUseOnHost
                        };
                        movers.push((keeper.id.clone(), kind));
                    }
                    movers.extend(
                        conflict.claimants[1..]
                            .iter()
                            .map(|c| (c.id.clone(), ConflictKind::Duplicate)),
                    );
                }
                kind => movers.extend(conflict.claimants.iter().map(|c| (c.id.clone(), kind))),
            }

            for (id, reason) in movers {
                let Some(idx) = services.iter().position(|s| s.id == id) else {
                    continue;
                };
                // Drop the claim first so the search does not count it
                services[idx].port = None;
                let category = services[idx].category.clone();
                let new_port = self.assign_port(services, &id, None, Some(&category))?;
                let change = self.move_service(&mut services[idx], conflict.port, new_port, reason);
                info!(
                    service = %change.name,
                    old_port = change.old_port,
                    new_port = change.new_port,
                    "reassigned port"
                );
                outcome.changes.push(change);
            }
        }

        for change in &outcome.changes {
            self.update_dependents(services, change, &mut outcome.dependent_env_updates);
        }

        Ok(outcome)
    }

    fn move_service(
        &self,
        svc: &mut Service,
        old: u16,
        new: u16,
        reason: ConflictKind,
    ) -> PortChange {
        self.apply_port(svc, Some(old), new);
        PortChange {
            service_id: svc.id.clone(),
            name: svc.name.clone(),
            reason,
            old_port: old,
            new_port: new,
            local_url: svc.local_url.clone(),
            was_running: svc.is_running(),
        }
    }

    /// Point `svc` at `new`. URLs and env overrides that embed `old` follow
    /// the move; a missing `local_url` is filled in.
    pub fn apply_port(&self, svc: &mut Service, old: Option<u16>, new: u16) {
        svc.port = Some(new);
        svc.local_url = Some(match (&svc.local_url, old) {
            (Some(url), Some(old)) => replace_port(url, old, new),
            (Some(url), None) => url.clone(),
            (None, _) => format!("http://{}:{}", self.host(), new),
        });
        if let (Some(url), Some(old)) = (&svc.healthcheck_url, old) {
            svc.healthcheck_url = Some(replace_port(url, old, new));
        }
        if let Some(old) = old {
            for value in svc.env_overrides.values_mut() {
                *value = replace_port(value, old, new);
            }
        }
        svc.touch();
    }

    fn update_dependents(
        &self,
        services: &mut [Service],
        change: &PortChange,
        updates: &mut Vec<DependentEnvUpdate>,
    ) {
        for svc in services.iter_mut() {
            if svc.id == change.service_id {
                continue;
            }
            let depends = svc
                .dependencies
                .iter()
                .any(|d| d == &change.service_id || d == &change.name);
            if !depends {
                continue;
            }
            // A dependent that itself listens on the old port keeps its own values
            if svc.port == Some(change.old_port) {
                continue;
            }

            let mut touched = false;
            for (key, value) in svc.env_overrides.iter_mut() {
                let rewritten = replace_port(value, change.old_port, change.new_port);
                if rewritten != *value {
                    updates.push(DependentEnvUpdate {
                        service_id: svc.id.clone(),
                        name: svc.name.clone(),
                        key: key.clone(),
                        old_value: Some(value.clone()),
                        new_value: rewritten.clone(),
                    });
                    *value = rewritten;
                    touched = true;
                }
            }

            if is_vite_app(svc) {
                if let Some(url) = &change.local_url {
                    let current = svc.env_overrides.get(VITE_API_BASE_URL);
                    if current != Some(url) {
                        updates.push(DependentEnvUpdate {
                            service_id: svc.id.clone(),
                            name: svc.name.clone(),
                            key: VITE_API_BASE_URL.to_string(),
                            old_value: current.cloned(),
                            new_value: url.clone(),
                        });
                        svc.env_overrides
                            .insert(VITE_API_BASE_URL.to_string(), url.clone());
                        touched = true;
                    }
                }
            }

            if touched {
                svc.touch();
            }
        }
    }
}
