pub mod conflict;
pub mod probe;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::model::{NexusConfig, PortRange, PortsConfig};
use crate::registry::Service;

pub use conflict::{
    ConflictKind, DependentEnvUpdate, PortChange, PortConflict, ResolveOutcome,
};
pub use probe::{PortProbe, SystemProbe};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port available in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("cannot probe {host}:{port}: {source}")]
    Probe {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// One row of the port map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port: u16,
    pub reserved_by_service_id: Option<String>,
    pub reserved_by_service_name: Option<String>,
    pub in_use_on_host: bool,
    pub conflict: bool,
}

/// Chooses ports for services.
///
/// A port is free for a service when no other service claims it, it is not
/// the controller's own port, and nothing on the host is bound to it. The
/// allocator never touches processes and never persists anything; callers
/// serialise allocation and write the results back.
pub struct PortAllocator {
    host: String,
    default_range: PortRange,
    ranges: BTreeMap<String, PortRange>,
    reserved: Vec<u16>,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(ports: &PortsConfig, controller_port: u16, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            host: ports.host.clone(),
            default_range: ports.default_range(),
            ranges: ports.ranges.clone(),
            reserved: vec![controller_port],
            probe,
        }
    }

    pub fn from_config(config: &NexusConfig) -> Self {
        Self::new(&config.ports, config.controller.port, Arc::new(SystemProbe))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn default_range(&self) -> PortRange {
        self.default_range
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn in_use(&self, port: u16) -> Result<bool, PortError> {
        self.probe.in_use(&self.host, port)
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        self.probe.owner(port)
    }

    /// The band for a category, falling back to the default band.
    pub fn range_for(&self, category: Option<&str>) -> PortRange {
        category
            .and_then(|c| self.ranges.get(c))
            .copied()
            .unwrap_or(self.default_range)
    }

    fn claimed_by_other(services: &[Service], service_id: &str, port: u16) -> bool {
        services
            .iter()
            .any(|s| s.id != service_id && s.port == Some(port))
    }

    /// Whether `port` can be given to `service_id`.
    pub fn is_free(
        &self,
        services: &[Service],
        service_id: &str,
        port: u16,
    ) -> Result<bool, PortError> {
        if port == 0 || self.is_reserved(port) {
            return Ok(false);
        }
        if Self::claimed_by_other(services, service_id, port) {
            return Ok(false);
        }
        Ok(!self.in_use(port)?)
    }

    fn first_free_in(
        &self,
        services: &[Service],
        service_id: &str,
        range: PortRange,
    ) -> Result<Option<u16>, PortError> {
        for port in range.iter() {
            if self.is_free(services, service_id, port)? {
                return Ok(Some(port));
            }
        }
        Ok(None)
    }

    /// Pick a port for `service_id`: the preferred port when free, else the
    /// lowest free port in the category band, else in the default band.
    pub fn assign_port(
        &self,
        services: &[Service],
        service_id: &str,
        preferred: Option<u16>,
        category_hint: Option<&str>,
    ) -> Result<u16, PortError> {
        if let Some(port) = preferred {
            if self.is_free(services, service_id, port)? {
                debug!(service = %service_id, port, "kept preferred port");
                return Ok(port);
            }
        }

        let band = self.range_for(category_hint);
        if band != self.default_range {
            if let Some(port) = self.first_free_in(services, service_id, band)? {
                debug!(service = %service_id, port, range = %band, "assigned port from category band");
                return Ok(port);
            }
        }

        match self.first_free_in(services, service_id, self.default_range)? {
            Some(port) => {
                debug!(service = %service_id, port, "assigned port");
                Ok(port)
            }
            None => Err(PortError::NoPortAvailable {
                start: self.default_range.start(),
                end: self.default_range.end(),
            }),
        }
    }

    /// Lowest port in the default band that nobody claims and nothing binds.
    pub fn next_available_port(&self, services: &[Service]) -> Result<u16, PortError> {
        self.assign_port(services, "", None, None)
    }

    /// Every port in `range` with who claims it and whether the host binds it.
    pub fn port_map(
        &self,
        services: &[Service],
        range: PortRange,
    ) -> Result<Vec<PortInfo>, PortError> {
        let mut by_port: BTreeMap<u16, Vec<&Service>> = BTreeMap::new();
        for svc in services {
            if let Some(port) = svc.port {
                by_port.entry(port).or_default().push(svc);
            }
        }

        let mut out = Vec::new();
        for port in range.iter() {
            let mut claimants = by_port.get(&port).cloned().unwrap_or_default();
            claimants.sort_by(|a, b| conflict::keeper_order(a, b));
            let first = claimants.first();
            let in_use = self.in_use(port)?;
            let conflict = claimants.len() > 1
                || first.is_some_and(|s| in_use && !s.is_running());
            out.push(PortInfo {
                port,
                reserved_by_service_id: first.map(|s| s.id.clone()),
                reserved_by_service_name: first.map(|s| s.name.clone()),
                in_use_on_host: in_use,
                conflict,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::probe::fake::FakeProbe;
    use super::*;
    use crate::registry::model::fixtures;
    use std::collections::HashSet;

    pub(crate) fn allocator(probe: FakeProbe) -> PortAllocator {
        let mut ports = PortsConfig::default();
        ports.range_start = 4000;
        ports.range_end = 4009;
        PortAllocator::new(&ports, 5010, Arc::new(probe))
    }

    #[test]
    fn preferred_port_kept_when_free() {
        let alloc = allocator(FakeProbe::new());
        let port = alloc.assign_port(&[], "a", Some(4005), None).unwrap();
        assert_eq!(port, 4005);
    }

    #[test]
    fn preferred_port_skipped_when_bound_on_host() {
        let alloc = allocator(FakeProbe::busy([4005, 4000]));
        let port = alloc.assign_port(&[], "a", Some(4005), None).unwrap();
        assert_eq!(port, 4001);
    }

    #[test]
    fn preferred_port_skipped_when_claimed_by_other() {
        let alloc = allocator(FakeProbe::new());
        let services = vec![fixtures::with_port("b", "b", 4000)];
        let port = alloc.assign_port(&services, "a", Some(4000), None).unwrap();
        assert_eq!(port, 4001);
    }

    #[test]
    fn own_claim_does_not_block_preferred() {
        let alloc = allocator(FakeProbe::new());
        let services = vec![fixtures::with_port("a", "a", 4003)];
        let port = alloc.assign_port(&services, "a", Some(4003), None).unwrap();
        assert_eq!(port, 4003);
    }

    #[test]
    fn controller_port_never_assigned() {
        let mut ports = PortsConfig::default();
        ports.range_start = 5009;
        ports.range_end = 5011;
        let alloc = PortAllocator::new(&ports, 5010, Arc::new(FakeProbe::busy([5009])));
        let port = alloc.assign_port(&[], "a", Some(5010), None).unwrap();
        assert_eq!(port, 5011);
    }

    #[test]
    fn category_band_used_before_default() {
        let mut ports = PortsConfig::default();
        ports.range_start = 4000;
        ports.range_end = 4009;
        ports.ranges.insert("web".to_string(), PortRange(4100, 4101));
        let alloc = PortAllocator::new(&ports, 5010, Arc::new(FakeProbe::busy([4100])));

        assert_eq!(alloc.assign_port(&[], "a", None, Some("web")).unwrap(), 4101);
        // Unknown category uses the default band
        assert_eq!(alloc.assign_port(&[], "a", None, Some("db")).unwrap(), 4000);
    }

    #[test]
    fn exhausted_category_band_falls_back_to_default() {
        let mut ports = PortsConfig::default();
        ports.range_start = 4000;
        ports.range_end = 4009;
        ports.ranges.insert("web".to_string(), PortRange(4100, 4100));
        let alloc = PortAllocator::new(&ports, 5010, Arc::new(FakeProbe::busy([4100])));
        assert_eq!(alloc.assign_port(&[], "a", None, Some("web")).unwrap(), 4000);
    }

    #[test]
    fn exhausted_range_is_error() {
        let alloc = allocator(FakeProbe::busy(4000..=4009));
        let err = alloc.assign_port(&[], "a", None, None).unwrap_err();
        assert!(matches!(
            err,
            PortError::NoPortAvailable {
                start: 4000,
                end: 4009
            }
        ));
        assert_eq!(err.to_string(), "no free port available in range 4000-4009");
    }

    #[test]
    fn sequential_assignments_are_distinct() {
        let alloc = allocator(FakeProbe::busy([4002]));
        let mut services: Vec<Service> = (0..6)
            .map(|i| fixtures::service(&format!("s{i}"), "svc"))
            .collect();

        for i in 0..services.len() {
            let id = services[i].id.clone();
            let port = alloc.assign_port(&services, &id, None, None).unwrap();
            services[i].port = Some(port);
        }

        let ports: HashSet<u16> = services.iter().filter_map(|s| s.port).collect();
        assert_eq!(ports.len(), services.len());
        assert!(!ports.contains(&4002));
    }

    #[test]
    fn next_available_skips_claims_and_listeners() {
        let alloc = allocator(FakeProbe::busy([4001]));
        let services = vec![fixtures::with_port("a", "a", 4000)];
        assert_eq!(alloc.next_available_port(&services).unwrap(), 4002);
    }

    #[test]
    fn port_map_flags_conflicts() {
        let probe = FakeProbe::busy([4001, 4003]);
        let alloc = allocator(probe);
        let mut running = fixtures::with_port("r", "runner", 4003);
        running.status = crate::registry::ServiceStatus::Running;
        let services = vec![
            fixtures::with_port("a", "alpha", 4000),
            fixtures::with_port("b", "beta", 4001),
            running,
            fixtures::with_port("c", "gamma", 4004),
            fixtures::with_port("d", "delta", 4004),
        ];

        let map = alloc.port_map(&services, PortRange(4000, 4005)).unwrap();
        assert_eq!(map.len(), 6);

        // Claimed, not bound
        assert!(!map[0].conflict);
        assert_eq!(map[0].reserved_by_service_name.as_deref(), Some("alpha"));
        // Claimed by a stopped service while something else binds it
        assert!(map[1].conflict && map[1].in_use_on_host);
        // Unclaimed but bound
        assert!(!map[2].conflict);
        assert!(map[2].reserved_by_service_id.is_none());
        // Bound by its running owner
        assert!(!map[3].conflict);
        // Claimed twice
        assert!(map[4].conflict);
        assert_eq!(map[4].reserved_by_service_id.as_deref(), Some("c"));
        assert!(!map[5].conflict);
    }
}
