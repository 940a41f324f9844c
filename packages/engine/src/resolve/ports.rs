// ABOUTME: Process-wide host port pool and per-environment port allocations
// ABOUTME: Leases bindable host ports from a configured range and releases them on teardown

use crate::error::ResolutionError;
use crate::model::MergedModel;
use envforge_config::EngineSettings;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// container name -> internal port -> host port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortAllocation {
    ports: BTreeMap<String, BTreeMap<u16, u16>>,
}

impl PortAllocation {
    pub fn from_map(ports: BTreeMap<String, BTreeMap<u16, u16>>) -> Self {
        Self { ports }
    }

    pub fn host_port(&self, container: &str, internal: u16) -> Option<u16> {
        self.ports.get(container)?.get(&internal).copied()
    }

    /// Port map of one container, empty if it exposes nothing
    pub fn container_ports(&self, container: &str) -> BTreeMap<u16, u16> {
        self.ports.get(container).cloned().unwrap_or_default()
    }

    /// Add the ports of a later allocation for other containers
    pub fn merge(&mut self, other: &PortAllocation) {
        for (container, ports) in &other.ports {
            self.ports
                .entry(container.clone())
                .or_default()
                .extend(ports.iter().map(|(k, v)| (*k, *v)));
        }
    }

    pub fn containers(&self) -> impl Iterator<Item = &str> + '_ {
        self.ports.keys().map(String::as_str)
    }

    /// Move the containers not in `keep` into a separate allocation
    pub fn split_off(&mut self, keep: &HashSet<String>) -> PortAllocation {
        let (kept, removed): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.ports)
            .into_iter()
            .partition(|(container, _)| keep.contains(container));
        self.ports = kept;
        PortAllocation { ports: removed }
    }

    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.values().flat_map(|m| m.values().copied())
    }

    pub fn len(&self) -> usize {
        self.ports.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PoolState {
    cursor: u16,
    leased: HashSet<u16>,
}

/// Host ports shared by every environment of the process.
///
/// The lock is held for a single allocate or release call only.
pub struct PortPool {
    min: u16,
    max: u16,
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            state: Mutex::new(PoolState {
                cursor: min,
                leased: HashSet::new(),
            }),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.port_range_min, settings.port_range_max)
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    pub fn leased(&self) -> usize {
        self.lock().leased.len()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_port_available(port: u16) -> bool {
        std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
    }

    /// Next free, bindable port after the cursor, wrapping once around the range
    fn next_port(&self, state: &mut PoolState) -> Option<u16> {
        let size = u32::from(self.max) - u32::from(self.min) + 1;

        for offset in 0..size {
            let port = (u32::from(state.cursor) - u32::from(self.min) + offset) % size
                + u32::from(self.min);
            let port = port as u16;

            if state.leased.contains(&port) || !Self::is_port_available(port) {
                continue;
            }

            state.cursor = if port == self.max { self.min } else { port + 1 };
            state.leased.insert(port);
            return Some(port);
        }

        None
    }

    /// Lease one host port for every exposed port of the model.
    ///
    /// Either every port is leased or none is.
    pub fn allocate(&self, model: &MergedModel) -> Result<PortAllocation, ResolutionError> {
        let requested: usize = model.containers.iter().map(|c| c.decl.ports.len()).sum();
        let mut ports: BTreeMap<String, BTreeMap<u16, u16>> = BTreeMap::new();

        let mut state = self.lock();
        for container in &model.containers {
            let entry = ports.entry(container.decl.name.clone()).or_default();

            for &internal in &container.decl.ports {
                match self.next_port(&mut state) {
                    Some(host) => {
                        entry.insert(internal, host);
                    }
                    None => {
                        for host in ports.values().flat_map(|m| m.values()) {
                            state.leased.remove(host);
                        }
                        warn!(
                            "Port range {}-{} exhausted while allocating {} ports",
                            self.min, self.max, requested
                        );
                        return Err(ResolutionError::PortsExhausted {
                            requested,
                            min: self.min,
                            max: self.max,
                        });
                    }
                }
            }
        }

        debug!("Allocated {} host ports", requested);
        Ok(PortAllocation { ports })
    }

    pub fn release(&self, allocation: &PortAllocation) {
        let mut state = self.lock();
        for port in allocation.host_ports() {
            state.leased.remove(&port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerDecl, ImageDecl, ImageSource, TemplateModel};
    use std::sync::Arc;

    fn model(containers: &[(&str, &[u16])]) -> MergedModel {
        let template = TemplateModel {
            template: "t".to_string(),
            instance: "0".to_string(),
            images: vec![ImageDecl {
                name: "alpine".to_string(),
                source: ImageSource::Fetch,
                containers: containers
                    .iter()
                    .map(|(name, ports)| ContainerDecl {
                        name: name.to_string(),
                        ports: ports.to_vec(),
                        ..Default::default()
                    })
                    .collect(),
            }],
            imports: vec![],
        };
        MergedModel::merge("env", vec![template]).unwrap()
    }

    #[test]
    fn test_allocation_is_injective() {
        let pool = PortPool::new(42000, 42100);
        let allocation = pool
            .allocate(&model(&[("web", &[80, 443]), ("db", &[5432])]))
            .unwrap();

        let hosts: HashSet<u16> = allocation.host_ports().collect();
        assert_eq!(hosts.len(), 3);
        assert!(hosts.iter().all(|p| (42000..=42100).contains(p)));
        assert!(allocation.host_port("web", 443).is_some());
        assert_eq!(allocation.host_port("db", 80), None);
        assert_eq!(pool.leased(), 3);
    }

    #[test]
    fn test_leased_ports_are_not_reused_until_released() {
        let pool = PortPool::new(42200, 42210);
        let first = pool.allocate(&model(&[("a", &[1, 2, 3])])).unwrap();
        let second = pool.allocate(&model(&[("b", &[1, 2, 3])])).unwrap();

        let first_hosts: HashSet<u16> = first.host_ports().collect();
        assert!(second.host_ports().all(|p| !first_hosts.contains(&p)));

        pool.release(&first);
        pool.release(&second);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn test_exhaustion_releases_partial_allocation() {
        let pool = PortPool::new(42300, 42303);
        pool.allocate(&model(&[("a", &[1, 2, 3])])).unwrap();

        let err = pool.allocate(&model(&[("b", &[1, 2])])).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::PortsExhausted {
                requested: 2,
                min: 42300,
                max: 42303
            }
        );
        assert_eq!(pool.leased(), 3);
    }

    #[test]
    fn test_port_bound_by_another_process_is_skipped() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let pool = PortPool::new(taken, taken);
        assert!(matches!(
            pool.allocate(&model(&[("a", &[80])])),
            Err(ResolutionError::PortsExhausted { .. })
        ));
    }

    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let pool = Arc::new(PortPool::new(42400, 42500));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let name = format!("c{}", i);
                    pool.allocate(&model(&[(name.as_str(), &[1, 2, 3, 4, 5])]))
                        .unwrap()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap().host_ports() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_allocations_merge_and_split() {
        let pool = PortPool::new(42700, 42710);
        let mut combined = pool.allocate(&model(&[("db", &[5432])])).unwrap();
        let addition = pool.allocate(&model(&[("app", &[80, 443])])).unwrap();

        combined.merge(&addition);
        assert_eq!(combined.len(), 3);
        assert_eq!(combined.host_port("app", 443), addition.host_port("app", 443));

        let keep: HashSet<String> = HashSet::from(["db".to_string()]);
        let removed = combined.split_off(&keep);
        assert_eq!(removed, addition);
        assert_eq!(combined.len(), 1);
        assert!(combined.host_port("db", 5432).is_some());
    }

    #[test]
    fn test_model_without_ports_allocates_nothing() {
        let pool = PortPool::new(42600, 42601);
        let allocation = pool.allocate(&model(&[("worker", &[])])).unwrap();
        assert!(allocation.is_empty());
        assert!(allocation.container_ports("worker").is_empty());
    }
}
