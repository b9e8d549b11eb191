//! # Topology Model
//!
//! The static graph of services, volumes and `depends_on` edges.
//!
//! A [`TopologyBuilder`] validates every declaration as it is added and a
//! [`Topology`] only exists once the whole declaration set is valid. After
//! [`TopologyBuilder::build`] the graph is immutable and is shared read-only
//! (behind an `Arc`) by every lifecycle task.
//!
//! ## Graph Representation
//!
//! Services are nodes of a `petgraph` [`DiGraph`], with an edge pointing from a
//! dependency to its dependent. Nodes are only ever appended, so a node's index
//! is also its declaration position, which is what breaks ties in
//! [`Topology::resolve_start_order`].
//!
//! ```rust
//! use stackup::{Service, Topology, Volume};
//!
//! let mut builder = Topology::builder();
//! builder.add_service(Service::new("db", "postgres:15").with_port(5432, 5432))?;
//! builder.add_service(Service::new("bot", "bot:latest").with_port(8000, 8000).depends_on("db"))?;
//! builder.add_volume(Volume::new("pgdata", "/var/lib/postgresql/data"), "db")?;
//!
//! let topology = builder.build()?;
//! let order: Vec<String> = topology
//!     .resolve_start_order()?
//!     .iter()
//!     .map(|id| id.to_string())
//!     .collect();
//! assert_eq!(order, ["db", "bot"]);
//! # Ok::<(), stackup::TopologyError>(())
//! ```

use crate::error::TopologyError;
use crate::service::{Service, ServiceId, Volume};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// A volume together with the service it is mounted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDeclaration {
    pub volume: Volume,
    pub owner: ServiceId,
}

/// Accumulates declarations and validates structural invariants.
///
/// The first failed declaration poisons the builder: [`build`](Self::build)
/// returns that error, so a partially valid topology can never be used.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    services: Vec<Service>,
    index: HashMap<ServiceId, NodeIndex>,
    graph: DiGraph<ServiceId, ()>,
    host_ports: HashMap<u16, ServiceId>,
    volumes: Vec<VolumeDeclaration>,
    poisoned: Option<TopologyError>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a service whose dependencies are all declared already.
    ///
    /// # Errors
    /// - [`TopologyError::CyclicDependency`] if the service depends on itself.
    /// - [`TopologyError::UnknownDependency`] if a dependency is not declared yet.
    /// - [`TopologyError::DuplicateService`], [`TopologyError::PortConflict`] and
    ///   [`TopologyError::MissingEnvironment`] as for [`add_services`](Self::add_services).
    pub fn add_service(&mut self, service: Service) -> Result<&mut Self, TopologyError> {
        let early = if service.depends_on.contains(&service.id) {
            Some(TopologyError::CyclicDependency(service.id.clone()))
        } else {
            service
                .depends_on
                .iter()
                .find(|dependency| !self.index.contains_key(*dependency))
                .map(|dependency| TopologyError::UnknownDependency {
                    service: service.id.clone(),
                    dependency: dependency.clone(),
                })
        };

        match early {
            Some(err) => Err(self.poison(err)),
            None => self.add_services([service]),
        }
    }

    /// Declares several services at once.
    ///
    /// Dependencies may point at services declared earlier *or* anywhere in the same
    /// batch, which is how a deployment file is loaded. The batch is validated as a
    /// whole against the combined graph and committed atomically.
    pub fn add_services(
        &mut self,
        services: impl IntoIterator<Item = Service>,
    ) -> Result<&mut Self, TopologyError> {
        let batch: Vec<Service> = services.into_iter().collect();
        match self.stage(&batch) {
            Ok((graph, index, host_ports)) => {
                for service in &batch {
                    debug!(service = %service.id, deps = service.depends_on.len(), "Service declared");
                }
                self.graph = graph;
                self.index = index;
                self.host_ports = host_ports;
                self.services.extend(batch);
                Ok(self)
            }
            Err(err) => Err(self.poison(err)),
        }
    }

    /// Declares a volume mounted into `owner`.
    pub fn add_volume(
        &mut self,
        volume: Volume,
        owner: impl Into<ServiceId>,
    ) -> Result<&mut Self, TopologyError> {
        let owner = owner.into();
        let result = if !self.index.contains_key(&owner) {
            Err(TopologyError::UnknownOwner {
                volume: volume.id.clone(),
                owner,
            })
        } else if self.volumes.iter().any(|decl| decl.volume.id == volume.id) {
            Err(TopologyError::DuplicateVolume(volume.id.clone()))
        } else if !volume.mount_path.starts_with('/') {
            Err(TopologyError::InvalidMountPath {
                volume: volume.id.clone(),
                path: volume.mount_path.clone(),
            })
        } else {
            Ok(owner)
        };

        match result {
            Ok(owner) => {
                debug!(volume = %volume.id, %owner, path = %volume.mount_path, "Volume declared");
                self.volumes.push(VolumeDeclaration { volume, owner });
                Ok(self)
            }
            Err(err) => Err(self.poison(err)),
        }
    }

    /// Start order of everything declared so far.
    pub fn resolve_start_order(&self) -> Result<Vec<ServiceId>, TopologyError> {
        start_order(&self.graph)
    }

    /// Finishes construction.
    ///
    /// Fails with the first declaration error, if any occurred, and re-checks
    /// acyclicity before handing out the immutable [`Topology`].
    pub fn build(self) -> Result<Topology, TopologyError> {
        if let Some(err) = self.poisoned {
            return Err(err);
        }
        let order = start_order(&self.graph)?;
        debug!(services = self.services.len(), volumes = self.volumes.len(), ?order, "Topology built");
        Ok(Topology {
            services: self.services,
            index: self.index,
            graph: self.graph,
            volumes: self.volumes,
        })
    }

    fn poison(&mut self, err: TopologyError) -> TopologyError {
        if self.poisoned.is_none() {
            self.poisoned = Some(err.clone());
        }
        err
    }

    /// Validates `batch` against a copy of the current state, returning the new state.
    #[allow(clippy::type_complexity)]
    fn stage(
        &self,
        batch: &[Service],
    ) -> Result<
        (
            DiGraph<ServiceId, ()>,
            HashMap<ServiceId, NodeIndex>,
            HashMap<u16, ServiceId>,
        ),
        TopologyError,
    > {
        let mut graph = self.graph.clone();
        let mut index = self.index.clone();
        let mut host_ports = self.host_ports.clone();

        for service in batch {
            if index.contains_key(&service.id) {
                return Err(TopologyError::DuplicateService(service.id.clone()));
            }
            if let Some(key) = service.missing_env().next() {
                return Err(TopologyError::MissingEnvironment {
                    service: service.id.clone(),
                    key: key.to_string(),
                });
            }
            for port in &service.ports {
                if let Some(first) = host_ports.insert(port.host, service.id.clone()) {
                    return Err(TopologyError::PortConflict {
                        port: port.host,
                        first,
                        second: service.id.clone(),
                    });
                }
            }
            let node = graph.add_node(service.id.clone());
            index.insert(service.id.clone(), node);
        }

        for service in batch {
            let dependent = index[&service.id];
            for dependency in &service.depends_on {
                let Some(&node) = index.get(dependency) else {
                    return Err(TopologyError::UnknownDependency {
                        service: service.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(node, dependent, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| TopologyError::CyclicDependency(graph[cycle.node_id()].clone()))?;

        Ok((graph, index, host_ports))
    }
}

/// An immutable, validated service graph.
#[derive(Debug, Clone)]
pub struct Topology {
    services: Vec<Service>,
    index: HashMap<ServiceId, NodeIndex>,
    graph: DiGraph<ServiceId, ()>,
    volumes: Vec<VolumeDeclaration>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    /// Services in declaration order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, id: &ServiceId) -> Option<&Service> {
        self.index
            .get(id)
            .and_then(|node| self.services.get(node.index()))
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn volumes(&self) -> &[VolumeDeclaration] {
        &self.volumes
    }

    /// Volumes mounted into `id`, in declaration order.
    pub fn volumes_of<'a>(&'a self, id: &'a ServiceId) -> impl Iterator<Item = &'a Volume> + 'a {
        self.volumes
            .iter()
            .filter(move |decl| &decl.owner == id)
            .map(|decl| &decl.volume)
    }

    /// Services `id` directly depends on, in declaration order.
    pub fn dependencies(&self, id: &ServiceId) -> Vec<&ServiceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Services that directly depend on `id`, in declaration order.
    pub fn dependents(&self, id: &ServiceId) -> Vec<&ServiceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Topological order: each service after all of its dependencies, ties broken
    /// by declaration order.
    ///
    /// The graph was checked when it was built; this re-checks anyway and fails with
    /// [`TopologyError::CyclicDependency`] rather than returning a partial order.
    pub fn resolve_start_order(&self) -> Result<Vec<ServiceId>, TopologyError> {
        start_order(&self.graph)
    }

    /// Dependents before their dependencies.
    pub fn resolve_stop_order(&self) -> Result<Vec<ServiceId>, TopologyError> {
        let mut order = self.resolve_start_order()?;
        order.reverse();
        Ok(order)
    }

    fn neighbors(&self, id: &ServiceId, direction: Direction) -> Vec<&ServiceId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        nodes.sort_unstable();
        nodes.into_iter().map(|n| &self.graph[n]).collect()
    }
}

/// Kahn's algorithm with a min-heap on node index (= declaration order).
fn start_order(graph: &DiGraph<ServiceId, ()>) -> Result<Vec<ServiceId>, TopologyError> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|node| in_degree[node.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(graph[node].clone());
        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            let degree = &mut in_degree[dependent.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    // Every node left with a positive in-degree sits on or behind a cycle.
    if let Some(stuck) = graph
        .node_indices()
        .find(|node| in_degree[node.index()] > 0)
    {
        return Err(TopologyError::CyclicDependency(graph[stuck].clone()));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(id: &str) -> Service {
        Service::new(id, format!("{id}:latest"))
    }

    fn ids(order: &[ServiceId]) -> Vec<&str> {
        order.iter().map(ServiceId::as_str).collect()
    }

    #[test]
    fn independent_services_keep_declaration_order() {
        let mut builder = Topology::builder();
        builder
            .add_service(svc("cache"))
            .unwrap()
            .add_service(svc("db"))
            .unwrap()
            .add_service(svc("queue"))
            .unwrap();
        let topology = builder.build().unwrap();

        assert_eq!(ids(&topology.resolve_start_order().unwrap()), ["cache", "db", "queue"]);
        assert_eq!(ids(&topology.resolve_stop_order().unwrap()), ["queue", "db", "cache"]);
    }

    #[test]
    fn ties_after_dependencies_follow_declaration_order() {
        let mut builder = Topology::builder();
        builder
            .add_services([
                svc("api").depends_on("db"),
                svc("worker"),
                svc("db"),
                svc("bot").depends_on("db"),
            ])
            .unwrap();
        let topology = builder.build().unwrap();

        // worker and db are both free at the start; worker was declared first.
        assert_eq!(ids(&topology.resolve_start_order().unwrap()), ["worker", "db", "api", "bot"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut builder = Topology::builder();
        let err = builder.add_service(svc("db").depends_on("db")).unwrap_err();
        assert_eq!(err, TopologyError::CyclicDependency(ServiceId::new("db")));
    }

    #[test]
    fn add_service_requires_declared_dependencies() {
        let mut builder = Topology::builder();
        let err = builder.add_service(svc("bot").depends_on("db")).unwrap_err();
        assert_eq!(
            err,
            TopologyError::UnknownDependency {
                service: ServiceId::new("bot"),
                dependency: ServiceId::new("db"),
            }
        );
    }

    #[test]
    fn batch_cycle_is_rejected_and_nothing_is_committed() {
        let mut builder = Topology::builder();
        builder.add_service(svc("db")).unwrap();

        let err = builder
            .add_services([svc("a").depends_on("b"), svc("b").depends_on("a")])
            .unwrap_err();
        assert!(matches!(err, TopologyError::CyclicDependency(_)));
        assert_eq!(ids(&builder.resolve_start_order().unwrap()), ["db"]);
    }

    #[test]
    fn first_error_poisons_build() {
        let mut builder = Topology::builder();
        builder.add_service(svc("db").with_port(8000, 8000)).unwrap();
        let _ = builder.add_service(svc("bot").with_port(8000, 80));
        // A later valid declaration does not clear the earlier failure.
        builder.add_service(svc("worker")).unwrap();

        assert!(matches!(
            builder.build(),
            Err(TopologyError::PortConflict { port: 8000, .. })
        ));
    }

    #[test]
    fn dependents_and_dependencies_are_direct_only() {
        let mut builder = Topology::builder();
        builder
            .add_services([
                svc("db"),
                svc("api").depends_on("db"),
                svc("bot").depends_on("api").depends_on("db"),
            ])
            .unwrap();
        let topology = builder.build().unwrap();

        let db = ServiceId::new("db");
        let api = ServiceId::new("api");
        let bot = ServiceId::new("bot");
        assert_eq!(topology.dependents(&db), vec![&api, &bot]);
        assert_eq!(topology.dependencies(&bot), vec![&db, &api]);
        assert!(topology.dependencies(&db).is_empty());
    }

    #[test]
    fn volume_validation() {
        let mut builder = Topology::builder();
        builder.add_service(svc("db")).unwrap();

        assert!(matches!(
            builder.add_volume(Volume::new("pgdata", "/data"), "nope"),
            Err(TopologyError::UnknownOwner { .. })
        ));

        let mut builder = Topology::builder();
        builder.add_service(svc("db")).unwrap();
        builder.add_volume(Volume::new("pgdata", "/data"), "db").unwrap();
        assert_eq!(
            builder.add_volume(Volume::new("pgdata", "/other"), "db").unwrap_err(),
            TopologyError::DuplicateVolume("pgdata".into())
        );

        let mut builder = Topology::builder();
        builder.add_service(svc("db")).unwrap();
        assert!(matches!(
            builder.add_volume(Volume::new("pgdata", "relative/path"), "db"),
            Err(TopologyError::InvalidMountPath { .. })
        ));
    }

    #[test]
    fn missing_environment_is_rejected() {
        let mut builder = Topology::builder();
        let err = builder
            .add_service(svc("db").require_env("POSTGRES_PASSWORD"))
            .unwrap_err();
        assert_eq!(
            err,
            TopologyError::MissingEnvironment {
                service: "db".into(),
                key: "POSTGRES_PASSWORD".into(),
            }
        );
    }

    #[test]
    fn start_order_names_a_service_left_on_the_cycle() {
        let mut graph = DiGraph::new();
        let a = graph.add_node(ServiceId::from("a"));
        let b = graph.add_node(ServiceId::from("b"));
        let c = graph.add_node(ServiceId::from("c"));
        graph.add_edge(a, b, ());
        graph.add_edge(b, c, ());
        graph.add_edge(c, b, ());

        assert_eq!(
            start_order(&graph).unwrap_err(),
            TopologyError::CyclicDependency("b".into())
        );
    }
}
