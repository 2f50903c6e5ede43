// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The fleet registry and scheduler.
//!
//! The registry is the network coordinator's authoritative view of every
//! local coordinator: its declared resources and attributes, its servers,
//! and whether it currently accepts new servers. It is reconciled against
//! each coordinator's periodic full-state sync.
//!
//! Resource accounting has no cached counters. The capacity available on a
//! coordinator is recomputed from its live server set on every check, so
//! placement decisions and the server records they create must happen under
//! the same lock; see [`Registry::place`].

use std::collections::{BTreeMap, BTreeSet};

use pp_ore::cast::CastLossy;
use pp_proto::command::{
    CoordinatorSummary, PackageManifest, PackageRef, Properties, ResourceMap, ServerSummary,
    SyncState,
};
use pp_proto::Identity;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors in placing a new server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// No enabled, unrestricted coordinator can run the server.
    #[error("no eligible local coordinator")]
    NoEligibleCoordinator,
    /// The requested coordinator is not registered.
    #[error("local coordinator does not exist: {0}")]
    UnknownCoordinator(Identity),
    /// The requested package is not known.
    #[error("unknown package {0}")]
    UnknownPackage(PackageRef),
    /// The requested coordinator cannot satisfy the server's requirements.
    #[error("local coordinator {0} lacks the resources or attributes to run the server")]
    InsufficientCapacity(Identity),
    /// The requested server is not registered.
    #[error("server does not exist: {0}")]
    UnknownServer(Uuid),
    /// The chosen coordinator has no live connection.
    #[error("local coordinator {0} is unreachable")]
    Unreachable(Identity),
}

/// A change in the fleet, published for external listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FleetEvent {
    /// A server finished provisioning.
    ServerProvisioned {
        /// The owning coordinator.
        coordinator: Identity,
        /// The server.
        server: Uuid,
    },
    /// A server failed to provision and was removed.
    ServerProvisionFailed {
        /// The owning coordinator.
        coordinator: Identity,
        /// The server.
        server: Uuid,
        /// The reason reported by the coordinator.
        message: String,
    },
    /// A server is gone.
    ServerShutdown {
        /// The owning coordinator.
        coordinator: Identity,
        /// The server.
        server: Uuid,
    },
    /// A coordinator started accepting new servers.
    CoordinatorEnabled(Identity),
    /// A coordinator stopped accepting new servers.
    CoordinatorDisabled(Identity),
}

/// What a server needs from the coordinator running it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirements {
    /// Resource amounts consumed by the server.
    pub resources: ResourceMap,
    /// Attributes the coordinator must declare.
    pub attributes: BTreeSet<String>,
}

impl Requirements {
    /// The requirements of servers running the package `manifest`.
    pub fn of(manifest: &PackageManifest) -> Requirements {
        Requirements {
            resources: manifest.resources.clone(),
            attributes: manifest.attributes.clone(),
        }
    }
}

/// A server, as seen by the network coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    /// The server's ID.
    pub uuid: Uuid,
    /// The server's name.
    pub name: String,
    /// The package the server runs.
    pub package: PackageRef,
    /// The server's properties.
    pub properties: Properties,
    /// Resources consumed by the server.
    pub resources: ResourceMap,
    /// Whether the coordinator acknowledged the server.
    pub active: bool,
    /// The coordinator running the server.
    pub coordinator: Identity,
}

impl Server {
    fn summary(&self) -> ServerSummary {
        ServerSummary {
            uuid: self.uuid,
            name: self.name.clone(),
            package: self.package.clone(),
            active: self.active,
        }
    }
}

/// A registered local coordinator.
#[derive(Clone, Debug)]
pub struct LocalCoordinator {
    /// The coordinator's identity.
    pub uuid: Identity,
    /// The coordinator's name.
    pub name: String,
    /// The name of the coordinator's key.
    pub key_name: Option<String>,
    /// The coordinator's declared resources.
    pub resources: ResourceMap,
    /// The coordinator's declared attributes.
    pub attributes: BTreeSet<String>,
    /// The coordinator's servers.
    pub servers: BTreeMap<Uuid, Server>,
    /// Whether the coordinator accepts new servers. Forced off at the start
    /// of every sync and restored from the sync payload at its end.
    pub enabled: bool,
    /// Whether an operator excluded the coordinator from scheduling.
    pub restricted: bool,
}

impl LocalCoordinator {
    /// A newly registered coordinator, disabled until its first sync.
    pub fn new(uuid: Identity, name: String, key_name: Option<String>) -> LocalCoordinator {
        LocalCoordinator {
            uuid,
            name,
            key_name,
            resources: ResourceMap::new(),
            attributes: BTreeSet::new(),
            servers: BTreeMap::new(),
            enabled: false,
            restricted: false,
        }
    }

    /// Reports whether the scheduler may place servers here.
    pub fn is_eligible(&self) -> bool {
        self.enabled && !self.restricted
    }

    /// The amount of `resource` not consumed by any registered server, or
    /// `None` if the resource is not declared.
    pub fn available(&self, resource: &str) -> Option<i64> {
        let max = *self.resources.get(resource)?;
        let used: i64 = self
            .servers
            .values()
            .filter_map(|server| server.resources.get(resource))
            .sum();
        Some(max - used)
    }

    /// Reports whether this coordinator declares every required attribute
    /// and has enough of every required resource available.
    pub fn can_provision(&self, requirements: &Requirements) -> bool {
        if !requirements.attributes.is_subset(&self.attributes) {
            return false;
        }
        requirements
            .resources
            .iter()
            .all(|(resource, required)| match self.available(resource) {
                Some(available) => available - required >= 0,
                None => false,
            })
    }

    /// The sum over declared resources of the available fraction. Higher
    /// values mean more free capacity.
    pub fn normalized_usage(&self) -> f64 {
        self.resources
            .iter()
            .filter(|(_, max)| **max > 0)
            .map(|(resource, max)| {
                let available = self.available(resource).unwrap_or(0);
                f64::cast_lossy(available) / f64::cast_lossy(*max)
            })
            .sum()
    }

    /// Summarizes this coordinator for fleet listings.
    pub fn summary(&self) -> CoordinatorSummary {
        CoordinatorSummary {
            uuid: self.uuid,
            name: self.name.clone(),
            enabled: self.enabled,
            restricted: self.restricted,
            resources: self.resources.clone(),
            attributes: self.attributes.clone(),
            servers: self.servers.values().map(Server::summary).collect(),
        }
    }
}

/// A request to place a new server.
#[derive(Clone, Debug)]
pub struct Placement {
    /// The concrete package version the server runs.
    pub package: PackageRef,
    /// The server's name.
    pub name: String,
    /// The server's merged properties.
    pub properties: Properties,
    /// What the server needs.
    pub requirements: Requirements,
    /// An explicit target, bypassing the scheduler.
    pub target: Option<Identity>,
}

/// The set of registered local coordinators.
#[derive(Debug, Default)]
pub struct Registry {
    coordinators: BTreeMap<Identity, LocalCoordinator>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a coordinator, unless it is already known.
    pub fn register(&mut self, uuid: Identity, name: String, key_name: Option<String>) {
        self.coordinators
            .entry(uuid)
            .or_insert_with(|| LocalCoordinator::new(uuid, name, key_name));
    }

    /// Looks up a coordinator.
    pub fn get(&self, uuid: &Identity) -> Option<&LocalCoordinator> {
        self.coordinators.get(uuid)
    }

    /// Looks up a server.
    pub fn server(&self, coordinator: &Identity, server: &Uuid) -> Option<&Server> {
        self.coordinators.get(coordinator)?.servers.get(server)
    }

    /// Returns every registered coordinator.
    pub fn coordinators(&self) -> impl Iterator<Item = &LocalCoordinator> {
        self.coordinators.values()
    }

    /// Selects the eligible coordinator able to run a server with the given
    /// requirements that has the largest normalized usage value, i.e. the
    /// most free capacity.
    pub fn select_coordinator(&self, requirements: &Requirements) -> Option<Identity> {
        let mut best: Option<(&LocalCoordinator, f64)> = None;
        for coordinator in self.coordinators.values() {
            if !coordinator.is_eligible() || !coordinator.can_provision(requirements) {
                continue;
            }
            let usage = coordinator.normalized_usage();
            match best {
                Some((_, best_usage)) if usage <= best_usage => {}
                _ => best = Some((coordinator, usage)),
            }
        }
        best.map(|(coordinator, _)| coordinator.uuid)
    }

    /// Chooses a coordinator for a new server and records the server,
    /// inactive, under that coordinator.
    ///
    /// An explicit target must be registered and have the capacity for the
    /// server, but may be disabled or restricted.
    pub fn place(&mut self, placement: Placement) -> Result<Server, PlacementError> {
        let uuid = match placement.target {
            Some(target) => {
                let coordinator = self
                    .coordinators
                    .get(&target)
                    .ok_or(PlacementError::UnknownCoordinator(target))?;
                if !coordinator.can_provision(&placement.requirements) {
                    return Err(PlacementError::InsufficientCapacity(target));
                }
                target
            }
            None => self
                .select_coordinator(&placement.requirements)
                .ok_or(PlacementError::NoEligibleCoordinator)?,
        };
        let server = Server {
            uuid: Uuid::new_v4(),
            name: placement.name,
            package: placement.package,
            properties: placement.properties,
            resources: placement.requirements.resources,
            active: false,
            coordinator: uuid,
        };
        if let Some(coordinator) = self.coordinators.get_mut(&uuid) {
            coordinator.servers.insert(server.uuid, server.clone());
        }
        info!(coordinator = %uuid, server = %server.uuid, package = %server.package, "registry: placed server");
        Ok(server)
    }

    /// Applies a coordinator's provisioning outcome. A success activates the
    /// server; a failure removes it.
    pub fn provision_response(
        &mut self,
        coordinator: &Identity,
        server: &Uuid,
        ok: bool,
        message: &str,
    ) -> Option<FleetEvent> {
        let servers = &mut self.coordinators.get_mut(coordinator)?.servers;
        if ok {
            servers.get_mut(server)?.active = true;
            Some(FleetEvent::ServerProvisioned {
                coordinator: *coordinator,
                server: *server,
            })
        } else {
            servers.remove(server)?;
            Some(FleetEvent::ServerProvisionFailed {
                coordinator: *coordinator,
                server: *server,
                message: message.to_string(),
            })
        }
    }

    /// Removes a server that is gone.
    pub fn remove_server(&mut self, coordinator: &Identity, server: &Uuid) -> Option<FleetEvent> {
        self.coordinators
            .get_mut(coordinator)?
            .servers
            .remove(server)?;
        Some(FleetEvent::ServerShutdown {
            coordinator: *coordinator,
            server: *server,
        })
    }

    /// Marks a server inactive ahead of its deprovisioning.
    pub fn mark_inactive(&mut self, coordinator: &Identity, server: &Uuid) -> bool {
        match self
            .coordinators
            .get_mut(coordinator)
            .and_then(|c| c.servers.get_mut(server))
        {
            Some(server) => {
                server.active = false;
                true
            }
            None => false,
        }
    }

    /// Stops placing servers on a coordinator.
    pub fn disable(&mut self, coordinator: &Identity) -> Option<FleetEvent> {
        let coordinator = self.coordinators.get_mut(coordinator)?;
        if !std::mem::replace(&mut coordinator.enabled, false) {
            return None;
        }
        Some(FleetEvent::CoordinatorDisabled(coordinator.uuid))
    }

    /// Sets or clears a coordinator's restricted flag.
    pub fn set_restricted(&mut self, coordinator: &Identity, restricted: bool) -> bool {
        match self.coordinators.get_mut(coordinator) {
            Some(coordinator) => {
                coordinator.restricted = restricted;
                true
            }
            None => false,
        }
    }

    /// Reconciles a coordinator against its complete reported state.
    ///
    /// The coordinator's resources, attributes, and servers are replaced
    /// wholesale. Servers that disappeared yield shutdown events and servers
    /// that appeared yield provisioned events. `requirements` supplies the
    /// resources consumed by servers of a package.
    pub fn sync(
        &mut self,
        uuid: &Identity,
        state: SyncState,
        requirements: impl Fn(&PackageRef) -> ResourceMap,
    ) -> Vec<FleetEvent> {
        let Some(coordinator) = self.coordinators.get_mut(uuid) else {
            debug!(coordinator = %uuid, "registry: sync from unregistered coordinator");
            return vec![];
        };
        let was_enabled = std::mem::replace(&mut coordinator.enabled, false);

        coordinator.name = state.name;
        coordinator.resources = state.resources;
        coordinator.attributes = state.attributes;
        let servers: BTreeMap<_, _> = state
            .servers
            .into_iter()
            .map(|server| {
                let resources = requirements(&server.package);
                let server = Server {
                    uuid: server.uuid,
                    name: server.name,
                    package: server.package,
                    properties: server.properties,
                    resources,
                    active: server.active,
                    coordinator: *uuid,
                };
                (server.uuid, server)
            })
            .collect();
        let previous = std::mem::replace(&mut coordinator.servers, servers);

        let mut events = vec![];
        for server in previous.keys() {
            if !coordinator.servers.contains_key(server) {
                events.push(FleetEvent::ServerShutdown {
                    coordinator: *uuid,
                    server: *server,
                });
            }
        }
        for server in coordinator.servers.keys() {
            if !previous.contains_key(server) {
                events.push(FleetEvent::ServerProvisioned {
                    coordinator: *uuid,
                    server: *server,
                });
            }
        }

        coordinator.enabled = state.enabled;
        match (was_enabled, coordinator.enabled) {
            (false, true) => events.push(FleetEvent::CoordinatorEnabled(*uuid)),
            (true, false) => events.push(FleetEvent::CoordinatorDisabled(*uuid)),
            _ => {}
        }
        debug!(coordinator = %uuid, events = events.len(), "registry: synced");
        events
    }

    /// Summarizes the fleet.
    pub fn snapshot(&self) -> Vec<CoordinatorSummary> {
        self.coordinators.values().map(LocalCoordinator::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use pp_proto::command::SyncServer;

    use super::*;

    fn coordinator(resources: &[(&str, i64)], attributes: &[&str]) -> LocalCoordinator {
        let mut coordinator = LocalCoordinator::new(Uuid::new_v4(), "node".into(), None);
        coordinator.resources = resources.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        coordinator.attributes = attributes.iter().map(|a| a.to_string()).collect();
        coordinator.enabled = true;
        coordinator
    }

    fn requirements(resources: &[(&str, i64)], attributes: &[&str]) -> Requirements {
        Requirements {
            resources: resources.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn server(coordinator: Identity, resources: &[(&str, i64)]) -> Server {
        Server {
            uuid: Uuid::new_v4(),
            name: "s".into(),
            package: PackageRef::new("web", "1.0"),
            properties: Properties::new(),
            resources: resources.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            active: true,
            coordinator,
        }
    }

    fn sync_state(servers: &[Uuid]) -> SyncState {
        SyncState {
            name: "node".into(),
            resources: ResourceMap::from([("memory".into(), 1024)]),
            attributes: BTreeSet::new(),
            enabled: true,
            servers: servers
                .iter()
                .map(|uuid| SyncServer {
                    uuid: *uuid,
                    name: "s".into(),
                    package: PackageRef::new("web", "1.0"),
                    properties: Properties::new(),
                    active: true,
                })
                .collect(),
        }
    }

    #[test]
    fn test_can_provision() {
        let mut node = coordinator(&[("memory", 1024), ("cpu", 4)], &["linux", "ssd"]);
        let existing = server(node.uuid, &[("memory", 512)]);
        node.servers.insert(existing.uuid, existing);

        assert!(node.can_provision(&requirements(&[("memory", 512)], &["linux"])));
        assert!(node.can_provision(&requirements(&[], &[])));
        // Missing attribute.
        assert!(!node.can_provision(&requirements(&[("memory", 1)], &["linux", "gpu"])));
        // Exhausted resource, recomputed from the server set.
        assert!(!node.can_provision(&requirements(&[("memory", 513)], &[])));
        // Undeclared resource.
        assert!(!node.can_provision(&requirements(&[("disk", 1)], &[])));
        assert_eq!(node.available("memory"), Some(512));
        assert_eq!(node.available("disk"), None);
    }

    #[test]
    fn test_select_most_free_capacity() {
        let mut registry = Registry::new();
        let mut busy = coordinator(&[("memory", 1000)], &[]);
        let used = server(busy.uuid, &[("memory", 800)]);
        busy.servers.insert(used.uuid, used);
        let idle = coordinator(&[("memory", 1000)], &[]);
        let mut restricted = coordinator(&[("memory", 4000)], &[]);
        restricted.restricted = true;
        let mut disabled = coordinator(&[("memory", 4000)], &[]);
        disabled.enabled = false;

        let idle_id = idle.uuid;
        for c in [busy, idle, restricted, disabled] {
            registry.coordinators.insert(c.uuid, c);
        }
        let req = requirements(&[("memory", 100)], &[]);
        assert_eq!(registry.select_coordinator(&req), Some(idle_id));
        assert_eq!(
            registry.select_coordinator(&requirements(&[("memory", 1001)], &[])),
            None
        );
    }

    #[test]
    fn test_place_records_server() {
        let mut registry = Registry::new();
        let node = coordinator(&[("memory", 1000)], &[]);
        let uuid = node.uuid;
        registry.coordinators.insert(uuid, node);

        let placement = |target| Placement {
            package: PackageRef::new("web", "1.0"),
            name: "web".into(),
            properties: Properties::new(),
            requirements: requirements(&[("memory", 600)], &[]),
            target,
        };
        let server = registry.place(placement(None)).unwrap();
        assert_eq!(server.coordinator, uuid);
        assert!(!registry.server(&uuid, &server.uuid).unwrap().active);

        // The first placement consumed the capacity the second needs.
        assert_eq!(
            registry.place(placement(None)),
            Err(PlacementError::NoEligibleCoordinator)
        );
        assert_eq!(
            registry.place(placement(Some(uuid))),
            Err(PlacementError::InsufficientCapacity(uuid))
        );
        let stranger = Uuid::new_v4();
        assert_eq!(
            registry.place(placement(Some(stranger))),
            Err(PlacementError::UnknownCoordinator(stranger))
        );

        assert_eq!(
            registry.provision_response(&uuid, &server.uuid, false, "boom"),
            Some(FleetEvent::ServerProvisionFailed {
                coordinator: uuid,
                server: server.uuid,
                message: "boom".into()
            })
        );
        assert!(registry.server(&uuid, &server.uuid).is_none());
        assert!(registry.place(placement(None)).is_ok());
    }

    #[test]
    fn test_sync_diff() {
        let mut registry = Registry::new();
        let uuid = Uuid::new_v4();
        registry.register(uuid, "node".into(), None);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let events = registry.sync(&uuid, sync_state(&[a, b]), |_| ResourceMap::new());
        assert_eq!(events.len(), 3);
        assert!(registry.get(&uuid).unwrap().enabled);

        let events = registry.sync(&uuid, sync_state(&[b, c]), |_| {
            ResourceMap::from([("memory".into(), 100)])
        });
        assert_eq!(
            events,
            vec![
                FleetEvent::ServerShutdown {
                    coordinator: uuid,
                    server: a
                },
                FleetEvent::ServerProvisioned {
                    coordinator: uuid,
                    server: c
                },
            ]
        );
        assert_eq!(registry.get(&uuid).unwrap().available("memory"), Some(824));
    }

    #[test]
    fn test_sync_restores_declared_enabled_flag() {
        let mut registry = Registry::new();
        let uuid = Uuid::new_v4();
        registry.register(uuid, "node".into(), None);
        registry.sync(&uuid, sync_state(&[]), |_| ResourceMap::new());

        let mut state = sync_state(&[]);
        state.enabled = false;
        let events = registry.sync(&uuid, state, |_| ResourceMap::new());
        assert_eq!(events, vec![FleetEvent::CoordinatorDisabled(uuid)]);
        assert!(!registry.get(&uuid).unwrap().is_eligible());
        assert_eq!(registry.disable(&uuid), None);
    }
}
