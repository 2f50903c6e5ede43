// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The PlayPen network coordinator.
//!
//! The network coordinator holds the fleet registry, places new servers on
//! local coordinators, and relays client commands and console sessions to
//! the local coordinator that runs the affected server.
//!
//! All state lives behind a [`Network`] handle, which is cheap to clone and
//! is passed explicitly to every connection task and command handler.

use std::sync::{Arc, Mutex, MutexGuard};

use pp_crypto::{CryptoError, SecretKey};
use pp_ore::id_gen::random_string;
use pp_proto::command::{
    AccessDenied, CoordinatorSummary, Deprovision, DetachConsole, FreezeServer, PackageRef,
    Properties, Provision, SendInput,
};
use pp_proto::{Command, CommandKind, Identity, TransactionMessage, TransactionMode};
use pp_service::dispatch::{CommandProcessor, HandlerTable, Incoming};
use pp_service::keystore::{KeyEntry, KeyKind, Keystore};
use pp_service::packages::{PackageError, PackageHandle, PackageResolver, PackageStore};
use pp_service::transaction::{TransactionInfo, TransactionManager};
use pp_service::transport::{ConnectionHandle, ConnectionRegistry, Transport};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AccessControl;
use crate::console::{ConsoleInfo, ConsoleRelay};
use crate::registry::{FleetEvent, Placement, PlacementError, Registry, Requirements};

pub mod auth;
pub mod config;
pub mod console;
mod handlers;
pub mod registry;
pub mod server;

pub use crate::config::NetworkConfig;

/// The property naming a server.
pub const SERVER_NAME_PROPERTY: &str = "server_name";

/// The length of generated coordinator keys.
const GENERATED_KEY_LEN: usize = 32;

/// A handle to the state of a network coordinator.
#[derive(Clone, Debug)]
pub struct Network {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    identity: Identity,
    keystore: Keystore,
    connections: Arc<ConnectionRegistry>,
    transactions: TransactionManager,
    // Covers every coordinator and its servers. Placement decisions and the
    // server records they create happen under one acquisition.
    registry: Mutex<Registry>,
    // Covers every console session.
    consoles: Mutex<ConsoleRelay>,
    packages: Arc<PackageStore>,
    access: AccessControl,
    strings: Properties,
    chunk_threshold: usize,
    events: broadcast::Sender<FleetEvent>,
    handlers: HandlerTable<Network>,
}

/// A server that was placed and whose provisioning is in flight.
#[derive(Debug)]
pub struct Provisioned {
    /// The coordinator the server was placed on.
    pub coordinator: Identity,
    /// The ID of the new server.
    pub server: Uuid,
    /// The concrete package version provisioned.
    pub package: PackageRef,
    /// The coordinator's replies on the `PROVISION` transaction.
    pub responses: mpsc::UnboundedReceiver<TransactionMessage>,
}

impl Network {
    /// Creates a network coordinator that sends through connections
    /// registered with [`Network::connected`].
    pub fn new(config: &NetworkConfig) -> Result<Network, anyhow::Error> {
        let connections = Arc::new(ConnectionRegistry::new());
        let transport = Arc::clone(&connections) as Arc<dyn Transport>;
        Network::build(config, connections, transport)
    }

    /// Creates a network coordinator that sends through `transport`.
    pub fn with_transport(
        config: &NetworkConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Network, anyhow::Error> {
        Network::build(config, Arc::new(ConnectionRegistry::new()), transport)
    }

    fn build(
        config: &NetworkConfig,
        connections: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Network, anyhow::Error> {
        let keystore = Keystore::from_configs(&config.coordinators, &config.clients)?;
        let packages = Arc::new(PackageStore::open(&config.package_root)?);

        let mut registry = Registry::new();
        for entry in keystore.entries(KeyKind::Coordinator) {
            registry.register(entry.identity, entry.name.clone(), entry.key_name.clone());
        }
        let (events, _) = broadcast::channel(1024);

        Ok(Network {
            inner: Arc::new(Inner {
                identity: config.id,
                keystore,
                connections,
                transactions: TransactionManager::new(config.id, transport),
                registry: Mutex::new(registry),
                consoles: Mutex::new(ConsoleRelay::new(config.id)),
                packages,
                access: AccessControl::from_configs(&config.authenticators),
                strings: config.strings.clone(),
                chunk_threshold: config.chunk_threshold,
                events,
                handlers: handlers::handler_table(),
            }),
        })
    }

    /// The network coordinator's identity.
    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    /// The keystore of known participants.
    pub fn keystore(&self) -> &Keystore {
        &self.inner.keystore
    }

    /// The package store.
    pub fn packages(&self) -> &Arc<PackageStore> {
        &self.inner.packages
    }

    /// The transaction manager.
    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    /// Subscribes to fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    /// Locks the fleet registry.
    pub fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("lock poisoned")
    }

    fn consoles(&self) -> MutexGuard<'_, ConsoleRelay> {
        self.inner.consoles.lock().expect("lock poisoned")
    }

    /// Summarizes the fleet.
    pub fn snapshot(&self) -> Vec<CoordinatorSummary> {
        self.registry().snapshot()
    }

    fn publish(&self, event: FleetEvent) {
        info!(?event, "network: fleet event");
        // No listeners is fine.
        let _ = self.inner.events.send(event);
    }

    /// Processes a message received on the channel `from`.
    pub fn receive(&self, message: TransactionMessage, from: Identity) -> bool {
        self.inner.transactions.receive(message, from, self)
    }

    /// Registers a newly authenticated connection.
    pub fn connected(&self, handle: ConnectionHandle) {
        let identity = handle.identity();
        self.inner.connections.register(handle);
        if let Some(entry) = self.inner.keystore.get(&identity) {
            if entry.kind == KeyKind::Coordinator {
                self.registry()
                    .register(identity, entry.name.clone(), entry.key_name.clone());
            }
            info!(%identity, name = %entry.name, kind = ?entry.kind, "network: participant connected");
        }
    }

    /// Cleans up after a connection closed.
    ///
    /// A coordinator that lost its connection is disabled and its console
    /// sessions are detached; so are the console sessions of a client.
    /// Nothing happens if the connection was already replaced.
    pub fn disconnected(&self, handle: &ConnectionHandle) {
        if !self.inner.connections.unregister(handle) {
            return;
        }
        let identity = handle.identity();
        info!(%identity, "network: participant disconnected");

        let event = self.registry().disable(&identity);
        if let Some(event) = event {
            self.publish(event);
        }

        let (relayed, attached) = {
            let mut consoles = self.consoles();
            (
                consoles.sweep_coordinator(&identity),
                consoles.sweep_client(&identity),
            )
        };
        for (console, info) in relayed {
            info!(%console, client = %info.attached, "network: console detached");
            self.send_single(Command::DetachConsole(DetachConsole { console }), info.attached);
        }
        for (console, info) in attached {
            info!(%console, coordinator = %info.coordinator, "network: console detached");
            self.send_single(Command::DetachConsole(DetachConsole { console }), info.coordinator);
        }
    }

    fn send_single(&self, command: Command, target: Identity) -> bool {
        self.inner.transactions.send_single(command, target)
    }

    /// Replies to a command. Commands that opened a transaction are answered
    /// by completing it; all others with a `SINGLE` message.
    fn reply_to(
        &self,
        from: Identity,
        transaction: Option<&TransactionInfo>,
        command: Command,
    ) -> bool {
        match transaction {
            Some(transaction) if !transaction.done => {
                self.inner
                    .transactions
                    .respond(transaction, TransactionMode::Complete, command)
            }
            _ => self.send_single(command, from),
        }
    }

    fn reply(&self, incoming: &Incoming, command: Command) -> bool {
        self.reply_to(incoming.from, incoming.transaction.as_ref(), command)
    }

    fn authorize(&self, incoming: &Incoming) -> bool {
        let Some(entry) = self.inner.keystore.get(&incoming.from) else {
            return false;
        };
        let kind = incoming.command.kind();
        let role_ok = match entry.kind {
            KeyKind::Client => kind.is_client() || kind == CommandKind::Noop,
            KeyKind::Coordinator => !kind.is_client(),
        };
        role_ok
            && self.inner.access.has_access(
                &entry.authenticators,
                &incoming.command,
                incoming.transaction.as_ref(),
                incoming.from,
            )
    }

    /// Places a new server running `package` and asks its coordinator to
    /// provision it.
    ///
    /// `package` may name the promoted version. Properties are merged from,
    /// in increasing precedence: the package's strings, the network's global
    /// strings, the server name, and `properties`.
    pub fn provision(
        &self,
        package: &PackageRef,
        name: Option<String>,
        properties: Properties,
        target: Option<Identity>,
    ) -> Result<Provisioned, PlacementError> {
        let handle = self
            .inner
            .packages
            .resolve(package)
            .ok_or_else(|| PlacementError::UnknownPackage(package.clone()))?;
        self.provision_resolved(&handle, name, properties, target)
    }

    fn provision_resolved(
        &self,
        handle: &PackageHandle,
        name: Option<String>,
        properties: Properties,
        target: Option<Identity>,
    ) -> Result<Provisioned, PlacementError> {
        let manifest = &handle.manifest;
        let name = name.unwrap_or_else(|| manifest.id.clone());
        let mut merged = manifest.strings.clone();
        merged.extend(self.inner.strings.clone());
        merged.insert(SERVER_NAME_PROPERTY.into(), name.clone());
        merged.extend(properties);

        let placement = Placement {
            package: manifest.package_ref(),
            name,
            properties: merged,
            requirements: Requirements::of(manifest),
            target,
        };
        let server = match self.registry().place(placement) {
            Ok(server) => server,
            Err(error) => {
                info!(package = %manifest.package_ref(), "network: placement failed: {error}");
                return Err(error);
            }
        };

        let provision = Command::Provision(Provision {
            server: server.uuid,
            name: server.name.clone(),
            package: server.package.clone(),
            properties: server.properties.clone(),
        });
        let Some((_, responses)) = self.inner.transactions.request(provision, server.coordinator)
        else {
            warn!(coordinator = %server.coordinator, server = %server.uuid, "network: coordinator unreachable");
            self.registry().remove_server(&server.coordinator, &server.uuid);
            return Err(PlacementError::Unreachable(server.coordinator));
        };
        Ok(Provisioned {
            coordinator: server.coordinator,
            server: server.uuid,
            package: server.package,
            responses,
        })
    }

    /// Asks a coordinator to deprovision a server, marking the server
    /// inactive right away.
    pub fn deprovision(&self, coordinator: Identity, server: Uuid, force: bool) -> bool {
        if !self.registry().mark_inactive(&coordinator, &server) {
            return false;
        }
        let command = Command::Deprovision(Deprovision { server, force });
        self.send_single(command, coordinator)
    }

    /// Asks a coordinator to shut down, disabling it right away.
    pub fn shutdown_coordinator(&self, coordinator: Identity) -> bool {
        let event = {
            let mut registry = self.registry();
            if registry.get(&coordinator).is_none() {
                return false;
            }
            registry.disable(&coordinator)
        };
        if let Some(event) = event {
            self.publish(event);
        }
        self.send_single(Command::Shutdown, coordinator)
    }

    /// Asks a coordinator to freeze a server, marking the server inactive
    /// right away.
    pub fn freeze_server(&self, coordinator: Identity, server: Uuid) -> bool {
        if !self.registry().mark_inactive(&coordinator, &server) {
            return false;
        }
        self.send_single(Command::FreezeServer(FreezeServer { server }), coordinator)
    }

    /// Sends a line of input to a server's process.
    pub fn send_input(&self, coordinator: Identity, server: Uuid, input: String) -> bool {
        if self.registry().server(&coordinator, &server).is_none() {
            return false;
        }
        self.send_single(Command::SendInput(SendInput { server, input }), coordinator)
    }

    /// Sets or clears a coordinator's restricted flag.
    pub fn restrict(&self, coordinator: Identity, restricted: bool) -> bool {
        let found = self.registry().set_restricted(&coordinator, restricted);
        if found {
            info!(%coordinator, restricted, "network: restriction changed");
        }
        found
    }

    /// Makes `package` the promoted version of its package ID.
    pub fn promote(&self, package: &PackageRef) -> Result<(), PackageError> {
        self.inner.packages.promote(package)
    }

    /// Creates the keystore entry and registry record of a new coordinator,
    /// returning its identity and shared secret.
    pub fn create_coordinator(
        &self,
        name: String,
        key_name: Option<String>,
    ) -> Result<(Identity, String), CryptoError> {
        let identity = Uuid::new_v4();
        let secret = random_string(GENERATED_KEY_LEN);
        let entry = KeyEntry {
            identity,
            kind: KeyKind::Coordinator,
            name: name.clone(),
            key_name: key_name.clone(),
            authenticators: vec![],
            key: SecretKey::new(&secret)?,
        };
        self.inner.keystore.insert(entry);
        self.registry().register(identity, name.clone(), key_name);
        info!(coordinator = %identity, %name, "network: created coordinator");
        Ok((identity, secret))
    }

    /// Opens a console session on a server for `client`, returning the
    /// session ID. The coordinator is not told yet.
    fn open_console(
        &self,
        coordinator: Identity,
        server: Uuid,
        client: Identity,
    ) -> Result<String, PlacementError> {
        if self.registry().server(&coordinator, &server).is_none() {
            return Err(PlacementError::UnknownServer(server));
        }
        let console = self.consoles().attach(coordinator, server, client);
        info!(%console, %coordinator, %server, %client, "network: console attached");
        Ok(console)
    }

    /// Ends a console session on behalf of `requester`, which must be either
    /// end of the session.
    fn close_console(&self, console: &str, requester: Identity) -> Option<ConsoleInfo> {
        let mut consoles = self.consoles();
        let info = consoles.get(console)?;
        if info.attached != requester && info.coordinator != requester {
            return None;
        }
        let info = consoles.detach(console);
        info!(%console, %requester, "network: console detached");
        info
    }
}

impl CommandProcessor for Network {
    fn process(&self, incoming: Incoming) -> bool {
        if !self.authorize(&incoming) {
            let command = incoming.command.kind();
            warn!(from = %incoming.from, %command, "network: access denied");
            self.reply(&incoming, Command::AccessDenied(AccessDenied { command }));
            return false;
        }
        self.inner.handlers.dispatch(self, incoming)
    }
}
