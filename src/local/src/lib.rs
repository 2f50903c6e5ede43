// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The PlayPen local coordinator.
//!
//! A local coordinator runs servers on one machine. It keeps a single
//! connection to the network coordinator, reports its complete state over it
//! periodically, and carries out the provisioning, deprovisioning, and
//! console commands the network coordinator sends. Packages are downloaded
//! on demand and cached locally.
//!
//! All state lives behind a [`Node`] handle, which is cheap to clone and is
//! passed explicitly to every command handler and background task.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use pp_ore::retry::{Retry, INFO_MIN_RETRIES};
use pp_ore::task::{AbortOnDropHandle, JoinHandleExt};
use pp_proto::command::{
    ConsoleMessage, DetachConsole, PackageRef, PackageRequest, Properties, Provision,
    ServerShutdown, SyncServer, SyncState,
};
use pp_proto::{Command, CommandKind, Identity, TransactionMessage};
use pp_service::dispatch::{CommandProcessor, HandlerTable, Incoming};
use pp_service::keystore::Credentials;
use pp_service::packages::{PackageError, PackageHandle, PackageResolver, PackageStore};
use pp_service::transaction::TransactionManager;
use pp_service::transfer::{ChunkReassembler, TransferError};
use pp_service::transport::{Connection, Transport, Upstream};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{PackageExecutor, Phase};
use crate::process::{OutputSubscription, ProcessHandle, ProcessSpec, ProcessSupervisor};

pub mod config;
pub mod executor;
mod handlers;
pub mod process;

pub use crate::config::LocalConfig;

/// The longest pause between reconnection attempts.
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// An error in carrying out a command.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("package {0} is unknown to the network coordinator")]
    UnknownPackage(PackageRef),
    #[error("no reply from the network coordinator")]
    NoReply,
    #[error("unexpected reply {0}")]
    UnexpectedReply(CommandKind),
    #[error("server {0} already exists")]
    DuplicateServer(Uuid),
    #[error("unknown server {0}")]
    UnknownServer(Uuid),
    #[error("{phase} phase of {package} failed")]
    Phase { phase: Phase, package: PackageRef },
    #[error("server process: {0:#}")]
    Process(anyhow::Error),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A server provisioned on this coordinator.
#[derive(Clone, Debug)]
pub struct LocalServer {
    /// The server's ID.
    pub uuid: Uuid,
    /// The server's name.
    pub name: String,
    /// The package the server runs.
    pub package: PackageRef,
    /// The server's properties.
    pub properties: Properties,
    /// The server's directory.
    pub dir: PathBuf,
    /// Whether provisioning finished.
    pub active: bool,
    /// The installed packages, dependencies first.
    pub packages: Vec<PackageHandle>,
    /// The server's process, if its package declares one.
    pub process: Option<Arc<dyn ProcessHandle>>,
}

/// What happens to a server's directory when the server goes away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposal {
    Remove,
    Freeze,
}

#[derive(Debug)]
struct ConsoleSession {
    server: Uuid,
    _task: AbortOnDropHandle<()>,
}

/// A handle to the state of a local coordinator.
#[derive(Clone, Debug)]
pub struct Node {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: LocalConfig,
    credentials: Credentials,
    upstream: Arc<Upstream>,
    transactions: TransactionManager,
    packages: Arc<PackageStore>,
    reassembler: Arc<ChunkReassembler>,
    executor: Arc<dyn PackageExecutor>,
    supervisor: Arc<dyn ProcessSupervisor>,
    // Covers every server on this coordinator.
    servers: Mutex<BTreeMap<Uuid, LocalServer>>,
    // Covers every console session.
    consoles: Mutex<BTreeMap<String, ConsoleSession>>,
    // One gate per package; holding it makes a download single-flight.
    downloads: Mutex<BTreeMap<PackageRef, Arc<tokio::sync::Mutex<()>>>>,
    enabled: AtomicBool,
    shutdown: watch::Sender<bool>,
    handlers: HandlerTable<Node>,
}

impl Node {
    /// Creates a local coordinator that talks to the network coordinator
    /// over the connection established by [`Node::run`].
    pub fn new(
        config: LocalConfig,
        executor: Arc<dyn PackageExecutor>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Node, anyhow::Error> {
        let upstream = Arc::new(Upstream::new());
        let transport = Arc::clone(&upstream) as Arc<dyn Transport>;
        Node::build(config, upstream, transport, executor, supervisor)
    }

    /// Creates a local coordinator that sends through `transport`.
    pub fn with_transport(
        config: LocalConfig,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn PackageExecutor>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Node, anyhow::Error> {
        Node::build(config, Arc::new(Upstream::new()), transport, executor, supervisor)
    }

    fn build(
        config: LocalConfig,
        upstream: Arc<Upstream>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn PackageExecutor>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Node, anyhow::Error> {
        let credentials = config.identity.credentials()?;
        for dir in [&config.temp_dir, &config.server_root, &config.frozen_root] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let packages = Arc::new(PackageStore::open(&config.package_root)?);
        let reassembler = Arc::new(ChunkReassembler::new(
            config.temp_dir.clone(),
            Arc::clone(&packages),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Node {
            inner: Arc::new(Inner {
                transactions: TransactionManager::new(credentials.identity, transport),
                credentials,
                config,
                upstream,
                packages,
                reassembler,
                executor,
                supervisor,
                servers: Mutex::new(BTreeMap::new()),
                consoles: Mutex::new(BTreeMap::new()),
                downloads: Mutex::new(BTreeMap::new()),
                enabled: AtomicBool::new(true),
                shutdown,
                handlers: handlers::handler_table(),
            }),
        })
    }

    /// The coordinator's identity.
    pub fn identity(&self) -> Identity {
        self.inner.credentials.identity
    }

    /// The coordinator's configuration.
    pub fn config(&self) -> &LocalConfig {
        &self.inner.config
    }

    /// The local package cache.
    pub fn packages(&self) -> &Arc<PackageStore> {
        &self.inner.packages
    }

    /// The transaction manager.
    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    /// Returns a copy of a server's record.
    pub fn server(&self, uuid: &Uuid) -> Option<LocalServer> {
        self.servers().get(uuid).cloned()
    }

    fn servers(&self) -> MutexGuard<'_, BTreeMap<Uuid, LocalServer>> {
        self.inner.servers.lock().expect("lock poisoned")
    }

    fn consoles(&self) -> MutexGuard<'_, BTreeMap<String, ConsoleSession>> {
        self.inner.consoles.lock().expect("lock poisoned")
    }

    /// Maintains the connection to the network coordinator until a shutdown
    /// is requested, reconnecting whenever the connection is lost.
    pub async fn run(&self) -> Result<(), anyhow::Error> {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let mut connection = self.connect().await?;
            self.inner.upstream.set(connection.handle());
            self.sync();

            let mut interval = tokio::time::interval(self.inner.config.sync_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately and we just synced.
            interval.tick().await;

            let result = loop {
                tokio::select! {
                    message = connection.recv() => match message {
                        Ok(message) => {
                            self.receive(message);
                        }
                        Err(error) => break Err(error),
                    },
                    _ = interval.tick() => {
                        self.sync();
                    }
                    () = stopped(&mut shutdown) => break Ok(()),
                }
            };
            self.inner.upstream.clear();
            match result {
                Ok(()) => {
                    info!(coordinator = %self.identity(), "local: shut down");
                    return Ok(());
                }
                Err(error) => warn!(coordinator = %self.identity(), "local: connection lost: {error:#}"),
            }
        }
    }

    /// Connects to the network coordinator, retrying forever.
    async fn connect(&self) -> Result<Connection, anyhow::Error> {
        let address = &self.inner.config.network_addr;
        Retry::default()
            .clamp_backoff(MAX_RECONNECT_BACKOFF)
            .retry_async(|state| {
                let credentials = self.inner.credentials.clone();
                async move {
                    match Connection::connect(address, credentials).await {
                        Ok(connection) => Ok(connection),
                        Err(error) => {
                            let backoff = state.next_backoff.unwrap_or_default();
                            if state.i >= INFO_MIN_RETRIES {
                                info!(%address, "error connecting to network coordinator, retrying in {backoff:?}: {error:#}");
                            } else {
                                debug!(%address, "error connecting to network coordinator, retrying in {backoff:?}: {error:#}");
                            }
                            Err(error)
                        }
                    }
                }
            })
            .await
    }

    /// Asks [`Node::run`] to return.
    pub fn request_shutdown(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
    }

    /// Processes a message received from the network coordinator.
    pub fn receive(&self, message: TransactionMessage) -> bool {
        self.inner
            .transactions
            .receive(message, self.identity(), self)
    }

    fn send_single(&self, command: Command) -> bool {
        self.inner
            .transactions
            .send_single(command, self.identity())
    }

    /// Describes the complete state of this coordinator.
    pub fn sync_state(&self) -> SyncState {
        let servers = self
            .servers()
            .values()
            .map(|server| SyncServer {
                uuid: server.uuid,
                name: server.name.clone(),
                package: server.package.clone(),
                properties: server.properties.clone(),
                active: server.active,
            })
            .collect();
        let config = &self.inner.config;
        SyncState {
            name: config.name.clone(),
            resources: config.resources.clone(),
            attributes: config.attributes.clone(),
            enabled: self.inner.enabled.load(Ordering::SeqCst),
            servers,
        }
    }

    /// Reports the complete state of this coordinator.
    pub fn sync(&self) -> bool {
        let state = self.sync_state();
        debug!(servers = state.servers.len(), "local: sync");
        self.send_single(Command::Sync(state))
    }

    /// Makes sure the current version of `package` is in the local cache,
    /// downloading it if the cached archive is missing or differs from the
    /// network coordinator's.
    pub async fn ensure_package(&self, package: &PackageRef) -> Result<PackageHandle, NodeError> {
        let request = PackageRequest {
            package: package.clone(),
        };
        let (_, mut replies) = self
            .inner
            .transactions
            .request(Command::PackageChecksumRequest(request), self.identity())
            .ok_or(NodeError::NoReply)?;
        let reply = replies.recv().await.ok_or(NodeError::NoReply)?;
        let Command::PackageChecksumResponse(response) = reply.command else {
            return Err(NodeError::UnexpectedReply(reply.command.kind()));
        };
        let Some(expected) = response.checksum else {
            return Err(NodeError::UnknownPackage(package.clone()));
        };
        let concrete = response.package;

        // A concurrent provision of the same package waits here and then
        // finds the archive the first one downloaded.
        let gate = Arc::clone(
            self.inner
                .downloads
                .lock()
                .expect("lock poisoned")
                .entry(concrete.clone())
                .or_default(),
        );
        let _downloading = gate.lock().await;

        match self.cached(&concrete).await {
            Some((handle, checksum)) if checksum == expected => {
                debug!(package = %concrete, "local: cached package is current");
                return Ok(handle);
            }
            Some(_) => info!(package = %concrete, "local: cached package is stale"),
            None => {}
        }
        self.download(&concrete).await
    }

    /// The cached archive of `package` and its checksum.
    async fn cached(&self, package: &PackageRef) -> Option<(PackageHandle, String)> {
        let store = Arc::clone(&self.inner.packages);
        let package = package.clone();
        pp_ore::task::spawn_blocking(
            || "local::cached_checksum",
            move || {
                let handle = store.resolve(&package)?;
                let checksum = store.checksum(&handle).ok()?;
                Some((handle, checksum))
            },
        )
        .await
        .ok()
        .flatten()
    }

    async fn download(&self, package: &PackageRef) -> Result<PackageHandle, NodeError> {
        info!(%package, "local: downloading package");
        let request = PackageRequest {
            package: package.clone(),
        };
        let (transaction, mut replies) = self
            .inner
            .transactions
            .request(Command::PackageRequest(request), self.identity())
            .ok_or(NodeError::NoReply)?;
        // The transfer verifies the archive checksum itself.
        match self
            .inner
            .reassembler
            .receive(package, &transaction.id, &mut replies)
            .await?
        {
            Some(handle) => Ok(handle),
            None => Err(NodeError::UnknownPackage(package.clone())),
        }
    }

    /// Ensures `package` and everything it depends on, returning the
    /// packages with every dependency before its dependents.
    pub async fn ensure_packages(
        &self,
        package: &PackageRef,
    ) -> Result<Vec<PackageHandle>, NodeError> {
        enum Visit {
            Enter(PackageRef),
            Exit(PackageHandle),
        }

        let mut ordered = vec![];
        let mut seen = BTreeSet::new();
        let mut stack = vec![Visit::Enter(package.clone())];
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(package) => {
                    if !seen.insert(package.clone()) {
                        continue;
                    }
                    let handle = self.ensure_package(&package).await?;
                    let dependencies = handle.manifest.dependencies.clone();
                    stack.push(Visit::Exit(handle));
                    stack.extend(dependencies.into_iter().rev().map(Visit::Enter));
                }
                Visit::Exit(handle) => ordered.push(handle),
            }
        }
        Ok(ordered)
    }

    fn server_dir(&self, uuid: Uuid, name: &str) -> PathBuf {
        let config = &self.inner.config;
        let usable = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if config.use_name_for_dirs && usable {
            config.server_root.join(name)
        } else {
            config.server_root.join(uuid.to_string())
        }
    }

    /// Provisions a new server and starts its process.
    ///
    /// The server is recorded, inactive, before any package is fetched, so
    /// that state reports made in the meantime include it.
    pub async fn provision(&self, request: Provision) -> Result<(), NodeError> {
        let uuid = request.server;
        let dir = self.server_dir(uuid, &request.name);
        {
            let mut servers = self.servers();
            if servers.contains_key(&uuid) {
                return Err(NodeError::DuplicateServer(uuid));
            }
            let server = LocalServer {
                uuid,
                name: request.name.clone(),
                package: request.package.clone(),
                properties: request.properties.clone(),
                dir: dir.clone(),
                active: false,
                packages: vec![],
                process: None,
            };
            servers.insert(uuid, server);
        }
        info!(server = %uuid, package = %request.package, dir = %dir.display(), "local: provisioning");

        match self.install(&request, &dir).await {
            Ok((packages, process)) => {
                if let Some(server) = self.servers().get_mut(&uuid) {
                    server.packages = packages;
                    server.process = process.clone();
                    server.active = true;
                }
                if let Some(process) = process {
                    self.watch_process(uuid, process);
                }
                info!(server = %uuid, "local: provisioned");
                Ok(())
            }
            Err(error) => {
                warn!(server = %uuid, "local: provisioning failed: {error}");
                self.servers().remove(&uuid);
                remove_dir(&dir).await;
                Err(error)
            }
        }
    }

    async fn install(
        &self,
        request: &Provision,
        dir: &Path,
    ) -> Result<(Vec<PackageHandle>, Option<Arc<dyn ProcessHandle>>), NodeError> {
        let packages = self.ensure_packages(&request.package).await?;
        for phase in [Phase::Provision, Phase::Execute] {
            for package in &packages {
                let ok = self
                    .inner
                    .executor
                    .execute(phase, package, dir, &request.properties)
                    .await;
                if !ok {
                    return Err(NodeError::Phase {
                        phase,
                        package: package.package_ref(),
                    });
                }
            }
        }

        let Some(run) = packages.last().and_then(|p| p.manifest.run.clone()) else {
            return Ok((packages, None));
        };
        let spec = ProcessSpec {
            command: run.command,
            args: run.args,
            cwd: dir.to_path_buf(),
            env: run.env,
        };
        let process = self
            .inner
            .supervisor
            .start(&spec)
            .await
            .map_err(NodeError::Process)?;
        Ok((packages, Some(process)))
    }

    /// Retires a server whose process exits on its own.
    fn watch_process(&self, uuid: Uuid, process: Arc<dyn ProcessHandle>) {
        let node = self.clone();
        let name = format!("local::watch_process:{uuid}");
        pp_ore::task::spawn(move || name, async move {
            process.wait().await;
            // Servers that were stopped on request are already gone.
            let current = node
                .servers()
                .get(&uuid)
                .and_then(|server| server.process.as_ref().map(|p| Arc::ptr_eq(p, &process)))
                .unwrap_or(false);
            if current {
                info!(server = %uuid, "local: server process exited");
                if let Err(error) = node.retire(uuid, Disposal::Remove, false).await {
                    warn!(server = %uuid, "local: cleanup failed: {error}");
                }
            }
        });
    }

    /// Stops a server, removes its directory, and reports it gone.
    pub async fn deprovision(&self, uuid: Uuid, force: bool) -> Result<(), NodeError> {
        self.retire(uuid, Disposal::Remove, force).await
    }

    /// Stops a server and moves its directory to the frozen area for
    /// inspection, then reports it gone.
    pub async fn freeze(&self, uuid: Uuid) -> Result<(), NodeError> {
        self.retire(uuid, Disposal::Freeze, false).await
    }

    async fn retire(&self, uuid: Uuid, disposal: Disposal, force: bool) -> Result<(), NodeError> {
        let server = self
            .servers()
            .remove(&uuid)
            .ok_or(NodeError::UnknownServer(uuid))?;
        info!(server = %uuid, ?disposal, force, "local: stopping server");
        self.detach_server_consoles(uuid);
        if let Some(process) = &server.process {
            process.stop(force).await;
        }

        let result = match disposal {
            Disposal::Remove => {
                for package in server.packages.iter().rev() {
                    // Cleanup continues past failed steps.
                    self.inner
                        .executor
                        .execute(Phase::Shutdown, package, &server.dir, &server.properties)
                        .await;
                }
                remove_dir(&server.dir).await;
                Ok(())
            }
            Disposal::Freeze => {
                let frozen = self.inner.config.frozen_root.join(uuid.to_string());
                remove_dir(&frozen).await;
                tokio::fs::rename(&server.dir, &frozen).await.map(|()| {
                    info!(server = %uuid, frozen = %frozen.display(), "local: server frozen");
                })
            }
        };
        self.send_single(Command::ServerShutdown(ServerShutdown { server: uuid }));
        Ok(result?)
    }

    /// Stops every server and asks [`Node::run`] to return.
    pub async fn shutdown(&self) {
        info!(coordinator = %self.identity(), "local: shutting down");
        self.inner.enabled.store(false, Ordering::SeqCst);
        let servers: Vec<_> = self.servers().keys().copied().collect();
        for uuid in servers {
            if let Err(error) = self.deprovision(uuid, false).await {
                warn!(server = %uuid, "local: cleanup failed: {error}");
            }
        }
        self.sync();
        self.request_shutdown();
    }

    /// Writes a line to a server's process.
    pub async fn send_input(&self, uuid: Uuid, input: &str) -> Result<(), NodeError> {
        let process = self
            .servers()
            .get(&uuid)
            .and_then(|server| server.process.clone())
            .ok_or(NodeError::UnknownServer(uuid))?;
        process.send_input(input).await.map_err(NodeError::Process)
    }

    /// Streams a server's output to the console session `console`.
    ///
    /// Returns `false`, and ends the session right away, if the server has
    /// no running process.
    pub fn attach_console(&self, uuid: Uuid, console: String) -> bool {
        let process = self
            .servers()
            .get(&uuid)
            .and_then(|server| server.process.clone())
            .filter(|process| process.is_running());
        let Some(process) = process else {
            info!(server = %uuid, %console, "local: no running process for console");
            self.send_single(Command::DetachConsole(DetachConsole { console }));
            return false;
        };

        // Subscribing under the session lock keeps the stream from ending
        // before the session is recorded.
        let mut consoles = self.consoles();
        let output = process.subscribe();
        let node = self.clone();
        let name = format!("local::console:{console}");
        let session = console.clone();
        let task = pp_ore::task::spawn(move || name, async move {
            node.stream_console(session, output).await
        });
        info!(server = %uuid, %console, "local: console attached");
        consoles.insert(
            console,
            ConsoleSession {
                server: uuid,
                _task: task.abort_on_drop(),
            },
        );
        true
    }

    async fn stream_console(&self, console: String, mut output: OutputSubscription) {
        for line in output.replay.drain(..) {
            self.send_console_line(&console, line);
        }
        loop {
            match output.lines.recv().await {
                Ok(line) => self.send_console_line(&console, line),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%console, skipped, "local: console fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }

        // The process ended.
        let session = self.consoles().remove(&console);
        if session.is_some() {
            info!(%console, "local: console detached");
            self.send_single(Command::DetachConsole(DetachConsole { console }));
        }
    }

    fn send_console_line(&self, console: &str, line: String) {
        let message = ConsoleMessage {
            console: console.to_string(),
            line,
        };
        self.send_single(Command::ConsoleMessage(message));
    }

    /// Ends a console session at the network coordinator's request.
    pub fn detach_console(&self, console: &str) -> bool {
        let found = self.consoles().remove(console).is_some();
        if found {
            info!(%console, "local: console detached");
        }
        found
    }

    fn detach_server_consoles(&self, uuid: Uuid) {
        let detached: Vec<String> = {
            let mut consoles = self.consoles();
            let ids: Vec<String> = consoles
                .iter()
                .filter(|(_, session)| session.server == uuid)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                consoles.remove(id);
            }
            ids
        };
        for console in detached {
            info!(server = %uuid, %console, "local: console detached");
            self.send_single(Command::DetachConsole(DetachConsole { console }));
        }
    }
}

/// Resolves once a shutdown is requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the node itself is gone.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(dir = %dir.display(), "local: cannot remove directory: {error}"),
    }
}

impl CommandProcessor for Node {
    fn process(&self, incoming: Incoming) -> bool {
        self.inner.handlers.dispatch(self, incoming)
    }
}
