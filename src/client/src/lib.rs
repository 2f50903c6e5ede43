// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A client for the PlayPen network coordinator.
//!
//! A [`Client`] holds one authenticated connection to the network
//! coordinator. Each request opens a transaction and waits for the reply on
//! it. Console sessions deliver output lines through a [`Console`], which
//! closes once the session is detached from either end.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pp_ore::task::{AbortOnDropHandle, JoinHandleExt};
use pp_proto::command::{
    ClientAttachConsole, ClientConsoleAttached, ClientCoordinatorCreated, ClientCreateCoordinator,
    ClientDeprovision, ClientFreezeServer, ClientPromote, ClientProvision,
    ClientProvisionResponse, ClientRestrict,
    ClientSendInput, ClientShutdown, CoordinatorSummary, DetachConsole, PackageRef,
};
use pp_proto::{Command, CommandKind, Identity, TransactionMessage, TransactionMode};
use pp_service::dispatch::{CommandProcessor, Incoming};
use pp_service::keystore::Credentials;
use pp_service::transaction::{
    channel_hook, TransactionHook, TransactionInfo, TransactionManager,
    DEFAULT_TRANSACTION_TIMEOUT,
};
use pp_service::transport::{Connection, ConnectionHandle, Transport, Upstream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a request waits for its reply by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = DEFAULT_TRANSACTION_TIMEOUT;

/// How much longer than the network coordinator's own placement transaction
/// a provision request waits, so that the coordinator's timeout reply still
/// reaches the client.
pub const PROVISION_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// A failed client request.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the network coordinator")]
    Disconnected,
    #[error("no reply within the request timeout")]
    Timeout,
    #[error("access denied for {0}")]
    AccessDenied(CommandKind),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected reply {0}")]
    UnexpectedReply(CommandKind),
}

/// The placement of a newly provisioned server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Provisioned {
    /// The coordinator running the server.
    pub coordinator: Uuid,
    /// The ID of the server.
    pub server: Uuid,
}

/// An attached console session.
#[derive(Debug)]
pub struct Console {
    id: String,
    lines: mpsc::UnboundedReceiver<String>,
}

impl Console {
    /// The session ID minted by the network coordinator.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the next output line, or `None` once the session is detached.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}

/// Output channels of the attached console sessions, by session ID.
type ConsoleTable = Mutex<BTreeMap<String, mpsc::UnboundedSender<String>>>;

/// A connection to the network coordinator.
#[derive(Debug)]
pub struct Client {
    shared: Arc<Shared>,
    _reader: AbortOnDropHandle<()>,
}

#[derive(Debug)]
struct Shared {
    identity: Identity,
    connection: ConnectionHandle,
    upstream: Arc<Upstream>,
    transactions: TransactionManager,
    consoles: Arc<ConsoleTable>,
    closed: watch::Sender<bool>,
    provision_timeout: Duration,
}

impl Client {
    /// Connects to the network coordinator at `address`.
    pub async fn connect(address: &str, credentials: Credentials) -> Result<Client, anyhow::Error> {
        let connection = Connection::connect(address, credentials).await?;
        Ok(Client::start(connection, DEFAULT_REQUEST_TIMEOUT)?)
    }

    /// Starts a client over an established connection. Requests that see no
    /// reply within `timeout` fail with [`ClientError::Timeout`].
    ///
    /// Provisioning waits at least [`PROVISION_TIMEOUT_MARGIN`] past the
    /// network coordinator's transaction timeout.
    pub fn start(connection: Connection, timeout: Duration) -> Result<Client, ClientError> {
        let identity = connection.identity();
        let handle = connection.handle();
        let upstream = Arc::new(Upstream::new());
        upstream.set(handle.clone());
        let transport = Arc::clone(&upstream) as Arc<dyn Transport>;
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            identity,
            connection: handle,
            upstream,
            transactions: TransactionManager::with_timeout(identity, transport, timeout),
            consoles: Arc::new(Mutex::new(BTreeMap::new())),
            closed,
            provision_timeout: timeout.max(DEFAULT_TRANSACTION_TIMEOUT) + PROVISION_TIMEOUT_MARGIN,
        });

        let name = format!("client::reader:{identity}");
        let reader = pp_ore::task::spawn(move || name, read(Arc::clone(&shared), connection))
            .abort_on_drop();

        // The network coordinator binds the connection to the identity of
        // the first envelope it receives.
        if !shared.transactions.send_single(Command::Noop, identity) {
            return Err(ClientError::Disconnected);
        }
        Ok(Client {
            shared,
            _reader: reader,
        })
    }

    /// The client's identity.
    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    /// Reports whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        !*self.shared.closed.borrow()
    }

    /// Closes the connection. Pending requests fail with
    /// [`ClientError::Disconnected`].
    pub fn close(&self) {
        self.shared.connection.close();
    }

    /// Provisions a server, waiting until its coordinator reports the
    /// outcome.
    pub async fn provision(&self, request: ClientProvision) -> Result<Provisioned, ClientError> {
        let timeout = self.shared.provision_timeout;
        match self
            .call_with_timeout(Command::ClientProvision(request), timeout)
            .await?
        {
            Command::ClientProvisionResponse(response) => match response {
                ClientProvisionResponse {
                    ok: true,
                    coordinator: Some(coordinator),
                    server: Some(server),
                    ..
                } => Ok(Provisioned {
                    coordinator,
                    server,
                }),
                response => Err(ClientError::Rejected(response.message)),
            },
            command => Err(ClientError::UnexpectedReply(command.kind())),
        }
    }

    /// Asks a coordinator to deprovision one of its servers.
    pub async fn deprovision(
        &self,
        coordinator: Uuid,
        server: Uuid,
        force: bool,
    ) -> Result<(), ClientError> {
        let command = Command::ClientDeprovision(ClientDeprovision {
            coordinator,
            server,
            force,
        });
        self.call_ack(command).await
    }

    /// Asks a coordinator to shut down.
    pub async fn shutdown(&self, coordinator: Uuid) -> Result<(), ClientError> {
        self.call_ack(Command::ClientShutdown(ClientShutdown { coordinator }))
            .await
    }

    /// Promotes a concrete package version.
    pub async fn promote(&self, package: PackageRef) -> Result<(), ClientError> {
        self.call_ack(Command::ClientPromote(ClientPromote { package }))
            .await
    }

    /// Creates a keystore entry for a new local coordinator.
    pub async fn create_coordinator(
        &self,
        name: String,
        key_name: Option<String>,
    ) -> Result<ClientCoordinatorCreated, ClientError> {
        let command = Command::ClientCreateCoordinator(ClientCreateCoordinator { name, key_name });
        match self.call(command).await? {
            Command::ClientCoordinatorCreated(created) => Ok(created),
            command => Err(ClientError::UnexpectedReply(command.kind())),
        }
    }

    /// Sends a line of input to a server's process.
    pub async fn send_input(
        &self,
        coordinator: Uuid,
        server: Uuid,
        input: String,
    ) -> Result<(), ClientError> {
        let command = Command::ClientSendInput(ClientSendInput {
            coordinator,
            server,
            input,
        });
        self.call_ack(command).await
    }

    /// Asks a coordinator to freeze one of its servers.
    pub async fn freeze_server(&self, coordinator: Uuid, server: Uuid) -> Result<(), ClientError> {
        self.call_ack(Command::ClientFreezeServer(ClientFreezeServer {
            coordinator,
            server,
        }))
        .await
    }

    /// Sets or clears a coordinator's restricted flag.
    pub async fn restrict(&self, coordinator: Uuid, restricted: bool) -> Result<(), ClientError> {
        self.call_ack(Command::ClientRestrict(ClientRestrict {
            coordinator,
            restricted,
        }))
        .await
    }

    /// Lists every registered coordinator and its servers.
    pub async fn list(&self) -> Result<Vec<CoordinatorSummary>, ClientError> {
        match self.call(Command::ClientList).await? {
            Command::ClientCoordinatorList(list) => Ok(list.coordinators),
            command => Err(ClientError::UnexpectedReply(command.kind())),
        }
    }

    /// Attaches a console session to a server's process.
    ///
    /// The session's output channel is registered as the reply arrives, so no
    /// line relayed right after the reply is lost.
    pub async fn attach_console(
        &self,
        coordinator: Uuid,
        server: Uuid,
    ) -> Result<Console, ClientError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hook = AttachHook {
            consoles: Arc::clone(&self.shared.consoles),
            tx,
        };
        let transaction = self.shared.transactions.begin_with_hook(hook);
        let command = Command::ClientAttachConsole(ClientAttachConsole {
            coordinator,
            server,
        });
        let (command, lines) = self.exchange(transaction, command, &mut rx).await?;
        match (check(command)?, lines) {
            (
                Command::ClientConsoleAttached(ClientConsoleAttached {
                    console: Some(id), ..
                }),
                Some(lines),
            ) => {
                info!(console = %id, %coordinator, %server, "client: console attached");
                Ok(Console { id, lines })
            }
            (Command::ClientConsoleAttached(response), _) => {
                Err(ClientError::Rejected(response.message))
            }
            (command, _) => Err(ClientError::UnexpectedReply(command.kind())),
        }
    }

    /// Detaches a console session. Its [`Console`] yields no further lines.
    pub async fn detach_console(&self, console: &str) -> Result<(), ClientError> {
        let command = Command::ClientDetachConsole(DetachConsole {
            console: console.to_string(),
        });
        let result = self.call_ack(command).await;
        self.shared
            .consoles
            .lock()
            .expect("lock poisoned")
            .remove(console);
        result
    }

    async fn call_ack(&self, command: Command) -> Result<(), ClientError> {
        match self.call(command).await? {
            Command::Ack(_) => Ok(()),
            command => Err(ClientError::UnexpectedReply(command.kind())),
        }
    }

    /// Sends `command` on a new transaction and returns the reply.
    async fn call(&self, command: Command) -> Result<Command, ClientError> {
        let (hook, mut rx) = channel_hook();
        let transaction = self.shared.transactions.begin_with_hook(hook);
        let reply = self.exchange(transaction, command, &mut rx).await?;
        check(reply.command)
    }

    async fn call_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Command, ClientError> {
        let (hook, mut rx) = channel_hook();
        let transaction = self
            .shared
            .transactions
            .begin_with_hook_and_timeout(hook, timeout);
        let reply = self.exchange(transaction, command, &mut rx).await?;
        check(reply.command)
    }

    /// Opens `transaction` with `command` and waits for the first item its
    /// hook forwards to `rx`.
    async fn exchange<T>(
        &self,
        transaction: TransactionInfo,
        command: Command,
        rx: &mut mpsc::UnboundedReceiver<T>,
    ) -> Result<T, ClientError> {
        let transactions = &self.shared.transactions;
        let mut closed = self.shared.closed.subscribe();
        let sent = !*closed.borrow_and_update()
            && match transactions.build(&transaction.id, TransactionMode::Create, command) {
                Some(message) => transactions.send(message, self.shared.identity),
                None => false,
            };
        if !sent {
            transactions.cancel(&transaction.id, true);
            return Err(ClientError::Disconnected);
        }

        tokio::select! {
            // The hook's sender is dropped with the transaction, so a timed
            // out transaction closes the channel.
            reply = rx.recv() => reply.ok_or(ClientError::Timeout),
            () = disconnected(&mut closed) => {
                transactions.cancel(&transaction.id, true);
                Err(ClientError::Disconnected)
            }
        }
    }
}

/// Converts a refusal into an error.
fn check(command: Command) -> Result<Command, ClientError> {
    match command {
        Command::AccessDenied(denied) => Err(ClientError::AccessDenied(denied.command)),
        Command::Ack(ack) if !ack.ok => Err(ClientError::Rejected(ack.message)),
        command => Ok(command),
    }
}

async fn disconnected(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Reads the connection until it fails.
async fn read(shared: Arc<Shared>, mut connection: Connection) {
    let processor = ClientProcessor {
        consoles: Arc::clone(&shared.consoles),
    };
    let error = loop {
        match connection.recv().await {
            Ok(message) => {
                shared
                    .transactions
                    .receive(message, shared.identity, &processor);
            }
            Err(error) => break error,
        }
    };
    info!(identity = %shared.identity, "client: connection closed: {error:#}");
    shared.upstream.clear();
    // Dropping the senders closes every console.
    shared.consoles.lock().expect("lock poisoned").clear();
    shared.closed.send_replace(true);
}

/// Registers the output channel of a console session when the attach reply
/// arrives, then forwards the reply.
struct AttachHook {
    consoles: Arc<ConsoleTable>,
    tx: mpsc::UnboundedSender<(Command, Option<mpsc::UnboundedReceiver<String>>)>,
}

impl TransactionHook for AttachHook {
    fn on_receive(&self, _info: &TransactionInfo, message: &TransactionMessage) {
        let lines = match &message.command {
            Command::ClientConsoleAttached(ClientConsoleAttached {
                ok: true,
                console: Some(console),
                ..
            }) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.consoles
                    .lock()
                    .expect("lock poisoned")
                    .insert(console.clone(), tx);
                Some(rx)
            }
            _ => None,
        };
        let _ = self.tx.send((message.command.clone(), lines));
    }
}

/// Handles the commands the network coordinator sends unprompted.
struct ClientProcessor {
    consoles: Arc<ConsoleTable>,
}

impl CommandProcessor for ClientProcessor {
    fn process(&self, incoming: Incoming) -> bool {
        match incoming.command {
            Command::ConsoleMessage(message) => {
                let mut consoles = self.consoles.lock().expect("lock poisoned");
                let Some(tx) = consoles.get(&message.console) else {
                    debug!(console = %message.console, "client: output for unknown console");
                    return false;
                };
                if tx.send(message.line).is_err() {
                    // The console was dropped.
                    consoles.remove(&message.console);
                }
                true
            }
            Command::DetachConsole(detach) => {
                info!(console = %detach.console, "client: console detached");
                self.consoles
                    .lock()
                    .expect("lock poisoned")
                    .remove(&detach.console)
                    .is_some()
            }
            Command::AccessDenied(denied) if incoming.transaction.is_none() => {
                warn!(command = %denied.command, "client: access denied");
                true
            }
            // Replies on our own transactions were delivered through their
            // hooks.
            _ if incoming.transaction.is_some() => true,
            Command::Noop | Command::Ack(_) => true,
            command => {
                debug!(command = %command.kind(), "client: unexpected command");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pp_proto::command::{AccessDenied, Ack, ConsoleMessage};

    use super::*;

    fn single(command: Command) -> Incoming {
        Incoming {
            from: Uuid::new_v4(),
            transaction: None,
            mode: TransactionMode::Single,
            command,
        }
    }

    #[test]
    fn test_check() {
        assert!(matches!(check(Command::Ack(Ack::ok("done"))), Ok(Command::Ack(_))));
        assert!(matches!(
            check(Command::Ack(Ack::failed("no such server"))),
            Err(ClientError::Rejected(message)) if message == "no such server"
        ));
        assert!(matches!(
            check(Command::AccessDenied(AccessDenied {
                command: CommandKind::ClientShutdown
            })),
            Err(ClientError::AccessDenied(CommandKind::ClientShutdown))
        ));
    }

    #[test]
    fn test_console_routing() {
        let consoles = Arc::new(Mutex::new(BTreeMap::new()));
        let processor = ClientProcessor {
            consoles: Arc::clone(&consoles),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        consoles.lock().unwrap().insert("c1".to_string(), tx);

        let line = |console: &str, line: &str| {
            single(Command::ConsoleMessage(ConsoleMessage {
                console: console.into(),
                line: line.into(),
            }))
        };
        assert!(processor.process(line("c1", "hello")));
        assert!(!processor.process(line("c2", "lost")));
        assert_eq!(rx.try_recv().unwrap(), "hello");

        let detach = single(Command::DetachConsole(DetachConsole {
            console: "c1".into(),
        }));
        assert!(processor.process(detach.clone()));
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
        assert!(!processor.process(detach));
    }

    #[test]
    fn test_dropped_console_is_forgotten() {
        let consoles = Arc::new(Mutex::new(BTreeMap::new()));
        let processor = ClientProcessor {
            consoles: Arc::clone(&consoles),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        consoles.lock().unwrap().insert("c1".to_string(), tx);
        drop(rx);

        let message = single(Command::ConsoleMessage(ConsoleMessage {
            console: "c1".into(),
            line: "hello".into(),
        }));
        assert!(processor.process(message));
        assert!(consoles.lock().unwrap().is_empty());
    }
}
