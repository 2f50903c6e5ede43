// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The connection/envelope layer.
//!
//! Every participant talks to the network coordinator over a single TCP
//! connection. The layer adds a protocol handshake, message framing, and
//! envelope authentication on top of the raw stream. It is symmetric across
//! roles: the only difference between the connecting and the accepting side
//! is how the channel's credentials are determined.
//!
//!  * A connecting participant (a local coordinator or a client) uses its
//!    own [`Credentials`].
//!  * An accepting network coordinator reads the first envelope, looks up
//!    the named identity in its [`Keystore`], and authenticates the envelope.
//!    That identity is then bound to the connection for its lifetime.
//!
//! Both directions of a channel are sealed under the same identity and key,
//! that of the non-network participant. Frames are bincode-encoded
//! [`Envelope`]s sent over the wire with a `u64` length prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use pp_ore::cast::CastFrom;
use pp_ore::task::{AbortOnDropHandle, JoinHandleExt};
use pp_proto::{Envelope, EnvelopeError, Identity, TransactionMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::keystore::{Credentials, Keystore};

/// A randomly chosen magic number identifying PlayPen connections.
pub const MAGIC: u64 = 0x506c_6179_5065_6e31;

/// The largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: u64 = 64 << 20;

/// Errors in framing a connection's byte stream.
#[derive(Error, Debug)]
pub enum WireError {
    /// The peer did not open with the protocol magic number.
    #[error("invalid protocol magic: {0:#x}")]
    InvalidMagic(u64),
    /// The peer announced a frame larger than [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooBig(u64),
    /// The stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A frame could not be decoded.
    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

/// Errors authenticating an envelope. These always terminate the
/// connection.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The envelope names an identity missing from the keystore.
    #[error("unknown identity {0}")]
    UnknownIdentity(Identity),
    /// The envelope names an identity other than the one bound to the
    /// connection.
    #[error("envelope identity {found} does not match channel identity {expected}")]
    IdentityMismatch {
        /// The identity bound to the connection.
        expected: Identity,
        /// The identity named by the envelope.
        found: Identity,
    },
    /// The envelope failed to authenticate or decrypt.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Something that can deliver transaction messages to a participant.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Enqueues `message` for delivery on the channel identified by
    /// `target`.
    ///
    /// Returns `false` if there is no live channel for `target`.
    fn send(&self, target: Identity, message: TransactionMessage) -> bool;
}

/// An active, authenticated connection.
///
/// Each connection spawns two tasks:
///
///  * The send task seals enqueued messages into envelopes and writes them.
///  * The recv task reads envelopes, authenticates them, and opens them.
///
/// Any authentication failure terminates the connection.
#[derive(Debug)]
pub struct Connection {
    /// The identity bound to this connection.
    identity: Identity,
    /// Message sender connected to the send task.
    msg_tx: mpsc::UnboundedSender<TransactionMessage>,
    /// Message receiver connected to the recv task.
    msg_rx: mpsc::UnboundedReceiver<TransactionMessage>,
    /// Receiver for errors encountered by connection tasks.
    error_rx: watch::Receiver<String>,
    /// Signalled when the connection is closed through a handle.
    close: Arc<Notify>,

    /// Handles to connection tasks.
    _tasks: [AbortOnDropHandle<()>; 2],
}

impl Connection {
    /// Connects to the network coordinator at `address`.
    pub async fn connect(address: &str, credentials: Credentials) -> anyhow::Result<Connection> {
        let stream = TcpStream::connect(address).await?;
        info!(%address, identity = %credentials.identity, "transport: connected");
        Connection::establish(stream, credentials).await
    }

    /// Starts the connecting side of a connection over `stream`.
    pub async fn establish<S>(stream: S, credentials: Credentials) -> anyhow::Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        handshake(&mut reader, &mut writer).await?;
        Ok(Connection::start(reader, writer, credentials, None))
    }

    /// Starts the accepting side of a connection over `stream`.
    ///
    /// The first envelope determines the connection's identity; it must
    /// name a keystore entry and authenticate under that entry's key.
    pub async fn accept<S>(stream: S, keystore: &Keystore) -> anyhow::Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        handshake(&mut reader, &mut writer).await?;

        let envelope: Envelope = read_frame(&mut reader).await?;
        let Some(entry) = keystore.get(&envelope.identity) else {
            bail!(AuthError::UnknownIdentity(envelope.identity));
        };
        let first = envelope.open(&entry.key).map_err(AuthError::from)?;
        let credentials = Credentials {
            identity: entry.identity,
            key: entry.key.clone(),
        };
        Ok(Connection::start(reader, writer, credentials, Some(first)))
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        credentials: Credentials,
        first: Option<TransactionMessage>,
    ) -> Connection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        // Initialize the error channel with a default error to return if none of the tasks
        // produced an error.
        let (error_tx, error_rx) = watch::channel("connection closed".into());

        if let Some(msg) = first {
            // The receiver is held locally, so this cannot fail.
            let _ = in_tx.send(msg);
        }

        let identity = credentials.identity;
        let send_task = pp_ore::task::spawn(
            || "transport::send",
            run_send_task(writer, out_rx, credentials.clone(), error_tx.clone()),
        );
        let recv_task = pp_ore::task::spawn(
            || "transport::recv",
            run_recv_task(reader, in_tx, credentials, error_tx),
        );

        Connection {
            identity,
            msg_tx: out_tx,
            msg_rx: in_rx,
            error_rx,
            close: Arc::new(Notify::new()),
            _tasks: [send_task.abort_on_drop(), recv_task.abort_on_drop()],
        }
    }

    /// The identity bound to this connection.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Returns a handle that enqueues messages on this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            identity: self.identity,
            tx: self.msg_tx.clone(),
            close: Arc::clone(&self.close),
        }
    }

    /// Return a received message.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.
    pub async fn recv(&mut self) -> anyhow::Result<TransactionMessage> {
        tokio::select! {
            // `mpsc::UnboundedReceiver::recv` is documented to be cancel safe.
            msg = self.msg_rx.recv() => match msg {
                Some(msg) => Ok(msg),
                None => bail!(self.collect_error().await),
            },
            () = self.close.notified() => bail!("connection closed locally"),
        }
    }

    /// Return a connection error.
    async fn collect_error(&mut self) -> String {
        // Wait for the first error to be reported, or for all connection tasks to shut down.
        let _ = self.error_rx.changed().await;
        // Mark the current value as unseen, so the next `collect_error` call can return
        // immediately.
        self.error_rx.mark_changed();

        self.error_rx.borrow().clone()
    }
}

/// Run a connection's send task.
async fn run_send_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut msg_rx: mpsc::UnboundedReceiver<TransactionMessage>,
    credentials: Credentials,
    error_tx: watch::Sender<String>,
) {
    while let Some(msg) = msg_rx.recv().await {
        trace!(transaction = %msg.id, mode = %msg.mode, kind = %msg.command.kind(), "transport: sending message");

        let result = match Envelope::seal(credentials.identity, &credentials.key, &msg) {
            Ok(envelope) => write_frame(&mut writer, &envelope).await,
            Err(error) => {
                // A message that cannot be sealed is dropped; the channel stays usable.
                warn!(transaction = %msg.id, "transport: failed to seal message: {error}");
                continue;
            }
        };
        if let Err(error) = result {
            debug!("transport: send error: {error}");
            let _ = error_tx.send(error.to_string());
            break;
        }
    }
}

/// Run a connection's recv task.
async fn run_recv_task<R: AsyncRead + Unpin>(
    mut reader: R,
    msg_tx: mpsc::UnboundedSender<TransactionMessage>,
    credentials: Credentials,
    error_tx: watch::Sender<String>,
) {
    loop {
        let envelope: Envelope = match read_frame(&mut reader).await {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!("transport: recv error: {error}");
                let _ = error_tx.send(error.to_string());
                break;
            }
        };
        match authenticate(&envelope, &credentials) {
            Ok(msg) => {
                trace!(transaction = %msg.id, mode = %msg.mode, "transport: received message");
                if msg_tx.send(msg).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(identity = %credentials.identity, "transport: authentication failure: {error}");
                let _ = error_tx.send(error.to_string());
                break;
            }
        }
    }
}

/// Authenticates and opens an envelope received on a channel bound to
/// `credentials`.
pub fn authenticate(
    envelope: &Envelope,
    credentials: &Credentials,
) -> Result<TransactionMessage, AuthError> {
    if envelope.identity != credentials.identity {
        return Err(AuthError::IdentityMismatch {
            expected: credentials.identity,
            found: envelope.identity,
        });
    }
    Ok(envelope.open(&credentials.key)?)
}

/// Perform the connection handshake.
///
/// Each endpoint sends the protocol magic number and expects to receive the
/// same from its peer.
async fn handshake<R, W>(mut reader: R, mut writer: W) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_u64(MAGIC).await?;
    writer.flush().await?;

    let peer_magic = reader.read_u64().await?;
    if peer_magic != MAGIC {
        return Err(WireError::InvalidMagic(peer_magic));
    }
    Ok(())
}

/// Write a frame into the given writer.
async fn write_frame<W>(mut writer: W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = pp_proto::wire_encode(envelope)?;

    let len = u64::cast_from(bytes.len());
    writer.write_u64(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

/// Read a frame from the given reader.
async fn read_frame<R>(mut reader: R) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u64().await?;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooBig(len));
    }
    let mut bytes = vec![0; usize::cast_from(len)];
    reader.read_exact(&mut bytes).await?;

    Ok(pp_proto::wire_decode(&bytes)?)
}

/// A cloneable handle that enqueues messages on a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    identity: Identity,
    tx: mpsc::UnboundedSender<TransactionMessage>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    /// The identity bound to the connection.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Enqueues a message, returning `false` if the connection is gone.
    pub fn send(&self, message: TransactionMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Reports whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Asks the owner of the connection to shut it down.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// The live connections of an accepting participant, keyed by identity.
///
/// At most one connection is live per identity; registering a second one
/// closes the first.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<BTreeMap<Identity, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Registers `handle` as the live connection for its identity.
    pub fn register(&self, handle: ConnectionHandle) {
        let mut connections = self.connections.lock().expect("lock poisoned");
        if let Some(previous) = connections.insert(handle.identity(), handle) {
            info!(identity = %previous.identity(), "transport: replacing existing connection");
            previous.close();
        }
    }

    /// Unregisters `handle`, unless it has already been replaced.
    ///
    /// Returns whether the handle was the live connection for its identity.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.lock().expect("lock poisoned");
        match connections.get(&handle.identity()) {
            Some(current) if current.same_connection(handle) => {
                connections.remove(&handle.identity());
                true
            }
            _ => false,
        }
    }

    /// Reports whether a connection is live for `identity`.
    pub fn is_connected(&self, identity: &Identity) -> bool {
        let connections = self.connections.lock().expect("lock poisoned");
        connections.contains_key(identity)
    }
}

impl Transport for ConnectionRegistry {
    fn send(&self, target: Identity, message: TransactionMessage) -> bool {
        let connections = self.connections.lock().expect("lock poisoned");
        match connections.get(&target) {
            Some(handle) => handle.send(message),
            None => {
                debug!(%target, "transport: no connection for target");
                false
            }
        }
    }
}

/// The single upstream connection of a local coordinator or client.
///
/// Such participants address every message to their own channel identity;
/// the target is ignored. The link is empty while disconnected.
#[derive(Debug, Default)]
pub struct Upstream {
    handle: Mutex<Option<ConnectionHandle>>,
}

impl Upstream {
    /// Creates a disconnected link.
    pub fn new() -> Upstream {
        Upstream::default()
    }

    /// Installs the live connection.
    pub fn set(&self, handle: ConnectionHandle) {
        *self.handle.lock().expect("lock poisoned") = Some(handle);
    }

    /// Clears the link.
    pub fn clear(&self) {
        *self.handle.lock().expect("lock poisoned") = None;
    }
}

impl Transport for Upstream {
    fn send(&self, _target: Identity, message: TransactionMessage) -> bool {
        match &*self.handle.lock().expect("lock poisoned") {
            Some(handle) => handle.send(message),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use pp_proto::command::Ack;
    use pp_proto::{Command, TransactionMode};
    use uuid::Uuid;

    use super::*;
    use crate::keystore::{KeyEntry, KeyKind};

    fn message(id: &str) -> TransactionMessage {
        TransactionMessage {
            id: id.into(),
            mode: TransactionMode::Single,
            command: Command::Ack(Ack::ok("hi")),
        }
    }

    fn keystore_with(identity: Identity, secret: &str) -> Keystore {
        let keystore = Keystore::new();
        keystore.insert(KeyEntry {
            identity,
            kind: KeyKind::Coordinator,
            name: "node".into(),
            key_name: None,
            authenticators: vec![],
            key: pp_crypto::SecretKey::new(secret).unwrap(),
        });
        keystore
    }

    #[tokio::test]
    async fn test_exchange() {
        let identity = Uuid::new_v4();
        let keystore = keystore_with(identity, "secret");
        let (a, b) = tokio::io::duplex(1 << 16);

        let credentials = Credentials::new(identity, "secret").unwrap();
        let (client, server) = tokio::join!(
            async {
                let conn = Connection::establish(a, credentials).await.unwrap();
                assert!(conn.handle().send(message("one")));
                conn
            },
            Connection::accept(b, &keystore),
        );
        let mut client = client;
        let mut server = server.unwrap();
        assert_eq!(server.identity(), identity);
        assert_eq!(server.recv().await.unwrap(), message("one"));

        assert!(server.handle().send(message("two")));
        assert_eq!(client.recv().await.unwrap(), message("two"));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let identity = Uuid::new_v4();
        let keystore = keystore_with(identity, "secret");
        let (a, b) = tokio::io::duplex(1 << 16);

        let credentials = Credentials::new(identity, "wrong").unwrap();
        let (client, server) = tokio::join!(
            async {
                let conn = Connection::establish(a, credentials).await.unwrap();
                conn.handle().send(message("one"));
                conn
            },
            Connection::accept(b, &keystore),
        );
        let error = server.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<AuthError>(),
            Some(AuthError::Envelope(EnvelopeError::HashMismatch(_)))
        ));
        drop(client);
    }

    #[tokio::test]
    async fn test_unknown_identity_rejected() {
        let keystore = keystore_with(Uuid::new_v4(), "secret");
        let (a, b) = tokio::io::duplex(1 << 16);

        let stranger = Uuid::new_v4();
        let credentials = Credentials::new(stranger, "secret").unwrap();
        let (_client, server) = tokio::join!(
            async {
                let conn = Connection::establish(a, credentials).await.unwrap();
                conn.handle().send(message("one"));
                conn
            },
            Connection::accept(b, &keystore),
        );
        assert!(matches!(
            server.unwrap_err().downcast_ref::<AuthError>(),
            Some(AuthError::UnknownIdentity(id)) if *id == stranger
        ));
    }

    #[test]
    fn test_identity_mismatch() {
        let identity = Uuid::new_v4();
        let credentials = Credentials::new(identity, "secret").unwrap();

        let other = Uuid::new_v4();
        let envelope = Envelope::seal(other, &credentials.key, &message("x")).unwrap();
        assert!(matches!(
            authenticate(&envelope, &credentials),
            Err(AuthError::IdentityMismatch { expected, found }) if expected == identity && found == other
        ));
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let (mut a, b) = tokio::io::duplex(1 << 16);
        let keystore = Keystore::new();
        a.write_u64(0xdead_beef).await.unwrap();
        let error = Connection::accept(b, &keystore).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<WireError>(),
            Some(WireError::InvalidMagic(0xdead_beef))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        a.write_u64(MAX_FRAME_SIZE + 1).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::FrameTooBig(len)) if len == MAX_FRAME_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn test_registry_replaces_connections() {
        let identity = Uuid::new_v4();
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let first = ConnectionHandle {
            identity,
            tx: tx1,
            close: Arc::new(Notify::new()),
        };
        let second = ConnectionHandle {
            identity,
            tx: tx2,
            close: Arc::new(Notify::new()),
        };

        assert!(!registry.send(identity, message("a")));
        registry.register(first.clone());
        assert!(registry.send(identity, message("a")));
        registry.register(second.clone());
        assert!(registry.send(identity, message("b")));
        assert_eq!(rx1.recv().await.unwrap().id, "a");
        assert_eq!(rx2.recv().await.unwrap().id, "b");

        // The replaced handle was asked to close.
        first.close.notified().await;
        assert!(!registry.unregister(&first));
        assert!(registry.is_connected(&identity));
        assert!(registry.unregister(&second));
        assert!(!registry.is_connected(&identity));
    }
}
