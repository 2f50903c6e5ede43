// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The transaction manager.
//!
//! A transaction is a correlated exchange of one or more messages, named by
//! an ID that the initiating side generates as `<identity>-<random>`. The
//! manager keeps the table of in-flight transactions for its process, builds
//! outgoing messages, matches inbound messages to pending transactions, and
//! removes transactions that are neither completed nor cancelled within the
//! timeout.
//!
//! # Modes
//!
//!  * `SINGLE` messages are one-off and never retained.
//!  * `CREATE` opens a transaction that the other side continues or
//!    completes.
//!  * `CONTINUE` is a mid-exchange message on an existing transaction.
//!  * `COMPLETE` is the final message, after which the transaction is gone on
//!    both sides.
//!
//! `CONTINUE` and `COMPLETE` on an unknown ID, and `CREATE` on an ID that is
//! already live, are protocol violations. They are logged and dropped; the
//! connection stays open.
//!
//! Cancellation only frees bookkeeping. Work already handed to a command
//! handler keeps running, and handlers must tolerate the transaction having
//! disappeared by the time they reply.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use pp_ore::id_gen::PrefixedIdGen;
use pp_ore::task::{AbortOnDropHandle, JoinHandleExt};
use pp_proto::{Command, Identity, TransactionMessage, TransactionMode};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dispatch::{CommandProcessor, Incoming};
use crate::transport::Transport;

/// The time after which an unfinished transaction is removed.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// The externally visible state of a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    /// The transaction ID.
    pub id: String,
    /// The channel identity the transaction exchanges messages with.
    pub target: Option<Identity>,
    /// The mode of the last message sent or received.
    pub mode: Option<TransactionMode>,
    /// Whether the transaction has completed.
    pub done: bool,
}

impl TransactionInfo {
    fn new(id: String, target: Option<Identity>) -> TransactionInfo {
        TransactionInfo {
            id,
            target,
            mode: None,
            done: false,
        }
    }
}

/// Observes the messages of a single transaction.
///
/// Hooks run while the transaction table is locked and must not call back
/// into the [`TransactionManager`].
pub trait TransactionHook: Send + Sync {
    /// Called for every message sent on the transaction.
    fn on_send(&self, _info: &TransactionInfo, _message: &TransactionMessage) {}
    /// Called for every `CONTINUE` or `COMPLETE` message received on the
    /// transaction.
    fn on_receive(&self, _info: &TransactionInfo, _message: &TransactionMessage) {}
}

/// A hook that forwards received messages into a channel.
///
/// The channel closes once the transaction is removed, whether it completed,
/// was cancelled, or timed out.
#[derive(Debug)]
pub struct ChannelHook {
    tx: mpsc::UnboundedSender<TransactionMessage>,
}

impl TransactionHook for ChannelHook {
    fn on_receive(&self, _info: &TransactionInfo, message: &TransactionMessage) {
        let _ = self.tx.send(message.clone());
    }
}

/// Creates a [`ChannelHook`] and the receiver it feeds.
pub fn channel_hook() -> (ChannelHook, mpsc::UnboundedReceiver<TransactionMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelHook { tx }, rx)
}

struct Transaction {
    info: TransactionInfo,
    hook: Option<Box<dyn TransactionHook>>,
    /// Dropping the handle cancels the timeout.
    _timeout: AbortOnDropHandle<()>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("info", &self.info)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

type TransactionTable = Mutex<BTreeMap<String, Transaction>>;

/// Manages the in-flight transactions of one process.
#[derive(Debug)]
pub struct TransactionManager {
    ids: PrefixedIdGen,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    table: Arc<TransactionTable>,
}

impl TransactionManager {
    /// Creates a manager that names its transactions after `identity` and
    /// sends messages through `transport`.
    pub fn new(identity: Identity, transport: Arc<dyn Transport>) -> TransactionManager {
        TransactionManager::with_timeout(identity, transport, DEFAULT_TRANSACTION_TIMEOUT)
    }

    /// Like [`TransactionManager::new`], with a custom timeout.
    pub fn with_timeout(
        identity: Identity,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> TransactionManager {
        TransactionManager {
            ids: PrefixedIdGen::new(identity.to_string()),
            transport,
            timeout,
            table: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Begins a new locally initiated transaction.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin(&self) -> TransactionInfo {
        self.begin_inner(None, self.timeout)
    }

    /// Begins a new locally initiated transaction observed by `hook`.
    pub fn begin_with_hook(&self, hook: impl TransactionHook + 'static) -> TransactionInfo {
        self.begin_inner(Some(Box::new(hook)), self.timeout)
    }

    /// Like [`TransactionManager::begin_with_hook`], expiring after
    /// `timeout` instead of the manager's timeout.
    pub fn begin_with_hook_and_timeout(
        &self,
        hook: impl TransactionHook + 'static,
        timeout: Duration,
    ) -> TransactionInfo {
        self.begin_inner(Some(Box::new(hook)), timeout)
    }

    fn begin_inner(
        &self,
        hook: Option<Box<dyn TransactionHook>>,
        timeout: Duration,
    ) -> TransactionInfo {
        let mut table = self.table.lock().expect("lock poisoned");
        let id = loop {
            let id = self.ids.allocate_id();
            if !table.contains_key(&id) {
                break id;
            }
        };
        let info = TransactionInfo::new(id.clone(), None);
        let transaction = Transaction {
            info: info.clone(),
            hook,
            _timeout: self.schedule_timeout(&id, timeout),
        };
        table.insert(id, transaction);
        info
    }

    fn schedule_timeout(&self, id: &str, timeout: Duration) -> AbortOnDropHandle<()> {
        let table = Arc::downgrade(&self.table);
        let id = id.to_string();
        let name = format!("transaction-timeout:{id}");
        pp_ore::task::spawn(move || name, async move {
            tokio::time::sleep(timeout).await;
            expire(&table, &id);
        })
        .abort_on_drop()
    }

    /// Wraps `command` into a message on the transaction `id`.
    ///
    /// Returns `None` if the transaction is unknown.
    pub fn build(
        &self,
        id: &str,
        mode: TransactionMode,
        command: Command,
    ) -> Option<TransactionMessage> {
        let table = self.table.lock().expect("lock poisoned");
        if !table.contains_key(id) {
            debug!(transaction = %id, "transaction: build on unknown transaction");
            return None;
        }
        Some(TransactionMessage {
            id: id.to_string(),
            mode,
            command,
        })
    }

    /// Sends `message` on its transaction to `target`.
    ///
    /// A `SINGLE` or `COMPLETE` message completes the transaction before it
    /// is handed to the transport, so a fast reply cannot find it still
    /// live. Returns `false` if the transaction is unknown or the transport
    /// could not accept the message; the caller must then cancel any
    /// transaction it began.
    pub fn send(&self, message: TransactionMessage, target: Identity) -> bool {
        let finished = {
            let mut table = self.table.lock().expect("lock poisoned");
            let Some(transaction) = table.get_mut(&message.id) else {
                warn!(transaction = %message.id, "transaction: send on unknown transaction");
                return false;
            };
            transaction.info.target = Some(target);
            transaction.info.mode = Some(message.mode);
            if let Some(hook) = &transaction.hook {
                hook.on_send(&transaction.info, &message);
            }
            if message.mode.is_terminal() {
                table.remove(&message.id)
            } else {
                None
            }
        };
        drop(finished);

        trace!(transaction = %message.id, mode = %message.mode, %target, "transaction: send");
        self.transport.send(target, message)
    }

    /// Sends a one-off `SINGLE` message to `target`. The message is never
    /// retained.
    pub fn send_single(&self, command: Command, target: Identity) -> bool {
        let message = TransactionMessage {
            id: self.ids.allocate_id(),
            mode: TransactionMode::Single,
            command,
        };
        self.transport.send(target, message)
    }

    /// Begins a transaction and opens it with a `CREATE` message carrying
    /// `command`.
    ///
    /// Returns the transaction together with a receiver for the peer's
    /// `CONTINUE` and `COMPLETE` messages. On failure, the transaction is
    /// cancelled and `None` is returned.
    pub fn request(
        &self,
        command: Command,
        target: Identity,
    ) -> Option<(TransactionInfo, mpsc::UnboundedReceiver<TransactionMessage>)> {
        let (hook, rx) = channel_hook();
        let info = self.begin_with_hook(hook);
        let sent = match self.build(&info.id, TransactionMode::Create, command) {
            Some(message) => self.send(message, target),
            None => false,
        };
        if !sent {
            self.cancel(&info.id, true);
            return None;
        }
        Some((info, rx))
    }

    /// Replies on a transaction received from a peer.
    ///
    /// Returns `false` if the transaction is gone or the reply could not be
    /// sent, in which case the transaction is cancelled.
    pub fn respond(
        &self,
        transaction: &TransactionInfo,
        mode: TransactionMode,
        command: Command,
    ) -> bool {
        let Some(target) = transaction.target else {
            return false;
        };
        let Some(message) = self.build(&transaction.id, mode, command) else {
            return false;
        };
        if !self.send(message, target) {
            self.cancel(&transaction.id, true);
            return false;
        }
        true
    }

    /// Processes a message received on the channel `from`, then hands its
    /// command to `processor`.
    ///
    /// Returns `false` for protocol violations, which are dropped, and
    /// otherwise the processor's result.
    pub fn receive(
        &self,
        message: TransactionMessage,
        from: Identity,
        processor: &dyn CommandProcessor,
    ) -> bool {
        let mode = message.mode;
        let transaction = match mode {
            TransactionMode::Single => None,
            TransactionMode::Create => {
                let mut table = self.table.lock().expect("lock poisoned");
                if table.contains_key(&message.id) {
                    warn!(transaction = %message.id, %from, "transaction: CREATE on live transaction");
                    return false;
                }
                let mut info = TransactionInfo::new(message.id.clone(), Some(from));
                info.mode = Some(mode);
                let transaction = Transaction {
                    info: info.clone(),
                    hook: None,
                    _timeout: self.schedule_timeout(&message.id, self.timeout),
                };
                table.insert(message.id.clone(), transaction);
                Some(info)
            }
            TransactionMode::Continue => {
                let mut table = self.table.lock().expect("lock poisoned");
                let Some(transaction) = table.get_mut(&message.id) else {
                    warn!(transaction = %message.id, %from, "transaction: CONTINUE on unknown transaction");
                    return false;
                };
                transaction.info.mode = Some(mode);
                if let Some(hook) = &transaction.hook {
                    hook.on_receive(&transaction.info, &message);
                }
                Some(transaction.info.clone())
            }
            TransactionMode::Complete => {
                let removed = {
                    let mut table = self.table.lock().expect("lock poisoned");
                    table.remove(&message.id)
                };
                let Some(mut transaction) = removed else {
                    warn!(transaction = %message.id, %from, "transaction: COMPLETE on unknown transaction");
                    return false;
                };
                transaction.info.mode = Some(mode);
                transaction.info.done = true;
                if let Some(hook) = &transaction.hook {
                    hook.on_receive(&transaction.info, &message);
                }
                Some(transaction.info)
            }
        };

        trace!(transaction = %message.id, %mode, %from, "transaction: receive");
        processor.process(Incoming {
            from,
            transaction,
            mode,
            command: message.command,
        })
    }

    /// Removes a transaction, cancelling its timeout.
    ///
    /// Returns whether the transaction existed. Unknown IDs are logged unless
    /// `silent` is set.
    pub fn cancel(&self, id: &str, silent: bool) -> bool {
        let removed = self.table.lock().expect("lock poisoned").remove(id);
        if removed.is_none() && !silent {
            debug!(transaction = %id, "transaction: cancel of unknown transaction");
        }
        removed.is_some()
    }

    /// Marks a transaction done and removes it, cancelling its timeout.
    pub fn complete(&self, id: &str) -> bool {
        let removed = self.table.lock().expect("lock poisoned").remove(id);
        removed.is_some()
    }

    /// Reports whether the transaction `id` is live.
    pub fn contains(&self, id: &str) -> bool {
        self.table.lock().expect("lock poisoned").contains_key(id)
    }

    /// Returns the state of the transaction `id`.
    pub fn info(&self, id: &str) -> Option<TransactionInfo> {
        let table = self.table.lock().expect("lock poisoned");
        table.get(id).map(|t| t.info.clone())
    }

    /// The number of live transactions.
    pub fn len(&self) -> usize {
        self.table.lock().expect("lock poisoned").len()
    }

    /// Reports whether no transactions are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a transaction whose timeout fired.
fn expire(table: &Weak<TransactionTable>, id: &str) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let removed = table.lock().expect("lock poisoned").remove(id);
    if let Some(transaction) = removed {
        warn!(transaction = %id, target = ?transaction.info.target, "transaction: timed out");
        // Aborts this task. Nothing is awaited past this point.
        drop(transaction);
    }
}

#[cfg(test)]
mod tests {
    use pp_proto::command::Ack;
    use uuid::Uuid;

    use super::*;
    use crate::testing::{RecordingProcessor, RecordingTransport};

    fn manager() -> (TransactionManager, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let shared = Arc::clone(&transport) as Arc<dyn Transport>;
        let manager = TransactionManager::new(Uuid::new_v4(), shared);
        (manager, transport)
    }

    fn message(id: &str, mode: TransactionMode) -> TransactionMessage {
        TransactionMessage {
            id: id.into(),
            mode,
            command: Command::Ack(Ack::ok("")),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_complete() {
        let (manager, _) = manager();
        let processor = RecordingProcessor::default();

        let info = manager.begin();
        assert!(info.id.starts_with(manager.ids.prefix()));
        assert!(manager.contains(&info.id));
        assert!(manager.cancel(&info.id, false));
        assert!(!manager.contains(&info.id));
        assert!(!manager.cancel(&info.id, true));

        let from = Uuid::new_v4();
        assert!(!manager.receive(message(&info.id, TransactionMode::Complete), from, &processor));
        assert!(processor.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (manager, _) = manager();
        let info = manager.begin();

        tokio::time::sleep(DEFAULT_TRANSACTION_TIMEOUT - Duration::from_secs(1)).await;
        assert!(manager.contains(&info.id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!manager.contains(&info.id));
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_timeout() {
        let (manager, _) = manager();
        let (hook, mut rx) = channel_hook();
        let long = DEFAULT_TRANSACTION_TIMEOUT * 2;
        let info = manager.begin_with_hook_and_timeout(hook, long);
        let short = manager.begin();

        tokio::time::sleep(DEFAULT_TRANSACTION_TIMEOUT + Duration::from_secs(1)).await;
        assert!(!manager.contains(&short.id));
        assert!(manager.contains(&info.id));
        tokio::time::sleep(DEFAULT_TRANSACTION_TIMEOUT).await;
        assert!(!manager.contains(&info.id));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_modes() {
        let (manager, transport) = manager();
        let target = Uuid::new_v4();

        let info = manager.begin();
        let create = manager.build(&info.id, TransactionMode::Create, Command::Noop).unwrap();
        assert!(manager.send(create, target));
        let recorded = manager.info(&info.id).unwrap();
        assert_eq!(recorded.target, Some(target));
        assert_eq!(recorded.mode, Some(TransactionMode::Create));

        let complete = manager.build(&info.id, TransactionMode::Complete, Command::Noop).unwrap();
        assert!(manager.send(complete, target));
        assert!(!manager.contains(&info.id));
        assert!(manager.build(&info.id, TransactionMode::Continue, Command::Noop).is_none());

        let sent = transport.take();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(to, _)| *to == target));
        assert_eq!(sent[1].1.mode, TransactionMode::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_cancels_request() {
        let (manager, transport) = manager();
        transport.set_failing(true);

        assert!(manager.request(Command::Noop, Uuid::new_v4()).is_none());
        assert!(manager.is_empty());
        assert!(!manager.send_single(Command::Noop, Uuid::new_v4()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_transaction() {
        let (manager, transport) = manager();
        let processor = RecordingProcessor::default();
        let peer = Uuid::new_v4();

        assert!(manager.receive(message("peer-1", TransactionMode::Create), peer, &processor));
        assert!(!manager.receive(message("peer-1", TransactionMode::Create), peer, &processor));
        assert!(manager.receive(message("peer-1", TransactionMode::Continue), peer, &processor));
        assert!(!manager.receive(message("peer-2", TransactionMode::Continue), peer, &processor));

        let received = processor.take();
        assert_eq!(received.len(), 2);
        let info = received[0].transaction.clone().unwrap();
        assert_eq!(info.target, Some(peer));

        assert!(manager.respond(&info, TransactionMode::Complete, Command::Noop));
        assert!(!manager.contains("peer-1"));
        assert!(!manager.respond(&info, TransactionMode::Complete, Command::Noop));
        assert_eq!(transport.take().len(), 1);

        assert!(manager.receive(message("peer-3", TransactionMode::Single), peer, &processor));
        assert!(!manager.contains("peer-3"));
        assert!(processor.take()[0].transaction.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_hook() {
        let (manager, transport) = manager();
        let processor = RecordingProcessor::default();
        let peer = Uuid::new_v4();

        let (info, mut rx) = manager.request(Command::Noop, peer).unwrap();
        let (to, sent) = transport.take().pop().unwrap();
        assert_eq!(to, peer);
        assert_eq!(sent.mode, TransactionMode::Create);

        manager.receive(message(&info.id, TransactionMode::Continue), peer, &processor);
        manager.receive(message(&info.id, TransactionMode::Complete), peer, &processor);
        assert_eq!(rx.recv().await.unwrap().mode, TransactionMode::Continue);
        assert_eq!(rx.recv().await.unwrap().mode, TransactionMode::Complete);
        assert!(rx.recv().await.is_none());

        let received = processor.take();
        assert!(received[1].transaction.as_ref().unwrap().done);
    }
}
