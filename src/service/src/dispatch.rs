// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command dispatch.
//!
//! Each role keeps a table from [`CommandKind`] to a handler function. The
//! transaction manager hands every received command to the role's
//! [`CommandProcessor`], which usually just consults its table.

use std::collections::BTreeMap;
use std::fmt;

use pp_proto::{Command, CommandKind, Identity, TransactionMode};
use tracing::{debug, warn};

use crate::transaction::TransactionInfo;

/// A command received from a peer, together with its transaction context.
#[derive(Clone, Debug)]
pub struct Incoming {
    /// The identity of the channel the command arrived on.
    pub from: Identity,
    /// The transaction the command belongs to. `None` for `SINGLE` messages.
    pub transaction: Option<TransactionInfo>,
    /// The mode the command was sent with.
    pub mode: TransactionMode,
    /// The command itself.
    pub command: Command,
}

/// Processes commands handed over by the transaction manager.
pub trait CommandProcessor: Send + Sync {
    /// Processes a command. A `false` result is logged but otherwise
    /// ignored; it never terminates the connection.
    fn process(&self, incoming: Incoming) -> bool;
}

/// A command handler operating on a role's context `C`.
pub type Handler<C> = fn(&C, Incoming) -> bool;

/// A table of command handlers.
pub struct HandlerTable<C> {
    handlers: BTreeMap<CommandKind, Handler<C>>,
}

impl<C> HandlerTable<C> {
    /// Creates an empty table.
    pub fn new() -> Self {
        HandlerTable {
            handlers: BTreeMap::new(),
        }
    }

    /// Registers `handler` for commands of the given kind, replacing any
    /// previous handler.
    pub fn register(mut self, kind: CommandKind, handler: Handler<C>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Reports whether the table has a handler for `kind`.
    pub fn handles(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Hands `incoming` to the registered handler.
    pub fn dispatch(&self, context: &C, incoming: Incoming) -> bool {
        let kind = incoming.command.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            warn!(%kind, from = %incoming.from, "dispatch: no handler for command");
            return false;
        };
        let transaction = incoming.transaction.as_ref().map(|t| t.id.clone());
        let ok = handler(context, incoming);
        if !ok {
            debug!(%kind, ?transaction, "dispatch: handler failed");
        }
        ok
    }
}

impl<C> Default for HandlerTable<C> {
    fn default() -> Self {
        HandlerTable::new()
    }
}

impl<C> fmt::Debug for HandlerTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pp_proto::command::Ack;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct Counter {
        acks: AtomicUsize,
    }

    fn handle_ack(counter: &Counter, incoming: Incoming) -> bool {
        counter.acks.fetch_add(1, Ordering::SeqCst);
        matches!(incoming.command, Command::Ack(ack) if ack.ok)
    }

    fn incoming(command: Command) -> Incoming {
        Incoming {
            from: Uuid::new_v4(),
            transaction: None,
            mode: TransactionMode::Single,
            command,
        }
    }

    #[test]
    fn test_dispatch() {
        let table = HandlerTable::new().register(CommandKind::Ack, handle_ack);
        let counter = Counter::default();

        assert!(table.handles(CommandKind::Ack));
        assert!(table.dispatch(&counter, incoming(Command::Ack(Ack::ok("")))));
        assert!(!table.dispatch(&counter, incoming(Command::Ack(Ack::failed("")))));
        assert!(!table.dispatch(&counter, incoming(Command::Noop)));
        assert_eq!(counter.acks.load(Ordering::SeqCst), 2);
    }
}
