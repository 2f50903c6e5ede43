// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transaction-tagged messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Command;

/// The role of a message within its transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    /// A one-shot message. No reply is expected and the transaction is not
    /// retained by either side.
    Single,
    /// Opens a transaction that the other side will continue or complete.
    Create,
    /// A mid-exchange message on an existing transaction.
    Continue,
    /// The final message of a transaction, which closes it.
    Complete,
}

impl TransactionMode {
    /// Reports whether sending a message in this mode ends the transaction on
    /// the sending side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionMode::Single | TransactionMode::Complete)
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionMode::Single => "SINGLE",
            TransactionMode::Create => "CREATE",
            TransactionMode::Continue => "CONTINUE",
            TransactionMode::Complete => "COMPLETE",
        })
    }
}

/// The decrypted content of an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionMessage {
    /// The transaction ID, `<originator identity>-<random>`.
    pub id: String,
    /// The role of this message within the transaction.
    pub mode: TransactionMode,
    /// The application command carried by this message.
    pub command: Command,
}
