// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire types for the PlayPen coordination protocol.
//!
//! The protocol is layered:
//!
//!  * An [`Envelope`] is the unit of transmission. It names the identity of
//!    the channel, the protocol version, a keyed hash, and an encrypted
//!    payload.
//!  * The decrypted payload of every envelope is exactly one
//!    [`TransactionMessage`], which tags an application [`Command`] with a
//!    transaction ID and a [`TransactionMode`].
//!  * [`Command`] is a closed union of every application command understood
//!    by network coordinators, local coordinators, and clients.
//!
//! Messages are encoded using the [`bincode`] format.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod command;
pub mod envelope;
pub mod transaction;

pub use command::{Command, CommandKind};
pub use envelope::{Envelope, EnvelopeError};
pub use transaction::{TransactionMessage, TransactionMode};

/// The identity of a participant: a network coordinator, a local
/// coordinator, or a client.
pub type Identity = uuid::Uuid;

/// The protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a message for wire transport.
pub fn wire_encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, bincode::Error> {
    bincode::DefaultOptions::new().serialize(msg)
}

/// Decode a wire frame back into a message.
pub fn wire_decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, bincode::Error> {
    bincode::DefaultOptions::new().deserialize(bytes)
}
