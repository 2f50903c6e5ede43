// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Authenticated envelopes.

use pp_crypto::{CryptoError, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::TransactionMessage;
use crate::{wire_decode, wire_encode, Identity, PROTOCOL_VERSION};

/// Errors arising while sealing or opening an [`Envelope`].
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The envelope's keyed hash does not match its payload.
    #[error("hash mismatch for identity {0}")]
    HashMismatch(Identity),
    /// The envelope was produced by an incompatible protocol version.
    #[error("protocol version mismatch: {peer} != {ours}")]
    VersionMismatch {
        /// The version named by the envelope.
        peer: u32,
        /// The version spoken by this build.
        ours: u32,
    },
    /// Encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The payload could not be encoded or decoded.
    #[error("wire codec: {0}")]
    Codec(#[from] bincode::Error),
}

impl EnvelopeError {
    /// Reports whether the error is an authentication failure, as opposed to
    /// a malformed but authentic envelope.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, EnvelopeError::HashMismatch(_))
    }
}

/// The unit of transmission between participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The identity whose shared secret protects this envelope.
    pub identity: Identity,
    /// The protocol version of the sender.
    pub protocol_version: u32,
    /// The hex-encoded keyed hash of `payload`.
    pub hash: String,
    /// The encrypted [`TransactionMessage`].
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encrypts and authenticates `message` under `key`.
    pub fn seal(
        identity: Identity,
        key: &SecretKey,
        message: &TransactionMessage,
    ) -> Result<Envelope, EnvelopeError> {
        let plaintext = wire_encode(message)?;
        let payload = pp_crypto::encrypt(&plaintext, key)?;
        let hash = pp_crypto::hash(key, &payload)?;
        Ok(Envelope {
            identity,
            protocol_version: PROTOCOL_VERSION,
            hash,
            payload,
        })
    }

    /// Authenticates and decrypts the message within this envelope.
    ///
    /// The payload is never decrypted unless the keyed hash validates.
    pub fn open(&self, key: &SecretKey) -> Result<TransactionMessage, EnvelopeError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(EnvelopeError::VersionMismatch {
                peer: self.protocol_version,
                ours: PROTOCOL_VERSION,
            });
        }
        if !pp_crypto::validate(&self.hash, key, &self.payload) {
            return Err(EnvelopeError::HashMismatch(self.identity));
        }
        let plaintext = pp_crypto::decrypt(&self.payload, key)?;
        Ok(wire_decode(&plaintext)?)
    }
}
