// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The crypto/auth codec shared by every PlayPen participant.
//!
//! Every envelope exchanged between participants is encrypted with a
//! symmetric cipher keyed by a password-derived key, and then authenticated
//! by a keyed hash computed over the *encrypted* bytes. The receiver must
//! [`validate`] the hash before it attempts to [`decrypt`] anything; a hash
//! mismatch is a hard authentication failure.
//!
//! Encryption is not authenticated encryption. Authentication is provided
//! exclusively by the keyed hash.

use std::fmt;

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::sha::Sha256;
use openssl::sign::Signer;
use openssl::symm::{self, Cipher};
use thiserror::Error;

/// The length of the initialization vector prepended to every ciphertext.
const IV_LEN: usize = 16;
/// The length of the derived AES-256 key.
const KEY_LEN: usize = 32;
/// The PBKDF2 iteration count used to derive the cipher key from a secret.
const KDF_ITERATIONS: usize = 10_000;
/// The PBKDF2 salt. Keys are derived deterministically from the shared
/// secret, so both sides of a channel derive the same key independently.
const KDF_SALT: &[u8] = b"playpen.envelope.v1";

/// Errors produced by the codec.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The underlying crypto library failed.
    #[error("openssl: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
    /// A ciphertext was too short to contain an initialization vector.
    #[error("ciphertext truncated: {0} bytes")]
    Truncated(usize),
}

/// A shared secret, together with the cipher key derived from it.
///
/// Deriving the cipher key is deliberately slow, so a `SecretKey` should be
/// constructed once per keystore entry and reused for every envelope.
#[derive(Clone)]
pub struct SecretKey {
    secret: Vec<u8>,
    cipher_key: [u8; KEY_LEN],
}

impl SecretKey {
    /// Derives a key from the given shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<SecretKey, CryptoError> {
        let secret = secret.as_ref().to_vec();
        let mut cipher_key = [0; KEY_LEN];
        openssl::pkcs5::pbkdf2_hmac(
            &secret,
            KDF_SALT,
            KDF_ITERATIONS,
            MessageDigest::sha256(),
            &mut cipher_key,
        )?;
        Ok(SecretKey { secret, cipher_key })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Encrypts `bytes` under `key`.
///
/// The returned buffer is a fresh random initialization vector followed by
/// the AES-256-CBC ciphertext.
pub fn encrypt(bytes: &[u8], key: &SecretKey) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0; IV_LEN];
    rand_bytes(&mut iv)?;
    let ciphertext = symm::encrypt(Cipher::aes_256_cbc(), &key.cipher_key, Some(&iv), bytes)?;
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts bytes produced by [`encrypt`] under the same `key`.
pub fn decrypt(bytes: &[u8], key: &SecretKey) -> Result<Vec<u8>, CryptoError> {
    if bytes.len() < IV_LEN {
        return Err(CryptoError::Truncated(bytes.len()));
    }
    let (iv, ciphertext) = bytes.split_at(IV_LEN);
    let plaintext = symm::decrypt(Cipher::aes_256_cbc(), &key.cipher_key, Some(iv), ciphertext)?;
    Ok(plaintext)
}

/// Computes the keyed hash of `bytes` under `key`, as a lowercase hex
/// string.
pub fn hash(key: &SecretKey, bytes: &[u8]) -> Result<String, CryptoError> {
    Ok(hex::encode(mac(key, bytes)?))
}

/// Reports whether `hash` is the keyed hash of `bytes` under `key`.
///
/// Malformed hashes and internal crypto failures are treated as mismatches.
pub fn validate(hash: &str, key: &SecretKey, bytes: &[u8]) -> bool {
    let Ok(expected) = hex::decode(hash) else {
        return false;
    };
    let Ok(actual) = mac(key, bytes) else {
        return false;
    };
    expected.len() == actual.len() && openssl::memcmp::eq(&expected, &actual)
}

fn mac(key: &SecretKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let pkey = PKey::hmac(&key.secret)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(bytes)?;
    Ok(signer.sign_to_vec()?)
}

/// Computes the checksum of a complete package payload.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Checksum::new();
    hasher.update(bytes);
    hasher.finish()
}

/// An incremental checksum, for payloads that are assembled piecewise.
///
/// Produces the same value as [`checksum`] over the concatenation of every
/// slice passed to [`Checksum::update`].
pub struct Checksum(Sha256);

impl Checksum {
    /// Starts a new checksum.
    pub fn new() -> Checksum {
        Checksum(Sha256::new())
    }

    /// Feeds more bytes into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Returns the hex-encoded checksum.
    pub fn finish(self) -> String {
        hex::encode(self.0.finish())
    }
}

impl Default for Checksum {
    fn default() -> Checksum {
        Checksum::new()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checksum").finish_non_exhaustive()
    }
}
