// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared secrets, established out of band.
//!
//! Every participant is known by an [`Identity`] and a shared secret. The
//! secret is the sole authentication factor of a channel and the password
//! from which its cipher key is derived.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use pp_crypto::{CryptoError, SecretKey};
use pp_proto::Identity;
use serde::{Deserialize, Serialize};

/// The kind of participant a keystore entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// A local coordinator.
    Coordinator,
    /// A client.
    Client,
}

/// The serialized form of a keystore entry, as found in configuration
/// files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// The participant's identity.
    pub id: Identity,
    /// The shared secret.
    pub key: String,
    /// A human-readable name for the participant.
    #[serde(default)]
    pub name: String,
    /// A human-readable name for the key.
    #[serde(default)]
    pub key_name: Option<String>,
    /// The names of the access policies attached to this key.
    #[serde(default)]
    pub authenticators: Vec<String>,
}

/// A participant's keystore entry.
#[derive(Clone, Debug)]
pub struct KeyEntry {
    /// The participant's identity.
    pub identity: Identity,
    /// The kind of participant.
    pub kind: KeyKind,
    /// A human-readable name for the participant.
    pub name: String,
    /// A human-readable name for the key.
    pub key_name: Option<String>,
    /// The names of the access policies attached to this key.
    pub authenticators: Vec<String>,
    /// The shared secret.
    pub key: SecretKey,
}

impl KeyEntry {
    /// Builds an entry from its configuration.
    pub fn from_config(kind: KeyKind, config: &KeyConfig) -> Result<KeyEntry, CryptoError> {
        Ok(KeyEntry {
            identity: config.id,
            kind,
            name: config.name.clone(),
            key_name: config.key_name.clone(),
            authenticators: config.authenticators.clone(),
            key: SecretKey::new(&config.key)?,
        })
    }
}

/// A participant's own identity and secret, as found in configuration
/// files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// The participant's identity.
    pub id: Identity,
    /// The shared secret.
    pub key: String,
}

impl IdentityConfig {
    /// Derives the credentials described by this configuration.
    pub fn credentials(&self) -> Result<Credentials, CryptoError> {
        Credentials::new(self.id, &self.key)
    }
}

/// The credentials a participant uses for its own outbound channel.
#[derive(Clone, Debug)]
pub struct Credentials {
    /// The participant's identity.
    pub identity: Identity,
    /// The participant's shared secret.
    pub key: SecretKey,
}

impl Credentials {
    /// Derives credentials from an identity and a shared secret.
    pub fn new(identity: Identity, secret: &str) -> Result<Credentials, CryptoError> {
        Ok(Credentials {
            identity,
            key: SecretKey::new(secret)?,
        })
    }
}

/// The set of known participants.
#[derive(Debug, Default)]
pub struct Keystore {
    // Covers every entry; entries are immutable once inserted.
    entries: RwLock<BTreeMap<Identity, Arc<KeyEntry>>>,
}

impl Keystore {
    /// Creates an empty keystore.
    pub fn new() -> Keystore {
        Keystore::default()
    }

    /// Creates a keystore seeded from configuration.
    pub fn from_configs(
        coordinators: &[KeyConfig],
        clients: &[KeyConfig],
    ) -> Result<Keystore, CryptoError> {
        let keystore = Keystore::new();
        for config in coordinators {
            keystore.insert(KeyEntry::from_config(KeyKind::Coordinator, config)?);
        }
        for config in clients {
            keystore.insert(KeyEntry::from_config(KeyKind::Client, config)?);
        }
        Ok(keystore)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&self, entry: KeyEntry) {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries.insert(entry.identity, Arc::new(entry));
    }

    /// Looks up the entry for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<Arc<KeyEntry>> {
        let entries = self.entries.read().expect("lock poisoned");
        entries.get(identity).cloned()
    }

    /// Returns every entry of the given kind.
    pub fn entries(&self, kind: KeyKind) -> Vec<Arc<KeyEntry>> {
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .values()
            .filter(|entry| entry.kind == kind)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_keystore_from_configs() {
        let node = Uuid::new_v4();
        let client = Uuid::new_v4();
        let config: Vec<KeyConfig> = serde_json::from_value(serde_json::json!([
            {"id": node, "key": "n", "name": "node-1", "authenticators": ["node"]}
        ]))
        .unwrap();
        let clients = vec![KeyConfig {
            id: client,
            key: "c".into(),
            name: "ops".into(),
            key_name: None,
            authenticators: vec![],
        }];

        let keystore = Keystore::from_configs(&config, &clients).unwrap();
        let entry = keystore.get(&node).unwrap();
        assert_eq!(entry.kind, KeyKind::Coordinator);
        assert_eq!(entry.name, "node-1");
        assert_eq!(entry.authenticators, vec!["node".to_string()]);
        assert_eq!(keystore.get(&client).unwrap().kind, KeyKind::Client);
        assert_eq!(keystore.entries(KeyKind::Coordinator).len(), 1);
        assert!(keystore.get(&Uuid::new_v4()).is_none());
    }
}
