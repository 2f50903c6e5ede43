// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Network coordinator configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pp_proto::command::Properties;
use pp_proto::Identity;
use pp_service::keystore::KeyConfig;
use pp_service::transfer::DEFAULT_CHUNK_THRESHOLD;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatorConfig;

/// The default address on which to listen for connections.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:25501";

/// The persisted configuration of a network coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// The network coordinator's identity. Prefixes the IDs it generates.
    pub id: Identity,
    /// The address on which to listen for connections.
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// The root of the package store.
    pub package_root: PathBuf,
    /// Archives larger than this many bytes are sent in chunks.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
    /// Properties passed to every provisioned server.
    #[serde(default)]
    pub strings: Properties,
    /// The keys of the known local coordinators.
    #[serde(default)]
    pub coordinators: Vec<KeyConfig>,
    /// The keys of the known clients.
    #[serde(default)]
    pub clients: Vec<KeyConfig>,
    /// Named access policies.
    #[serde(default)]
    pub authenticators: BTreeMap<String, AuthenticatorConfig>,
}

fn default_chunk_threshold() -> usize {
    DEFAULT_CHUNK_THRESHOLD
}

impl NetworkConfig {
    /// Loads the configuration at `path`.
    pub fn load(path: &Path) -> Result<NetworkConfig, anyhow::Error> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: NetworkConfig = serde_json::from_str(
            r#"{
                "id": "4c2b5d0e-7b0a-4c62-9b59-0d6f3b8f2a11",
                "package_root": "/var/lib/playpen/packages",
                "coordinators": [
                    {"id": "d1f0c3a2-56a9-4a57-8f2e-3a3c5f9f0b01", "key": "s3cret", "name": "node-1"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.chunk_threshold, DEFAULT_CHUNK_THRESHOLD);
        assert_eq!(config.listen_addr, None);
        assert_eq!(config.coordinators[0].name, "node-1");
        assert!(config.clients.is_empty());
    }
}
