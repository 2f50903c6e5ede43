// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Local coordinator configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pp_proto::command::ResourceMap;
use pp_service::keystore::IdentityConfig;
use serde::{Deserialize, Serialize};

/// How often a connected local coordinator reports its complete state.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(90);

/// How many output lines of a server process are replayed to a newly
/// attached console.
pub const DEFAULT_CONSOLE_REPLAY_LINES: usize = 50;

/// The persisted configuration of a local coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalConfig {
    /// The coordinator's identity and shared secret.
    pub identity: IdentityConfig,
    /// The coordinator's display name.
    pub name: String,
    /// The address of the network coordinator.
    pub network_addr: String,
    /// The declared resource capacity.
    #[serde(default)]
    pub resources: ResourceMap,
    /// The declared attributes.
    #[serde(default)]
    pub attributes: BTreeSet<String>,
    /// The root of the local package cache.
    pub package_root: PathBuf,
    /// Where package chunks are staged during downloads.
    pub temp_dir: PathBuf,
    /// The parent directory of server directories.
    pub server_root: PathBuf,
    /// Where frozen server directories are moved.
    pub frozen_root: PathBuf,
    /// Names server directories after the server name instead of its ID.
    #[serde(default)]
    pub use_name_for_dirs: bool,
    /// Output lines replayed to a newly attached console.
    #[serde(default = "default_console_replay_lines")]
    pub console_replay_lines: usize,
    /// Seconds between state reports.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

fn default_console_replay_lines() -> usize {
    DEFAULT_CONSOLE_REPLAY_LINES
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL.as_secs()
}

impl LocalConfig {
    /// Loads the configuration at `path`.
    pub fn load(path: &Path) -> Result<LocalConfig, anyhow::Error> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    /// The interval between state reports.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
