// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Console session bookkeeping.
//!
//! A console session relays the output of a server's process from the local
//! coordinator running it to one attached client. The network coordinator
//! only records which coordinator produces a session's output and which
//! client consumes it.

use std::collections::BTreeMap;

use pp_ore::id_gen::PrefixedIdGen;
use pp_proto::Identity;
use uuid::Uuid;

/// A live console session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleInfo {
    /// The coordinator running the server.
    pub coordinator: Identity,
    /// The server whose output is relayed.
    pub server: Uuid,
    /// The attached client.
    pub attached: Identity,
}

/// The table of live console sessions.
#[derive(Debug)]
pub struct ConsoleRelay {
    ids: PrefixedIdGen,
    sessions: BTreeMap<String, ConsoleInfo>,
}

impl ConsoleRelay {
    /// Creates an empty table whose session IDs are prefixed with
    /// `identity`.
    pub fn new(identity: Identity) -> ConsoleRelay {
        ConsoleRelay {
            ids: PrefixedIdGen::new(format!("console-{identity}")),
            sessions: BTreeMap::new(),
        }
    }

    /// Records a new session and returns its ID.
    pub fn attach(&mut self, coordinator: Identity, server: Uuid, client: Identity) -> String {
        let id = loop {
            let id = self.ids.allocate_id();
            if !self.sessions.contains_key(&id) {
                break id;
            }
        };
        let info = ConsoleInfo {
            coordinator,
            server,
            attached: client,
        };
        self.sessions.insert(id.clone(), info);
        id
    }

    /// Looks up a session.
    pub fn get(&self, console: &str) -> Option<&ConsoleInfo> {
        self.sessions.get(console)
    }

    /// Removes a session.
    pub fn detach(&mut self, console: &str) -> Option<ConsoleInfo> {
        self.sessions.remove(console)
    }

    /// Removes every session relayed from `coordinator`.
    pub fn sweep_coordinator(&mut self, coordinator: &Identity) -> Vec<(String, ConsoleInfo)> {
        self.sweep(|info| info.coordinator == *coordinator)
    }

    /// Removes every session attached to `client`.
    pub fn sweep_client(&mut self, client: &Identity) -> Vec<(String, ConsoleInfo)> {
        self.sweep(|info| info.attached == *client)
    }

    fn sweep(&mut self, mut pred: impl FnMut(&ConsoleInfo) -> bool) -> Vec<(String, ConsoleInfo)> {
        let ids: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, info)| pred(info))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|info| (id, info)))
            .collect()
    }

    /// The number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Reports whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
