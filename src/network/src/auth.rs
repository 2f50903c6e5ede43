// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Access policies.
//!
//! A keystore entry may name any number of policies. A participant whose
//! entry names none may issue every command; otherwise a command is allowed
//! if any named policy grants it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use pp_proto::{Command, CommandKind, Identity};
use pp_service::transaction::TransactionInfo;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Decides whether a participant may issue a command.
pub trait Authenticator: fmt::Debug + Send + Sync {
    /// Reports whether `source` may issue `command` on `transaction`.
    fn has_access(
        &self,
        command: &Command,
        transaction: Option<&TransactionInfo>,
        source: Identity,
    ) -> bool;
}

/// Grants every command.
#[derive(Debug, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn has_access(&self, _: &Command, _: Option<&TransactionInfo>, _: Identity) -> bool {
        true
    }
}

/// Grants nothing.
#[derive(Debug, Clone, Copy)]
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn has_access(&self, _: &Command, _: Option<&TransactionInfo>, _: Identity) -> bool {
        false
    }
}

/// Grants a fixed set of command kinds.
#[derive(Debug, Clone)]
pub struct AllowCommands {
    kinds: BTreeSet<CommandKind>,
}

impl AllowCommands {
    /// Grants exactly `kinds`.
    pub fn new(kinds: impl IntoIterator<Item = CommandKind>) -> AllowCommands {
        AllowCommands {
            kinds: kinds.into_iter().collect(),
        }
    }
}

impl Authenticator for AllowCommands {
    fn has_access(&self, command: &Command, _: Option<&TransactionInfo>, _: Identity) -> bool {
        self.kinds.contains(&command.kind())
    }
}

/// The configuration of a named policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuthenticatorConfig {
    /// See [`AllowAll`].
    AllowAll,
    /// See [`DenyAll`].
    DenyAll,
    /// See [`AllowCommands`].
    Commands {
        /// The granted command kinds.
        allow: BTreeSet<CommandKind>,
    },
}

impl AuthenticatorConfig {
    fn build(&self) -> Arc<dyn Authenticator> {
        match self {
            AuthenticatorConfig::AllowAll => Arc::new(AllowAll),
            AuthenticatorConfig::DenyAll => Arc::new(DenyAll),
            AuthenticatorConfig::Commands { allow } => Arc::new(AllowCommands::new(allow.iter().copied())),
        }
    }
}

/// The named policies known to the network coordinator.
#[derive(Debug, Default, Clone)]
pub struct AccessControl {
    policies: BTreeMap<String, Arc<dyn Authenticator>>,
}

impl AccessControl {
    /// Builds the policies described by `configs`.
    pub fn from_configs(configs: &BTreeMap<String, AuthenticatorConfig>) -> AccessControl {
        let mut access = AccessControl::default();
        for (name, config) in configs {
            access.register(name.clone(), config.build());
        }
        access
    }

    /// Registers a policy under `name`.
    pub fn register(&mut self, name: String, policy: Arc<dyn Authenticator>) {
        self.policies.insert(name, policy);
    }

    /// Reports whether any of the named policies grants `command`. With no
    /// policies named, every command is granted. Unknown names grant
    /// nothing.
    pub fn has_access(
        &self,
        names: &[String],
        command: &Command,
        transaction: Option<&TransactionInfo>,
        source: Identity,
    ) -> bool {
        if names.is_empty() {
            return true;
        }
        names.iter().any(|name| match self.policies.get(name) {
            Some(policy) => policy.has_access(command, transaction, source),
            None => {
                warn!(policy = %name, "auth: unknown access policy");
                false
            }
        })
    }
}
