// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Application commands.
//!
//! [`Command`] is the closed union of every command exchanged by PlayPen
//! participants. Commands prefixed with `Client` form the client-facing
//! surface of the network coordinator; all others flow between the network
//! coordinator and local coordinators.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared resource amounts, keyed by resource name.
pub type ResourceMap = BTreeMap<String, i64>;

/// String properties passed to a server's package steps and process.
pub type Properties = BTreeMap<String, String>;

/// The version name that resolves to a package's promoted version.
pub const PROMOTED_VERSION: &str = "promoted";

/// A reference to a package version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    /// The package ID.
    pub id: String,
    /// The package version, or [`PROMOTED_VERSION`].
    pub version: String,
}

impl PackageRef {
    /// Constructs a new package reference.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> PackageRef {
        PackageRef {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Reports whether this reference names the promoted version rather than
    /// a concrete one.
    pub fn is_promoted(&self) -> bool {
        self.version == PROMOTED_VERSION
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// How to run a server's process once its package is installed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// The program to execute, relative to the server directory if not
    /// absolute.
    pub command: String,
    /// Arguments to the program. `${name}` placeholders are substituted with
    /// server properties.
    pub args: Vec<String>,
    /// Additional environment variables.
    pub env: BTreeMap<String, String>,
}

/// The metadata of a package version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    /// The package ID.
    pub id: String,
    /// The concrete package version.
    pub version: String,
    /// Resources consumed by every server running this package.
    #[serde(default)]
    pub resources: ResourceMap,
    /// Attributes a local coordinator must declare to run this package.
    #[serde(default)]
    pub attributes: BTreeSet<String>,
    /// Default string properties for servers running this package.
    #[serde(default)]
    pub strings: Properties,
    /// Packages that must be installed alongside this one.
    #[serde(default)]
    pub dependencies: Vec<PackageRef>,
    /// The process to run, if any.
    #[serde(default)]
    pub run: Option<RunSpec>,
}

impl PackageManifest {
    /// Returns a reference to this package version.
    pub fn package_ref(&self) -> PackageRef {
        PackageRef::new(&self.id, &self.version)
    }
}

/// A server as reported by its local coordinator during sync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncServer {
    /// The server's ID.
    pub uuid: Uuid,
    /// The server's name.
    pub name: String,
    /// The package the server runs.
    pub package: PackageRef,
    /// The server's properties.
    pub properties: Properties,
    /// Whether the server finished provisioning.
    pub active: bool,
}

/// The complete state of a local coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// The coordinator's name.
    pub name: String,
    /// The coordinator's declared resources.
    pub resources: ResourceMap,
    /// The coordinator's declared attributes.
    pub attributes: BTreeSet<String>,
    /// Whether the coordinator accepts new servers.
    pub enabled: bool,
    /// Every server on the coordinator, including inactive ones.
    pub servers: Vec<SyncServer>,
}

/// Requests that a local coordinator provision a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    /// The ID of the new server.
    pub server: Uuid,
    /// The name of the new server.
    pub name: String,
    /// The concrete package version to provision.
    pub package: PackageRef,
    /// The merged properties of the new server.
    pub properties: Properties,
}

/// The outcome of a [`Provision`] request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    /// The ID of the server.
    pub server: Uuid,
    /// Whether provisioning succeeded.
    pub ok: bool,
    /// A human-readable description of the outcome.
    pub message: String,
}

/// Requests that a local coordinator deprovision a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deprovision {
    /// The ID of the server.
    pub server: Uuid,
    /// Kill the server's process instead of asking it to stop.
    pub force: bool,
}

/// Announces that a server is gone from its local coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerShutdown {
    /// The ID of the server.
    pub server: Uuid,
}

/// Requests that a local coordinator freeze a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeServer {
    /// The ID of the server.
    pub server: Uuid,
}

/// Sends a line of input to a server's process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInput {
    /// The ID of the server.
    pub server: Uuid,
    /// The input, without a trailing newline.
    pub input: String,
}

/// Requests a package archive, or its checksum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    /// The package version.
    pub package: PackageRef,
}

/// One message of a package transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageTransfer {
    /// The package is unknown to the sender.
    Missing,
    /// The complete package, small enough for a single message.
    Whole {
        /// The package metadata.
        manifest: PackageManifest,
        /// The complete archive.
        data: Vec<u8>,
        /// The checksum of `data`.
        checksum: String,
    },
    /// One chunk of a chunked transfer.
    Chunk {
        /// The position of this chunk, starting at zero.
        chunk_id: u64,
        /// The chunk contents.
        data: Vec<u8>,
    },
    /// The end-of-file marker of a chunked transfer.
    EndOfFile {
        /// The package metadata.
        manifest: PackageManifest,
        /// The total number of chunks sent.
        chunk_count: u64,
        /// The checksum of the complete, un-chunked archive.
        checksum: String,
    },
}

/// A package transfer message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResponse {
    /// The package version being transferred.
    pub package: PackageRef,
    /// The transfer content.
    pub transfer: PackageTransfer,
}

/// The checksum of a package, as known to the network coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChecksumResponse {
    /// The package version.
    pub package: PackageRef,
    /// The checksum, or `None` if the package is unknown.
    pub checksum: Option<String>,
}

/// Attaches a console session to a server's process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachConsole {
    /// The ID of the server.
    pub server: Uuid,
    /// The ID of the console session.
    pub console: String,
}

/// A line of console output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    /// The ID of the console session.
    pub console: String,
    /// The output line.
    pub line: String,
}

/// Ends a console session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachConsole {
    /// The ID of the console session.
    pub console: String,
}

/// A generic acknowledgement, carrying a human-readable result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the acknowledged operation succeeded.
    pub ok: bool,
    /// A human-readable description of the result.
    pub message: String,
}

impl Ack {
    /// A successful acknowledgement.
    pub fn ok(message: impl Into<String>) -> Ack {
        Ack {
            ok: true,
            message: message.into(),
        }
    }

    /// A failed acknowledgement.
    pub fn failed(message: impl Into<String>) -> Ack {
        Ack {
            ok: false,
            message: message.into(),
        }
    }
}

/// Reports that the sender may not issue a command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDenied {
    /// The kind of the denied command.
    pub command: CommandKind,
}

/// A client request to provision a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProvision {
    /// The package to provision; the version may be [`PROMOTED_VERSION`].
    pub package: PackageRef,
    /// The server name. Defaults to the package ID.
    pub name: Option<String>,
    /// Properties overriding every other property source.
    pub properties: Properties,
    /// An explicit placement target, bypassing the scheduler.
    pub coordinator: Option<Uuid>,
}

/// The outcome of a [`ClientProvision`] request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProvisionResponse {
    /// Whether provisioning succeeded.
    pub ok: bool,
    /// The coordinator the server was placed on.
    pub coordinator: Option<Uuid>,
    /// The ID of the new server.
    pub server: Option<Uuid>,
    /// A human-readable description of the outcome.
    pub message: String,
}

/// A client request to deprovision a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeprovision {
    /// The coordinator running the server.
    pub coordinator: Uuid,
    /// The ID of the server.
    pub server: Uuid,
    /// Kill the server's process instead of asking it to stop.
    pub force: bool,
}

/// A client request to shut down a local coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientShutdown {
    /// The coordinator to shut down.
    pub coordinator: Uuid,
}

/// A client request to promote a package version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPromote {
    /// The concrete package version to promote.
    pub package: PackageRef,
}

/// A client request to create a keystore entry for a new local coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCreateCoordinator {
    /// The name of the new coordinator.
    pub name: String,
    /// An optional name for the new key.
    pub key_name: Option<String>,
}

/// The credentials of a newly created local coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCoordinatorCreated {
    /// The identity of the new coordinator.
    pub uuid: Uuid,
    /// The shared secret of the new coordinator.
    pub key: String,
}

/// A client request to attach to a server's console.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAttachConsole {
    /// The coordinator running the server.
    pub coordinator: Uuid,
    /// The ID of the server.
    pub server: Uuid,
}

/// The outcome of a [`ClientAttachConsole`] request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConsoleAttached {
    /// Whether the session was created.
    pub ok: bool,
    /// The ID of the new console session.
    pub console: Option<String>,
    /// A human-readable description of the outcome.
    pub message: String,
}

/// A client request to send input to a server's process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSendInput {
    /// The coordinator running the server.
    pub coordinator: Uuid,
    /// The ID of the server.
    pub server: Uuid,
    /// The input line.
    pub input: String,
}

/// A client request to freeze a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFreezeServer {
    /// The coordinator running the server.
    pub coordinator: Uuid,
    /// The ID of the server.
    pub server: Uuid,
}

/// A client request to set or clear a coordinator's restricted flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRestrict {
    /// The coordinator.
    pub coordinator: Uuid,
    /// Whether the coordinator is excluded from scheduling.
    pub restricted: bool,
}

/// A summary of a server, for fleet listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    /// The server's ID.
    pub uuid: Uuid,
    /// The server's name.
    pub name: String,
    /// The package the server runs.
    pub package: PackageRef,
    /// Whether the server finished provisioning.
    pub active: bool,
}

/// A summary of a local coordinator, for fleet listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSummary {
    /// The coordinator's identity.
    pub uuid: Uuid,
    /// The coordinator's name.
    pub name: String,
    /// Whether the coordinator accepts new servers.
    pub enabled: bool,
    /// Whether an operator excluded the coordinator from scheduling.
    pub restricted: bool,
    /// The coordinator's declared resources.
    pub resources: ResourceMap,
    /// The coordinator's declared attributes.
    pub attributes: BTreeSet<String>,
    /// The coordinator's servers.
    pub servers: Vec<ServerSummary>,
}

/// A snapshot of the fleet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCoordinatorList {
    /// Every registered coordinator.
    pub coordinators: Vec<CoordinatorSummary>,
}

/// Every application command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Does nothing.
    Noop,
    /// A generic acknowledgement.
    Ack(Ack),
    /// The sender may not issue the named command.
    AccessDenied(AccessDenied),
    /// A local coordinator's complete state.
    Sync(SyncState),
    /// Provision a server.
    Provision(Provision),
    /// The outcome of provisioning.
    ProvisionResponse(ProvisionResponse),
    /// Deprovision a server.
    Deprovision(Deprovision),
    /// A server is gone.
    ServerShutdown(ServerShutdown),
    /// Shut down the receiving local coordinator.
    Shutdown,
    /// Freeze a server.
    FreezeServer(FreezeServer),
    /// Send input to a server's process.
    SendInput(SendInput),
    /// Request a package archive.
    PackageRequest(PackageRequest),
    /// A package transfer message.
    PackageResponse(PackageResponse),
    /// Request a package checksum.
    PackageChecksumRequest(PackageRequest),
    /// A package checksum.
    PackageChecksumResponse(PackageChecksumResponse),
    /// Attach a console session.
    AttachConsole(AttachConsole),
    /// A line of console output.
    ConsoleMessage(ConsoleMessage),
    /// Detach a console session.
    DetachConsole(DetachConsole),
    /// `C_PROVISION`.
    ClientProvision(ClientProvision),
    /// `C_PROVISION_RESPONSE`.
    ClientProvisionResponse(ClientProvisionResponse),
    /// `C_DEPROVISION`.
    ClientDeprovision(ClientDeprovision),
    /// `C_SHUTDOWN`.
    ClientShutdown(ClientShutdown),
    /// `C_PROMOTE`.
    ClientPromote(ClientPromote),
    /// `C_CREATE_COORDINATOR`.
    ClientCreateCoordinator(ClientCreateCoordinator),
    /// `C_COORDINATOR_CREATED`.
    ClientCoordinatorCreated(ClientCoordinatorCreated),
    /// `C_ATTACH_CONSOLE`.
    ClientAttachConsole(ClientAttachConsole),
    /// `C_CONSOLE_ATTACHED`.
    ClientConsoleAttached(ClientConsoleAttached),
    /// `C_DETACH_CONSOLE`.
    ClientDetachConsole(DetachConsole),
    /// `C_SEND_INPUT`.
    ClientSendInput(ClientSendInput),
    /// `C_FREEZE_SERVER`.
    ClientFreezeServer(ClientFreezeServer),
    /// `C_RESTRICT`.
    ClientRestrict(ClientRestrict),
    /// `C_LIST`.
    ClientList,
    /// `C_COORDINATOR_LIST`.
    ClientCoordinatorList(ClientCoordinatorList),
}

/// The tag of a [`Command`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum CommandKind {
    Noop,
    Ack,
    AccessDenied,
    Sync,
    Provision,
    ProvisionResponse,
    Deprovision,
    ServerShutdown,
    Shutdown,
    FreezeServer,
    SendInput,
    PackageRequest,
    PackageResponse,
    PackageChecksumRequest,
    PackageChecksumResponse,
    AttachConsole,
    ConsoleMessage,
    DetachConsole,
    ClientProvision,
    ClientProvisionResponse,
    ClientDeprovision,
    ClientShutdown,
    ClientPromote,
    ClientCreateCoordinator,
    ClientCoordinatorCreated,
    ClientAttachConsole,
    ClientConsoleAttached,
    ClientDetachConsole,
    ClientSendInput,
    ClientFreezeServer,
    ClientRestrict,
    ClientList,
    ClientCoordinatorList,
}

impl Command {
    /// Returns the tag of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Noop => CommandKind::Noop,
            Command::Ack(_) => CommandKind::Ack,
            Command::AccessDenied(_) => CommandKind::AccessDenied,
            Command::Sync(_) => CommandKind::Sync,
            Command::Provision(_) => CommandKind::Provision,
            Command::ProvisionResponse(_) => CommandKind::ProvisionResponse,
            Command::Deprovision(_) => CommandKind::Deprovision,
            Command::ServerShutdown(_) => CommandKind::ServerShutdown,
            Command::Shutdown => CommandKind::Shutdown,
            Command::FreezeServer(_) => CommandKind::FreezeServer,
            Command::SendInput(_) => CommandKind::SendInput,
            Command::PackageRequest(_) => CommandKind::PackageRequest,
            Command::PackageResponse(_) => CommandKind::PackageResponse,
            Command::PackageChecksumRequest(_) => CommandKind::PackageChecksumRequest,
            Command::PackageChecksumResponse(_) => CommandKind::PackageChecksumResponse,
            Command::AttachConsole(_) => CommandKind::AttachConsole,
            Command::ConsoleMessage(_) => CommandKind::ConsoleMessage,
            Command::DetachConsole(_) => CommandKind::DetachConsole,
            Command::ClientProvision(_) => CommandKind::ClientProvision,
            Command::ClientProvisionResponse(_) => CommandKind::ClientProvisionResponse,
            Command::ClientDeprovision(_) => CommandKind::ClientDeprovision,
            Command::ClientShutdown(_) => CommandKind::ClientShutdown,
            Command::ClientPromote(_) => CommandKind::ClientPromote,
            Command::ClientCreateCoordinator(_) => CommandKind::ClientCreateCoordinator,
            Command::ClientCoordinatorCreated(_) => CommandKind::ClientCoordinatorCreated,
            Command::ClientAttachConsole(_) => CommandKind::ClientAttachConsole,
            Command::ClientConsoleAttached(_) => CommandKind::ClientConsoleAttached,
            Command::ClientDetachConsole(_) => CommandKind::ClientDetachConsole,
            Command::ClientSendInput(_) => CommandKind::ClientSendInput,
            Command::ClientFreezeServer(_) => CommandKind::ClientFreezeServer,
            Command::ClientRestrict(_) => CommandKind::ClientRestrict,
            Command::ClientList => CommandKind::ClientList,
            Command::ClientCoordinatorList(_) => CommandKind::ClientCoordinatorList,
        }
    }
}

impl CommandKind {
    /// Reports whether this command belongs to the client-facing surface.
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            CommandKind::ClientProvision
                | CommandKind::ClientProvisionResponse
                | CommandKind::ClientDeprovision
                | CommandKind::ClientShutdown
                | CommandKind::ClientPromote
                | CommandKind::ClientCreateCoordinator
                | CommandKind::ClientCoordinatorCreated
                | CommandKind::ClientAttachConsole
                | CommandKind::ClientConsoleAttached
                | CommandKind::ClientDetachConsole
                | CommandKind::ClientSendInput
                | CommandKind::ClientFreezeServer
                | CommandKind::ClientRestrict
                | CommandKind::ClientList
                | CommandKind::ClientCoordinatorList
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind() {
        assert_eq!(Command::Noop.kind(), CommandKind::Noop);
        assert_eq!(Command::ClientList.kind(), CommandKind::ClientList);
        assert!(CommandKind::ClientList.is_client());
        assert!(!CommandKind::Sync.is_client());
        assert_eq!(CommandKind::PackageResponse.to_string(), "PackageResponse");
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: PackageManifest =
            serde_json::from_str(r#"{"id": "web", "version": "1.0"}"#).unwrap();
        assert!(manifest.resources.is_empty());
        assert!(manifest.attributes.is_empty());
        assert!(manifest.run.is_none());
        assert_eq!(manifest.package_ref(), PackageRef::new("web", "1.0"));
        assert!(PackageRef::new("web", PROMOTED_VERSION).is_promoted());
    }
}
