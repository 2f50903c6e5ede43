// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Network coordinator scenarios driven through a recording transport.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use pp_network::auth::AuthenticatorConfig;
use pp_network::registry::FleetEvent;
use pp_network::{Network, NetworkConfig};
use pp_proto::command::{
    AccessDenied, ClientAttachConsole, ClientProvision, ConsoleMessage, PackageManifest,
    PackageRef, PackageRequest, PackageTransfer, Properties, ProvisionResponse, ResourceMap,
    SyncServer, SyncState, PROMOTED_VERSION,
};
use pp_proto::{Command, CommandKind, Identity, TransactionMessage, TransactionMode};
use pp_service::keystore::KeyConfig;
use pp_service::testing::RecordingTransport;
use pp_service::transport::Transport;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    _dir: TempDir,
    network: Network,
    transport: Arc<RecordingTransport>,
    node: Identity,
    alice: Identity,
    bob: Identity,
    /// Messages taken from the transport but not yet claimed by a test.
    pending: Vec<(Identity, TransactionMessage)>,
}

fn key(id: Identity, name: &str, authenticators: &[&str]) -> KeyConfig {
    KeyConfig {
        id,
        key: format!("{name}-secret"),
        name: name.into(),
        key_name: None,
        authenticators: authenticators.iter().map(|a| a.to_string()).collect(),
    }
}

impl Harness {
    fn new() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (node, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let config = NetworkConfig {
            id: Uuid::new_v4(),
            listen_addr: None,
            package_root: dir.path().join("packages"),
            chunk_threshold: 16,
            strings: Properties::from([
                ("region".into(), "eu".into()),
                ("motd".into(), "global".into()),
            ]),
            coordinators: vec![key(node, "node-1", &[])],
            clients: vec![key(alice, "alice", &[]), key(bob, "bob", &["readonly"])],
            authenticators: BTreeMap::from([(
                "readonly".into(),
                AuthenticatorConfig::Commands {
                    allow: BTreeSet::from([
                        CommandKind::ClientList,
                        CommandKind::ClientAttachConsole,
                    ]),
                },
            )]),
        };
        let transport = Arc::new(RecordingTransport::default());
        let shared = Arc::clone(&transport) as Arc<dyn Transport>;
        let network = Network::with_transport(&config, shared).unwrap();

        let manifest = PackageManifest {
            id: "web".into(),
            version: "1.0".into(),
            resources: ResourceMap::from([("memory".into(), 512)]),
            attributes: BTreeSet::new(),
            strings: Properties::from([("motd".into(), "package".into())]),
            dependencies: vec![],
            run: None,
        };
        let packages = network.packages();
        packages
            .install_bytes(&manifest, b"a web server archive")
            .unwrap();
        packages.promote(&manifest.package_ref()).unwrap();

        Harness {
            _dir: dir,
            network,
            transport,
            node,
            alice,
            bob,
            pending: vec![],
        }
    }

    fn send(&self, from: Identity, id: &str, mode: TransactionMode, command: Command) -> bool {
        let message = TransactionMessage {
            id: id.into(),
            mode,
            command,
        };
        self.network.receive(message, from)
    }

    /// Waits for the network to send a message matching `pred` to `target`.
    async fn expect(
        &mut self,
        target: Identity,
        pred: impl Fn(&TransactionMessage) -> bool,
    ) -> TransactionMessage {
        for _ in 0..500 {
            self.pending.extend(self.transport.take());
            if let Some(i) = self
                .pending
                .iter()
                .position(|(to, message)| *to == target && pred(message))
            {
                return self.pending.remove(i).1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no matching message for {target}; pending: {:?}", self.pending);
    }

    async fn sync(&mut self, servers: Vec<SyncServer>) {
        let mut events = self.network.subscribe();
        let state = SyncState {
            name: "node-1".into(),
            resources: ResourceMap::from([("memory".into(), 1024)]),
            attributes: BTreeSet::new(),
            enabled: true,
            servers,
        };
        assert!(self.send(self.node, "node-sync", TransactionMode::Single, Command::Sync(state)));
        // The registry is updated in the background.
        let enabled = async {
            loop {
                match events.recv().await {
                    Ok(FleetEvent::CoordinatorEnabled(uuid)) if uuid == self.node => break,
                    Ok(_) => {}
                    Err(error) => panic!("event stream failed: {error}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), enabled)
            .await
            .expect("sync never applied");
    }
}

fn is(kind: CommandKind) -> impl Fn(&TransactionMessage) -> bool {
    move |message| message.command.kind() == kind
}

#[tokio::test]
async fn test_client_provision_end_to_end() {
    let mut h = Harness::new();
    h.sync(vec![]).await;

    let request = ClientProvision {
        package: PackageRef::new("web", PROMOTED_VERSION),
        name: Some("www".into()),
        properties: Properties::from([("region".into(), "us".into())]),
        coordinator: None,
    };
    assert!(h.send(h.alice, "alice-1", TransactionMode::Create, Command::ClientProvision(request)));

    let provision = h.expect(h.node, is(CommandKind::Provision)).await;
    assert_eq!(provision.mode, TransactionMode::Create);
    let Command::Provision(provision_cmd) = &provision.command else {
        unreachable!()
    };
    assert_eq!(provision_cmd.package, PackageRef::new("web", "1.0"));
    assert_eq!(provision_cmd.name, "www");
    assert_eq!(provision_cmd.properties["server_name"], "www");
    assert_eq!(provision_cmd.properties["region"], "us");
    assert_eq!(provision_cmd.properties["motd"], "global");
    let server = provision_cmd.server;
    assert!(!h.network.registry().server(&h.node, &server).unwrap().active);

    let response = ProvisionResponse {
        server,
        ok: true,
        message: "provisioned".into(),
    };
    assert!(h.send(h.node, &provision.id, TransactionMode::Complete, Command::ProvisionResponse(response)));

    let reply = h.expect(h.alice, is(CommandKind::ClientProvisionResponse)).await;
    assert_eq!(reply.id, "alice-1");
    assert_eq!(reply.mode, TransactionMode::Complete);
    let Command::ClientProvisionResponse(reply) = reply.command else {
        unreachable!()
    };
    assert!(reply.ok);
    assert_eq!(reply.coordinator, Some(h.node));
    assert_eq!(reply.server, Some(server));
    assert!(h.network.registry().server(&h.node, &server).unwrap().active);
}

#[tokio::test]
async fn test_client_provision_without_capacity() {
    let mut h = Harness::new();
    // No sync yet: the coordinator is registered but disabled.
    let request = ClientProvision {
        package: PackageRef::new("web", "1.0"),
        name: None,
        properties: Properties::new(),
        coordinator: None,
    };
    assert!(h.send(h.alice, "alice-1", TransactionMode::Create, Command::ClientProvision(request)));
    let reply = h.expect(h.alice, is(CommandKind::ClientProvisionResponse)).await;
    let Command::ClientProvisionResponse(reply) = reply.command else {
        unreachable!()
    };
    assert!(!reply.ok);
    assert_eq!(reply.server, None);
}

#[tokio::test]
async fn test_two_clients_share_console_output() {
    let mut h = Harness::new();
    let server = Uuid::new_v4();
    h.sync(vec![SyncServer {
        uuid: server,
        name: "www".into(),
        package: PackageRef::new("web", "1.0"),
        properties: Properties::new(),
        active: true,
    }])
    .await;

    let mut consoles = vec![];
    for (client, id) in [(h.alice, "alice-attach"), (h.bob, "bob-attach")] {
        let request = ClientAttachConsole {
            coordinator: h.node,
            server,
        };
        assert!(h.send(client, id, TransactionMode::Create, Command::ClientAttachConsole(request)));
        let reply = h.expect(client, is(CommandKind::ClientConsoleAttached)).await;
        let Command::ClientConsoleAttached(reply) = reply.command else {
            unreachable!()
        };
        assert!(reply.ok);
        let console = reply.console.unwrap();
        let attach = h.expect(h.node, is(CommandKind::AttachConsole)).await;
        assert!(matches!(&attach.command, Command::AttachConsole(a) if a.console == console));
        consoles.push((client, console));
    }
    assert_ne!(consoles[0].1, consoles[1].1);

    for (_, console) in &consoles {
        let line = ConsoleMessage {
            console: console.clone(),
            line: "listening on :8080".into(),
        };
        assert!(h.send(h.node, "node-out", TransactionMode::Single, Command::ConsoleMessage(line)));
    }
    for (client, console) in &consoles {
        let output = h.expect(*client, is(CommandKind::ConsoleMessage)).await;
        assert_eq!(
            output.command,
            Command::ConsoleMessage(ConsoleMessage {
                console: console.clone(),
                line: "listening on :8080".into(),
            })
        );
    }
}

#[tokio::test]
async fn test_access_denied() {
    let mut h = Harness::new();

    // Bob's policy does not grant shutdowns.
    let shutdown = Command::ClientShutdown(pp_proto::command::ClientShutdown {
        coordinator: h.node,
    });
    assert!(!h.send(h.bob, "bob-1", TransactionMode::Create, shutdown));
    let reply = h.expect(h.bob, is(CommandKind::AccessDenied)).await;
    assert_eq!(reply.id, "bob-1");
    assert_eq!(
        reply.command,
        Command::AccessDenied(AccessDenied {
            command: CommandKind::ClientShutdown
        })
    );
    assert!(h.network.registry().get(&h.node).is_some());

    // Coordinators may not use the client surface.
    assert!(!h.send(h.node, "node-1", TransactionMode::Create, Command::ClientList));
    h.expect(h.node, is(CommandKind::AccessDenied)).await;

    // But Bob may list the fleet.
    assert!(h.send(h.bob, "bob-2", TransactionMode::Create, Command::ClientList));
    let list = h.expect(h.bob, is(CommandKind::ClientCoordinatorList)).await;
    let Command::ClientCoordinatorList(list) = list.command else {
        unreachable!()
    };
    assert_eq!(list.coordinators.len(), 1);
    assert_eq!(list.coordinators[0].uuid, h.node);
}

#[tokio::test]
async fn test_package_request_is_chunked() {
    let mut h = Harness::new();
    let request = PackageRequest {
        package: PackageRef::new("web", PROMOTED_VERSION),
    };
    assert!(h.send(h.node, "node-pkg", TransactionMode::Create, Command::PackageRequest(request)));

    let mut data = vec![];
    loop {
        let message = h.expect(h.node, |m| m.id == "node-pkg").await;
        let Command::PackageResponse(response) = message.command else {
            unreachable!()
        };
        match response.transfer {
            PackageTransfer::Chunk { data: chunk, .. } => {
                assert_eq!(message.mode, TransactionMode::Continue);
                data.extend(chunk);
            }
            PackageTransfer::EndOfFile {
                manifest,
                chunk_count,
                checksum,
            } => {
                assert_eq!(message.mode, TransactionMode::Complete);
                assert_eq!(manifest.version, "1.0");
                assert_eq!(chunk_count, 1);
                assert_eq!(checksum, pp_crypto::checksum(&data));
                break;
            }
            other => panic!("unexpected transfer {other:?}"),
        }
    }
    assert_eq!(data, b"a web server archive");

    let request = PackageRequest {
        package: PackageRef::new("nope", "1.0"),
    };
    assert!(h.send(h.node, "node-pkg-2", TransactionMode::Create, Command::PackageRequest(request)));
    let message = h.expect(h.node, |m| m.id == "node-pkg-2").await;
    assert!(matches!(
        message.command,
        Command::PackageResponse(r) if r.transfer == PackageTransfer::Missing
    ));
}

#[tokio::test]
async fn test_deprovision_marks_inactive() {
    let mut h = Harness::new();
    let server = Uuid::new_v4();
    h.sync(vec![SyncServer {
        uuid: server,
        name: "www".into(),
        package: PackageRef::new("web", "1.0"),
        properties: Properties::new(),
        active: true,
    }])
    .await;

    assert!(h.network.deprovision(h.node, server, false));
    assert!(!h.network.registry().server(&h.node, &server).unwrap().active);
    let message = h.expect(h.node, is(CommandKind::Deprovision)).await;
    assert_eq!(message.mode, TransactionMode::Single);
    assert!(!h.network.deprovision(h.node, Uuid::new_v4(), false));

    assert!(h.network.shutdown_coordinator(h.node));
    assert!(!h.network.registry().get(&h.node).unwrap().enabled);
    h.expect(h.node, is(CommandKind::Shutdown)).await;
}

#[tokio::test]
async fn test_sync_reports_fleet_changes() {
    let mut h = Harness::new();
    let (kept, gone) = (Uuid::new_v4(), Uuid::new_v4());
    let server = |uuid| SyncServer {
        uuid,
        name: "www".into(),
        package: PackageRef::new("web", "1.0"),
        properties: Properties::new(),
        active: true,
    };
    h.sync(vec![server(kept), server(gone)]).await;
    assert_eq!(
        h.network.registry().server(&h.node, &kept).unwrap().resources,
        ResourceMap::from([("memory".into(), 512)])
    );

    let mut events = h.network.subscribe();
    let state = SyncState {
        name: "node-1".into(),
        resources: ResourceMap::from([("memory".into(), 1024)]),
        attributes: BTreeSet::new(),
        enabled: false,
        servers: vec![server(kept)],
    };
    assert!(h.send(h.node, "node-sync-2", TransactionMode::Single, Command::Sync(state)));
    let mut received = vec![];
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(event);
    }
    assert_eq!(
        received,
        vec![
            FleetEvent::ServerShutdown {
                coordinator: h.node,
                server: gone,
            },
            FleetEvent::CoordinatorDisabled(h.node),
        ]
    );
}
