// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client behavior against a scripted network coordinator.

use std::time::Duration;

use pp_client::{Client, ClientError, DEFAULT_REQUEST_TIMEOUT};
use pp_proto::command::{
    AccessDenied, Ack, ClientConsoleAttached, ClientCoordinatorList, ClientProvision,
    ClientProvisionResponse, ConsoleMessage, DetachConsole, PackageRef, Properties,
};
use pp_proto::{Command, CommandKind, TransactionMessage, TransactionMode};
use pp_service::keystore::{Credentials, KeyConfig, KeyEntry, KeyKind, Keystore};
use pp_service::transaction::DEFAULT_TRANSACTION_TIMEOUT;
use pp_service::transport::Connection;
use uuid::Uuid;

/// Connects a client to a scripted peer that plays the network coordinator.
async fn connect(timeout: Duration) -> (Client, Connection) {
    let id = Uuid::new_v4();
    let config = KeyConfig {
        id,
        key: "alice-secret".into(),
        name: "alice".into(),
        key_name: None,
        authenticators: vec![],
    };
    let keystore = Keystore::new();
    keystore.insert(KeyEntry::from_config(KeyKind::Client, &config).unwrap());

    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let accept = tokio::spawn(async move { Connection::accept(theirs, &keystore).await });
    let credentials = Credentials::new(id, "alice-secret").unwrap();
    let connection = Connection::establish(ours, credentials).await.unwrap();
    let client = Client::start(connection, timeout).unwrap();

    let mut peer = accept.await.unwrap().unwrap();
    let first = peer.recv().await.unwrap();
    assert_eq!(first.mode, TransactionMode::Single);
    assert_eq!(first.command, Command::Noop);
    (client, peer)
}

/// Receives the next request and answers it with `reply`.
async fn answer(peer: &mut Connection, kind: CommandKind, reply: Command) {
    let request = peer.recv().await.unwrap();
    assert_eq!(request.mode, TransactionMode::Create);
    assert_eq!(request.command.kind(), kind);
    peer.handle().send(TransactionMessage {
        id: request.id,
        mode: TransactionMode::Complete,
        command: reply,
    });
}

#[tokio::test]
async fn test_request_reply() {
    let (client, mut peer) = connect(Duration::from_secs(10)).await;

    let reply = Command::ClientCoordinatorList(ClientCoordinatorList {
        coordinators: vec![],
    });
    let (list, ()) = tokio::join!(
        client.list(),
        answer(&mut peer, CommandKind::ClientList, reply)
    );
    assert_eq!(list.unwrap(), vec![]);

    let (restricted, ()) = tokio::join!(
        client.restrict(Uuid::new_v4(), true),
        answer(
            &mut peer,
            CommandKind::ClientRestrict,
            Command::Ack(Ack::ok("restriction updated"))
        )
    );
    restricted.unwrap();
}

#[tokio::test]
async fn test_refusals() {
    let (client, mut peer) = connect(Duration::from_secs(10)).await;

    let (result, ()) = tokio::join!(
        client.deprovision(Uuid::new_v4(), Uuid::new_v4(), false),
        answer(
            &mut peer,
            CommandKind::ClientDeprovision,
            Command::Ack(Ack::failed("unknown server"))
        )
    );
    assert!(matches!(result, Err(ClientError::Rejected(m)) if m == "unknown server"));

    let denied = Command::AccessDenied(AccessDenied {
        command: CommandKind::ClientShutdown,
    });
    let (result, ()) = tokio::join!(
        client.shutdown(Uuid::new_v4()),
        answer(&mut peer, CommandKind::ClientShutdown, denied)
    );
    assert!(matches!(
        result,
        Err(ClientError::AccessDenied(CommandKind::ClientShutdown))
    ));

    let (result, ()) = tokio::join!(
        client.list(),
        answer(&mut peer, CommandKind::ClientList, Command::Ack(Ack::ok("?")))
    );
    assert!(matches!(
        result,
        Err(ClientError::UnexpectedReply(CommandKind::Ack))
    ));
}

#[tokio::test]
async fn test_console_lines_following_attach_are_kept() {
    let (client, mut peer) = connect(Duration::from_secs(10)).await;

    let script = async {
        let request = peer.recv().await.unwrap();
        assert_eq!(request.command.kind(), CommandKind::ClientAttachConsole);
        let handle = peer.handle();
        // The reply and the first lines are written back to back.
        let attached = Command::ClientConsoleAttached(ClientConsoleAttached {
            ok: true,
            console: Some("console-1".into()),
            message: "attached".into(),
        });
        handle.send(TransactionMessage {
            id: request.id,
            mode: TransactionMode::Complete,
            command: attached,
        });
        for line in ["one", "two"] {
            handle.send(TransactionMessage {
                id: format!("net-{line}"),
                mode: TransactionMode::Single,
                command: Command::ConsoleMessage(ConsoleMessage {
                    console: "console-1".into(),
                    line: line.into(),
                }),
            });
        }
        handle.send(TransactionMessage {
            id: "net-detach".into(),
            mode: TransactionMode::Single,
            command: Command::DetachConsole(DetachConsole {
                console: "console-1".into(),
            }),
        });
    };
    let (console, ()) = tokio::join!(
        client.attach_console(Uuid::new_v4(), Uuid::new_v4()),
        script
    );
    let mut console = console.unwrap();
    assert_eq!(console.id(), "console-1");
    assert_eq!(console.next_line().await.as_deref(), Some("one"));
    assert_eq!(console.next_line().await.as_deref(), Some("two"));
    assert_eq!(console.next_line().await, None);
}

#[tokio::test]
async fn test_failed_attach() {
    let (client, mut peer) = connect(Duration::from_secs(10)).await;

    let reply = Command::ClientConsoleAttached(ClientConsoleAttached {
        ok: false,
        console: None,
        message: "unknown server".into(),
    });
    let (result, ()) = tokio::join!(
        client.attach_console(Uuid::new_v4(), Uuid::new_v4()),
        answer(&mut peer, CommandKind::ClientAttachConsole, reply)
    );
    assert!(matches!(result, Err(ClientError::Rejected(m)) if m == "unknown server"));
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let (client, mut peer) = connect(Duration::from_millis(200)).await;

    let (result, request) = tokio::join!(client.list(), peer.recv());
    assert_eq!(request.unwrap().command, Command::ClientList);
    assert!(matches!(result, Err(ClientError::Timeout)));
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_provision_outlasts_network_placement() {
    let (client, mut peer) = connect(DEFAULT_REQUEST_TIMEOUT).await;

    let script = async {
        let request = peer.recv().await.unwrap();
        assert_eq!(request.command.kind(), CommandKind::ClientProvision);
        // The network coordinator reports its own placement timeout.
        tokio::time::sleep(DEFAULT_TRANSACTION_TIMEOUT + Duration::from_secs(1)).await;
        let reply = Command::ClientProvisionResponse(ClientProvisionResponse {
            ok: false,
            coordinator: None,
            server: None,
            message: "provisioning timed out".into(),
        });
        peer.handle().send(TransactionMessage {
            id: request.id,
            mode: TransactionMode::Complete,
            command: reply,
        });
    };
    let (result, ()) = tokio::join!(
        client.provision(ClientProvision {
            package: PackageRef::new("web", "1.0"),
            name: None,
            properties: Properties::new(),
            coordinator: None,
        }),
        script
    );
    assert!(matches!(result, Err(ClientError::Rejected(m)) if m == "provisioning timed out"));
}

#[tokio::test]
async fn test_lost_connection_fails_pending_requests() {
    let (client, mut peer) = connect(Duration::from_secs(60)).await;

    let script = async move {
        let request = peer.recv().await.unwrap();
        assert_eq!(request.command, Command::ClientList);
        drop(peer);
    };
    let (result, ()) = tokio::join!(client.list(), script);
    assert!(matches!(result, Err(ClientError::Disconnected)));
    assert!(!client.is_connected());
    assert!(matches!(
        client.promote(PackageRef::new("web", "1.0")).await,
        Err(ClientError::Disconnected)
    ));
}
