// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transactions over a real TCP connection.

use std::sync::Arc;

use pp_proto::command::Ack;
use pp_proto::{Command, TransactionMode};
use pp_service::keystore::{Credentials, KeyConfig, Keystore};
use pp_service::testing::RecordingProcessor;
use pp_service::transaction::TransactionManager;
use pp_service::transport::{Connection, ConnectionRegistry, Transport, Upstream};
use tokio::net::TcpListener;
use uuid::Uuid;

#[tokio::test]
async fn test_request_response_over_tcp() {
    let node = Uuid::new_v4();
    let keystore = Keystore::from_configs(
        &[KeyConfig {
            id: node,
            key: "hunter2".into(),
            name: "node-1".into(),
            key_name: None,
            authenticators: vec![],
        }],
        &[],
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::accept(stream, &keystore).await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(conn.handle());
        let shared = Arc::clone(&registry) as Arc<dyn Transport>;
        let manager = TransactionManager::new(Uuid::new_v4(), shared);
        let processor = RecordingProcessor::default();

        let message = conn.recv().await.unwrap();
        assert_eq!(message.mode, TransactionMode::Create);
        assert!(manager.receive(message, conn.identity(), &processor));
        let incoming = processor.take().remove(0);
        assert_eq!(incoming.from, node);
        assert_eq!(incoming.command, Command::Noop);

        let transaction = incoming.transaction.unwrap();
        assert!(manager.respond(&transaction, TransactionMode::Complete, Command::Ack(Ack::ok("pong"))));
        // Keep the connection open until the client hangs up.
        let _ = conn.recv().await;
    });

    let credentials = Credentials::new(node, "hunter2").unwrap();
    let mut conn = Connection::connect(&addr, credentials).await.unwrap();
    let upstream = Arc::new(Upstream::new());
    upstream.set(conn.handle());
    let shared = Arc::clone(&upstream) as Arc<dyn Transport>;
    let manager = TransactionManager::new(node, shared);
    let processor = RecordingProcessor::default();

    let (info, mut replies) = manager.request(Command::Noop, node).unwrap();
    let message = conn.recv().await.unwrap();
    assert_eq!(message.id, info.id);
    assert!(manager.receive(message, node, &processor));
    let reply = replies.recv().await.unwrap();
    assert_eq!(reply.command, Command::Ack(Ack::ok("pong")));
    assert!(replies.recv().await.is_none());
    assert!(manager.is_empty());

    drop(conn);
    server.await.unwrap();
}
