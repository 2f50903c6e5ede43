// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The accept loop.

use std::net::SocketAddr;

use pp_service::transport::Connection;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::Network;

/// Serves connections from `listener` until accepting fails.
pub async fn serve(network: Network, listener: TcpListener) -> Result<(), anyhow::Error> {
    info!(address = %listener.local_addr()?, "network: listening for connections");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "network: accepted connection");

        let network = network.clone();
        pp_ore::task::spawn(|| format!("network::connection:{peer}"), async move {
            if let Err(error) = serve_connection(network, stream, peer).await {
                info!(%peer, "network: connection closed: {error:#}");
            }
        });
    }
}

/// Serves a single connection.
///
/// Returns once the connection fails; it never ends cleanly.
async fn serve_connection(
    network: Network,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), anyhow::Error> {
    let mut conn = match Connection::accept(stream, network.keystore()).await {
        Ok(conn) => conn,
        Err(error) => {
            warn!(%peer, "network: rejected connection: {error:#}");
            return Err(error);
        }
    };
    let identity = conn.identity();
    let handle = conn.handle();
    network.connected(handle.clone());

    let result = loop {
        // `Connection::recv` is documented to be cancel safe.
        match conn.recv().await {
            Ok(message) => {
                network.receive(message, identity);
            }
            Err(error) => break error,
        }
    };

    network.disconnected(&handle);
    Err(result)
}
