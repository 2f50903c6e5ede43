// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handlers for the commands the network coordinator sends.

use pp_proto::command::ProvisionResponse;
use pp_proto::{Command, CommandKind, TransactionMode};
use pp_service::dispatch::{HandlerTable, Incoming};
use tracing::{debug, info, warn};

use crate::Node;

pub(crate) fn handler_table() -> HandlerTable<Node> {
    HandlerTable::new()
        .register(CommandKind::Noop, handle_noop)
        .register(CommandKind::Ack, handle_ack)
        .register(CommandKind::AccessDenied, handle_access_denied)
        .register(CommandKind::Provision, handle_provision)
        .register(CommandKind::Deprovision, handle_deprovision)
        .register(CommandKind::Shutdown, handle_shutdown)
        .register(CommandKind::FreezeServer, handle_freeze_server)
        .register(CommandKind::SendInput, handle_send_input)
        .register(CommandKind::AttachConsole, handle_attach_console)
        .register(CommandKind::DetachConsole, handle_detach_console)
        .register(CommandKind::PackageResponse, handle_transfer_reply)
        .register(CommandKind::PackageChecksumResponse, handle_transfer_reply)
}

fn handle_noop(_: &Node, _: Incoming) -> bool {
    true
}

fn handle_ack(_: &Node, incoming: Incoming) -> bool {
    let Command::Ack(ack) = incoming.command else {
        return false;
    };
    debug!(ok = ack.ok, message = %ack.message, "local: ack");
    true
}

fn handle_access_denied(_: &Node, incoming: Incoming) -> bool {
    let Command::AccessDenied(denied) = incoming.command else {
        return false;
    };
    warn!(command = %denied.command, "local: network coordinator denied access");
    true
}

/// Replies to package requests are consumed by the transaction that asked.
fn handle_transfer_reply(_: &Node, incoming: Incoming) -> bool {
    incoming.transaction.is_some()
}

fn handle_provision(node: &Node, incoming: Incoming) -> bool {
    let (Command::Provision(request), Some(transaction)) =
        (incoming.command, incoming.transaction)
    else {
        return false;
    };
    let node = node.clone();
    let name = format!("local::provision:{}", request.server);
    pp_ore::task::spawn(move || name, async move {
        let server = request.server;
        let response = match node.provision(request).await {
            Ok(()) => ProvisionResponse {
                server,
                ok: true,
                message: "provisioned".into(),
            },
            Err(error) => ProvisionResponse {
                server,
                ok: false,
                message: error.to_string(),
            },
        };
        let sent = node.transactions().respond(
            &transaction,
            TransactionMode::Complete,
            Command::ProvisionResponse(response),
        );
        if !sent {
            warn!(%server, "local: provision response not sent");
        }
    });
    true
}

fn handle_deprovision(node: &Node, incoming: Incoming) -> bool {
    let Command::Deprovision(request) = incoming.command else {
        return false;
    };
    if node.server(&request.server).is_none() {
        info!(server = %request.server, "local: deprovision of unknown server");
        return false;
    }
    let node = node.clone();
    let name = format!("local::deprovision:{}", request.server);
    pp_ore::task::spawn(move || name, async move {
        if let Err(error) = node.deprovision(request.server, request.force).await {
            warn!(server = %request.server, "local: deprovision failed: {error}");
        }
    });
    true
}

fn handle_shutdown(node: &Node, _: Incoming) -> bool {
    let node = node.clone();
    pp_ore::task::spawn(|| "local::shutdown", async move { node.shutdown().await });
    true
}

fn handle_freeze_server(node: &Node, incoming: Incoming) -> bool {
    let Command::FreezeServer(request) = incoming.command else {
        return false;
    };
    if node.server(&request.server).is_none() {
        info!(server = %request.server, "local: freeze of unknown server");
        return false;
    }
    let node = node.clone();
    let name = format!("local::freeze:{}", request.server);
    pp_ore::task::spawn(move || name, async move {
        if let Err(error) = node.freeze(request.server).await {
            warn!(server = %request.server, "local: freeze failed: {error}");
        }
    });
    true
}

fn handle_send_input(node: &Node, incoming: Incoming) -> bool {
    let Command::SendInput(request) = incoming.command else {
        return false;
    };
    let node = node.clone();
    let name = format!("local::send_input:{}", request.server);
    pp_ore::task::spawn(move || name, async move {
        if let Err(error) = node.send_input(request.server, &request.input).await {
            warn!(server = %request.server, "local: input not delivered: {error}");
        }
    });
    true
}

fn handle_attach_console(node: &Node, incoming: Incoming) -> bool {
    let Command::AttachConsole(request) = incoming.command else {
        return false;
    };
    node.attach_console(request.server, request.console)
}

fn handle_detach_console(node: &Node, incoming: Incoming) -> bool {
    let Command::DetachConsole(request) = incoming.command else {
        return false;
    };
    node.detach_console(&request.console)
}
