// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command handlers.
//!
//! Handlers run on the connection's read path and must not block. Anything
//! touching the disk or waiting on another participant is moved to a task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use pp_proto::command::{
    Ack, AttachConsole, ClientConsoleAttached, ClientCoordinatorCreated, ClientCoordinatorList,
    ClientProvisionResponse, DetachConsole, PackageChecksumResponse, PackageRef,
    PackageResponse, PackageTransfer, ResourceMap,
};
use pp_proto::{Command, CommandKind, TransactionMode};
use pp_service::dispatch::{HandlerTable, Incoming};
use pp_service::packages::PackageResolver;
use pp_service::transfer::{send_package, CHUNK_SIZE};
use tracing::{debug, info, warn};

use crate::Network;

pub(crate) fn handler_table() -> HandlerTable<Network> {
    HandlerTable::new()
        .register(CommandKind::Noop, handle_noop)
        .register(CommandKind::Ack, handle_ack)
        .register(CommandKind::Sync, handle_sync)
        .register(CommandKind::ProvisionResponse, handle_provision_response)
        .register(CommandKind::ServerShutdown, handle_server_shutdown)
        .register(CommandKind::PackageRequest, handle_package_request)
        .register(
            CommandKind::PackageChecksumRequest,
            handle_package_checksum_request,
        )
        .register(CommandKind::ConsoleMessage, handle_console_message)
        .register(CommandKind::DetachConsole, handle_detach_console)
        .register(CommandKind::ClientProvision, handle_client_provision)
        .register(CommandKind::ClientDeprovision, handle_client_deprovision)
        .register(CommandKind::ClientShutdown, handle_client_shutdown)
        .register(CommandKind::ClientPromote, handle_client_promote)
        .register(
            CommandKind::ClientCreateCoordinator,
            handle_client_create_coordinator,
        )
        .register(CommandKind::ClientAttachConsole, handle_client_attach_console)
        .register(CommandKind::ClientDetachConsole, handle_client_detach_console)
        .register(CommandKind::ClientSendInput, handle_client_send_input)
        .register(CommandKind::ClientFreezeServer, handle_client_freeze_server)
        .register(CommandKind::ClientRestrict, handle_client_restrict)
        .register(CommandKind::ClientList, handle_client_list)
}

fn ack(ok: bool, message: &str) -> Command {
    if ok {
        Command::Ack(Ack::ok(message))
    } else {
        Command::Ack(Ack::failed(message))
    }
}

fn handle_noop(_: &Network, _: Incoming) -> bool {
    true
}

fn handle_ack(_: &Network, incoming: Incoming) -> bool {
    let Command::Ack(ack) = incoming.command else {
        return false;
    };
    debug!(from = %incoming.from, ok = ack.ok, message = %ack.message, "network: ack");
    true
}

fn handle_sync(network: &Network, incoming: Incoming) -> bool {
    let Command::Sync(state) = incoming.command else {
        return false;
    };
    let network = network.clone();
    let coordinator = incoming.from;
    pp_ore::task::spawn(|| "network::sync", async move {
        // Server resource requirements come from package manifests on disk.
        let packages: BTreeSet<PackageRef> =
            state.servers.iter().map(|s| s.package.clone()).collect();
        let store = Arc::clone(network.packages());
        let resolved = pp_ore::task::spawn_blocking(
            || "network::sync_requirements",
            move || {
                packages
                    .into_iter()
                    .map(|package| {
                        let resources = store
                            .resolve(&package)
                            .map(|handle| handle.manifest.resources)
                            .unwrap_or_default();
                        (package, resources)
                    })
                    .collect::<BTreeMap<PackageRef, ResourceMap>>()
            },
        )
        .await;
        let requirements = match resolved {
            Ok(requirements) => requirements,
            Err(error) => {
                warn!(%coordinator, "network: sync aborted: {error}");
                return;
            }
        };

        let events = network.registry().sync(&coordinator, state, |package| {
            requirements.get(package).cloned().unwrap_or_default()
        });
        for event in events {
            network.publish(event);
        }
    });
    true
}

fn handle_provision_response(network: &Network, incoming: Incoming) -> bool {
    let Command::ProvisionResponse(response) = incoming.command else {
        return false;
    };
    info!(
        coordinator = %incoming.from,
        server = %response.server,
        ok = response.ok,
        message = %response.message,
        "network: provision response",
    );
    let event = network.registry().provision_response(
        &incoming.from,
        &response.server,
        response.ok,
        &response.message,
    );
    match event {
        Some(event) => {
            network.publish(event);
            true
        }
        None => false,
    }
}

fn handle_server_shutdown(network: &Network, incoming: Incoming) -> bool {
    let Command::ServerShutdown(shutdown) = incoming.command else {
        return false;
    };
    let event = network
        .registry()
        .remove_server(&incoming.from, &shutdown.server);
    match event {
        Some(event) => {
            network.publish(event);
            true
        }
        None => false,
    }
}

fn handle_package_request(network: &Network, incoming: Incoming) -> bool {
    let (Command::PackageRequest(request), Some(transaction)) =
        (incoming.command, incoming.transaction)
    else {
        return false;
    };
    let network = network.clone();
    let name = format!("network::package_request:{}", request.package);
    pp_ore::task::spawn_blocking(
        move || name,
        move || {
            let transactions = network.transactions();
            let Some(handle) = network.packages().resolve(&request.package) else {
                info!(package = %request.package, "network: requested package is unknown");
                let command = Command::PackageResponse(PackageResponse {
                    package: request.package,
                    transfer: PackageTransfer::Missing,
                });
                transactions.respond(&transaction, TransactionMode::Complete, command);
                return;
            };
            let data = match std::fs::read(&handle.archive) {
                Ok(data) => data,
                Err(error) => {
                    warn!(package = %request.package, "network: cannot read package: {error}");
                    transactions.cancel(&transaction.id, true);
                    return;
                }
            };
            let sent = send_package(
                transactions,
                &transaction,
                &handle.manifest,
                &data,
                network.inner.chunk_threshold,
                CHUNK_SIZE,
            );
            if !sent {
                warn!(package = %request.package, "network: package transfer failed");
            }
        },
    );
    true
}

fn handle_package_checksum_request(network: &Network, incoming: Incoming) -> bool {
    let (Command::PackageChecksumRequest(request), Some(transaction)) =
        (incoming.command, incoming.transaction)
    else {
        return false;
    };
    let network = network.clone();
    let name = format!("network::checksum_request:{}", request.package);
    pp_ore::task::spawn_blocking(
        move || name,
        move || {
            let packages = network.packages();
            let (package, checksum) = match packages.resolve(&request.package) {
                Some(handle) => match packages.checksum(&handle) {
                    Ok(checksum) => (handle.package_ref(), Some(checksum)),
                    Err(error) => {
                        warn!(package = %request.package, "network: cannot checksum package: {error}");
                        (request.package, None)
                    }
                },
                None => (request.package, None),
            };
            let command =
                Command::PackageChecksumResponse(PackageChecksumResponse { package, checksum });
            network
                .transactions()
                .respond(&transaction, TransactionMode::Complete, command);
        },
    );
    true
}

fn handle_console_message(network: &Network, incoming: Incoming) -> bool {
    let Command::ConsoleMessage(message) = incoming.command else {
        return false;
    };
    let client = match network.consoles().get(&message.console) {
        Some(info) if info.coordinator == incoming.from => info.attached,
        _ => {
            debug!(console = %message.console, "network: output for unknown console");
            return false;
        }
    };
    network.send_single(Command::ConsoleMessage(message), client)
}

fn handle_detach_console(network: &Network, incoming: Incoming) -> bool {
    let Command::DetachConsole(detach) = incoming.command else {
        return false;
    };
    match network.close_console(&detach.console, incoming.from) {
        Some(info) => network.send_single(Command::DetachConsole(detach), info.attached),
        None => false,
    }
}

fn handle_client_provision(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientProvision(request) = incoming.command else {
        return false;
    };
    let network = network.clone();
    let client = incoming.from;
    let transaction = incoming.transaction;
    pp_ore::task::spawn(|| "network::client_provision", async move {
        let store = Arc::clone(network.packages());
        let package = request.package.clone();
        let resolved =
            pp_ore::task::spawn_blocking(|| "network::resolve_package", move || store.resolve(&package))
                .await
                .ok()
                .flatten();

        let response = match resolved {
            None => ClientProvisionResponse {
                ok: false,
                coordinator: None,
                server: None,
                message: format!("unknown package {}", request.package),
            },
            Some(handle) => {
                let provisioned = network.provision_resolved(
                    &handle,
                    request.name,
                    request.properties,
                    request.coordinator,
                );
                match provisioned {
                    Err(error) => ClientProvisionResponse {
                        ok: false,
                        coordinator: None,
                        server: None,
                        message: error.to_string(),
                    },
                    Ok(mut provisioned) => {
                        let mut outcome = None;
                        while let Some(message) = provisioned.responses.recv().await {
                            if let Command::ProvisionResponse(response) = message.command {
                                outcome = Some(response);
                            }
                        }
                        let (ok, message) = match outcome {
                            Some(response) => (response.ok, response.message),
                            None => (false, "provisioning timed out".to_string()),
                        };
                        ClientProvisionResponse {
                            ok,
                            coordinator: Some(provisioned.coordinator),
                            server: Some(provisioned.server),
                            message,
                        }
                    }
                }
            }
        };
        network.reply_to(
            client,
            transaction.as_ref(),
            Command::ClientProvisionResponse(response),
        );
    });
    true
}

fn handle_client_deprovision(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientDeprovision(request) = &incoming.command else {
        return false;
    };
    let ok = network.deprovision(request.coordinator, request.server, request.force);
    network.reply(&incoming, ack(ok, "deprovision requested"));
    ok
}

fn handle_client_shutdown(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientShutdown(request) = &incoming.command else {
        return false;
    };
    let ok = network.shutdown_coordinator(request.coordinator);
    network.reply(&incoming, ack(ok, "shutdown requested"));
    ok
}

fn handle_client_promote(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientPromote(request) = incoming.command else {
        return false;
    };
    let network = network.clone();
    let client = incoming.from;
    let transaction = incoming.transaction;
    let name = format!("network::promote:{}", request.package);
    pp_ore::task::spawn_blocking(
        move || name,
        move || {
            let reply = match network.promote(&request.package) {
                Ok(()) => Ack::ok(format!("promoted {}", request.package)),
                Err(error) => Ack::failed(error.to_string()),
            };
            network.reply_to(client, transaction.as_ref(), Command::Ack(reply));
        },
    );
    true
}

fn handle_client_create_coordinator(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientCreateCoordinator(request) = &incoming.command else {
        return false;
    };
    match network.create_coordinator(request.name.clone(), request.key_name.clone()) {
        Ok((uuid, key)) => network.reply(
            &incoming,
            Command::ClientCoordinatorCreated(ClientCoordinatorCreated { uuid, key }),
        ),
        Err(error) => {
            network.reply(&incoming, ack(false, &error.to_string()));
            false
        }
    }
}

fn handle_client_attach_console(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientAttachConsole(request) = &incoming.command else {
        return false;
    };
    let console = match network.open_console(request.coordinator, request.server, incoming.from) {
        Ok(console) => console,
        Err(error) => {
            let response = ClientConsoleAttached {
                ok: false,
                console: None,
                message: error.to_string(),
            };
            network.reply(&incoming, Command::ClientConsoleAttached(response));
            return false;
        }
    };

    // The client learns the session ID before the coordinator is asked to
    // attach.
    let response = ClientConsoleAttached {
        ok: true,
        console: Some(console.clone()),
        message: "attached".into(),
    };
    network.reply(&incoming, Command::ClientConsoleAttached(response));

    let attach = Command::AttachConsole(AttachConsole {
        server: request.server,
        console: console.clone(),
    });
    if !network.send_single(attach, request.coordinator) {
        network.close_console(&console, incoming.from);
        network.send_single(
            Command::DetachConsole(DetachConsole { console }),
            incoming.from,
        );
        return false;
    }
    true
}

fn handle_client_detach_console(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientDetachConsole(request) = &incoming.command else {
        return false;
    };
    let ok = match network.close_console(&request.console, incoming.from) {
        Some(info) => network.send_single(
            Command::DetachConsole(DetachConsole {
                console: request.console.clone(),
            }),
            info.coordinator,
        ),
        None => false,
    };
    network.reply(&incoming, ack(ok, "detached"));
    ok
}

fn handle_client_send_input(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientSendInput(request) = &incoming.command else {
        return false;
    };
    let ok = network.send_input(request.coordinator, request.server, request.input.clone());
    network.reply(&incoming, ack(ok, "input sent"));
    ok
}

fn handle_client_freeze_server(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientFreezeServer(request) = &incoming.command else {
        return false;
    };
    let ok = network.freeze_server(request.coordinator, request.server);
    network.reply(&incoming, ack(ok, "freeze requested"));
    ok
}

fn handle_client_restrict(network: &Network, incoming: Incoming) -> bool {
    let Command::ClientRestrict(request) = &incoming.command else {
        return false;
    };
    let ok = network.restrict(request.coordinator, request.restricted);
    network.reply(&incoming, ack(ok, "restriction updated"));
    ok
}

fn handle_client_list(network: &Network, incoming: Incoming) -> bool {
    let coordinators = network.snapshot();
    network.reply(
        &incoming,
        Command::ClientCoordinatorList(ClientCoordinatorList { coordinators }),
    )
}
