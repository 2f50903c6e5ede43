// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Common code for PlayPen services.
//!
//! This crate is shared by the network coordinator, local coordinators, and
//! clients. It holds everything that is symmetric across those roles: the
//! keystore, the authenticated connection layer, the transaction manager,
//! command dispatch, the package store, and the chunked package transfer
//! protocol.

pub mod dispatch;
pub mod keystore;
pub mod packages;
pub mod testing;
pub mod transaction;
pub mod transfer;
pub mod transport;
