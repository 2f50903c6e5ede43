// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Test doubles for the transport and command processing seams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use pp_proto::{Identity, TransactionMessage};

use crate::dispatch::{CommandProcessor, Incoming};
use crate::transport::Transport;

/// A [`Transport`] that records every message instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Identity, TransactionMessage)>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    /// Makes subsequent sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Removes and returns the recorded messages, oldest first.
    pub fn take(&self) -> Vec<(Identity, TransactionMessage)> {
        std::mem::take(&mut *self.sent.lock().expect("lock poisoned"))
    }
}

impl Transport for RecordingTransport {
    fn send(&self, target: Identity, message: TransactionMessage) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().expect("lock poisoned").push((target, message));
        true
    }
}

/// A [`CommandProcessor`] that records every command it is handed and
/// accepts it.
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    received: Mutex<Vec<Incoming>>,
}

impl RecordingProcessor {
    /// Removes and returns the recorded commands, oldest first.
    pub fn take(&self) -> Vec<Incoming> {
        std::mem::take(&mut *self.received.lock().expect("lock poisoned"))
    }
}

impl CommandProcessor for RecordingProcessor {
    fn process(&self, incoming: Incoming) -> bool {
        self.received.lock().expect("lock poisoned").push(incoming);
        true
    }
}
