// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! ID generation utilities.

use rand::distributions::{Alphanumeric, DistString};

/// The length of the random component of a [`PrefixedIdGen`] ID.
pub const RANDOM_SUFFIX_LEN: usize = 16;

/// Returns a random alphanumeric string of the given length.
pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Generates string IDs of the form `<prefix>-<random>`.
///
/// Every participant in a PlayPen network uses its own identity as the
/// prefix, which makes the generated IDs globally unique without any
/// coordination between participants.
#[derive(Debug, Clone)]
pub struct PrefixedIdGen {
    prefix: String,
}

impl PrefixedIdGen {
    /// Creates a generator for the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        PrefixedIdGen {
            prefix: prefix.into(),
        }
    }

    /// Returns the prefix of generated IDs.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocates a fresh ID.
    pub fn allocate_id(&self) -> String {
        format!("{}-{}", self.prefix, random_string(RANDOM_SUFFIX_LEN))
    }
}
