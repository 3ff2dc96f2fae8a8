// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace and span identifier generation.

/// Generates a random 64-bit identifier suitable for trace and span ids.
///
/// Identifiers are nonzero (zero means "no parent" on the wire) and keep the
/// high bit clear so they fit the positive `i64` range the agent expects.
#[must_use]
pub fn generate_id() -> u64 {
    loop {
        let id = fastrand::u64(..) >> 1;
        if id != 0 {
            return id;
        }
    }
}
