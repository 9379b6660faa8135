// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Environment-driven configuration.

/// Whether verbose tracing was requested via `PLDM_DEBUG=1`.
pub fn debug_enabled() -> bool {
    std::env::var("PLDM_DEBUG").as_deref() == Ok("1")
}
