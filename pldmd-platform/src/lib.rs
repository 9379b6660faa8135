// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM Monitoring and Control support.
 *
 * Copyright (c) 2025 Code Construct
 */
#![forbid(unsafe_code)]

//! PLDM Monitoring & Control (type 2) for a management controller.
//!
//! Covers PDR ingestion (retrieval, repository, parsing, the
//! entity-association tree) and the numeric/state sensor and effecter
//! engines that poll and drive a terminus.

use std::time::Duration;

use thiserror::Error;

pub mod effecter_numeric;
pub mod effecter_state;
pub mod entity;
pub mod pdr;
pub mod proto;
pub mod publish;
pub mod retrieval;
pub mod sensor_numeric;
pub mod sensor_state;
pub mod state_sets;
pub mod terminus;

#[cfg(test)]
pub(crate) mod sensor_test;

/// PLDM type 2, Monitoring and Control
pub const PLDM_TYPE_PLATFORM: u8 = 2;

/// Timeout for a single platform command exchange.
pub const CMD_TIMEOUT: Duration = Duration::from_millis(100);
/// Retry budget for platform commands.
pub const CMD_RETRIES: usize = 3;

/// Errors from the effecter set paths.
///
/// Out-of-range and unsupported-state refusals happen before any transport
/// request is issued.
#[derive(Error, Debug)]
pub enum SetError {
    /// Requested value lies outside `[min_settable, max_settable]`
    #[error("value out of settable range")]
    OutOfRange,
    /// Requested state is not in the effecter's possible state set
    #[error("state not in possible state set")]
    UnsupportedState,
    /// Underlying command failure
    #[error(transparent)]
    Pldm(#[from] pldmd_base::PldmError),
}
