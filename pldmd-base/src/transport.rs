// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Transport binding traits.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Transport abstraction the PLDM core runs over.
//!
//! The message transport (MCTP in practice) is an external collaborator; the
//! core only needs to move byte buffers to and from endpoints and to hold a
//! link bandwidth reservation. [`Binding`] captures exactly that surface.

use core::fmt;
use std::time::Duration;

use thiserror::Error;

/// Transport endpoint ID
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Eid(pub u8);

impl fmt::Display for Eid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Message tag for an unsolicited message.
///
/// Carried back when responding so the transport can route the response to
/// the requester. `owner` is set on requests and cleared on responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tag {
    /// Tag value allocated by the requester's transport
    pub value: u8,
    /// Tag Owner bit
    pub owner: bool,
}

impl Tag {
    /// The response tag for this (request) tag: same value, owner cleared.
    pub fn response(&self) -> Tag {
        Tag {
            value: self.value,
            owner: false,
        }
    }
}

/// An error type for the transport binding
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// Failure in transmit path, typically transport-specific
    #[error("transmit failure")]
    TxFailure,
    /// Failure in receive path, typically transport-specific
    #[error("receive failure")]
    RxFailure,
    /// Timed out waiting for the remote peer
    #[error("timed out")]
    TimedOut,
    /// The remote peer cannot be reached
    #[error("endpoint unreachable")]
    Unreachable,
    /// The binding refused a bandwidth reservation
    #[error("bandwidth reservation refused")]
    ReservationRefused,
    /// IO error from the transport binding
    #[error("transport IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport result type
pub type Result<T> = core::result::Result<T, TransportError>;

/// A message delivered by the transport.
#[derive(Debug)]
pub struct Inbound {
    /// Source endpoint
    pub eid: Eid,
    /// Message tag, for responding
    pub tag: Tag,
    /// Message payload, including the message type byte
    pub payload: Vec<u8>,
}

/// The transport surface the core needs.
///
/// Buffers passed in and out include the one-byte message type prefix.
/// Implementations perform request/response correlation for
/// [`transfer`](Self::transfer); [`recv`](Self::recv) only yields messages
/// initiated by the remote end.
pub trait Binding {
    /// Send a request and wait for the correlated response.
    ///
    /// Returns [`TransportError::TimedOut`] if nothing arrives within
    /// `timeout`.
    fn transfer(
        &mut self,
        eid: Eid,
        payload: &[u8],
        timeout: Duration,
    ) -> impl core::future::Future<Output = Result<Vec<u8>>>;

    /// Send a message without waiting for a response.
    fn send(
        &mut self,
        eid: Eid,
        tag: Tag,
        payload: &[u8],
    ) -> impl core::future::Future<Output = Result<()>>;

    /// Wait for a remote-initiated message.
    fn recv(&mut self) -> impl core::future::Future<Output = Result<Inbound>>;

    /// Grant `eid` exclusive use of the link for `timeout_secs` seconds.
    fn reserve_bandwidth(
        &mut self,
        eid: Eid,
        timeout_secs: u16,
    ) -> impl core::future::Future<Output = Result<()>>;

    /// Release a bandwidth reservation held for `eid`.
    fn release_bandwidth(
        &mut self,
        eid: Eid,
    ) -> impl core::future::Future<Output = Result<()>>;
}
