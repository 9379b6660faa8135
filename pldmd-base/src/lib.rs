// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM base message definitions.
 *
 * Copyright (c) 2025 Code Construct
 */
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Platform Level Data Model (PLDM) base messaging for a management
//! controller.
//!
//! This crate carries the base request/response types, per-terminus instance
//! ID allocation, and the transport mediator that higher PLDM types
//! (monitoring & control, firmware update) issue their commands through.

use core::fmt::{self, Debug};

use num_derive::FromPrimitive;
use thiserror::Error;

pub mod control;
pub mod mediator;
pub mod transport;

use transport::TransportError;

/// Maximum size of a PLDM message, defining our buffer sizes.
pub const PLDM_MAX_MSGSIZE: usize = 1024;

/// MCTP message type byte prefixed to every PLDM payload on the wire.
pub const MCTP_MSG_TYPE_PLDM: u8 = 0x01;

/// Size of the PLDM request header (rq/iid, type, command).
pub const PLDM_REQ_HDR_SIZE: usize = 3;
/// Size of the PLDM response header (iid, type, command, completion code).
pub const PLDM_RESP_HDR_SIZE: usize = 4;

/// Mask for the 5-bit PLDM instance ID field.
pub const PLDM_IID_MASK: u8 = 0x1f;

/// PLDM terminus ID.
///
/// Assigned during base negotiation, mapped bijectively to a transport
/// endpoint for the lifetime of the terminus.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tid(pub u8);

impl fmt::Display for Tid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, fmt)
    }
}

/// Unassigned terminus ID sentinel.
pub const TID_UNASSIGNED: Tid = Tid(0x00);

/// Generic PLDM error type
#[derive(Error, Debug)]
pub enum PldmError {
    /// PLDM protocol error
    #[error("PLDM protocol error: {0}")]
    Protocol(String),
    /// Transport communication error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// No valid response within the retry budget
    #[error("no response within retry budget")]
    Timeout,
    /// Another `{tid, type}` pair holds the bandwidth reservation
    #[error("bandwidth reserved by another session")]
    Busy,
    /// A command failed with a non-success completion code
    #[error("command failed with completion code 0x{0:02x}")]
    CompletionCode(u8),
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// No buffer space available
    #[error("insufficient buffer space available")]
    NoSpace,
}

/// Create a `PldmError::Protocol` from a message and optional detail.
///
/// Example
///
/// ```
/// # let iid = 1u8;
/// # let actual_iid = 2u8;
/// use pldmd_base::proto_error;
/// proto_error!("Mismatching IID", "expected {iid:02x}, received {actual_iid:02x}");
/// proto_error!("Rq bit wasn't expected");
/// ```
#[macro_export]
macro_rules! proto_error {
    ($msg: expr, $($desc:tt)+)
        => { $crate::PldmError::Protocol(format!("{}. {}", $msg, format_args!($($desc)+))) };
    ($msg: expr)
        => { $crate::PldmError::Protocol(format!("{}.", $msg)) };
}

/// PLDM protocol return type
pub type Result<T> = core::result::Result<T, PldmError>;

/// Generic PLDM completion codes, DSP0240.
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[allow(non_camel_case_types)]
#[repr(u8)]
pub enum CCode {
    SUCCESS = 0,
    ERROR = 1,
    ERROR_INVALID_DATA = 2,
    ERROR_INVALID_LENGTH = 3,
    ERROR_NOT_READY = 4,
    ERROR_UNSUPPORTED_PLDM_CMD = 5,
    ERROR_INVALID_PLDM_TYPE = 32,
}

/// Returns `Err(PldmError::CompletionCode)` for a non-success code.
pub fn ccode_result(cc: u8) -> Result<()> {
    if cc == CCode::SUCCESS as u8 {
        Ok(())
    } else {
        Err(PldmError::CompletionCode(cc))
    }
}

/// Base PLDM request type
#[derive(Clone)]
pub struct PldmRequest {
    /// PLDM Instance ID
    pub iid: u8,
    /// PLDM type
    pub typ: u8,
    /// PLDM command code
    pub cmd: u8,
    /// PLDM command data payload
    pub data: Vec<u8>,
}

impl Debug for PldmRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PldmRequest")
            .field("iid", &self.iid)
            .field("typ", &self.typ)
            .field("cmd", &self.cmd)
            .field("data.len()", &self.data.len())
            .field("data..10", &&self.data[..self.data.len().min(10)])
            .finish()
    }
}

impl PldmRequest {
    /// Create a new PLDM request for a given PLDM message type and command
    /// number.
    ///
    /// The instance ID is assigned by the mediator on transmit.
    pub fn new(typ: u8, cmd: u8) -> Self {
        Self::new_data(typ, cmd, Vec::new())
    }

    /// Create a new PLDM request with a data payload.
    pub fn new_data(typ: u8, cmd: u8, data: Vec<u8>) -> Self {
        Self {
            iid: 0,
            typ,
            cmd,
            data,
        }
    }

    /// Create a PLDM request from received message data.
    ///
    /// `data` excludes the MCTP message type byte. Fails if the buffer is
    /// short or the rq bit indicates a response.
    pub fn from_buf(data: &[u8]) -> Result<Self> {
        if data.len() < PLDM_REQ_HDR_SIZE {
            return Err(proto_error!("Short request", "{} bytes", data.len()));
        }

        let rq = (data[0] & 0x80) != 0;
        if !rq {
            return Err(proto_error!("PLDM response, expected request"));
        }

        Ok(PldmRequest {
            iid: data[0] & PLDM_IID_MASK,
            typ: data[1] & 0x3f,
            cmd: data[2],
            data: data[PLDM_REQ_HDR_SIZE..].to_vec(),
        })
    }

    /// Create a response for this request.
    ///
    /// The instance, type and command are carried over; the completion code
    /// starts as success with an empty payload.
    pub fn response(&self) -> PldmResponse {
        PldmResponse {
            iid: self.iid,
            typ: self.typ,
            cmd: self.cmd,
            cc: 0,
            data: Vec::new(),
        }
    }

    /// Encode to wire format, including the MCTP message type prefix.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(1 + PLDM_REQ_HDR_SIZE + self.data.len());
        buf.push(MCTP_MSG_TYPE_PLDM);
        buf.push(0x80 | (self.iid & PLDM_IID_MASK));
        buf.push(self.typ & 0x3f);
        buf.push(self.cmd);
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// Base PLDM response type
#[derive(Clone)]
pub struct PldmResponse {
    /// PLDM Instance ID
    pub iid: u8,
    /// PLDM type
    pub typ: u8,
    /// PLDM command code (defined by the original request)
    pub cmd: u8,
    /// PLDM completion code
    pub cc: u8,
    /// PLDM response data payload. Does not include the cc field.
    pub data: Vec<u8>,
}

impl Debug for PldmResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PldmResponse")
            .field("iid", &self.iid)
            .field("typ", &self.typ)
            .field("cmd", &self.cmd)
            .field("cc", &self.cc)
            .field("data.len()", &self.data.len())
            .field("data..10", &&self.data[..self.data.len().min(10)])
            .finish()
    }
}

impl PldmResponse {
    /// Create a `PldmResponse` from received message data.
    ///
    /// `data` excludes the MCTP message type byte.
    pub fn from_buf(data: &[u8]) -> Result<Self> {
        if data.len() < PLDM_RESP_HDR_SIZE {
            return Err(proto_error!("Short response", "{} bytes", data.len()));
        }

        let rq = (data[0] & 0x80) != 0;
        if rq {
            return Err(proto_error!("PLDM request, expected response"));
        }

        Ok(PldmResponse {
            iid: data[0] & PLDM_IID_MASK,
            typ: data[1] & 0x3f,
            cmd: data[2],
            cc: data[3],
            data: data[PLDM_RESP_HDR_SIZE..].to_vec(),
        })
    }

    /// Encode to wire format, including the MCTP message type prefix.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(1 + PLDM_RESP_HDR_SIZE + self.data.len());
        buf.push(MCTP_MSG_TYPE_PLDM);
        buf.push(self.iid & PLDM_IID_MASK);
        buf.push(self.typ & 0x3f);
        buf.push(self.cmd);
        buf.push(self.cc);
        buf.extend_from_slice(&self.data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let mut req = PldmRequest::new_data(0x02, 0x11, vec![0xaa, 0xbb]);
        req.iid = 0x13;
        let w = req.to_wire();
        assert_eq!(w, [0x01, 0x93, 0x02, 0x11, 0xaa, 0xbb]);

        let parsed = PldmRequest::from_buf(&w[1..]).unwrap();
        assert_eq!(parsed.iid, 0x13);
        assert_eq!(parsed.typ, 0x02);
        assert_eq!(parsed.cmd, 0x11);
        assert_eq!(parsed.data, [0xaa, 0xbb]);
    }

    #[test]
    fn response_parse() {
        // rq bit set is not a response
        PldmResponse::from_buf(&[0x81, 0x02, 0x11, 0x00]).unwrap_err();
        // short
        PldmResponse::from_buf(&[0x01, 0x02, 0x11]).unwrap_err();

        let rsp =
            PldmResponse::from_buf(&[0x05, 0x02, 0x11, 0x00, 0x28]).unwrap();
        assert_eq!(rsp.iid, 0x05);
        assert_eq!(rsp.cc, 0x00);
        assert_eq!(rsp.data, [0x28]);
    }

    #[test]
    fn response_from_request() {
        let req = PldmRequest::from_buf(&[0x9f, 0x05, 0x16, 0x00]).unwrap();
        let rsp = req.response();
        assert_eq!(rsp.iid, 0x1f);
        assert_eq!(rsp.typ, 0x05);
        assert_eq!(rsp.cmd, 0x16);
        assert_eq!(rsp.cc, 0);
    }
}
