// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM Messaging Control and Discovery ("PLDM Control") support.
 *
 * Copyright (c) 2025 Code Construct
 */

//! PLDM Messaging Control and Discovery ("PLDM Control" / type 0) messaging
//! support.
//!
//! Base negotiation for a newly discovered terminus: TID assignment and
//! enumeration of the supported PLDM types and commands.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::HashMap;
use std::time::Duration;

use deku::{DekuContainerRead, DekuContainerWrite};

use crate::mediator::Mediator;
use crate::transport::Binding;
use crate::{
    ccode_result, proto_error, PldmError, PldmRequest, Result, Tid,
};

/// PLDM type 0, Messaging Control and Discovery
pub const PLDM_TYPE_CONTROL: u8 = 0;

const CMD_TIMEOUT: Duration = Duration::from_millis(100);
const CMD_RETRIES: usize = 3;

/// PLDM Control command codes
#[allow(missing_docs)]
#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub enum Cmd {
    SetTID = 0x01,
    GetTID = 0x02,
    GetPLDMVersion = 0x03,
    GetPLDMTypes = 0x04,
    GetPLDMCommands = 0x05,
}

/// Common PLDM transfer flag values
#[allow(missing_docs)]
pub mod xfer_flag {
    pub const START: u8 = 0x01;
    pub const MIDDLE: u8 = 0x02;
    pub const END: u8 = 0x04;
    pub const START_AND_END: u8 = 0x05;
}

/// Common PLDM transfer operation flag values
#[allow(missing_docs)]
pub mod xfer_op {
    pub const GET_NEXTPART: u8 = 0x00;
    pub const GET_FIRSTPART: u8 = 0x01;
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
struct SetTIDReq {
    tid: u8,
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
struct GetTIDResp {
    tid: u8,
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
struct GetPLDMTypesResp {
    types: [u8; 8],
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
#[deku(endian = "little")]
struct GetPLDMVersionReq {
    xfer_handle: u32,
    xfer_op: u8,
    pldm_type: u8,
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
#[deku(endian = "little")]
struct GetPLDMVersionResp {
    next_handle: u32,
    xfer_flag: u8,
    version: u32,
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
#[deku(endian = "little")]
struct GetPLDMCommandsReq {
    pldm_type: u8,
    version: u32,
}

#[derive(Debug, deku::DekuRead, deku::DekuWrite)]
struct GetPLDMCommandsResp {
    commands: [u8; 32],
}

/// Per-type support data learned during base negotiation.
#[derive(Debug, Clone)]
pub struct TypeSupport {
    /// Version reported by Get PLDM Version
    pub version: u32,
    /// Command support bitmap, bit `cmd` set means command supported
    pub commands: [u8; 32],
}

/// Supported PLDM types and commands for one terminus.
#[derive(Debug, Default, Clone)]
pub struct CommandSupportTable {
    types: HashMap<u8, TypeSupport>,
}

impl CommandSupportTable {
    /// Whether the terminus reported support for `typ`.
    pub fn supports_type(&self, typ: u8) -> bool {
        self.types.contains_key(&typ)
    }

    /// Whether the terminus reported support for `cmd` of `typ`.
    pub fn supports(&self, typ: u8, cmd: u8) -> bool {
        self.types
            .get(&typ)
            .map(|t| t.commands[cmd as usize / 8] & (1 << (cmd % 8)) != 0)
            .unwrap_or(false)
    }
}

fn req_with<T: DekuContainerWrite>(cmd: Cmd, msg: &T) -> Result<PldmRequest> {
    let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
    Ok(PldmRequest::new_data(PLDM_TYPE_CONTROL, cmd as u8, data))
}

/// Perform a Set TID request.
pub async fn set_tid(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
    new_tid: Tid,
) -> Result<()> {
    let mut req = req_with(Cmd::SetTID, &SetTIDReq { tid: new_tid.0 })?;
    mediator
        .send_receive_cc(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await
}

/// Perform a Get TID request.
pub async fn get_tid(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<Tid> {
    let mut req = PldmRequest::new(PLDM_TYPE_CONTROL, Cmd::GetTID as u8);
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    ccode_result(rsp.cc)?;

    let ((rest, _), tidrsp) = GetTIDResp::from_bytes((&rsp.data, 0))
        .map_err(|_| proto_error!("Bad GetTID response"))?;
    if !rest.is_empty() {
        warn!("Extra Get TID response");
    }
    Ok(Tid(tidrsp.tid))
}

/// Perform a Get PLDM Types request, returning the supported type numbers.
pub async fn get_pldm_types(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<Vec<u8>> {
    let mut req = PldmRequest::new(PLDM_TYPE_CONTROL, Cmd::GetPLDMTypes as u8);
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    ccode_result(rsp.cc)?;

    let ((rest, _), tyrsp) = GetPLDMTypesResp::from_bytes((&rsp.data, 0))
        .map_err(|_| proto_error!("Bad GetPLDMTypes response"))?;
    if !rest.is_empty() {
        warn!("Extra Get PLDM Types response");
    }

    let mut types = Vec::new();
    for t in 0..64u8 {
        if tyrsp.types[t as usize / 8] & (1 << (t % 8)) != 0 {
            types.push(t);
        }
    }
    Ok(types)
}

/// Perform a Get PLDM Version request for one type.
///
/// Only single-part version responses are handled.
pub async fn get_pldm_version(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
    pldm_type: u8,
) -> Result<u32> {
    let msg = GetPLDMVersionReq {
        xfer_handle: 0,
        xfer_op: xfer_op::GET_FIRSTPART,
        pldm_type,
    };
    let mut req = req_with(Cmd::GetPLDMVersion, &msg)?;
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    ccode_result(rsp.cc)?;

    // The version CRC trails the last part; ignore anything beyond the
    // first version field.
    let ((_rest, _), vrsp) = GetPLDMVersionResp::from_bytes((&rsp.data, 0))
        .map_err(|_| proto_error!("Bad GetPLDMVersion response"))?;

    if vrsp.xfer_flag != xfer_flag::START_AND_END {
        return Err(proto_error!("Can't handle multi-part version"));
    }
    Ok(vrsp.version)
}

/// Perform a Get PLDM Commands request for one type.
pub async fn get_pldm_commands(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
    pldm_type: u8,
    version: u32,
) -> Result<[u8; 32]> {
    let msg = GetPLDMCommandsReq { pldm_type, version };
    let mut req = req_with(Cmd::GetPLDMCommands, &msg)?;
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    ccode_result(rsp.cc)?;

    let ((rest, _), crsp) = GetPLDMCommandsResp::from_bytes((&rsp.data, 0))
        .map_err(|_| proto_error!("Bad GetPLDMCommands response"))?;
    if !rest.is_empty() {
        warn!("Extra Get PLDM Commands response");
    }
    Ok(crsp.commands)
}

/// Base negotiation for a newly mapped terminus.
///
/// Assigns `tid` with Set TID, reads it back, and enumerates the supported
/// types and per-type commands into a [`CommandSupportTable`].
pub async fn negotiate(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<CommandSupportTable> {
    set_tid(mediator, tid, tid).await?;

    let assigned = get_tid(mediator, tid).await?;
    if assigned != tid {
        return Err(proto_error!(
            "TID readback mismatch",
            "assigned {tid} read {assigned}"
        ));
    }

    let mut table = CommandSupportTable::default();
    for typ in get_pldm_types(mediator, tid).await? {
        let version = match get_pldm_version(mediator, tid, typ).await {
            Ok(v) => v,
            Err(e) => {
                warn!("TID {tid}: no version for type {typ}: {e}");
                continue;
            }
        };
        match get_pldm_commands(mediator, tid, typ, version).await {
            Ok(commands) => {
                table
                    .types
                    .insert(typ, TypeSupport { version, commands });
            }
            Err(e) => {
                warn!("TID {tid}: no command table for type {typ}: {e}");
            }
        }
    }

    info!("TID {tid}: base negotiation complete");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_support_lookup() {
        let mut table = CommandSupportTable::default();
        let mut commands = [0u8; 32];
        // commands 0x11 and 0x20
        commands[0x11 / 8] |= 1 << (0x11 % 8);
        commands[0x20 / 8] |= 1 << (0x20 % 8);
        table.types.insert(
            2,
            TypeSupport {
                version: 0xf1f1f000,
                commands,
            },
        );

        assert!(table.supports_type(2));
        assert!(!table.supports_type(5));
        assert!(table.supports(2, 0x11));
        assert!(table.supports(2, 0x20));
        assert!(!table.supports(2, 0x12));
        assert!(!table.supports(5, 0x11));
    }

    #[test]
    fn version_req_encode() {
        let msg = GetPLDMVersionReq {
            xfer_handle: 0,
            xfer_op: xfer_op::GET_FIRSTPART,
            pldm_type: 2,
        };
        let b = msg.to_bytes().unwrap();
        assert_eq!(b, [0, 0, 0, 0, 0x01, 0x02]);
    }
}
