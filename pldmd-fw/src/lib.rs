// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update: PLDM type 5 messaging.
 *
 * Copyright (c) 2025 Code Construct
 */
#![forbid(unsafe_code)]

//! PLDM Firmware Update (type 5) for a management controller acting as the
//! Update Agent.

use core::fmt;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use chrono::Datelike;
use enumset::{EnumSet, EnumSetType};
use num_derive::FromPrimitive;

use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    character::complete::u32 as c_u32,
    combinator::{all_consuming, flat_map, map, map_opt, map_parser, map_res, rest, value},
    multi::{count, length_count},
    number::complete::{le_u16, le_u32, le_u8},
    sequence::tuple,
    IResult,
};

pub mod pkg;
pub mod ua;

/// Firmware Update PLDM Type 5
pub const PLDM_TYPE_FW: u8 = 5;

/// Baseline transfer size, the mandatory minimum payload per transfer PDU.
pub const PLDM_FW_BASELINE_TRANSFER: usize = 32;

type VResult<I, O> = IResult<I, O>;

/// PLDM firmware device states, DSP0267.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum FdState {
    Idle = 0,
    LearnComponents = 1,
    ReadyXfer = 2,
    Download = 3,
    Verify = 4,
    Apply = 5,
    Activate = 6,
}

impl TryFrom<u8> for FdState {
    type Error = &'static str;
    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Idle),
            1 => Ok(Self::LearnComponents),
            2 => Ok(Self::ReadyXfer),
            3 => Ok(Self::Download),
            4 => Ok(Self::Verify),
            5 => Ok(Self::Apply),
            6 => Ok(Self::Activate),
            _ => Err("unknown state!"),
        }
    }
}

impl FdState {
    /// Parse from a buffer
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map_res(le_u8, TryInto::<FdState>::try_into)(buf)
    }
}

/// PLDM Firmware Commands
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Cmd {
    QueryDeviceIdentifiers = 0x01,
    GetFirmwareParameters = 0x02,
    RequestUpdate = 0x10,
    GetPackageData = 0x11,
    GetDeviceMetaData = 0x12,
    PassComponentTable = 0x13,
    UpdateComponent = 0x14,
    RequestFirmwareData = 0x15,
    TransferComplete = 0x16,
    VerifyComplete = 0x17,
    ApplyComplete = 0x18,
    GetMetaData = 0x19,
    ActivateFirmware = 0x1A,
    GetStatus = 0x1B,
    CancelUpdateComponent = 0x1C,
    CancelUpdate = 0x1D,
}

impl Cmd {
    /// Commands for which the UA is the requester.
    pub const fn is_ua(&self) -> bool {
        !self.is_fd()
    }

    /// Commands initiated by the firmware device.
    pub const fn is_fd(&self) -> bool {
        matches!(
            self,
            Self::GetPackageData
                | Self::RequestFirmwareData
                | Self::TransferComplete
                | Self::VerifyComplete
                | Self::ApplyComplete
                | Self::GetMetaData
        )
    }
}

/// PLDM firmware response codes
#[allow(missing_docs)]
pub mod fw_codes {
    pub const NOT_IN_UPDATE_MODE: u8 = 0x80;
    pub const ALREADY_IN_UPDATE_MODE: u8 = 0x81;
    pub const DATA_OUT_OF_RANGE: u8 = 0x82;
    pub const INVALID_TRANSFER_LENGTH: u8 = 0x83;
    pub const INVALID_STATE_FOR_COMMAND: u8 = 0x84;
    pub const INCOMPLETE_UPDATE: u8 = 0x85;
    pub const BUSY_IN_BACKGROUND: u8 = 0x86;
    pub const CANCEL_PENDING: u8 = 0x87;
    pub const COMMAND_NOT_EXPECTED: u8 = 0x88;
    pub const RETRY_REQUEST_FW_DATA: u8 = 0x89;
    pub const UNABLE_TO_INITIATE_UPDATE: u8 = 0x8A;
    pub const ACTIVATION_NOT_REQUIRED: u8 = 0x8B;
    pub const SELF_CONTAINED_ACTIVATION_NOT_PERMITTED: u8 = 0x8C;
    pub const NO_DEVICE_METADATA: u8 = 0x8D;
    pub const RETRY_REQUEST_UPDATE: u8 = 0x8E;
    pub const NO_PACKAGE_DATA: u8 = 0x8F;
    pub const INVALID_TRANSFER_HANDLE: u8 = 0x90;
    pub const INVALID_TRANSFER_OPERATION: u8 = 0x91;
    pub const PACKAGE_DATA_ERROR: u8 = 0x93;
}

/// Transfer Result codes for TransferComplete
///
/// Not all defined Transfer Result codes are defined in this enum,
/// arbitrary `u8` values may be expected.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransferResult {
    Success,
    Corrupt,
    VersionMismatch,
    Aborted,
    Timeout,
    GenericError,
    Other(u8),
}

impl From<u8> for TransferResult {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::Corrupt,
            0x02 => Self::VersionMismatch,
            0x03 => Self::Aborted,
            0x09 => Self::Timeout,
            0x0a => Self::GenericError,
            v => Self::Other(v),
        }
    }
}

/// Verify Result codes for VerifyComplete
///
/// Ref "VerifyComplete command format" Table 31 of DSP0267 1.1.0
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Success,
    Failure,
    VersionMismatch,
    SecurityChecksFailed,
    IncompleteImage,
    // 0x5 - 0x8 reserved
    Timeout,
    GenericError,
    Other(u8),
}

impl From<u8> for VerifyResult {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::Failure,
            0x02 => Self::VersionMismatch,
            0x03 => Self::SecurityChecksFailed,
            0x04 => Self::IncompleteImage,
            0x09 => Self::Timeout,
            0x0a => Self::GenericError,
            v => Self::Other(v),
        }
    }
}

/// Apply Result codes for ApplyComplete
///
/// Ref "ApplyComplete command format" Table 32 of DSP0267 1.1.0
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    Success,
    SuccessModActivation,
    FailedMemoryWrite,
    Timeout,
    GenericError,
    Other(u8),
}

impl From<u8> for ApplyResult {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::SuccessModActivation,
            0x02 => Self::FailedMemoryWrite,
            0x09 => Self::Timeout,
            0x0a => Self::GenericError,
            v => Self::Other(v),
        }
    }
}

/// A version or vendor string from a descriptor or package.
#[derive(Debug, Clone)]
pub enum DescriptorString {
    /// Printable string data
    String(String),
    /// Raw byte data
    Bytes(Vec<u8>),
}

impl fmt::Display for DescriptorString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trim_chars = ['\0', ' '];
        match self {
            Self::String(s) => {
                write!(f, "{}", s.trim_end_matches(trim_chars).escape_default())
            }
            Self::Bytes(bs) => {
                for b in bs.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl DescriptorString {
    /// The string type byte for encoding.
    pub fn string_type(&self) -> u8 {
        match self {
            Self::Bytes(_) => 0,
            Self::String(_) => 1,
        }
    }

    /// The raw bytes of the string.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::String(b) => b.as_bytes(),
        }
    }

    /// Append type, length and bytes to an outgoing payload.
    pub fn write_utf8_bytes(&self, v: &mut Vec<u8>) {
        v.push(self.string_type());
        v.push(self.as_bytes().len() as u8);
        v.extend_from_slice(self.as_bytes());
    }

    fn new_utf8(v: &[u8]) -> Option<Self> {
        if v.len() > 0xff {
            return None;
        }
        let s = core::str::from_utf8(v).ok()?;
        Some(Self::String(s.to_string()))
    }

    fn new_bytes(v: &[u8]) -> Option<Self> {
        if v.len() > 0xff {
            return None;
        }
        Some(Self::Bytes(v.to_vec()))
    }
}

/// Parse a string with type and length
pub fn parse_string<'a>(
    typ: u8,
    len: u8,
) -> impl FnMut(&'a [u8]) -> VResult<&'a [u8], DescriptorString> {
    map_opt(take(len), move |d: &[u8]| match typ {
        0 => DescriptorString::new_bytes(d),
        // ascii or utf-8
        1 | 2 => DescriptorString::new_utf8(d),
        _ => {
            debug!("unimplemented string type {typ}");
            None
        }
    })
}

/// Parse a string where type, length and data are adjacent (in that order)
pub fn parse_string_adjacent(buf: &[u8]) -> VResult<&[u8], DescriptorString> {
    let (r, (typ, len)) = tuple((le_u8, le_u8))(buf)?;
    parse_string(typ, len)(r)
}

/// A device descriptor
#[derive(Debug)]
pub enum Descriptor {
    /// PCI Vendor ID
    PciVid(u16),
    /// IANA Enterprise ID
    Iana(u32),
    /// UUID
    Uuid(uuid::Uuid),
    /// PCI Device ID
    PciDid(u16),
    /// PCI Subsystem Vendor ID
    PciSubVid(u16),
    /// PCI Subsystem Device ID
    PciSubDid(u16),
    /// Vendor Defined
    Vendor {
        /// Vendor-defined title string
        title: Option<DescriptorString>,
        /// Vendor-defined data
        data: Vec<u8>,
    },
}

impl Descriptor {
    fn parse_pcivid(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u16, Self::PciVid)(buf)
    }

    fn parse_iana(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u32, Self::Iana)(buf)
    }

    fn parse_uuid(buf: &[u8]) -> VResult<&[u8], Self> {
        map_res(take(16usize), |b| {
            let u = uuid::Uuid::from_slice(b)?;
            Ok::<Descriptor, uuid::Error>(Self::Uuid(u))
        })(buf)
    }

    fn parse_pcidid(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u16, Self::PciDid)(buf)
    }

    fn parse_pcisubvid(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u16, Self::PciSubVid)(buf)
    }

    fn parse_pcisubdid(buf: &[u8]) -> VResult<&[u8], Self> {
        map(le_u16, Self::PciSubDid)(buf)
    }

    fn parse_vendor(buf: &[u8]) -> VResult<&[u8], Self> {
        // Attempt to parse with a proper title string; if not present just
        // consume everything as byte data
        let f1 = |(t, d): (_, &[u8])| {
            Some(Self::Vendor {
                title: Some(t),
                data: d.to_vec(),
            })
        };
        let f2 = |d: &[u8]| {
            Some(Self::Vendor {
                title: None,
                data: d.to_vec(),
            })
        };
        alt((
            map_opt(tuple((parse_string_adjacent, rest)), f1),
            map_opt(rest, f2),
        ))(buf)
    }

    fn parse_fail(buf: &[u8]) -> VResult<&[u8], Self> {
        nom::combinator::fail(buf)
    }

    /// Parse one type/length-prefixed descriptor.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let f = |(typ, len)| {
            let g = match typ {
                0x0000 => Self::parse_pcivid,
                0x0001 => Self::parse_iana,
                0x0002 => Self::parse_uuid,
                0x0100 => Self::parse_pcidid,
                0x0101 => Self::parse_pcisubvid,
                0x0102 => Self::parse_pcisubdid,
                0xffff => Self::parse_vendor,
                _ => {
                    debug!("Unknown descriptor type 0x{typ:04x}");
                    Self::parse_fail
                }
            };
            map_parser(take(len), all_consuming(g))
        };
        flat_map(tuple((le_u16, le_u16)), f)(buf)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PciVid(id) => write!(f, "pci-vendor:{id:04x}"),
            Self::Iana(id) => write!(f, "iana:{id:08x}"),
            Self::Uuid(id) => write!(f, "uuid:{id}"),
            Self::PciDid(id) => write!(f, "pci-device:{id:04x}"),
            Self::PciSubVid(id) => write!(f, "pci-subsys-vendor:{id:04x}"),
            Self::PciSubDid(id) => write!(f, "pci-subsys-device:{id:04x}"),
            Self::Vendor { title, data } => {
                match title {
                    Some(t) => write!(f, "vendor:{t}")?,
                    None => write!(f, "vendor:")?,
                }
                write!(f, "[")?;
                for b in data {
                    write!(f, "{b:02x}")?;
                }
                write!(f, "]")?;
                Ok(())
            }
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Vendor { data: s, .. }, Self::Vendor { data: o, .. }) => {
                s == o
            }
            (Self::Iana(s), Self::Iana(o)) => s == o,
            (Self::Uuid(s), Self::Uuid(o)) => s == o,
            (Self::PciVid(s), Self::PciVid(o)) => s == o,
            (Self::PciDid(s), Self::PciDid(o)) => s == o,
            (Self::PciSubVid(s), Self::PciSubVid(o)) => s == o,
            (Self::PciSubDid(s), Self::PciSubDid(o)) => s == o,
            _ => false,
        }
    }
}

/// The descriptor set identifying one firmware device.
#[derive(Debug)]
pub struct DeviceIdentifiers {
    /// The descriptors, in response order
    pub ids: Vec<Descriptor>,
}

impl PartialEq for DeviceIdentifiers {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
    }
}

impl DeviceIdentifiers {
    /// Parse a count-prefixed descriptor list.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        length_count(le_u8, Descriptor::parse)(buf)
            .map(|(rest, ids)| (rest, Self { ids }))
    }
}

impl fmt::Display for DeviceIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in self.ids.iter() {
            write!(f, "{}{}", if first { "" } else { "," }, id)?;
            first = false;
        }
        Ok(())
    }
}

/// PLDM date as used in version stamps.
pub type PldmDate = chrono::naive::NaiveDate;

/// Parse a `YYYYMMDD` PLDM date; all-zero bytes mean "no date".
pub fn pldm_date_parse(buf: &[u8]) -> VResult<&[u8], Option<PldmDate>> {
    let (r, o) = alt((
        value(None, tag([0u8; 8])),
        map(
            tuple((
                map_parser(take(4u8), c_u32),
                map_parser(take(2u8), c_u32),
                map_parser(take(2u8), c_u32),
            )),
            Some,
        ),
    ))(buf)?;

    let d = o.and_then(|(y, m, d)| PldmDate::from_ymd_opt(y as i32, m, d));

    Ok((r, d))
}

/// An active or pending version in the Component Parameter Table.
#[derive(Debug)]
pub struct ComponentVersion {
    /// Comparison stamp
    pub stamp: u32,
    /// Version string
    pub version: DescriptorString,
    /// Release date, if reported
    pub date: Option<PldmDate>,
}

impl fmt::Display for ComponentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if let Some(d) = self.date {
            write!(f, " ({}{:02}{:02})", d.year(), d.month(), d.day())?;
        }
        if self.stamp != 0 {
            write!(f, " [{:08x}]", self.stamp)?;
        }
        Ok(())
    }
}

/// Component classification
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ComponentClassification {
    Unknown,
    Other,
    Firmware,
    /// Other values
    Value(u16),
}

impl From<u16> for ComponentClassification {
    fn from(x: u16) -> Self {
        match x {
            0x0000 => Self::Unknown,
            0x0001 => Self::Other,
            0x000a => Self::Firmware,
            v => Self::Value(v),
        }
    }
}

impl From<&ComponentClassification> for u16 {
    fn from(c: &ComponentClassification) -> u16 {
        match c {
            ComponentClassification::Unknown => 0x0000,
            ComponentClassification::Other => 0x0001,
            ComponentClassification::Firmware => 0x000a,
            ComponentClassification::Value(v) => *v,
        }
    }
}

#[allow(missing_docs)]
#[derive(EnumSetType, Debug)]
pub enum ActivationMethod {
    PendingComponentImageSet = 7,
    PendingImage = 6,
    ACPowerCycle = 5,
    DCPowerCycle = 4,
    SystemReboot = 3,
    MediumSpecificReset = 2,
    SelfContained = 1,
    Automatic = 0,
}

/// Activation method bitfield.
pub type ActivationMethods = EnumSet<ActivationMethod>;

#[allow(missing_docs)]
#[derive(EnumSetType, Debug)]
pub enum DeviceCapability {
    ComponentUpdateFailureRecovery = 0,
    ComponentUpdateFailureRetry = 1,
    FDHostFunctionalityDuringUpdate = 2,
    FDPartialUpdates = 3,
    FDUpdateModeRestrictionOSActive = 4,
    FDDowngradeRestrictions = 8,
    SecurityRevisionUpdateRequest = 9,
}

/// Device capability bitfield from Get Firmware Parameters.
#[derive(Debug, Default)]
pub struct DeviceCapabilities(pub EnumSet<DeviceCapability>);

impl DeviceCapabilities {
    /// Build from the wire representation, masking undefined bits.
    pub fn from_u32(x: u32) -> Self {
        Self(EnumSet::<DeviceCapability>::from_u32_truncated(x))
    }

    /// The wire representation.
    pub fn as_u32(&self) -> u32 {
        self.0.as_u32()
    }
}

#[allow(missing_docs)]
#[derive(EnumSetType, Debug)]
pub enum ComponentCapability {
    FDApplyState = 0,
    ComponentDowngrade = 2,
    SecurityRevisionUpdateRequest = 3,
    SecurityRevisionNotLatest = 4,
}

/// Component capability bitfield.
pub type ComponentCapabilities = EnumSet<ComponentCapability>;

/// One ComponentParameterTable entry in Get Firmware Parameters
#[allow(missing_docs)]
#[derive(Debug)]
pub struct Component {
    pub classification: ComponentClassification,
    pub identifier: u16,
    pub classificationindex: u8,
    pub active: ComponentVersion,
    pub pending: ComponentVersion,
    pub activation_methods: ActivationMethods,
    pub caps_during_update: ComponentCapabilities,
}

impl Component {
    /// Parse one Component Parameter Table entry.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (
            r,
            (
                classification,
                identifier,
                classificationindex,
                c1,
                c2,
                activation_methods,
                caps_during_update,
            ),
        ) = tuple((
            le_u16,
            le_u16,
            le_u8,
            tuple((le_u32, le_u8, le_u8, pldm_date_parse)),
            tuple((le_u32, le_u8, le_u8, pldm_date_parse)),
            le_u16,
            le_u32,
        ))(buf)?;

        let (r, c1_str) = parse_string(c1.1, c1.2)(r)?;
        let (r, c2_str) = parse_string(c2.1, c2.2)(r)?;

        let c = Component {
            classification: classification.into(),
            identifier,
            classificationindex,
            active: ComponentVersion {
                stamp: c1.0,
                version: c1_str,
                date: c1.3,
            },
            pending: ComponentVersion {
                stamp: c2.0,
                version: c2_str,
                date: c2.3,
            },
            activation_methods: ActivationMethods::from_u16_truncated(
                activation_methods,
            ),
            caps_during_update: ComponentCapabilities::from_u32_truncated(
                caps_during_update,
            ),
        };

        Ok((r, c))
    }
}

/// Parsed Get Firmware Parameters response.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct FirmwareParameters {
    pub caps: DeviceCapabilities,
    pub components: Vec<Component>,
    pub active: DescriptorString,
    pub pending: DescriptorString,
}

impl FirmwareParameters {
    /// Parse a Get Firmware Parameters response payload.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, p) = tuple((le_u32, le_u16, le_u8, le_u8, le_u8, le_u8))(buf)?;

        let (
            caps,
            ccount,
            active_str_type,
            active_str_len,
            pending_str_type,
            pending_str_len,
        ) = p;

        let (r, active) = parse_string(active_str_type, active_str_len)(r)?;
        let (r, pending) = parse_string(pending_str_type, pending_str_len)(r)?;

        let (r, components) = count(Component::parse, ccount as usize)(r)?;

        let fp = FirmwareParameters {
            caps: DeviceCapabilities::from_u32(caps),
            components,
            active,
            pending,
        };

        Ok((r, fp))
    }
}

/// Parsed RequestUpdate response.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct RequestUpdateResponse {
    pub fd_metadata_len: u16,
    pub fd_will_send_gpd: u8,
}

impl RequestUpdateResponse {
    /// Parse a RequestUpdate response payload.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, t) = tuple((le_u16, le_u8))(buf)?;
        Ok((
            r,
            RequestUpdateResponse {
                fd_metadata_len: t.0,
                fd_will_send_gpd: t.1,
            },
        ))
    }
}

/// Response Codes for Update Component and Pass Component Table
///
/// This list is not complete, refer to the specification
#[allow(missing_docs)]
#[repr(u8)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum ComponentResponseCode {
    Success = 0x00,
    IdenticalVersion = 0x01,
    DowngradeVersion = 0x02,
    InvalidVersion = 0x03,
    Conflict = 0x04,
    MissingPrerequisite = 0x05,
    NotSupported = 0x06,
    SecurityPreventDowngrade = 0x07,
}

/// Parsed UpdateComponent response.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct UpdateComponentResponse {
    /// ComponentCompatibilityResponse, 0 when the component can be updated
    pub response: u8,
    /// A ComponentResponseCode
    pub response_code: u8,
    pub update_flags: u32,
    pub estimate_time: u16,
}

impl UpdateComponentResponse {
    /// Parse an UpdateComponent response payload.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (response, response_code, update_flags, estimate_time)) =
            tuple((le_u8, le_u8, le_u32, le_u16))(buf)?;

        let s = Self {
            response,
            response_code,
            update_flags,
            estimate_time,
        };
        Ok((r, s))
    }
}

/// Parsed GetStatus response.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct GetStatusResponse {
    pub current_state: FdState,
    pub previous_state: FdState,
    pub aux_state: u8,
    pub aux_state_status: u8,
    pub progress_percent: u8,
    pub reason_code: u8,
    pub update_option_flags_enabled: u32,
}

impl GetStatusResponse {
    /// Parse a GetStatus response payload.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, t) = tuple((
            FdState::parse,
            FdState::parse,
            le_u8,
            le_u8,
            le_u8,
            le_u8,
            le_u32,
        ))(buf)?;
        Ok((
            r,
            Self {
                current_state: t.0,
                previous_state: t.1,
                aux_state: t.2,
                aux_state_status: t.3,
                progress_percent: t.4,
                reason_code: t.5,
                update_option_flags_enabled: t.6,
            },
        ))
    }
}

/// A data-transfer pull from the firmware device.
///
/// Request payload of GetPackageData, GetMetaData and the FD-pushed
/// GetDeviceMetaData.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq)]
pub struct DataTransferReq {
    pub handle: u32,
    pub op: u8,
}

impl DataTransferReq {
    /// Parse the request payload.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u32, le_u8)), |(handle, op)| Self { handle, op })(buf)
    }
}

/// Parsed RequestFirmwareData request payload.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq)]
pub struct RequestFirmwareDataReq {
    pub offset: u32,
    pub length: u32,
}

impl RequestFirmwareDataReq {
    /// Parse the request payload.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        map(tuple((le_u32, le_u32)), |(offset, length)| Self {
            offset,
            length,
        })(buf)
    }
}

/// Transfer flag for an outgoing data portion.
///
/// Callers must not invoke this for an empty transfer; `data_size` of zero
/// is undefined input.
pub fn transfer_flag(offset: usize, length: usize, data_size: usize) -> u8 {
    use pldmd_base::control::xfer_flag;

    debug_assert!(data_size > 0);
    if offset + length >= data_size {
        if offset == 0 {
            xfer_flag::START_AND_END
        } else {
            xfer_flag::END
        }
    } else if offset == 0 {
        xfer_flag::START
    } else {
        xfer_flag::MIDDLE
    }
}

/// Transfer flag for entry `idx` of `total` in a Pass Component Table
/// sequence.
pub fn pass_component_flag(idx: usize, total: usize) -> u8 {
    use pldmd_base::control::xfer_flag;

    if total == 1 {
        xfer_flag::START_AND_END
    } else if idx == 0 {
        xfer_flag::START
    } else if idx + 1 == total {
        xfer_flag::END
    } else {
        xfer_flag::MIDDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pldmd_base::control::xfer_flag;

    #[test]
    fn date_parse() {
        let x = b"20240704x";
        let d = pldm_date_parse(x).unwrap();
        let expect = PldmDate::from_ymd_opt(2024, 7, 4).unwrap();
        assert_eq!(d, ("x".as_bytes(), Some(expect)));

        // negative date rejected
        let x = b"-0240704x";
        pldm_date_parse(x).unwrap_err();

        // short fails
        let x = b"2024070";
        pldm_date_parse(x).unwrap_err();

        // bad date returns None
        let x = b"20240732";
        let (_, d) = pldm_date_parse(x).unwrap();
        assert_eq!(d, None);
    }

    #[test]
    fn descriptor_parse() {
        // PCI vendor id 0xccde
        let raw = [0x00, 0x00, 0x02, 0x00, 0xde, 0xcc];
        let (rest, d) = Descriptor::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(d, Descriptor::PciVid(0xccde));

        // IANA
        let raw = [0x01, 0x00, 0x04, 0x00, 0xd2, 0x04, 0x00, 0x00];
        let (_, d) = Descriptor::parse(&raw).unwrap();
        assert_eq!(d, Descriptor::Iana(1234));
    }

    #[test]
    fn device_identifiers_parse() {
        let raw = [
            0x02, // count
            0x00, 0x00, 0x02, 0x00, 0xde, 0xcc, // pci vid
            0x01, 0x00, 0x04, 0x00, 0xd2, 0x04, 0x00, 0x00, // iana
        ];
        let (rest, ids) = DeviceIdentifiers::parse(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(ids.ids.len(), 2);
    }

    #[test]
    fn transfer_flag_table() {
        // (offset, end-reached) → flag per the DSP0267 portion rules
        assert_eq!(transfer_flag(0, 32, 100), xfer_flag::START);
        assert_eq!(transfer_flag(32, 32, 100), xfer_flag::MIDDLE);
        assert_eq!(transfer_flag(0, 100, 100), xfer_flag::START_AND_END);
        assert_eq!(transfer_flag(0, 120, 100), xfer_flag::START_AND_END);
        assert_eq!(transfer_flag(96, 4, 100), xfer_flag::END);
        assert_eq!(transfer_flag(96, 32, 100), xfer_flag::END);
    }

    #[test]
    fn pass_component_flags() {
        assert_eq!(pass_component_flag(0, 1), xfer_flag::START_AND_END);
        assert_eq!(pass_component_flag(0, 3), xfer_flag::START);
        assert_eq!(pass_component_flag(1, 3), xfer_flag::MIDDLE);
        assert_eq!(pass_component_flag(2, 3), xfer_flag::END);
    }

    #[test]
    fn get_status_parse() {
        let raw = [3, 2, 0, 0, 50, 0, 0, 0, 0, 0];
        let (rest, s) = all_consuming(GetStatusResponse::parse)(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(s.current_state, FdState::Download);
        assert_eq!(s.previous_state, FdState::ReadyXfer);
        assert_eq!(s.progress_percent, 50);

        // unknown state fails
        let raw = [9, 2, 0, 0, 0, 0, 0, 0, 0, 0];
        GetStatusResponse::parse(&raw).unwrap_err();
    }
}
