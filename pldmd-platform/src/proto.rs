// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM Monitoring and Control wire definitions.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Message structures for the platform commands the daemon issues.

use core::num::ParseIntError;
use core::str::FromStr;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use deku::{deku_derive, DekuEnumExt, DekuRead, DekuWrite};

use chrono::{DateTime, FixedOffset, TimeDelta, TimeZone};

use pldmd_base::{proto_error, PldmError};

/// PLDM Platform Commands
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Cmd {
    GetTerminusUID = 0x03,
    SetEventReceiver = 0x04,
    GetEventReceiver = 0x05,
    PlatformEventMessage = 0x0A,
    PollForPlatformEventMessage = 0x0B,
    EventMessageSupported = 0x0C,
    EventMessageBufferSize = 0x0D,
    SetNumericSensorEnable = 0x10,
    GetSensorReading = 0x11,
    GetSensorThresholds = 0x12,
    SetSensorThresholds = 0x13,
    RestoreSensorThresholds = 0x14,
    GetSensorHysteresis = 0x15,
    SetSensorHysteresis = 0x16,
    InitNumericSensor = 0x17,
    SetStateSensorEnables = 0x20,
    GetStateSensorReadings = 0x21,
    InitStateSensor = 0x22,
    SetNumericEffecterEnable = 0x30,
    SetNumericEffecterValue = 0x31,
    GetNumericEffecterValue = 0x32,
    SetStateEffecterEnables = 0x38,
    SetStateEffecterStates = 0x39,
    GetStateEffecterStates = 0x3A,
    GetPDRRepositoryInfo = 0x50,
    GetPDR = 0x51,
    FindPDR = 0x52,
    GetPDRRepositorySignature = 0x53,
    RunInitAgent = 0x58,
}

impl TryFrom<u8> for Cmd {
    type Error = PldmError;

    fn try_from(value: u8) -> Result<Self, PldmError> {
        Self::from_u8(value).ok_or_else(|| {
            proto_error!("Unknown PLDM platform command", "{value:02x}")
        })
    }
}

/// PLDM platform response codes
#[allow(missing_docs)]
pub mod plat_codes {
    pub const INVALID_SENSOR_ID: u8 = 0x80;
    pub const EVENT_GENERATION_NOT_SUPPORTED: u8 = 0x82;

    // Get PDR
    pub const INVALID_DATA_TRANSFER_HANDLE: u8 = 0x80;
    pub const INVALID_TRANSFER_OPERATION_FLAG: u8 = 0x81;
    pub const INVALID_RECORD_HANDLE: u8 = 0x82;
    pub const INVALID_RECORD_CHANGE_NUMBER: u8 = 0x83;
    pub const TRANSFER_TIMEOUT: u8 = 0x84;
    pub const REPOSITORY_UPDATE_IN_PROGRESS: u8 = 0x85;
}

pub use plat_codes::*;

// repr(u8) doesn't work with field-less variants for Deku
#[allow(missing_docs)]
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, DekuWrite, DekuRead)]
#[deku(endian = "little", ctx = "data_size: u8", id = "data_size")]
pub enum SensorData {
    #[deku(id = 0)]
    U8(u8),
    #[deku(id = 1)]
    I8(i8),
    #[deku(id = 2)]
    U16(u16),
    #[deku(id = 3)]
    I16(i16),
    #[deku(id = 4)]
    U32(u32),
    #[deku(id = 5)]
    I32(i32),
}

impl SensorData {
    /// The raw reading widened to `f64`.
    pub fn to_f64(&self) -> f64 {
        match *self {
            Self::U8(v) => v.into(),
            Self::I8(v) => v.into(),
            Self::U16(v) => v.into(),
            Self::I16(v) => v.into(),
            Self::U32(v) => v.into(),
            Self::I32(v) => v.into(),
        }
    }

    /// Format a raw value for the given data size.
    ///
    /// Fails if the value cannot be represented.
    pub fn from_f64(data_size: u8, v: f64) -> Option<Self> {
        if !v.is_finite() {
            return None;
        }
        let v = v.round();
        let r = match data_size {
            0 => Self::U8(u8::try_from(v as i64).ok()?),
            1 => Self::I8(i8::try_from(v as i64).ok()?),
            2 => Self::U16(u16::try_from(v as i64).ok()?),
            3 => Self::I16(i16::try_from(v as i64).ok()?),
            4 => Self::U32(u32::try_from(v as i64).ok()?),
            5 => Self::I32(i32::try_from(v as i64).ok()?),
            _ => return None,
        };
        Some(r)
    }

    /// The data size discriminant for this reading.
    pub fn data_size(&self) -> u8 {
        // Infallible for a unit-discriminant enum
        self.deku_id().unwrap_or(0)
    }
}

/// Sensor value ranges, sized by the PDR's range field format.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Clone, Copy, DekuWrite, DekuRead)]
#[deku(endian = "little", ctx = "format: u8", id = "format")]
pub enum RangeData {
    #[deku(id = 0)]
    U8(u8),
    #[deku(id = 1)]
    I8(i8),
    #[deku(id = 2)]
    U16(u16),
    #[deku(id = 3)]
    I16(i16),
    #[deku(id = 4)]
    U32(u32),
    #[deku(id = 5)]
    I32(i32),
    #[deku(id = 6)]
    F32(f32),
}

impl RangeData {
    /// The range bound widened to `f64`.
    pub fn to_f64(&self) -> f64 {
        match *self {
            Self::U8(v) => v.into(),
            Self::I8(v) => v.into(),
            Self::U16(v) => v.into(),
            Self::I16(v) => v.into(),
            Self::U32(v) => v.into(),
            Self::I32(v) => v.into(),
            Self::F32(v) => v.into(),
        }
    }
}

#[allow(missing_docs)]
#[derive(
    FromPrimitive, Debug, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite,
)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum SensorOperationalState {
    Enabled = 0,
    Disabled,
    Unavailable,
    StatusUnknown,
    Failed,
    Initializing,
    ShuttingDown,
    InTest,
}

#[allow(missing_docs)]
#[derive(
    FromPrimitive, Debug, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite,
)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum SetSensorOperationalState {
    Enabled = 0,
    Disabled,
    Unavailable,
}

#[allow(missing_docs)]
#[derive(
    FromPrimitive, Debug, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite,
)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum SensorEventMessageEnable {
    /// NoEventGeneration for GetSensor, NoChange for SetSensorEnable
    NoEventGeneration = 0,
    EventsDisabled,
    EventsEnabled,
    OpEventsOnlyEnabled,
    StateEventsOnlyEnabled,
}

#[allow(missing_docs)]
#[derive(
    FromPrimitive, Debug, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite,
)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum SensorState {
    Unknown = 0,
    Normal,
    Warning,
    Critical,
    Fatal,
    LowerWarning,
    LowerCritical,
    LowerFatal,
    UpperWarning,
    UpperCritical,
    UpperFatal,
}

/// Effecter operational states, DSP0248 table 37.
#[allow(missing_docs)]
#[derive(
    FromPrimitive, Debug, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite,
)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum EffecterOperationalState {
    EnabledUpdatePending = 0,
    EnabledNoUpdatePending,
    Disabled,
    Unavailable,
    StatusUnknown,
    Failed,
    Initializing,
    ShuttingDown,
    InTest,
}

/// Sensor identifier
#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy, Hash)]
#[deku(endian = "little")]
pub struct SensorId(pub u16);

impl FromStr for SensorId {
    type Err = ParseIntError;
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Ok(Self(if let Some(s) = s.strip_prefix("0x") {
            u16::from_str_radix(s, 16)
        } else {
            s.parse()
        }?))
    }
}

/// Effecter identifier
#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy, Hash)]
#[deku(endian = "little")]
pub struct EffecterId(pub u16);

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone)]
pub struct GetSensorReadingReq {
    pub sensor: SensorId,
    pub rearm: bool,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq)]
pub struct GetSensorReadingResp {
    #[deku(temp, temp_value = "self.reading.data_size()")]
    data_size: u8,
    pub op_state: SensorOperationalState,
    pub event_enable: SensorEventMessageEnable,
    pub present_state: SensorState,
    pub previous_state: SensorState,
    pub event_state: SensorState,
    #[deku(ctx = "*core::borrow::Borrow::<u8>::borrow(&data_size)")]
    pub reading: SensorData,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateSensorReadingsReq {
    pub sensor: SensorId,
    pub rearm: u8,
    #[deku(temp, temp_value = "0")]
    rsvd: u8,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct StateField {
    pub op_state: SensorOperationalState,
    pub present_state: u8,
    pub previous_state: u8,
    pub event_state: u8,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateSensorReadingsResp {
    #[deku(temp, temp_value = "self.fields.len() as u8")]
    composite_sensor_count: u8,
    #[deku(count = "composite_sensor_count")]
    pub fields: Vec<StateField>,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct SetNumericSensorEnableReq {
    pub sensor: SensorId,
    pub set_op_state: SetSensorOperationalState,
    pub event_enable: SensorEventMessageEnable,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct SetEnableField {
    pub set_op_state: SetSensorOperationalState,
    pub event_enable: SensorEventMessageEnable,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStateSensorEnablesReq {
    pub sensor: SensorId,
    #[deku(temp, temp_value = "self.fields.len() as u8")]
    composite_sensor_count: u8,
    #[deku(count = "composite_sensor_count")]
    pub fields: Vec<SetEnableField>,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct SetNumericEffecterEnableReq {
    pub effecter: EffecterId,
    pub op_state: EffecterOperationalState,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq)]
pub struct SetNumericEffecterValueReq {
    pub effecter: EffecterId,
    #[deku(temp, temp_value = "self.value.data_size()")]
    data_size: u8,
    #[deku(ctx = "*core::borrow::Borrow::<u8>::borrow(&data_size)")]
    pub value: SensorData,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct GetNumericEffecterValueReq {
    pub effecter: EffecterId,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq)]
pub struct GetNumericEffecterValueResp {
    #[deku(temp, temp_value = "self.present.data_size()")]
    data_size: u8,
    pub op_state: EffecterOperationalState,
    #[deku(ctx = "*core::borrow::Borrow::<u8>::borrow(&data_size)")]
    pub pending: SensorData,
    #[deku(ctx = "*core::borrow::Borrow::<u8>::borrow(&data_size)")]
    pub present: SensorData,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct EffecterEnableField {
    pub op_state: EffecterOperationalState,
    pub event_enable: SensorEventMessageEnable,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStateEffecterEnablesReq {
    pub effecter: EffecterId,
    #[deku(temp, temp_value = "self.fields.len() as u8")]
    composite_effecter_count: u8,
    #[deku(count = "composite_effecter_count")]
    pub fields: Vec<EffecterEnableField>,
}

/// Set request flag for a `SetStateEffecterStates` field.
#[allow(missing_docs)]
#[derive(
    FromPrimitive, Debug, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite,
)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum SetRequest {
    NoChange = 0,
    RequestSet,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct StateEffecterSetField {
    pub set_request: SetRequest,
    pub effecter_state: u8,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStateEffecterStatesReq {
    pub effecter: EffecterId,
    #[deku(temp, temp_value = "self.fields.len() as u8")]
    composite_effecter_count: u8,
    #[deku(count = "composite_effecter_count")]
    pub fields: Vec<StateEffecterSetField>,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct GetStateEffecterStatesReq {
    pub effecter: EffecterId,
}

#[allow(missing_docs)]
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
pub struct EffecterStateField {
    pub op_state: EffecterOperationalState,
    pub pending_state: u8,
    pub present_state: u8,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateEffecterStatesResp {
    #[deku(temp, temp_value = "self.fields.len() as u8")]
    composite_effecter_count: u8,
    #[deku(count = "composite_effecter_count")]
    pub fields: Vec<EffecterStateField>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, Eq, PartialEq)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum PDRRepositoryState {
    Available = 0,
    UpdateInProgress,
    Failed,
}

/// PLDM timestamp104.
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Timestamp104(pub [u8; 13]);

impl core::fmt::Debug for Timestamp104 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Ok(dt) = DateTime::<FixedOffset>::try_from(self) {
            write!(f, "Timestamp104({dt:?})")
        } else {
            write!(f, "Timestamp104(invalid {:?})", self.0)
        }
    }
}

impl TryFrom<&Timestamp104> for DateTime<FixedOffset> {
    type Error = ();

    fn try_from(t: &Timestamp104) -> Result<Self, Self::Error> {
        let t = &t.0;
        let tz = i16::from_le_bytes(t[..=1].try_into().unwrap_or_default());
        let tz = FixedOffset::east_opt(tz as i32 * 60).ok_or_else(|| {
            trace!("Bad timezone {tz}");
        })?;
        let year = u16::from_le_bytes(t[10..=11].try_into().unwrap_or_default());
        let dt = tz
            .with_ymd_and_hms(
                year as i32,
                t[9] as u32,
                t[8] as u32,
                t[7] as u32,
                t[6] as u32,
                t[5] as u32,
            )
            .earliest()
            .ok_or_else(|| {
                trace!("Bad timestamp");
            })?;
        // read a u32 and mask to 24 bit
        let micros = u32::from_le_bytes(t[2..=5].try_into().unwrap_or_default())
            & 0xffffff;
        Ok(dt + TimeDelta::microseconds(micros as i64))
    }
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPDRRepositoryInfoResp {
    pub state: PDRRepositoryState,
    pub update_time: Timestamp104,
    pub oem_update_time: Timestamp104,
    #[deku(endian = "little")]
    pub record_count: u32,
    #[deku(endian = "little")]
    pub repository_size: u32,
    #[deku(endian = "little")]
    pub largest_record_size: u32,
    pub data_transfer_handle_timeout: u8,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[deku(id_type = "u8")]
#[repr(u8)]
pub enum TransferOperationFlag {
    NextPart = 0,
    FirstPart = 1,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPDRReq {
    pub record_handle: u32,
    pub data_transfer_handle: u32,
    pub transfer_operation_flag: TransferOperationFlag,
    pub request_count: u16,
    pub record_change_number: u16,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPDRResp {
    #[deku(endian = "little")]
    pub next_record_handle: u32,
    #[deku(endian = "little")]
    pub next_data_transfer_handle: u32,
    pub transfer_flag: u8,

    #[deku(temp, temp_value = "self.record_data.len() as u16")]
    #[deku(endian = "little")]
    response_count: u16,
    #[deku(count = "response_count")]
    pub record_data: Vec<u8>,

    /// CRC over the entire PDR, present when transfer_flag has END set
    #[deku(
        cond = "*transfer_flag & pldmd_base::control::xfer_flag::END != 0"
    )]
    pub crc: Option<u8>,
}
