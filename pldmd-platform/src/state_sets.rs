// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! PLDM State Set definitions.
//!
//! From DSP0249. Only contains a subset at present; state-change events for
//! unlisted sets carry no readable names and are suppressed.

use core::fmt::Debug;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum HealthState {
    Unknown = 0,
    Normal,
    NonCritical,
    Critical,
    Fatal,
    UpperNonCritical,
    LowerNonCritical,
    UpperCritical,
    LowerCritical,
    UpperFatal,
    LowerFatal,
}

impl HealthState {
    /// DSP0249 state set number.
    pub const ID: u16 = 1;
}

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Availability {
    Unknown = 0,
    Enabled,
    Disabled,
    Shutdown,
    Offline,
    Online,
    Offduty,
    Available,
    Standby,
    SleepLight,
    SleepDeep,
    PoweredCycledOff,
    PoweredOff,
    Rebooting,
}

impl Availability {
    /// DSP0249 state set number.
    pub const ID: u16 = 2;
}

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum OperationFaultStatus {
    Unknown = 0,
    Normal,
    Error,
    NonRecoverableError,
}

impl OperationFaultStatus {
    /// DSP0249 state set number.
    pub const ID: u16 = 10;
}

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum PowerState {
    Unknown = 0,
    FullPower,
    PowerSave,
    PowerSaveStandby,
    PowerSaveSleep,
    PowerOff,
}

impl PowerState {
    /// DSP0249 state set number.
    pub const ID: u16 = 11;
}

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum DeviceInitialization {
    Unknown = 0,
    Normal,
    InitializationInProgress,
    InitializationHung,
    InitializationFailed,
}

impl DeviceInitialization {
    /// DSP0249 state set number.
    pub const ID: u16 = 20;
}

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum BootRestartCause {
    Unknown = 0,
    PowerUp,
    HardReset,
    WarmReset,
    ManualHardReset,
    ManualWarmReset,
    SystemRestart,
    WatchdogTimeout,
}

impl BootRestartCause {
    /// DSP0249 state set number.
    pub const ID: u16 = 192;
}

#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum HardwareSecurity {
    Unknown = 0,
    HardwareSecurityVerified,
    HardwareSecurityUnverified,
}

impl HardwareSecurity {
    /// DSP0249 state set number.
    pub const ID: u16 = 99;
}

/// The readable name of a state set, for known sets.
pub fn state_set_name(id: u16) -> Option<&'static str> {
    let name = match id {
        HealthState::ID => "Health State",
        Availability::ID => "Availability",
        OperationFaultStatus::ID => "Operation Fault Status",
        PowerState::ID => "Power State",
        DeviceInitialization::ID => "Device Initialization",
        HardwareSecurity::ID => "Hardware Security",
        BootRestartCause::ID => "Boot Restart Cause",
        _ => return None,
    };
    Some(name)
}

fn debug_name<T: FromPrimitive + Debug>(value: u8) -> Option<String> {
    T::from_u8(value).map(|v| format!("{v:?}"))
}

/// The readable name of a state value within a set.
///
/// `None` for unknown sets or values outside the set.
pub fn state_value_name(id: u16, value: u8) -> Option<String> {
    match id {
        HealthState::ID => debug_name::<HealthState>(value),
        Availability::ID => debug_name::<Availability>(value),
        OperationFaultStatus::ID => debug_name::<OperationFaultStatus>(value),
        PowerState::ID => debug_name::<PowerState>(value),
        DeviceInitialization::ID => debug_name::<DeviceInitialization>(value),
        HardwareSecurity::ID => debug_name::<HardwareSecurity>(value),
        BootRestartCause::ID => debug_name::<BootRestartCause>(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(state_set_name(10), Some("Operation Fault Status"));
        assert_eq!(state_set_name(0xffee), None);
        assert_eq!(state_value_name(10, 1).as_deref(), Some("Normal"));
        assert_eq!(state_value_name(10, 2).as_deref(), Some("Error"));
        assert_eq!(state_value_name(10, 99), None);
        assert_eq!(state_value_name(0xffee, 1), None);
    }
}
