// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! The publication surface the engines report through.
//!
//! The object/property service that exposes inventory, sensors and
//! effecters to local consumers is an external collaborator; the engines
//! only see this trait. Implementations must not fail; errors stay on the
//! sink side.

use pldmd_base::Tid;

use crate::entity::Entity;
use crate::proto::{EffecterId, SensorId};

/// State reading value meaning "no valid state".
pub const INVALID_STATE: u8 = 0xff;

/// Published reading of a numeric sensor or effecter.
#[derive(Debug, Clone, Copy)]
pub struct NumericReading {
    /// Converted value, NaN when unknown
    pub value: f64,
    /// Whether the source is reachable
    pub available: bool,
    /// Whether the source is operating
    pub functional: bool,
}

impl Default for NumericReading {
    fn default() -> Self {
        Self {
            value: f64::NAN,
            available: true,
            functional: true,
        }
    }
}

/// Published reading of a state sensor.
#[derive(Debug, Clone, Copy)]
pub struct StateReading {
    /// Present state, [`INVALID_STATE`] when unknown
    pub current: u8,
    /// Previous state
    pub previous: u8,
    /// Whether the source is reachable
    pub available: bool,
    /// Whether the source is operating
    pub functional: bool,
}

impl Default for StateReading {
    fn default() -> Self {
        Self {
            current: INVALID_STATE,
            previous: INVALID_STATE,
            available: true,
            functional: true,
        }
    }
}

/// Published reading of a state effecter.
#[derive(Debug, Clone, Copy)]
pub struct StateEffecterReading {
    /// Present state
    pub current: u8,
    /// Pending state while a transition is in progress
    pub pending: u8,
    /// Whether the source is reachable
    pub available: bool,
    /// Whether the source is operating
    pub functional: bool,
}

impl Default for StateEffecterReading {
    fn default() -> Self {
        Self {
            current: INVALID_STATE,
            pending: INVALID_STATE,
            available: true,
            functional: true,
        }
    }
}

/// Threshold severity of a numeric sensor alarm.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSeverity {
    Warning,
    Critical,
}

/// Bound direction of a numeric sensor alarm.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdBound {
    Upper,
    Lower,
}

/// A state sensor transition observed between two polls.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    /// Terminus the sensor belongs to
    pub tid: Tid,
    /// Sensor that changed
    pub sensor: SensorId,
    /// Published sensor name
    pub sensor_name: String,
    /// Readable state set name
    pub state_set: String,
    /// Readable name of the previous state
    pub previous: String,
    /// Readable name of the new state
    pub current: String,
}

/// Sink for everything the platform engines publish.
///
/// All methods default to no-ops so implementations subscribe to what they
/// need.
#[allow(unused_variables)]
pub trait PlatformSink {
    /// An inventory node for an entity in the association tree.
    fn inventory_node(&mut self, tid: Tid, path: &str, entity: Entity) {}

    /// A FRU record set attached to an entity path.
    fn fru_record_set(&mut self, tid: Tid, path: &str, fru_rsi: u16) {}

    /// A sensor object created under its entity path.
    fn sensor_node(&mut self, tid: Tid, id: SensorId, path: &str) {}

    /// An effecter object created under its entity path.
    fn effecter_node(&mut self, tid: Tid, id: EffecterId, path: &str) {}

    /// A numeric sensor reading update.
    fn numeric_sensor_reading(
        &mut self,
        tid: Tid,
        id: SensorId,
        name: &str,
        reading: &NumericReading,
    ) {
    }

    /// A threshold alarm assertion change.
    fn threshold_alarm(
        &mut self,
        tid: Tid,
        id: SensorId,
        severity: ThresholdSeverity,
        bound: ThresholdBound,
        asserted: bool,
    ) {
    }

    /// A state sensor reading update.
    fn state_sensor_reading(
        &mut self,
        tid: Tid,
        id: SensorId,
        name: &str,
        reading: &StateReading,
    ) {
    }

    /// A state change observed on a state sensor.
    fn state_change_event(&mut self, event: &StateChangeEvent) {}

    /// A numeric effecter value update.
    fn numeric_effecter_reading(
        &mut self,
        tid: Tid,
        id: EffecterId,
        name: &str,
        reading: &NumericReading,
    ) {
    }

    /// A state effecter reading update.
    fn state_effecter_reading(
        &mut self,
        tid: Tid,
        id: EffecterId,
        name: &str,
        reading: &StateEffecterReading,
    ) {
    }

    /// A sensor removed during terminus teardown.
    fn sensor_removed(&mut self, tid: Tid, id: SensorId) {}

    /// An effecter removed during terminus teardown.
    fn effecter_removed(&mut self, tid: Tid, id: EffecterId) {}
}

/// A sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl PlatformSink for NullSink {}
