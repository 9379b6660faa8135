// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Publication sink implementations.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Publication sinks for the engines' output.
//!
//! `LogSink` reports through the log facade; `MemorySink` records the last
//! published state for introspection and tests.

use std::collections::HashMap;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use pldmd_base::Tid;
use pldmd_fw::ua::FwSink;
use pldmd_platform::entity::Entity;
use pldmd_platform::proto::{EffecterId, SensorId};
use pldmd_platform::publish::{
    NumericReading, PlatformSink, StateChangeEvent, StateEffecterReading,
    StateReading, ThresholdBound, ThresholdSeverity,
};

/// Publishes everything as log lines.
#[derive(Debug, Default)]
pub struct LogSink;

impl PlatformSink for LogSink {
    fn inventory_node(&mut self, _tid: Tid, path: &str, entity: Entity) {
        info!(
            "inventory {path}: entity type {} instance {} container {}",
            entity.entity_type, entity.entity_instance, entity.container_id
        );
    }

    fn fru_record_set(&mut self, tid: Tid, path: &str, fru_rsi: u16) {
        info!("TID {tid}: FRU record set 0x{fru_rsi:04x} at {path}");
    }

    fn sensor_node(&mut self, tid: Tid, id: SensorId, path: &str) {
        info!("TID {tid}: sensor {} at {path}", id.0);
    }

    fn effecter_node(&mut self, tid: Tid, id: EffecterId, path: &str) {
        info!("TID {tid}: effecter {} at {path}", id.0);
    }

    fn numeric_sensor_reading(
        &mut self,
        tid: Tid,
        id: SensorId,
        name: &str,
        reading: &NumericReading,
    ) {
        debug!(
            "TID {tid}: {name} ({}) = {} available={} functional={}",
            id.0, reading.value, reading.available, reading.functional
        );
    }

    fn threshold_alarm(
        &mut self,
        tid: Tid,
        id: SensorId,
        severity: ThresholdSeverity,
        bound: ThresholdBound,
        asserted: bool,
    ) {
        warn!(
            "TID {tid}: sensor {} {severity:?} {bound:?} alarm {}",
            id.0,
            if asserted { "asserted" } else { "deasserted" }
        );
    }

    fn state_sensor_reading(
        &mut self,
        tid: Tid,
        id: SensorId,
        name: &str,
        reading: &StateReading,
    ) {
        debug!(
            "TID {tid}: {name} ({}) state {} (previous {})",
            id.0, reading.current, reading.previous
        );
    }

    fn state_change_event(&mut self, event: &StateChangeEvent) {
        info!(
            "{} of {} state sensor changed from {} to {}",
            event.state_set, event.sensor_name, event.previous, event.current
        );
    }

    fn numeric_effecter_reading(
        &mut self,
        tid: Tid,
        id: EffecterId,
        name: &str,
        reading: &NumericReading,
    ) {
        debug!(
            "TID {tid}: {name} ({}) = {} functional={}",
            id.0, reading.value, reading.functional
        );
    }

    fn state_effecter_reading(
        &mut self,
        tid: Tid,
        id: EffecterId,
        name: &str,
        reading: &StateEffecterReading,
    ) {
        debug!(
            "TID {tid}: {name} ({}) state {} pending {}",
            id.0, reading.current, reading.pending
        );
    }
}

impl FwSink for LogSink {
    fn progress(&mut self, tid: Tid, percent: u8) {
        info!("TID {tid}: update progress {percent}%");
    }

    fn activation(&mut self, active: bool) {
        info!(
            "Firmware activation: {}",
            if active { "Active" } else { "Failed" }
        );
    }
}

/// Records the last published state of everything.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Inventory paths published per terminus
    pub inventory: Vec<(Tid, String, Entity)>,
    /// Sensor object paths
    pub sensor_paths: HashMap<(u8, u16), String>,
    /// Last numeric sensor readings
    pub numeric: HashMap<(u8, u16), NumericReading>,
    /// Last state sensor readings
    pub states: HashMap<(u8, u16), StateReading>,
    /// Last numeric effecter readings
    pub numeric_effecters: HashMap<(u8, u16), NumericReading>,
    /// Last state effecter readings
    pub state_effecters: HashMap<(u8, u16), StateEffecterReading>,
    /// State change events, in order
    pub events: Vec<StateChangeEvent>,
    /// Threshold alarm transitions, in order
    pub alarms: Vec<(u16, ThresholdSeverity, ThresholdBound, bool)>,
    /// Update progress reports
    pub progress: Vec<u8>,
    /// Final activation outcome of the last update
    pub activation: Option<bool>,
}

impl PlatformSink for MemorySink {
    fn inventory_node(&mut self, tid: Tid, path: &str, entity: Entity) {
        self.inventory.push((tid, path.to_string(), entity));
    }

    fn sensor_node(&mut self, tid: Tid, id: SensorId, path: &str) {
        self.sensor_paths.insert((tid.0, id.0), path.to_string());
    }

    fn numeric_sensor_reading(
        &mut self,
        tid: Tid,
        id: SensorId,
        _name: &str,
        reading: &NumericReading,
    ) {
        self.numeric.insert((tid.0, id.0), *reading);
    }

    fn threshold_alarm(
        &mut self,
        _tid: Tid,
        id: SensorId,
        severity: ThresholdSeverity,
        bound: ThresholdBound,
        asserted: bool,
    ) {
        self.alarms.push((id.0, severity, bound, asserted));
    }

    fn state_sensor_reading(
        &mut self,
        tid: Tid,
        id: SensorId,
        _name: &str,
        reading: &StateReading,
    ) {
        self.states.insert((tid.0, id.0), *reading);
    }

    fn state_change_event(&mut self, event: &StateChangeEvent) {
        self.events.push(event.clone());
    }

    fn numeric_effecter_reading(
        &mut self,
        tid: Tid,
        id: EffecterId,
        _name: &str,
        reading: &NumericReading,
    ) {
        self.numeric_effecters.insert((tid.0, id.0), *reading);
    }

    fn state_effecter_reading(
        &mut self,
        tid: Tid,
        id: EffecterId,
        _name: &str,
        reading: &StateEffecterReading,
    ) {
        self.state_effecters.insert((tid.0, id.0), *reading);
    }

    fn sensor_removed(&mut self, tid: Tid, id: SensorId) {
        self.numeric.remove(&(tid.0, id.0));
        self.states.remove(&(tid.0, id.0));
        self.sensor_paths.remove(&(tid.0, id.0));
    }

    fn effecter_removed(&mut self, tid: Tid, id: EffecterId) {
        self.numeric_effecters.remove(&(tid.0, id.0));
        self.state_effecters.remove(&(tid.0, id.0));
    }
}

impl FwSink for MemorySink {
    fn progress(&mut self, _tid: Tid, percent: u8) {
        self.progress.push(percent);
    }

    fn activation(&mut self, active: bool) {
        self.activation = Some(active);
    }
}
