// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * State sensor engine.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Polling engine for one state sensor.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use deku::{DekuContainerRead, DekuContainerWrite};
use num_traits::FromPrimitive;

use pldmd_base::mediator::Mediator;
use pldmd_base::transport::Binding;
use pldmd_base::{
    ccode_result, proto_error, PldmError, PldmRequest, Result, Tid,
};

use crate::pdr::{possible_state_values, InitHint, StateSensorPdr};
use crate::proto::{
    Cmd, GetStateSensorReadingsReq, GetStateSensorReadingsResp,
    SensorEventMessageEnable, SensorId, SensorOperationalState,
    SetEnableField, SetSensorOperationalState, SetStateSensorEnablesReq,
};
use crate::publish::{
    PlatformSink, StateChangeEvent, StateReading, INVALID_STATE,
};
use crate::sensor_numeric::ERROR_THRESHOLD;
use crate::state_sets::{state_set_name, state_value_name};
use crate::{CMD_RETRIES, CMD_TIMEOUT, PLDM_TYPE_PLATFORM};

/// One state sensor of a terminus.
pub struct StateSensorHandler {
    tid: Tid,
    id: SensorId,
    name: String,
    pdr: StateSensorPdr,
    possible: Vec<u8>,
    reading: StateReading,
    published: bool,
    err_count: usize,
    disabled: bool,
}

impl StateSensorHandler {
    /// Construct the handler from a parsed State Sensor PDR.
    ///
    /// Fails when the PDR carries no possible states.
    pub fn new(
        tid: Tid,
        name: String,
        pdr: StateSensorPdr,
    ) -> Result<StateSensorHandler> {
        let possible = possible_state_values(&pdr.possible_states);
        if possible.is_empty() {
            return Err(proto_error!("State sensor PDR data invalid"));
        }
        if pdr.composite_sensor_count > 1 {
            warn!(
                "TID {tid}: composite state sensor {} not supported, \
                 driving first instance only",
                pdr.sensor_id
            );
        }
        Ok(StateSensorHandler {
            tid,
            id: SensorId(pdr.sensor_id),
            name,
            pdr,
            possible,
            reading: StateReading::default(),
            published: false,
            err_count: 0,
            disabled: false,
        })
    }

    /// The sensor's ID.
    pub fn id(&self) -> SensorId {
        self.id
    }

    /// The sensor's published name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The states the sensor may report.
    pub fn possible_states(&self) -> &[u8] {
        &self.possible
    }

    /// The last published reading.
    pub fn reading(&self) -> &StateReading {
        &self.reading
    }

    /// Whether the PDR disables this sensor.
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Enable the sensor per its PDR init hint.
    pub async fn enable(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
    ) -> Result<()> {
        let op_state = match InitHint::from_u8(self.pdr.sensor_init) {
            Some(InitHint::NoInit) | Some(InitHint::Enable) => {
                SetSensorOperationalState::Enabled
            }
            Some(InitHint::Disable) => {
                self.disabled = true;
                SetSensorOperationalState::Disabled
            }
            Some(InitHint::UseInitPdr) => {
                warn!(
                    "TID {}: state sensor {} requests init PDR, not supported",
                    self.tid, self.id.0
                );
                return Err(PldmError::InvalidArgument);
            }
            None => {
                error!(
                    "TID {}: invalid sensorInit in state sensor PDR",
                    self.tid
                );
                return Err(PldmError::InvalidArgument);
            }
        };

        let msg = SetStateSensorEnablesReq {
            sensor: self.id,
            fields: vec![SetEnableField {
                set_op_state: op_state,
                event_enable: SensorEventMessageEnable::NoEventGeneration,
            }],
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::SetStateSensorEnables as u8,
            data,
        );
        mediator
            .send_receive_cc(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;

        if self.disabled {
            self.update(sink, INVALID_STATE, INVALID_STATE, true, false);
        }
        debug!(
            "TID {}: SetStateSensorEnables success, sensor {}",
            self.tid, self.id.0
        );
        Ok(())
    }

    /// Poll the sensor once and publish the outcome.
    pub async fn poll(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
    ) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        match self.read(mediator, sink).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.increment_error(sink);
                Err(e)
            }
        }
    }

    async fn read(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
    ) -> Result<()> {
        let msg = GetStateSensorReadingsReq {
            sensor: self.id,
            rearm: 0,
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::GetStateSensorReadings as u8,
            data,
        );
        let rsp = mediator
            .send_receive(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;
        ccode_result(rsp.cc)?;

        let ((_, _), readings) =
            GetStateSensorReadingsResp::from_bytes((&rsp.data, 0)).map_err(
                |e| {
                    trace!("GetStateSensorReadings parse error {e}");
                    proto_error!("Bad GetStateSensorReadings response")
                },
            )?;

        // Composite sensors are not driven; only the first field matters
        let Some(field) = readings.fields.first() else {
            return Err(proto_error!("Empty state sensor reading"));
        };

        match field.op_state {
            SensorOperationalState::Enabled => {
                self.err_count = 0;
                self.update(
                    sink,
                    field.present_state,
                    field.previous_state,
                    true,
                    true,
                );
                Ok(())
            }
            SensorOperationalState::Disabled => {
                self.update(sink, INVALID_STATE, INVALID_STATE, true, false);
                debug!(
                    "TID {}: state sensor {} disabled",
                    self.tid, self.id.0
                );
                Ok(())
            }
            SensorOperationalState::Unavailable => {
                self.update(sink, INVALID_STATE, INVALID_STATE, false, false);
                debug!(
                    "TID {}: state sensor {} unavailable",
                    self.tid, self.id.0
                );
                Err(proto_error!("Sensor unavailable"))
            }
            other => {
                debug!(
                    "TID {}: state sensor {} operational state {other:?}",
                    self.tid, self.id.0
                );
                Err(proto_error!("Sensor state unknown"))
            }
        }
    }

    fn increment_error(&mut self, sink: &mut dyn PlatformSink) {
        if self.err_count >= ERROR_THRESHOLD {
            return;
        }
        self.err_count += 1;
        if self.err_count == ERROR_THRESHOLD {
            error!(
                "TID {}: state sensor {} reading failed",
                self.tid, self.id.0
            );
            self.update(sink, INVALID_STATE, INVALID_STATE, true, false);
        }
    }

    fn update(
        &mut self,
        sink: &mut dyn PlatformSink,
        current: u8,
        previous: u8,
        available: bool,
        functional: bool,
    ) {
        // A transition between valid states is reported before the
        // published readings move
        if self.published
            && ((current != self.reading.current && current != INVALID_STATE)
                || (previous != self.reading.previous
                    && previous != INVALID_STATE))
        {
            self.emit_state_change(sink, current, previous);
        }

        self.reading = StateReading {
            current,
            previous,
            available,
            functional,
        };
        self.published = true;
        sink.state_sensor_reading(self.tid, self.id, &self.name, &self.reading);
    }

    fn emit_state_change(
        &self,
        sink: &mut dyn PlatformSink,
        current: u8,
        previous: u8,
    ) {
        let set_id = self.pdr.state_set_id;
        let Some(set_name) = state_set_name(set_id) else {
            return;
        };
        let Some(current_name) = state_value_name(set_id, current) else {
            return;
        };
        let Some(previous_name) = state_value_name(set_id, previous) else {
            return;
        };

        info!(
            "{set_name} of {} state sensor changed from {previous_name} to \
             {current_name}",
            self.name
        );
        sink.state_change_event(&StateChangeEvent {
            tid: self.tid,
            sensor: self.id,
            sensor_name: self.name.clone(),
            state_set: set_name.to_string(),
            previous: previous_name,
            current: current_name,
        });
    }

    /// Tear the sensor down.
    pub fn shutdown(&mut self, sink: &mut dyn PlatformSink) {
        sink.sensor_removed(self.tid, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::sensor_test::ScriptBinding;
    use crate::state_sets::OperationFaultStatus;
    use pldmd_base::transport::Eid;

    #[derive(Default)]
    struct Record {
        readings: Vec<StateReading>,
        events: Vec<StateChangeEvent>,
    }

    impl PlatformSink for Record {
        fn state_sensor_reading(
            &mut self,
            _tid: Tid,
            _id: SensorId,
            _name: &str,
            reading: &StateReading,
        ) {
            self.readings.push(*reading);
        }

        fn state_change_event(&mut self, event: &StateChangeEvent) {
            self.events.push(event.clone());
        }
    }

    fn handler() -> StateSensorHandler {
        let pdr = StateSensorPdr {
            terminus_handle: 1,
            sensor_id: 3,
            entity: Entity {
                entity_type: 7,
                entity_instance: 1,
                container_id: 100,
            },
            sensor_init: InitHint::NoInit as u8,
            sensor_auxiliary_names_pdr: 0,
            composite_sensor_count: 1,
            state_set_id: OperationFaultStatus::ID,
            possible_states_size: 1,
            // states 1, 2, 3
            possible_states: vec![0b0000_1110],
        };
        StateSensorHandler::new(Tid(1), "Fault_Status".into(), pdr).unwrap()
    }

    fn readings_resp(op_state: u8, present: u8, previous: u8) -> Vec<u8> {
        vec![0x01, op_state, present, previous, present]
    }

    fn mediator(b: ScriptBinding) -> Mediator<ScriptBinding> {
        let mut m = Mediator::new(b);
        m.tid_map_mut().add(Tid(1), Eid(8)).unwrap();
        m
    }

    #[test]
    fn empty_possible_states_rejected() {
        let pdr = StateSensorPdr {
            possible_states_size: 0,
            possible_states: vec![],
            ..handler().pdr
        };
        assert!(StateSensorHandler::new(Tid(1), "x".into(), pdr).is_err());
    }

    #[test]
    fn state_change_event() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&readings_resp(0, 1, 1));
            b.push_ok(&readings_resp(0, 2, 1));
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut s = handler();

            s.poll(&mut m, &mut sink).await.unwrap();
            // first publication carries no event
            assert!(sink.events.is_empty());

            s.poll(&mut m, &mut sink).await.unwrap();
            assert_eq!(sink.events.len(), 1);
            let ev = &sink.events[0];
            assert_eq!(ev.state_set, "Operation Fault Status");
            assert_eq!(ev.previous, "Normal");
            assert_eq!(ev.current, "Error");

            assert_eq!(sink.readings.last().unwrap().current, 2);
            assert_eq!(sink.readings.last().unwrap().previous, 1);
        })
    }

    #[test]
    fn debounce_to_invalid() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&readings_resp(0, 1, 1));
            for _ in 0..ERROR_THRESHOLD * CMD_RETRIES {
                b.push_timeout();
            }
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut s = handler();

            s.poll(&mut m, &mut sink).await.unwrap();
            for _ in 0..ERROR_THRESHOLD {
                s.poll(&mut m, &mut sink).await.unwrap_err();
            }

            let last = sink.readings.last().unwrap();
            assert!(!last.functional);
            assert_eq!(last.current, INVALID_STATE);
            // the invalid transition emits no event
            assert!(sink.events.is_empty());
        })
    }

    #[test]
    fn disabled_init_hint_skips_polling() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&[]); // enable (disable) command
            let mut m = mediator(b);
            let mut sink = Record::default();

            let mut pdr_handler = {
                let mut h = handler();
                h.pdr.sensor_init = InitHint::Disable as u8;
                h
            };
            pdr_handler.enable(&mut m, &mut sink).await.unwrap();
            assert!(pdr_handler.disabled());
            assert!(!sink.readings.last().unwrap().functional);

            // polling is a no-op while disabled
            pdr_handler.poll(&mut m, &mut sink).await.unwrap();
            assert_eq!(sink.readings.len(), 1);
        })
    }
}
