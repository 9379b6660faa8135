// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * State effecter engine.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Read/write engine for one state effecter.

use std::time::Duration;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use deku::{DekuContainerRead, DekuContainerWrite};
use num_traits::FromPrimitive;

use pldmd_base::mediator::Mediator;
use pldmd_base::transport::Binding;
use pldmd_base::{
    ccode_result, proto_error, PldmError, PldmRequest, Result, Tid,
};

use crate::effecter_numeric::EFFECTER_ERROR_THRESHOLD;
use crate::pdr::{possible_state_values, InitHint, StateEffecterPdr};
use crate::proto::{
    Cmd, EffecterEnableField, EffecterId, EffecterOperationalState,
    GetStateEffecterStatesReq, GetStateEffecterStatesResp,
    SensorEventMessageEnable, SetRequest, SetStateEffecterEnablesReq,
    SetStateEffecterStatesReq, StateEffecterSetField,
};
use crate::publish::{PlatformSink, StateEffecterReading, INVALID_STATE};
use crate::{SetError, CMD_RETRIES, CMD_TIMEOUT, PLDM_TYPE_PLATFORM};

// A state transition is quick; re-read shortly after.
const TRANSITION_INTERVAL: Duration = Duration::from_millis(3);

/// One state effecter of a terminus.
pub struct StateEffecterHandler {
    tid: Tid,
    id: EffecterId,
    name: String,
    pdr: StateEffecterPdr,
    possible: Vec<u8>,
    reading: StateEffecterReading,
    published: bool,
    err_count: usize,
}

impl StateEffecterHandler {
    /// Construct the handler from a parsed State Effecter PDR.
    ///
    /// Fails when the PDR carries no possible states.
    pub fn new(
        tid: Tid,
        name: String,
        pdr: StateEffecterPdr,
    ) -> Result<StateEffecterHandler> {
        let possible = possible_state_values(&pdr.possible_states);
        if possible.is_empty() {
            return Err(proto_error!("State effecter PDR data invalid"));
        }
        if pdr.composite_effecter_count > 1 {
            warn!(
                "TID {tid}: composite state effecter {} not supported, \
                 driving first instance only",
                pdr.effecter_id
            );
        }
        Ok(StateEffecterHandler {
            tid,
            id: EffecterId(pdr.effecter_id),
            name,
            pdr,
            possible,
            reading: StateEffecterReading::default(),
            published: false,
            err_count: 0,
        })
    }

    /// The effecter's ID.
    pub fn id(&self) -> EffecterId {
        self.id
    }

    /// The effecter's published name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The states the effecter accepts.
    pub fn possible_states(&self) -> &[u8] {
        &self.possible
    }

    /// The last published reading.
    pub fn reading(&self) -> &StateEffecterReading {
        &self.reading
    }

    /// Enable the effecter per its PDR init hint.
    pub async fn enable(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        let op_state = match InitHint::from_u8(self.pdr.effecter_init) {
            Some(InitHint::NoInit) | Some(InitHint::Enable) => {
                EffecterOperationalState::EnabledNoUpdatePending
            }
            Some(InitHint::Disable) => EffecterOperationalState::Disabled,
            Some(InitHint::UseInitPdr) => {
                warn!(
                    "TID {}: state effecter {} requests init PDR, \
                     not supported",
                    self.tid, self.id.0
                );
                return Err(PldmError::InvalidArgument);
            }
            None => {
                error!(
                    "TID {}: invalid effecterInit in state effecter PDR",
                    self.tid
                );
                return Err(PldmError::InvalidArgument);
            }
        };

        let msg = SetStateEffecterEnablesReq {
            effecter: self.id,
            fields: vec![EffecterEnableField {
                op_state,
                event_enable: SensorEventMessageEnable::NoEventGeneration,
            }],
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::SetStateEffecterEnables as u8,
            data,
        );
        mediator
            .send_receive_cc(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;

        debug!(
            "TID {}: SetStateEffecterEnables success, effecter {}",
            self.tid, self.id.0
        );
        Ok(())
    }

    /// Read the effecter once and publish the outcome.
    pub async fn poll(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
    ) -> Result<()> {
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
        let mut pending_retries = 0usize;

        loop {
            let msg = GetStateEffecterStatesReq { effecter: self.id };
            let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
            let mut req = PldmRequest::new_data(
                PLDM_TYPE_PLATFORM,
                Cmd::GetStateEffecterStates as u8,
                data,
            );
            let rsp = mediator
                .send_receive(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
                .await?;
            ccode_result(rsp.cc)?;

            let ((_, _), states) =
                GetStateEffecterStatesResp::from_bytes((&rsp.data, 0))
                    .map_err(|e| {
                        trace!("GetStateEffecterStates parse error {e}");
                        proto_error!("Bad GetStateEffecterStates response")
                    })?;

            // Composite effecters are not driven
            let Some(field) = states.fields.first() else {
                return Err(proto_error!("Empty state effecter reading"));
            };

            match field.op_state {
                EffecterOperationalState::EnabledUpdatePending => {
                    pending_retries += 1;
                    if pending_retries > CMD_RETRIES {
                        warn!(
                            "TID {}: state effecter {} update pending, \
                             retry budget exceeded",
                            self.tid, self.id.0
                        );
                        return Err(proto_error!("Effecter update pending"));
                    }
                    smol::Timer::after(TRANSITION_INTERVAL).await;
                }
                EffecterOperationalState::EnabledNoUpdatePending => {
                    self.err_count = 0;
                    self.publish(
                        sink,
                        field.present_state,
                        field.pending_state,
                        true,
                        true,
                    );
                    return Ok(());
                }
                EffecterOperationalState::Disabled => {
                    self.publish(
                        sink,
                        INVALID_STATE,
                        INVALID_STATE,
                        true,
                        false,
                    );
                    debug!(
                        "TID {}: state effecter {} disabled",
                        self.tid, self.id.0
                    );
                    return Ok(());
                }
                EffecterOperationalState::Unavailable => {
                    self.publish(
                        sink,
                        INVALID_STATE,
                        INVALID_STATE,
                        false,
                        false,
                    );
                    debug!(
                        "TID {}: state effecter {} unavailable",
                        self.tid, self.id.0
                    );
                    return Err(proto_error!("Effecter unavailable"));
                }
                other => {
                    debug!(
                        "TID {}: state effecter {} operational state \
                         {other:?}",
                        self.tid, self.id.0
                    );
                    return Err(proto_error!("Effecter state unknown"));
                }
            }
        }
    }

    /// Request a transition to `state`, then re-read.
    ///
    /// States outside the PDR's possible state set are refused before any
    /// transport request is issued.
    pub async fn set(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
        state: u8,
    ) -> core::result::Result<(), SetError> {
        if !self.possible.contains(&state) {
            error!(
                "TID {}: state effecter {} state {state} not in possible \
                 state set",
                self.tid, self.id.0
            );
            return Err(SetError::UnsupportedState);
        }

        let msg = SetStateEffecterStatesReq {
            effecter: self.id,
            fields: vec![StateEffecterSetField {
                set_request: SetRequest::RequestSet,
                effecter_state: state,
            }],
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::SetStateEffecterStates as u8,
            data,
        );
        mediator
            .send_receive_cc(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await
            .map_err(|e| {
                self.err_count =
                    (self.err_count + 1).min(EFFECTER_ERROR_THRESHOLD);
                SetError::Pldm(e)
            })?;

        debug!(
            "TID {}: SetStateEffecterStates success, effecter {}",
            self.tid, self.id.0
        );

        smol::Timer::after(TRANSITION_INTERVAL).await;
        if let Err(e) = self.poll(mediator, sink).await {
            error!(
                "TID {}: state effecter {} re-read after set failed: {e}",
                self.tid, self.id.0
            );
        }
        Ok(())
    }

    fn increment_error(&mut self, sink: &mut dyn PlatformSink) {
        if self.err_count >= EFFECTER_ERROR_THRESHOLD {
            return;
        }
        self.err_count += 1;
        if self.err_count == EFFECTER_ERROR_THRESHOLD {
            error!(
                "TID {}: state effecter {} reading failed",
                self.tid, self.id.0
            );
            self.publish(sink, INVALID_STATE, INVALID_STATE, true, false);
        }
    }

    fn publish(
        &mut self,
        sink: &mut dyn PlatformSink,
        current: u8,
        pending: u8,
        available: bool,
        functional: bool,
    ) {
        self.reading = StateEffecterReading {
            current,
            pending,
            available,
            functional,
        };
        self.published = true;
        sink.state_effecter_reading(
            self.tid, self.id, &self.name, &self.reading,
        );
    }

    /// Tear the effecter down.
    pub fn shutdown(&mut self, sink: &mut dyn PlatformSink) {
        sink.effecter_removed(self.tid, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::sensor_test::ScriptBinding;
    use pldmd_base::transport::Eid;

    #[derive(Default)]
    struct Record {
        readings: Vec<StateEffecterReading>,
    }

    impl PlatformSink for Record {
        fn state_effecter_reading(
            &mut self,
            _tid: Tid,
            _id: EffecterId,
            _name: &str,
            reading: &StateEffecterReading,
        ) {
            self.readings.push(*reading);
        }
    }

    fn handler() -> StateEffecterHandler {
        let pdr = StateEffecterPdr {
            terminus_handle: 1,
            effecter_id: 4,
            entity: Entity {
                entity_type: 7,
                entity_instance: 1,
                container_id: 100,
            },
            effecter_semantic_id: 0,
            effecter_init: InitHint::NoInit as u8,
            has_description_pdr: 0,
            composite_effecter_count: 1,
            state_set_id: 11,
            possible_states_size: 1,
            // states 1, 2
            possible_states: vec![0b0000_0110],
        };
        StateEffecterHandler::new(Tid(1), "Power_Mode".into(), pdr).unwrap()
    }

    // count, op_state, pending, present
    fn states_resp(op_state: u8, pending: u8, present: u8) -> Vec<u8> {
        vec![0x01, op_state, pending, present]
    }

    fn mediator(b: ScriptBinding) -> Mediator<ScriptBinding> {
        let mut m = Mediator::new(b);
        m.tid_map_mut().add(Tid(1), Eid(8)).unwrap();
        m
    }

    #[test]
    fn set_and_reread() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&[]); // SetStateEffecterStates
            b.push_ok(&states_resp(1, 0, 2)); // reread
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut e = handler();

            e.set(&mut m, &mut sink, 2).await.unwrap();

            let reqs = &m.binding_ref().requests;
            assert_eq!(reqs.len(), 2);
            assert_eq!(reqs[0].cmd, Cmd::SetStateEffecterStates as u8);
            // effecter 4, one field, requestSet, state 2
            assert_eq!(reqs[0].data, [0x04, 0x00, 0x01, 0x01, 0x02]);

            assert_eq!(sink.readings.last().unwrap().current, 2);
        })
    }

    #[test]
    fn unsupported_state_is_local() {
        smol::block_on(async {
            let mut m = mediator(ScriptBinding::default());
            let mut sink = Record::default();
            let mut e = handler();

            let err = e.set(&mut m, &mut sink, 7).await.unwrap_err();
            assert!(matches!(err, SetError::UnsupportedState));
            assert!(m.binding_ref().requests.is_empty());
        })
    }

    #[test]
    fn update_pending_then_settled() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&states_resp(0, 2, 1)); // pending
            b.push_ok(&states_resp(1, 0, 2)); // settled
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut e = handler();

            e.poll(&mut m, &mut sink).await.unwrap();
            let last = sink.readings.last().unwrap();
            assert_eq!(last.current, 2);
            assert!(last.functional);
        })
    }

    #[test]
    fn error_threshold_is_five() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            for _ in 0..EFFECTER_ERROR_THRESHOLD * CMD_RETRIES {
                b.push_timeout();
            }
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut e = handler();

            for _ in 0..EFFECTER_ERROR_THRESHOLD {
                e.poll(&mut m, &mut sink).await.unwrap_err();
            }

            // one non-functional publication, after the fifth failure
            assert_eq!(sink.readings.len(), 1);
            assert!(!sink.readings[0].functional);
        })
    }
}
