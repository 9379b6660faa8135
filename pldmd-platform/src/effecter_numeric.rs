// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Numeric effecter engine.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Read/write engine for one numeric effecter.

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

use crate::pdr::{InitHint, NumericEffecterPdr};
use crate::proto::{
    Cmd, EffecterId, EffecterOperationalState, GetNumericEffecterValueReq,
    GetNumericEffecterValueResp, SensorData, SetNumericEffecterEnableReq,
    SetNumericEffecterValueReq,
};
use crate::publish::{NumericReading, PlatformSink};
use crate::{SetError, CMD_RETRIES, CMD_TIMEOUT, PLDM_TYPE_PLATFORM};

/// Consecutive failures before an effecter goes non-functional.
pub const EFFECTER_ERROR_THRESHOLD: usize = 5;

/// One numeric effecter of a terminus.
pub struct NumericEffecterHandler {
    tid: Tid,
    id: EffecterId,
    name: String,
    pdr: NumericEffecterPdr,
    /// Settable bounds derived from the PDR through the reading scaling
    pub min_settable: f64,
    /// Settable bounds derived from the PDR through the reading scaling
    pub max_settable: f64,
    reading: NumericReading,
    published: bool,
    err_count: usize,
}

impl NumericEffecterHandler {
    /// Construct the handler from a parsed Numeric Effecter PDR.
    pub fn new(
        tid: Tid,
        name: String,
        pdr: NumericEffecterPdr,
    ) -> NumericEffecterHandler {
        let conv = |raw: f64| (raw as f32 * pdr.resolution + pdr.offset) as f64;
        let min_settable = conv(pdr.min_settable.to_f64());
        let max_settable = conv(pdr.max_settable.to_f64());

        NumericEffecterHandler {
            tid,
            id: EffecterId(pdr.effecter_id),
            name,
            pdr,
            min_settable,
            max_settable,
            reading: NumericReading::default(),
            published: false,
            err_count: 0,
        }
    }

    /// The effecter's ID.
    pub fn id(&self) -> EffecterId {
        self.id
    }

    /// The effecter's published name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last published reading.
    pub fn reading(&self) -> &NumericReading {
        &self.reading
    }

    fn convert(&self, raw: f64) -> f64 {
        (raw as f32 * self.pdr.resolution + self.pdr.offset) as f64
    }

    fn transition_wait(&self) -> Option<Duration> {
        let t = self.pdr.transition_interval;
        if t.is_finite() && t > 0.0 {
            Some(Duration::from_millis((t * 1000.0).round() as u64))
        } else {
            None
        }
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
                    "TID {}: numeric effecter {} requests init PDR, \
                     not supported",
                    self.tid, self.id.0
                );
                return Err(PldmError::InvalidArgument);
            }
            None => {
                error!(
                    "TID {}: invalid effecterInit in numeric effecter PDR",
                    self.tid
                );
                return Err(PldmError::InvalidArgument);
            }
        };

        let msg = SetNumericEffecterEnableReq {
            effecter: self.id,
            op_state,
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::SetNumericEffecterEnable as u8,
            data,
        );
        mediator
            .send_receive_cc(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;

        debug!(
            "TID {}: SetNumericEffecterEnable success, effecter {}",
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
        // A pending transition is given `transition_interval` to settle,
        // re-reading up to the command retry budget
        let mut pending_retries = 0usize;

        loop {
            let msg = GetNumericEffecterValueReq { effecter: self.id };
            let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
            let mut req = PldmRequest::new_data(
                PLDM_TYPE_PLATFORM,
                Cmd::GetNumericEffecterValue as u8,
                data,
            );
            let rsp = mediator
                .send_receive(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
                .await?;
            ccode_result(rsp.cc)?;

            let ((_, _), value) =
                GetNumericEffecterValueResp::from_bytes((&rsp.data, 0))
                    .map_err(|e| {
                        trace!("GetNumericEffecterValue parse error {e}");
                        proto_error!("Bad GetNumericEffecterValue response")
                    })?;

            match value.op_state {
                EffecterOperationalState::EnabledUpdatePending => {
                    pending_retries += 1;
                    if pending_retries > CMD_RETRIES {
                        warn!(
                            "TID {}: effecter {} update pending, retry \
                             budget exceeded",
                            self.tid, self.id.0
                        );
                        return Err(proto_error!("Effecter update pending"));
                    }
                    if let Some(wait) = self.transition_wait() {
                        smol::Timer::after(wait).await;
                    }
                }
                EffecterOperationalState::EnabledNoUpdatePending => {
                    if value.present.data_size()
                        != self.pdr.effecter_data_size
                    {
                        error!(
                            "TID {}: effecter {} reading data size mismatch",
                            self.tid, self.id.0
                        );
                        return Err(proto_error!(
                            "Effecter data size mismatch"
                        ));
                    }
                    let v = self.convert(value.present.to_f64());
                    self.err_count = 0;
                    self.publish(sink, v, true, true);
                    return Ok(());
                }
                EffecterOperationalState::Disabled => {
                    self.publish(sink, f64::NAN, true, false);
                    debug!(
                        "TID {}: numeric effecter {} disabled",
                        self.tid, self.id.0
                    );
                    return Ok(());
                }
                EffecterOperationalState::Unavailable => {
                    self.publish(sink, f64::NAN, false, false);
                    debug!(
                        "TID {}: numeric effecter {} unavailable",
                        self.tid, self.id.0
                    );
                    return Err(proto_error!("Effecter unavailable"));
                }
                other => {
                    debug!(
                        "TID {}: numeric effecter {} operational state \
                         {other:?}",
                        self.tid, self.id.0
                    );
                    return Err(proto_error!("Effecter state unknown"));
                }
            }
        }
    }

    /// Set the effecter to `value`, then re-read after the transition
    /// interval.
    ///
    /// Values outside `[min_settable, max_settable]` are refused before any
    /// transport request is issued.
    pub async fn set(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
        value: f64,
    ) -> core::result::Result<(), SetError> {
        if !(value >= self.min_settable && value <= self.max_settable) {
            error!(
                "TID {}: effecter {} value {value} outside [{}, {}]",
                self.tid, self.id.0, self.min_settable, self.max_settable
            );
            return Err(SetError::OutOfRange);
        }

        if self.pdr.resolution == 0.0 {
            return Err(SetError::Pldm(PldmError::InvalidArgument));
        }
        let raw =
            ((value as f32 - self.pdr.offset) / self.pdr.resolution) as f64;
        let Some(raw) =
            SensorData::from_f64(self.pdr.effecter_data_size, raw)
        else {
            error!(
                "TID {}: effecter {} value formatting failed",
                self.tid, self.id.0
            );
            return Err(SetError::OutOfRange);
        };

        let msg = SetNumericEffecterValueReq {
            effecter: self.id,
            value: raw,
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::SetNumericEffecterValue as u8,
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
            "TID {}: SetNumericEffecterValue success, effecter {}",
            self.tid, self.id.0
        );

        // Refresh the published value once the transition has had time to
        // complete
        if let Some(wait) = self.transition_wait() {
            smol::Timer::after(wait).await;
        }
        if let Err(e) = self.poll(mediator, sink).await {
            error!(
                "TID {}: effecter {} re-read after set failed: {e}",
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
                "TID {}: numeric effecter {} reading failed",
                self.tid, self.id.0
            );
            self.publish(sink, f64::NAN, true, false);
        }
    }

    fn publish(
        &mut self,
        sink: &mut dyn PlatformSink,
        value: f64,
        available: bool,
        functional: bool,
    ) {
        self.reading = NumericReading {
            value,
            available,
            functional,
        };
        self.published = true;
        sink.numeric_effecter_reading(
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
    use crate::pdr::{parse_record, test_records};
    use crate::sensor_test::ScriptBinding;
    use pldmd_base::transport::Eid;

    #[derive(Default)]
    struct Record {
        readings: Vec<NumericReading>,
    }

    impl PlatformSink for Record {
        fn numeric_effecter_reading(
            &mut self,
            _tid: Tid,
            _id: EffecterId,
            _name: &str,
            reading: &NumericReading,
        ) {
            self.readings.push(*reading);
        }
    }

    fn handler(transition: f32) -> NumericEffecterHandler {
        let entity = Entity {
            entity_type: 7,
            entity_instance: 1,
            container_id: 100,
        };
        let rec = test_records::numeric_effecter_u8(
            1, 9, entity, 0, 100, transition,
        );
        let pdr: NumericEffecterPdr = parse_record(&rec).unwrap();
        NumericEffecterHandler::new(Tid(1), "Fan_Duty".into(), pdr)
    }

    // data_size u8, op_state, pending, present
    fn value_resp(op_state: u8, pending: u8, present: u8) -> Vec<u8> {
        vec![0x00, op_state, pending, present]
    }

    fn mediator(b: ScriptBinding) -> Mediator<ScriptBinding> {
        let mut m = Mediator::new(b);
        m.tid_map_mut().add(Tid(1), Eid(8)).unwrap();
        m
    }

    #[test]
    fn settable_bounds_from_pdr() {
        let h = handler(0.0);
        assert_eq!(h.min_settable, 0.0);
        assert_eq!(h.max_settable, 100.0);
    }

    #[test]
    fn set_and_reread() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&[]); // SetNumericEffecterValue
            b.push_ok(&value_resp(1, 0, 55)); // reread
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut e = handler(0.0);

            e.set(&mut m, &mut sink, 55.0).await.unwrap();

            let reqs = &m.binding_ref().requests;
            assert_eq!(reqs.len(), 2);
            assert_eq!(reqs[0].cmd, Cmd::SetNumericEffecterValue as u8);
            // effecter id 9, u8 data size, raw 55
            assert_eq!(reqs[0].data, [0x09, 0x00, 0x00, 55]);
            assert_eq!(reqs[1].cmd, Cmd::GetNumericEffecterValue as u8);

            assert_eq!(sink.readings.last().unwrap().value, 55.0);
        })
    }

    #[test]
    fn set_out_of_range_is_local() {
        smol::block_on(async {
            let mut m = mediator(ScriptBinding::default());
            let mut sink = Record::default();
            let mut e = handler(0.0);

            let err = e.set(&mut m, &mut sink, 101.0).await.unwrap_err();
            assert!(matches!(err, SetError::OutOfRange));
            let err = e.set(&mut m, &mut sink, -1.0).await.unwrap_err();
            assert!(matches!(err, SetError::OutOfRange));
            let err = e.set(&mut m, &mut sink, f64::NAN).await.unwrap_err();
            assert!(matches!(err, SetError::OutOfRange));

            // nothing reached the wire
            assert!(m.binding_ref().requests.is_empty());
        })
    }

    #[test]
    fn update_pending_rereads() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            b.push_ok(&value_resp(0, 55, 40)); // update pending
            b.push_ok(&value_resp(1, 0, 55)); // settled
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut e = handler(0.001);

            e.poll(&mut m, &mut sink).await.unwrap();
            assert_eq!(sink.readings.last().unwrap().value, 55.0);
        })
    }

    #[test]
    fn update_pending_retry_cap() {
        smol::block_on(async {
            let mut b = ScriptBinding::default();
            for _ in 0..CMD_RETRIES + 1 {
                b.push_ok(&value_resp(0, 55, 40));
            }
            let mut m = mediator(b);
            let mut sink = Record::default();
            let mut e = handler(0.001);

            e.poll(&mut m, &mut sink).await.unwrap_err();
            assert!(m.binding_ref().drained());
        })
    }
}
