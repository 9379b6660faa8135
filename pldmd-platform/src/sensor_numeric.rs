// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Numeric sensor engine.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Polling engine for one numeric sensor.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use deku::{DekuContainerRead, DekuContainerWrite};
use num_traits::FromPrimitive;

use pldmd_base::mediator::Mediator;
use pldmd_base::transport::Binding;
use pldmd_base::{
    ccode_result, proto_error, PldmError, PldmRequest, Result, Tid,
};

use crate::pdr::{threshold_support, InitHint, NumericSensorPdr};
use crate::proto::{
    Cmd, GetSensorReadingReq, GetSensorReadingResp, SensorEventMessageEnable,
    SensorId, SensorOperationalState, SetNumericSensorEnableReq,
    SetSensorOperationalState,
};
use crate::publish::{
    NumericReading, PlatformSink, ThresholdBound, ThresholdSeverity,
};
use crate::{CMD_RETRIES, CMD_TIMEOUT, PLDM_TYPE_PLATFORM};

/// Consecutive poll failures before a sensor goes non-functional.
pub const ERROR_THRESHOLD: usize = 3;

#[derive(Debug)]
struct Threshold {
    severity: ThresholdSeverity,
    bound: ThresholdBound,
    value: f64,
    hysteresis: f64,
    asserted: bool,
}

/// One numeric sensor of a terminus.
pub struct NumericSensorHandler {
    tid: Tid,
    id: SensorId,
    name: String,
    pdr: NumericSensorPdr,
    reading: NumericReading,
    published: bool,
    err_count: usize,
    disabled: bool,
    thresholds: Vec<Threshold>,
    /// Minimum delta against the last published value; smaller changes are
    /// suppressed to avoid flap
    pub publish_hysteresis: f64,
}

impl NumericSensorHandler {
    /// Construct the handler from a parsed Numeric Sensor PDR.
    pub fn new(
        tid: Tid,
        name: String,
        pdr: NumericSensorPdr,
    ) -> NumericSensorHandler {
        let id = SensorId(pdr.sensor_id);
        let conv = |raw: f64| (raw as f32 * pdr.resolution + pdr.offset) as f64;
        // Hysteresis is a delta in raw units, offset does not apply
        let hysteresis =
            (pdr.hysteresis.to_f64() as f32 * pdr.resolution) as f64;

        let mut thresholds = Vec::new();
        let supported = pdr.supported_thresholds;
        let mut add = |bit, severity, bound, raw: f64| {
            if supported & bit != 0 {
                thresholds.push(Threshold {
                    severity,
                    bound,
                    value: conv(raw),
                    hysteresis,
                    asserted: false,
                });
            }
        };
        add(
            threshold_support::UPPER_WARNING,
            ThresholdSeverity::Warning,
            ThresholdBound::Upper,
            pdr.warning_high.to_f64(),
        );
        add(
            threshold_support::UPPER_CRITICAL,
            ThresholdSeverity::Critical,
            ThresholdBound::Upper,
            pdr.critical_high.to_f64(),
        );
        add(
            threshold_support::LOWER_WARNING,
            ThresholdSeverity::Warning,
            ThresholdBound::Lower,
            pdr.warning_low.to_f64(),
        );
        add(
            threshold_support::LOWER_CRITICAL,
            ThresholdSeverity::Critical,
            ThresholdBound::Lower,
            pdr.critical_low.to_f64(),
        );

        NumericSensorHandler {
            tid,
            id,
            name,
            pdr,
            reading: NumericReading::default(),
            published: false,
            err_count: 0,
            disabled: false,
            thresholds,
            publish_hysteresis: 0.0,
        }
    }

    /// The sensor's ID.
    pub fn id(&self) -> SensorId {
        self.id
    }

    /// The sensor's published name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last published reading.
    pub fn reading(&self) -> &NumericReading {
        &self.reading
    }

    /// Whether the PDR disables this sensor; disabled sensors are skipped by
    /// the poll driver.
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    fn convert(&self, raw: f64) -> f64 {
        (raw as f32 * self.pdr.resolution + self.pdr.offset) as f64
    }

    /// Enable the sensor per its PDR init hint.
    ///
    /// Initialization PDRs are not supported; a `use-init-pdr` hint fails.
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
                    "TID {}: numeric sensor {} requests init PDR, \
                     not supported",
                    self.tid, self.id.0
                );
                return Err(PldmError::InvalidArgument);
            }
            None => {
                error!(
                    "TID {}: invalid sensorInit in numeric sensor PDR",
                    self.tid
                );
                return Err(PldmError::InvalidArgument);
            }
        };

        let msg = SetNumericSensorEnableReq {
            sensor: self.id,
            set_op_state: op_state,
            event_enable: SensorEventMessageEnable::NoEventGeneration,
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::SetNumericSensorEnable as u8,
            data,
        );
        mediator
            .send_receive_cc(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;

        if self.disabled {
            self.publish(sink, f64::NAN, true, false);
        }
        debug!(
            "TID {}: SetNumericSensorEnable success, sensor {}",
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
        let msg = GetSensorReadingReq {
            sensor: self.id,
            rearm: false,
        };
        let data = msg.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req = PldmRequest::new_data(
            PLDM_TYPE_PLATFORM,
            Cmd::GetSensorReading as u8,
            data,
        );
        let rsp = mediator
            .send_receive(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;
        ccode_result(rsp.cc)?;

        let ((_, _), reading) =
            GetSensorReadingResp::from_bytes((&rsp.data, 0)).map_err(|e| {
                trace!("GetSensorReading parse error {e}");
                proto_error!("Bad GetSensorReading response")
            })?;

        match reading.op_state {
            SensorOperationalState::Enabled => {
                if reading.reading.data_size() != self.pdr.sensor_data_size {
                    error!(
                        "TID {}: sensor {} reading data size mismatch",
                        self.tid, self.id.0
                    );
                    return Err(proto_error!("Sensor data size mismatch"));
                }
                let value = self.convert(reading.reading.to_f64());
                self.err_count = 0;
                self.publish(sink, value, true, true);
                Ok(())
            }
            SensorOperationalState::Disabled => {
                self.publish(sink, f64::NAN, true, false);
                debug!(
                    "TID {}: numeric sensor {} disabled",
                    self.tid, self.id.0
                );
                Ok(())
            }
            SensorOperationalState::Unavailable => {
                self.publish(sink, f64::NAN, false, false);
                debug!(
                    "TID {}: numeric sensor {} unavailable",
                    self.tid, self.id.0
                );
                Err(proto_error!("Sensor unavailable"))
            }
            other => {
                debug!(
                    "TID {}: numeric sensor {} operational state {other:?}",
                    self.tid, self.id.0
                );
                Err(proto_error!("Sensor state unknown"))
            }
        }
    }

    // Error debounce: the sensor goes non-functional only when the failure
    // count reaches the threshold; any success resets it.
    fn increment_error(&mut self, sink: &mut dyn PlatformSink) {
        if self.err_count >= ERROR_THRESHOLD {
            return;
        }
        self.err_count += 1;
        if self.err_count == ERROR_THRESHOLD {
            error!(
                "TID {}: numeric sensor {} reading failed",
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
        if functional && value.is_finite() {
            self.check_thresholds(sink, value);
        }

        // Suppress flap below the publish hysteresis when nothing else
        // changed
        if self.published
            && available == self.reading.available
            && functional == self.reading.functional
            && (value - self.reading.value).abs() < self.publish_hysteresis
        {
            return;
        }

        self.reading = NumericReading {
            value,
            available,
            functional,
        };
        self.published = true;
        sink.numeric_sensor_reading(self.tid, self.id, &self.name, &self.reading);
    }

    fn check_thresholds(&mut self, sink: &mut dyn PlatformSink, value: f64) {
        for t in &mut self.thresholds {
            let (assert, deassert) = match t.bound {
                ThresholdBound::Upper => (
                    value >= t.value,
                    value < t.value - t.hysteresis,
                ),
                ThresholdBound::Lower => (
                    value <= t.value,
                    value > t.value + t.hysteresis,
                ),
            };
            if !t.asserted && assert {
                t.asserted = true;
                sink.threshold_alarm(
                    self.tid, self.id, t.severity, t.bound, true,
                );
            } else if t.asserted && deassert {
                t.asserted = false;
                sink.threshold_alarm(
                    self.tid, self.id, t.severity, t.bound, false,
                );
            }
        }
    }

    /// Tear the sensor down.
    pub fn shutdown(&mut self, sink: &mut dyn PlatformSink) {
        sink.sensor_removed(self.tid, self.id);
    }
}
