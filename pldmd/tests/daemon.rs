// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * End-to-end daemon tests over a simulated terminus.
 *
 * Copyright (c) 2025 Code Construct
 */

use std::collections::VecDeque;
use std::time::Duration;

use deku::DekuContainerWrite;

use pldmd::daemon::Daemon;
use pldmd::dump::dump_pdrs;
use pldmd::sink::MemorySink;
use pldmd_base::transport::{
    Binding, Eid, Inbound, Result as TResult, Tag, TransportError,
};
use pldmd_base::{PldmRequest, PldmResponse, MCTP_MSG_TYPE_PLDM, Tid};
use pldmd_platform::entity::Entity;
use pldmd_platform::pdr::{
    pdr_type, tl_validity, EntityAssociationPdr, InitHint, NumericSensorPdr,
    PdrHeader, StateSensorPdr, TerminusLocatorPdr, PDR_VERSION_1,
};
use pldmd_platform::proto::{
    GetPDRRepositoryInfoResp, GetPDRReq, PDRRepositoryState, RangeData,
    SensorData, Timestamp104,
};

fn wrap(handle: u32, ty: u8, body: Vec<u8>) -> Vec<u8> {
    let hdr = PdrHeader {
        record_handle: handle,
        version: PDR_VERSION_1,
        pdr_type: ty,
        record_change_num: 0,
        data_length: body.len() as u16,
    };
    let mut rec = hdr.to_bytes().unwrap();
    rec.extend(body);
    rec
}

fn board() -> Entity {
    Entity {
        entity_type: 7,
        entity_instance: 1,
        container_id: 100,
    }
}

fn cpu() -> Entity {
    Entity {
        entity_type: 2,
        entity_instance: 1,
        container_id: 1,
    }
}

fn records() -> Vec<(u32, Vec<u8>)> {
    let locator = TerminusLocatorPdr {
        terminus_handle: 1,
        validity: tl_validity::VALID,
        tid: 0,
        container_id: 100,
        locator_type: 0,
        locator_value_size: 1,
        locator_value: vec![0x08],
    };
    let assoc = EntityAssociationPdr {
        container_id: 100,
        association_type: 0,
        container: board(),
        contained_count: 1,
        contained: vec![cpu()],
    };
    let sensor = NumericSensorPdr {
        terminus_handle: 1,
        sensor_id: 1,
        entity: cpu(),
        sensor_init: InitHint::NoInit as u8,
        sensor_auxiliary_names_pdr: 0,
        base_unit: 2, // degrees C
        unit_modifier: 0,
        rate_unit: 0,
        base_oem_unit_handle: 0,
        aux_unit: 0,
        aux_unit_modifier: 0,
        aux_rate_unit: 0,
        rel: 0,
        aux_oem_unit_handle: 0,
        is_linear: 1,
        sensor_data_size: 0,
        resolution: 1.0,
        offset: 0.0,
        accuracy: 0,
        plus_tolerance: 0,
        minus_tolerance: 0,
        hysteresis: SensorData::U8(0),
        supported_thresholds: 0,
        threshold_and_hysteresis_volatility: 0,
        state_transition_interval: 0.0,
        update_interval: 1.0,
        max_readable: SensorData::U8(255),
        min_readable: SensorData::U8(0),
        range_field_format: 0,
        range_field_support: 0,
        nominal_value: RangeData::U8(40),
        normal_max: RangeData::U8(60),
        normal_min: RangeData::U8(10),
        warning_high: RangeData::U8(70),
        warning_low: RangeData::U8(5),
        critical_high: RangeData::U8(85),
        critical_low: RangeData::U8(2),
        fatal_high: RangeData::U8(95),
        fatal_low: RangeData::U8(0),
    };
    let state_sensor = StateSensorPdr {
        terminus_handle: 1,
        sensor_id: 2,
        entity: cpu(),
        sensor_init: InitHint::NoInit as u8,
        sensor_auxiliary_names_pdr: 0,
        composite_sensor_count: 1,
        state_set_id: 10, // Operation Fault Status
        possible_states_size: 1,
        possible_states: vec![0b0000_1110],
    };

    vec![
        (
            1,
            wrap(1, pdr_type::TERMINUS_LOCATOR, locator.to_bytes().unwrap()),
        ),
        (
            2,
            wrap(2, pdr_type::ENTITY_ASSOCIATION, assoc.to_bytes().unwrap()),
        ),
        (
            3,
            wrap(3, pdr_type::NUMERIC_SENSOR, sensor.to_bytes().unwrap()),
        ),
        (
            4,
            wrap(
                4,
                pdr_type::STATE_SENSOR,
                state_sensor.to_bytes().unwrap(),
            ),
        ),
    ]
}

/// A terminus answering base negotiation and platform commands.
struct SimTerminus {
    tid: u8,
    records: Vec<(u32, Vec<u8>)>,
    /// raw u8 readings served to GetSensorReading, last entry repeats
    numeric_readings: VecDeque<u8>,
    /// (present, previous) pairs served to GetStateSensorReadings
    state_readings: VecDeque<(u8, u8)>,
}

impl SimTerminus {
    fn new() -> Self {
        SimTerminus {
            tid: 0,
            records: records(),
            numeric_readings: VecDeque::from(vec![40]),
            state_readings: VecDeque::from(vec![(1, 1)]),
        }
    }

    fn control(&mut self, req: &PldmRequest) -> PldmResponse {
        let mut resp = req.response();
        match req.cmd {
            0x01 => {
                // SetTID
                self.tid = req.data[0];
            }
            0x02 => {
                // GetTID
                resp.data = vec![self.tid];
            }
            0x03 => {
                // GetPLDMVersion, single part
                let mut d = vec![0, 0, 0, 0, 0x05];
                d.extend_from_slice(&0xf1f1_f000u32.to_le_bytes());
                resp.data = d;
            }
            0x04 => {
                // GetPLDMTypes: control and platform
                let mut types = [0u8; 8];
                types[0] = 1 << 0 | 1 << 2;
                resp.data = types.to_vec();
            }
            0x05 => {
                // GetPLDMCommands: everything
                resp.data = vec![0xff; 32];
            }
            _ => resp.cc = 5,
        }
        resp
    }

    fn platform(&mut self, req: &PldmRequest) -> PldmResponse {
        use deku::DekuContainerRead;

        let mut resp = req.response();
        match req.cmd {
            0x50 => {
                // GetPDRRepositoryInfo
                let info = GetPDRRepositoryInfoResp {
                    state: PDRRepositoryState::Available,
                    update_time: Timestamp104::default(),
                    oem_update_time: Timestamp104::default(),
                    record_count: self.records.len() as u32,
                    repository_size: 1024,
                    largest_record_size: 256,
                    data_transfer_handle_timeout: 0,
                };
                resp.data = info.to_bytes().unwrap();
            }
            0x51 => {
                // GetPDR, served single-part
                let ((_, _), gp) =
                    GetPDRReq::from_bytes((&req.data, 0)).unwrap();
                let idx = if gp.record_handle == 0 {
                    0
                } else {
                    self.records
                        .iter()
                        .position(|(h, _)| *h == gp.record_handle)
                        .unwrap()
                };
                let (_, record) = &self.records[idx];
                let next = self
                    .records
                    .get(idx + 1)
                    .map(|(h, _)| *h)
                    .unwrap_or(0);

                let mut d = Vec::new();
                d.extend_from_slice(&next.to_le_bytes());
                d.extend_from_slice(&0u32.to_le_bytes());
                d.push(0x05); // START_AND_END
                d.extend_from_slice(&(record.len() as u16).to_le_bytes());
                d.extend_from_slice(record);
                // CRC trails any END-flagged part; unchecked for single
                // part transfers
                d.push(0);
                resp.data = d;
            }
            0x10 | 0x20 => {
                // Set*SensorEnable(s), cc-only
            }
            0x11 => {
                // GetSensorReading
                let raw = if self.numeric_readings.len() > 1 {
                    self.numeric_readings.pop_front().unwrap()
                } else {
                    *self.numeric_readings.front().unwrap()
                };
                resp.data = vec![0x00, 0x00, 0x00, 0x01, 0x01, 0x01, raw];
            }
            0x21 => {
                // GetStateSensorReadings
                let (present, previous) = if self.state_readings.len() > 1 {
                    self.state_readings.pop_front().unwrap()
                } else {
                    *self.state_readings.front().unwrap()
                };
                resp.data = vec![0x01, 0x00, present, previous, present];
            }
            _ => resp.cc = 5,
        }
        resp
    }
}

impl Binding for SimTerminus {
    async fn transfer(
        &mut self,
        _eid: Eid,
        payload: &[u8],
        _timeout: Duration,
    ) -> TResult<Vec<u8>> {
        assert_eq!(payload[0], MCTP_MSG_TYPE_PLDM);
        let req = PldmRequest::from_buf(&payload[1..]).unwrap();
        let resp = match req.typ {
            0 => self.control(&req),
            2 => self.platform(&req),
            _ => {
                let mut r = req.response();
                r.cc = 5;
                r
            }
        };
        Ok(resp.to_wire())
    }

    async fn send(
        &mut self,
        _eid: Eid,
        _tag: Tag,
        _payload: &[u8],
    ) -> TResult<()> {
        Ok(())
    }

    async fn recv(&mut self) -> TResult<Inbound> {
        Err(TransportError::RxFailure)
    }

    async fn reserve_bandwidth(
        &mut self,
        _eid: Eid,
        _timeout_secs: u16,
    ) -> TResult<()> {
        Ok(())
    }

    async fn release_bandwidth(&mut self, _eid: Eid) -> TResult<()> {
        Ok(())
    }
}

#[test]
fn init_and_poll() {
    smol::block_on(async {
        let mut daemon = Daemon::new(SimTerminus::new(), MemorySink::default());

        daemon.device_added(Eid(8)).await;

        let t = daemon.terminus(Tid(1)).expect("terminus initialised");
        assert_eq!(t.tid, Tid(1));
        let platform = t.platform.as_ref().expect("platform initialised");
        assert_eq!(platform.repo.len(), 4);
        assert_eq!(platform.numeric_sensors.len(), 1);
        assert_eq!(platform.state_sensors.len(), 1);

        // inventory was published for both entities
        assert_eq!(daemon.sink().inventory.len(), 2);
        assert!(daemon
            .sink()
            .inventory
            .iter()
            .any(|(_, p, _)| p == "system/1/7_1_100/2_1_1"));

        daemon.poll_cycle().await;

        let reading = daemon.sink().numeric.get(&(1, 1)).unwrap();
        assert_eq!(reading.value, 40.0);
        assert!(reading.available);
        assert!(reading.functional);

        let state = daemon.sink().states.get(&(1, 2)).unwrap();
        assert_eq!(state.current, 1);
        assert!(state.functional);
    })
}

#[test]
fn state_change_emits_event() {
    smol::block_on(async {
        let mut sim = SimTerminus::new();
        sim.state_readings = VecDeque::from(vec![(1, 1), (2, 1)]);
        let mut daemon = Daemon::new(sim, MemorySink::default());

        daemon.device_added(Eid(8)).await;
        daemon.poll_cycle().await;
        daemon.poll_cycle().await;

        let events = &daemon.sink().events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state_set, "Operation Fault Status");
        assert_eq!(events[0].previous, "Normal");
        assert_eq!(events[0].current, "Error");

        let state = daemon.sink().states.get(&(1, 2)).unwrap();
        assert_eq!(state.current, 2);
        assert_eq!(state.previous, 1);
    })
}

#[test]
fn removal_tears_down() {
    smol::block_on(async {
        let mut daemon = Daemon::new(SimTerminus::new(), MemorySink::default());

        daemon.device_added(Eid(8)).await;
        daemon.poll_cycle().await;
        assert!(daemon.sink().numeric.contains_key(&(1, 1)));

        daemon.device_removed(Eid(8)).await;
        assert!(daemon.terminus(Tid(1)).is_none());
        assert!(daemon.sink().numeric.is_empty());
        assert!(daemon.sink().states.is_empty());

        // the EID can be initialised again, with a fresh TID mapping
        daemon.device_added(Eid(8)).await;
        assert!(daemon.terminus(Tid(1)).is_some());
    })
}

#[test]
fn pdr_dump_writes_records() {
    smol::block_on(async {
        let mut daemon = Daemon::new(SimTerminus::new(), MemorySink::default());
        daemon.device_added(Eid(8)).await;

        let dir = tempfile::tempdir().unwrap();
        let t = daemon.terminus(Tid(1)).unwrap();
        let path =
            dump_pdrs(t.platform.as_ref().unwrap(), dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "pldm_pdr_dump_1.txt"
        );

        let text = std::fs::read_to_string(&path).unwrap();
        // one block per record, lowest type first
        assert_eq!(text.matches("PDR Type: ").count(), 4);
        let first = text.lines().next().unwrap();
        assert_eq!(first, "PDR Type: 1");
        assert!(text.contains("Data: 0x"));
    })
}
