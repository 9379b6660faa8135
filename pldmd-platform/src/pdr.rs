// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Platform Descriptor Record definitions and repository.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Typed views over PDR records and the per-terminus record store.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::BTreeMap;

use deku::{deku_derive, DekuContainerRead, DekuRead, DekuWrite};
use num_derive::FromPrimitive;

use crate::entity::Entity;
use crate::proto::{RangeData, SensorData};

/// Size of the common PDR header.
pub const PDR_HEADER_SIZE: usize = 10;

/// PDR header version carried by every record.
pub const PDR_VERSION_1: u8 = 1;

/// PDR type numbers, DSP0248 table 2.
#[allow(missing_docs)]
pub mod pdr_type {
    pub const TERMINUS_LOCATOR: u8 = 1;
    pub const NUMERIC_SENSOR: u8 = 2;
    pub const NUMERIC_SENSOR_INITIALIZATION: u8 = 3;
    pub const STATE_SENSOR: u8 = 4;
    pub const STATE_SENSOR_INITIALIZATION: u8 = 5;
    pub const SENSOR_AUXILIARY_NAMES: u8 = 6;
    pub const OEM_UNIT: u8 = 7;
    pub const OEM_STATE_SET: u8 = 8;
    pub const NUMERIC_EFFECTER: u8 = 9;
    pub const NUMERIC_EFFECTER_INITIALIZATION: u8 = 10;
    pub const STATE_EFFECTER: u8 = 11;
    pub const STATE_EFFECTER_INITIALIZATION: u8 = 12;
    pub const EFFECTER_AUXILIARY_NAMES: u8 = 13;
    pub const EFFECTER_OEM_SEMANTIC: u8 = 14;
    pub const ENTITY_ASSOCIATION: u8 = 15;
    pub const ENTITY_AUXILIARY_NAMES: u8 = 16;
    pub const OEM_ENTITY_ID: u8 = 17;
    pub const INTERRUPT_ASSOCIATION: u8 = 18;
    pub const EVENT_LOG: u8 = 19;
    pub const FRU_RECORD_SET: u8 = 20;
    pub const OEM: u8 = 127;
}

/// Common header on every PDR record.
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct PdrHeader {
    /// Record handle, opaque and non-zero
    pub record_handle: u32,
    /// Header version
    pub version: u8,
    /// PDR type
    pub pdr_type: u8,
    /// Change number of the record
    pub record_change_num: u16,
    /// Length of the record body
    pub data_length: u16,
}

impl PdrHeader {
    /// Parse the header from the start of a raw record.
    pub fn parse(record: &[u8]) -> Option<PdrHeader> {
        let ((_, _), hdr) = PdrHeader::from_bytes((record, 0)).ok()?;
        Some(hdr)
    }
}

/// The PDR type of a raw record, if the header is present.
pub fn record_type(record: &[u8]) -> Option<u8> {
    record.get(5).copied()
}

/// Parse a typed PDR body from a raw record, skipping the common header.
///
/// Trailing bytes beyond the typed fields are permitted; malformed records
/// yield `None`.
pub fn parse_record<'a, T>(record: &'a [u8]) -> Option<T>
where
    T: DekuContainerRead<'a>,
{
    let body = record.get(PDR_HEADER_SIZE..)?;
    match T::from_bytes((body, 0)) {
        Ok((_, v)) => Some(v),
        Err(e) => {
            debug!("PDR body parse failed: {e}");
            None
        }
    }
}

/// Terminus Locator PDR validity values.
#[allow(missing_docs)]
pub mod tl_validity {
    pub const NOT_VALID: u8 = 0;
    pub const VALID: u8 = 1;
}

/// Byte offset of the TID field within a raw Terminus Locator record.
pub const TL_TID_OFFSET: usize = PDR_HEADER_SIZE + 3;

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminusLocatorPdr {
    pub terminus_handle: u16,
    pub validity: u8,
    pub tid: u8,
    pub container_id: u16,
    pub locator_type: u8,
    pub locator_value_size: u8,
    #[deku(count = "locator_value_size")]
    pub locator_value: Vec<u8>,
}

/// Sensor and effecter initialization hints.
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum InitHint {
    NoInit = 0,
    UseInitPdr = 1,
    Enable = 2,
    Disable = 3,
}

/// Supported threshold bits in the Numeric Sensor PDR.
#[allow(missing_docs)]
pub mod threshold_support {
    pub const UPPER_WARNING: u8 = 1 << 0;
    pub const UPPER_CRITICAL: u8 = 1 << 1;
    pub const UPPER_FATAL: u8 = 1 << 2;
    pub const LOWER_WARNING: u8 = 1 << 3;
    pub const LOWER_CRITICAL: u8 = 1 << 4;
    pub const LOWER_FATAL: u8 = 1 << 5;
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq)]
pub struct NumericSensorPdr {
    pub terminus_handle: u16,
    pub sensor_id: u16,
    pub entity: Entity,
    pub sensor_init: u8,
    pub sensor_auxiliary_names_pdr: u8,
    pub base_unit: u8,
    pub unit_modifier: i8,
    pub rate_unit: u8,
    pub base_oem_unit_handle: u8,
    pub aux_unit: u8,
    pub aux_unit_modifier: i8,
    pub aux_rate_unit: u8,
    pub rel: u8,
    pub aux_oem_unit_handle: u8,
    pub is_linear: u8,
    pub sensor_data_size: u8,
    pub resolution: f32,
    pub offset: f32,
    pub accuracy: u16,
    pub plus_tolerance: u8,
    pub minus_tolerance: u8,
    #[deku(ctx = "*sensor_data_size")]
    pub hysteresis: SensorData,
    pub supported_thresholds: u8,
    pub threshold_and_hysteresis_volatility: u8,
    pub state_transition_interval: f32,
    pub update_interval: f32,
    #[deku(ctx = "*sensor_data_size")]
    pub max_readable: SensorData,
    #[deku(ctx = "*sensor_data_size")]
    pub min_readable: SensorData,
    pub range_field_format: u8,
    pub range_field_support: u8,
    #[deku(ctx = "*range_field_format")]
    pub nominal_value: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub normal_max: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub normal_min: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub warning_high: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub warning_low: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub critical_high: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub critical_low: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub fatal_high: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub fatal_low: RangeData,
}

/// Largest possible-states bitmap accepted, DSP0248 table 81.
pub const MAX_POSSIBLE_STATES_SIZE: usize = 0x20;

/// Decode a possible-states bitmap into the set state values.
pub fn possible_state_values(bitmap: &[u8]) -> Vec<u8> {
    let mut values = Vec::new();
    for (idx, byte) in bitmap.iter().take(MAX_POSSIBLE_STATES_SIZE).enumerate()
    {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                values.push((idx * 8 + bit) as u8);
            }
        }
    }
    values
}

/// State Sensor PDR.
///
/// Composite sensors are not driven; only the first possible-states
/// instance is decoded, further instances are ignored.
#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSensorPdr {
    pub terminus_handle: u16,
    pub sensor_id: u16,
    pub entity: Entity,
    pub sensor_init: u8,
    pub sensor_auxiliary_names_pdr: u8,
    pub composite_sensor_count: u8,
    pub state_set_id: u16,
    pub possible_states_size: u8,
    #[deku(count = "possible_states_size")]
    pub possible_states: Vec<u8>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq)]
pub struct NumericEffecterPdr {
    pub terminus_handle: u16,
    pub effecter_id: u16,
    pub entity: Entity,
    pub effecter_semantic_id: u16,
    pub effecter_init: u8,
    pub effecter_auxiliary_names: u8,
    pub base_unit: u8,
    pub unit_modifier: i8,
    pub rate_unit: u8,
    pub base_oem_unit_handle: u8,
    pub aux_unit: u8,
    pub aux_unit_modifier: i8,
    pub aux_rate_unit: u8,
    pub aux_oem_unit_handle: u8,
    pub is_linear: u8,
    pub effecter_data_size: u8,
    pub resolution: f32,
    pub offset: f32,
    pub accuracy: u16,
    pub plus_tolerance: u8,
    pub minus_tolerance: u8,
    pub state_transition_interval: f32,
    pub transition_interval: f32,
    #[deku(ctx = "*effecter_data_size")]
    pub max_settable: SensorData,
    #[deku(ctx = "*effecter_data_size")]
    pub min_settable: SensorData,
    pub range_field_format: u8,
    pub range_field_support: u8,
    #[deku(ctx = "*range_field_format")]
    pub nominal_value: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub normal_max: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub normal_min: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub rated_max: RangeData,
    #[deku(ctx = "*range_field_format")]
    pub rated_min: RangeData,
}

/// State Effecter PDR, first possible-states instance only.
#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEffecterPdr {
    pub terminus_handle: u16,
    pub effecter_id: u16,
    pub entity: Entity,
    pub effecter_semantic_id: u16,
    pub effecter_init: u8,
    pub has_description_pdr: u8,
    pub composite_effecter_count: u8,
    pub state_set_id: u16,
    pub possible_states_size: u8,
    #[deku(count = "possible_states_size")]
    pub possible_states: Vec<u8>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAssociationPdr {
    pub container_id: u16,
    pub association_type: u8,
    pub container: Entity,
    pub contained_count: u8,
    #[deku(count = "contained_count")]
    pub contained: Vec<Entity>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAuxNamesPdr {
    pub entity: Entity,
    pub shared_name_count: u8,
    pub name_string_count: u8,
    /// Language tag / UTF-16BE name pairs
    #[deku(read_all)]
    pub names: Vec<u8>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorAuxNamesPdr {
    pub terminus_handle: u16,
    pub sensor_id: u16,
    pub sensor_count: u8,
    pub name_string_count: u8,
    #[deku(read_all)]
    pub names: Vec<u8>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffecterAuxNamesPdr {
    pub terminus_handle: u16,
    pub effecter_id: u16,
    pub effecter_count: u8,
    pub name_string_count: u8,
    #[deku(read_all)]
    pub names: Vec<u8>,
}

#[allow(missing_docs)]
#[deku_derive(DekuRead, DekuWrite)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FruRecordSetPdr {
    pub terminus_handle: u16,
    pub fru_rsi: u16,
    pub entity: Entity,
}

/// Append-only store of raw PDR records keyed by record handle.
///
/// Written once during terminus init, read-only afterwards. Inserting a
/// handle twice keeps the first record.
#[derive(Debug, Default)]
pub struct PdrRepo {
    records: BTreeMap<u32, Vec<u8>>,
}

impl PdrRepo {
    /// Construct an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw record under `handle`. Idempotent by handle.
    pub fn insert(&mut self, handle: u32, record: Vec<u8>) {
        self.records.entry(handle).or_insert(record);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the repository holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The raw record stored under `handle`.
    pub fn get(&self, handle: u32) -> Option<&[u8]> {
        self.records.get(&handle).map(|r| r.as_slice())
    }

    /// Raw records of one PDR type, in handle order.
    pub fn records_of_type(
        &self,
        ty: u8,
    ) -> impl Iterator<Item = (u32, &[u8])> {
        self.records
            .iter()
            .filter(move |(_, r)| record_type(r) == Some(ty))
            .map(|(h, r)| (*h, r.as_slice()))
    }

    /// All raw records, in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.records.iter().map(|(h, r)| (*h, r.as_slice()))
    }
}

#[cfg(test)]
pub(crate) mod test_records {
    //! Raw-record builders shared by the crate's tests.

    use super::*;
    use deku::DekuContainerWrite;

    pub fn wrap(handle: u32, ty: u8, body: Vec<u8>) -> Vec<u8> {
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

    pub fn terminus_locator(handle: u32, tid: u8, container_id: u16) -> Vec<u8> {
        let body = TerminusLocatorPdr {
            terminus_handle: 1,
            validity: tl_validity::VALID,
            tid,
            container_id,
            locator_type: 0,
            locator_value_size: 1,
            locator_value: vec![0x08],
        };
        wrap(handle, pdr_type::TERMINUS_LOCATOR, body.to_bytes().unwrap())
    }

    pub fn numeric_effecter_u8(
        handle: u32,
        effecter_id: u16,
        entity: Entity,
        min_set: u8,
        max_set: u8,
        transition_interval: f32,
    ) -> Vec<u8> {
        let body = NumericEffecterPdr {
            terminus_handle: 1,
            effecter_id,
            entity,
            effecter_semantic_id: 0,
            effecter_init: InitHint::NoInit as u8,
            effecter_auxiliary_names: 0,
            base_unit: 19, // percentage
            unit_modifier: 0,
            rate_unit: 0,
            base_oem_unit_handle: 0,
            aux_unit: 0,
            aux_unit_modifier: 0,
            aux_rate_unit: 0,
            aux_oem_unit_handle: 0,
            is_linear: 1,
            effecter_data_size: 0,
            resolution: 1.0,
            offset: 0.0,
            accuracy: 0,
            plus_tolerance: 0,
            minus_tolerance: 0,
            state_transition_interval: 0.0,
            transition_interval,
            max_settable: SensorData::U8(max_set),
            min_settable: SensorData::U8(min_set),
            range_field_format: 0,
            range_field_support: 0,
            nominal_value: RangeData::U8(0),
            normal_max: RangeData::U8(0),
            normal_min: RangeData::U8(0),
            rated_max: RangeData::U8(max_set),
            rated_min: RangeData::U8(min_set),
        };
        wrap(handle, pdr_type::NUMERIC_EFFECTER, body.to_bytes().unwrap())
    }

    pub fn numeric_sensor_u8(
        handle: u32,
        sensor_id: u16,
        entity: Entity,
        resolution: f32,
        offset: f32,
    ) -> Vec<u8> {
        let body = NumericSensorPdr {
            terminus_handle: 1,
            sensor_id,
            entity,
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
            resolution,
            offset,
            accuracy: 0,
            plus_tolerance: 0,
            minus_tolerance: 0,
            hysteresis: SensorData::U8(2),
            supported_thresholds: threshold_support::UPPER_WARNING
                | threshold_support::UPPER_CRITICAL,
            threshold_and_hysteresis_volatility: 0,
            state_transition_interval: 0.0,
            update_interval: 1.0,
            max_readable: SensorData::U8(255),
            min_readable: SensorData::U8(0),
            range_field_format: 0,
            range_field_support: 0x18,
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
        wrap(handle, pdr_type::NUMERIC_SENSOR, body.to_bytes().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn entity() -> Entity {
        Entity {
            entity_type: 7,
            entity_instance: 1,
            container_id: 100,
        }
    }

    #[test]
    fn numeric_sensor_roundtrip() {
        let rec =
            test_records::numeric_sensor_u8(5, 1, entity(), 1.0, 0.0);
        let hdr = PdrHeader::parse(&rec).unwrap();
        assert_eq!(hdr.record_handle, 5);
        assert_eq!(hdr.pdr_type, pdr_type::NUMERIC_SENSOR);
        assert_eq!(record_type(&rec), Some(pdr_type::NUMERIC_SENSOR));

        let pdr: NumericSensorPdr = parse_record(&rec).unwrap();
        assert_eq!(pdr.sensor_id, 1);
        assert_eq!(pdr.entity, entity());
        assert_eq!(pdr.hysteresis, SensorData::U8(2));
        assert_eq!(pdr.warning_high, RangeData::U8(70));
    }

    #[test]
    fn truncated_record_rejected() {
        let mut rec =
            test_records::numeric_sensor_u8(5, 1, entity(), 1.0, 0.0);
        rec.truncate(rec.len() - 4);
        assert!(parse_record::<NumericSensorPdr>(&rec).is_none());
    }

    #[test]
    fn possible_states_decode() {
        assert_eq!(possible_state_values(&[0b0000_1110]), vec![1, 2, 3]);
        assert_eq!(possible_state_values(&[0x00, 0x01]), vec![8]);
        assert!(possible_state_values(&[]).is_empty());
    }

    #[test]
    fn repo_insert_idempotent() {
        let mut repo = PdrRepo::new();
        let rec = test_records::terminus_locator(1, 7, 100);
        repo.insert(1, rec.clone());
        repo.insert(1, vec![0xde, 0xad]);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get(1), Some(rec.as_slice()));
    }

    #[test]
    fn repo_find_by_type() {
        let mut repo = PdrRepo::new();
        repo.insert(1, test_records::terminus_locator(1, 7, 100));
        repo.insert(2, test_records::numeric_sensor_u8(2, 1, entity(), 1.0, 0.0));
        repo.insert(3, test_records::numeric_sensor_u8(3, 2, entity(), 1.0, 0.0));

        let sensors: Vec<_> =
            repo.records_of_type(pdr_type::NUMERIC_SENSOR).collect();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0].0, 2);
        assert_eq!(
            repo.records_of_type(pdr_type::TERMINUS_LOCATOR).count(),
            1
        );
        assert_eq!(repo.records_of_type(pdr_type::OEM).count(), 0);
    }

    #[test]
    fn locator_parse() {
        let rec = test_records::terminus_locator(9, 7, 100);
        let tl: TerminusLocatorPdr = parse_record(&rec).unwrap();
        assert_eq!(tl.tid, 7);
        assert_eq!(tl.container_id, 100);
        assert_eq!(tl.validity, tl_validity::VALID);
        assert_eq!(rec[TL_TID_OFFSET], 7);
    }
}
