// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Per-terminus platform state.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Platform init for one terminus: PDR ingestion, inventory publication
//! and sensor/effecter handler construction.

use std::collections::HashMap;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use pldmd_base::mediator::Mediator;
use pldmd_base::transport::Binding;
use pldmd_base::{Result, Tid};

use crate::effecter_numeric::NumericEffecterHandler;
use crate::effecter_state::StateEffecterHandler;
use crate::entity::{decode_aux_name, AssociationNode, Entity, EntityTree};
use crate::pdr::{
    self, pdr_type, EffecterAuxNamesPdr, EntityAssociationPdr,
    EntityAuxNamesPdr, FruRecordSetPdr, NumericEffecterPdr, NumericSensorPdr,
    PdrRepo, SensorAuxNamesPdr, StateEffecterPdr, StateSensorPdr,
};
use crate::publish::PlatformSink;
use crate::retrieval::{self, RetrievedRepo};
use crate::sensor_numeric::NumericSensorHandler;
use crate::sensor_state::StateSensorHandler;

/// Platform-level state of one terminus.
///
/// Owns the PDR repository and every sensor/effecter handler. The handlers
/// hold no references into the repository; parsed views are copied out
/// during construction.
pub struct PlatformTerminus {
    /// The terminus ID
    pub tid: Tid,
    /// Raw PDR store, read-only after init
    pub repo: PdrRepo,
    /// Container id of the valid Terminus Locator PDR
    pub container_id: Option<u16>,
    /// Sanitised device-level name
    pub device_name: String,
    /// Numeric sensor handlers, in PDR handle order
    pub numeric_sensors: Vec<NumericSensorHandler>,
    /// State sensor handlers
    pub state_sensors: Vec<StateSensorHandler>,
    /// Numeric effecter handlers
    pub numeric_effecters: Vec<NumericEffecterHandler>,
    /// State effecter handlers
    pub state_effecters: Vec<StateEffecterHandler>,
}

// Entity auxiliary names; a shared-name PDR covers an instance range.
fn entity_aux_names(repo: &PdrRepo) -> HashMap<Entity, String> {
    let mut names = HashMap::new();
    for (_, rec) in repo.records_of_type(pdr_type::ENTITY_AUXILIARY_NAMES) {
        let Some(p) = pdr::parse_record::<EntityAuxNamesPdr>(rec) else {
            warn!("Entity Auxiliary Names PDR parsing failed");
            continue;
        };
        let Some(name) = decode_aux_name(p.name_string_count, &p.names)
        else {
            error!("Entity Auxiliary Name invalid");
            continue;
        };
        if p.shared_name_count == 0 {
            debug!("Entity auxiliary name: {name}");
            names.entry(p.entity).or_insert(name);
        } else {
            // entity_instance gives the start of the covered range
            for k in 0..=p.shared_name_count as u16 {
                let entity = Entity {
                    entity_instance: p.entity.entity_instance + k,
                    ..p.entity
                };
                names.entry(entity).or_insert(format!("{name}_{k}"));
            }
        }
    }
    names
}

fn sensor_aux_names(
    repo: &PdrRepo,
    device_name: &str,
) -> HashMap<u16, String> {
    let mut names = HashMap::new();
    for (_, rec) in repo.records_of_type(pdr_type::SENSOR_AUXILIARY_NAMES) {
        let Some(p) = pdr::parse_record::<SensorAuxNamesPdr>(rec) else {
            warn!("Sensor Auxiliary Names PDR parsing failed");
            continue;
        };
        if let Some(name) = decode_aux_name(p.name_string_count, &p.names) {
            debug!("Sensor {} auxiliary name: {name}", p.sensor_id);
            names.insert(p.sensor_id, format!("{device_name}_{name}"));
        }
    }
    names
}

fn effecter_aux_names(
    repo: &PdrRepo,
    device_name: &str,
) -> HashMap<u16, String> {
    let mut names = HashMap::new();
    for (_, rec) in repo.records_of_type(pdr_type::EFFECTER_AUXILIARY_NAMES) {
        let Some(p) = pdr::parse_record::<EffecterAuxNamesPdr>(rec) else {
            warn!("Effecter Auxiliary Names PDR parsing failed");
            continue;
        };
        if let Some(name) = decode_aux_name(p.name_string_count, &p.names) {
            debug!("Effecter {} auxiliary name: {name}", p.effecter_id);
            names.insert(p.effecter_id, format!("{device_name}_{name}"));
        }
    }
    names
}

fn association_tree(
    repo: &PdrRepo,
    container_id: u16,
) -> Option<EntityTree> {
    let mut assocs = Vec::new();
    for (_, rec) in repo.records_of_type(pdr_type::ENTITY_ASSOCIATION) {
        let Some(p) = pdr::parse_record::<EntityAssociationPdr>(rec) else {
            warn!("Entity Association PDR parsing failed");
            continue;
        };
        assocs.push(AssociationNode {
            container: p.container,
            children: p.contained,
        });
    }
    if assocs.is_empty() {
        return None;
    }
    EntityTree::build(assocs, container_id)
}

impl PlatformTerminus {
    /// Retrieve PDRs, publish the inventory and construct the handlers, then
    /// enable every sensor and effecter.
    ///
    /// Handlers whose enable command fails are dropped with an error log;
    /// the terminus itself survives.
    pub async fn init(
        mediator: &mut Mediator<impl Binding>,
        tid: Tid,
        sink: &mut dyn PlatformSink,
    ) -> Result<PlatformTerminus> {
        let retrieved = retrieval::fetch_repository(mediator, tid).await?;
        let mut terminus = Self::build(tid, retrieved, sink);

        let mut enabled = Vec::new();
        for mut s in terminus.numeric_sensors.drain(..) {
            match s.enable(mediator, sink).await {
                Ok(()) => enabled.push(s),
                Err(e) => error!(
                    "TID {tid}: numeric sensor {} init failed: {e}",
                    s.id().0
                ),
            }
        }
        terminus.numeric_sensors = enabled;

        let mut enabled = Vec::new();
        for mut s in terminus.state_sensors.drain(..) {
            match s.enable(mediator, sink).await {
                Ok(()) => enabled.push(s),
                Err(e) => error!(
                    "TID {tid}: state sensor {} init failed: {e}",
                    s.id().0
                ),
            }
        }
        terminus.state_sensors = enabled;

        // Effecters read their initial value right after enabling
        let mut enabled = Vec::new();
        for mut e in terminus.numeric_effecters.drain(..) {
            match e.enable(mediator).await {
                Ok(()) => {
                    let _ = e.poll(mediator, sink).await;
                    enabled.push(e);
                }
                Err(err) => error!(
                    "TID {tid}: numeric effecter {} init failed: {err}",
                    e.id().0
                ),
            }
        }
        terminus.numeric_effecters = enabled;

        let mut enabled = Vec::new();
        for mut e in terminus.state_effecters.drain(..) {
            match e.enable(mediator).await {
                Ok(()) => {
                    let _ = e.poll(mediator, sink).await;
                    enabled.push(e);
                }
                Err(err) => error!(
                    "TID {tid}: state effecter {} init failed: {err}",
                    e.id().0
                ),
            }
        }
        terminus.state_effecters = enabled;

        info!(
            "TID {tid}: platform init complete, {} sensors, {} effecters",
            terminus.numeric_sensors.len() + terminus.state_sensors.len(),
            terminus.numeric_effecters.len()
                + terminus.state_effecters.len()
        );
        Ok(terminus)
    }

    /// Parse the repository into inventory and handlers.
    pub fn build(
        tid: Tid,
        retrieved: RetrievedRepo,
        sink: &mut dyn PlatformSink,
    ) -> PlatformTerminus {
        let RetrievedRepo { repo, container_id } = retrieved;

        let entity_names = entity_aux_names(&repo);

        let tree = container_id
            .and_then(|cid| association_tree(&repo, cid));
        if tree.is_none() {
            warn!("TID {tid}: no entity association tree");
        }

        // Root-to-leaf object paths, consumed into the entity→path map as
        // the inventory is published
        let mut entity_paths: HashMap<Entity, String> = HashMap::new();
        if let Some(tree) = &tree {
            let prefix = format!("system/{tid}");
            for (path, entity) in tree.object_paths(&prefix, &entity_names) {
                sink.inventory_node(tid, &path, entity);
                entity_paths.entry(entity).or_insert(path);
            }
        }

        let device_name = tree
            .as_ref()
            .and_then(|t| entity_names.get(&t.root()).cloned())
            .map(|n| format!("{n}_{tid}"))
            .unwrap_or_else(|| format!("PLDM_Device_{tid}"));
        debug!("TID {tid}: device name {device_name}");

        let sensor_names = sensor_aux_names(&repo, &device_name);
        let effecter_names = effecter_aux_names(&repo, &device_name);

        let sensor_name = |id: u16| {
            sensor_names
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("{device_name}_Sensor_{id}"))
        };
        let effecter_name = |id: u16| {
            effecter_names
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("{device_name}_Effecter_{id}"))
        };

        let mut numeric_sensors = Vec::new();
        for (_, rec) in repo.records_of_type(pdr_type::NUMERIC_SENSOR) {
            let Some(p) = pdr::parse_record::<NumericSensorPdr>(rec) else {
                warn!("TID {tid}: numeric sensor PDR parsing failed");
                continue;
            };
            let name = sensor_name(p.sensor_id);
            match entity_paths.get(&p.entity) {
                Some(path) => {
                    let path = format!("{path}/{name}");
                    sink.sensor_node(
                        tid,
                        crate::proto::SensorId(p.sensor_id),
                        &path,
                    );
                }
                None => warn!(
                    "TID {tid}: no entity for numeric sensor {}",
                    p.sensor_id
                ),
            }
            numeric_sensors.push(NumericSensorHandler::new(tid, name, p));
        }

        let mut state_sensors = Vec::new();
        for (_, rec) in repo.records_of_type(pdr_type::STATE_SENSOR) {
            let Some(p) = pdr::parse_record::<StateSensorPdr>(rec) else {
                warn!("TID {tid}: state sensor PDR parsing failed");
                continue;
            };
            let name = sensor_name(p.sensor_id);
            match entity_paths.get(&p.entity) {
                Some(path) => {
                    let path = format!("{path}/{name}");
                    sink.sensor_node(
                        tid,
                        crate::proto::SensorId(p.sensor_id),
                        &path,
                    );
                }
                None => warn!(
                    "TID {tid}: no entity for state sensor {}",
                    p.sensor_id
                ),
            }
            match StateSensorHandler::new(tid, name, p) {
                Ok(h) => state_sensors.push(h),
                Err(e) => {
                    warn!("TID {tid}: state sensor rejected: {e}")
                }
            }
        }

        let mut numeric_effecters = Vec::new();
        for (_, rec) in repo.records_of_type(pdr_type::NUMERIC_EFFECTER) {
            let Some(p) = pdr::parse_record::<NumericEffecterPdr>(rec) else {
                warn!("TID {tid}: numeric effecter PDR parsing failed");
                continue;
            };
            let name = effecter_name(p.effecter_id);
            match entity_paths.get(&p.entity) {
                Some(path) => {
                    let path = format!("{path}/{name}");
                    sink.effecter_node(
                        tid,
                        crate::proto::EffecterId(p.effecter_id),
                        &path,
                    );
                }
                None => warn!(
                    "TID {tid}: no entity for numeric effecter {}",
                    p.effecter_id
                ),
            }
            numeric_effecters
                .push(NumericEffecterHandler::new(tid, name, p));
        }

        let mut state_effecters = Vec::new();
        for (_, rec) in repo.records_of_type(pdr_type::STATE_EFFECTER) {
            let Some(p) = pdr::parse_record::<StateEffecterPdr>(rec) else {
                warn!("TID {tid}: state effecter PDR parsing failed");
                continue;
            };
            let name = effecter_name(p.effecter_id);
            match entity_paths.get(&p.entity) {
                Some(path) => {
                    let path = format!("{path}/{name}");
                    sink.effecter_node(
                        tid,
                        crate::proto::EffecterId(p.effecter_id),
                        &path,
                    );
                }
                None => warn!(
                    "TID {tid}: no entity for state effecter {}",
                    p.effecter_id
                ),
            }
            match StateEffecterHandler::new(tid, name, p) {
                Ok(h) => state_effecters.push(h),
                Err(e) => {
                    warn!("TID {tid}: state effecter rejected: {e}")
                }
            }
        }

        for (_, rec) in repo.records_of_type(pdr_type::FRU_RECORD_SET) {
            let Some(p) = pdr::parse_record::<FruRecordSetPdr>(rec) else {
                error!("TID {tid}: FRU Record Set PDR length invalid");
                continue;
            };
            // A FRU without a matching entity is not exposed
            match entity_paths.get(&p.entity) {
                Some(path) => sink.fru_record_set(tid, path, p.fru_rsi),
                None => warn!(
                    "TID {tid}: no entity for FRU record set {:#x}",
                    p.fru_rsi
                ),
            }
        }

        PlatformTerminus {
            tid,
            repo,
            container_id,
            device_name,
            numeric_sensors,
            state_sensors,
            numeric_effecters,
            state_effecters,
        }
    }

    /// Poll every sensor and effecter once, sequentially.
    pub async fn poll_all(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn PlatformSink,
    ) {
        for s in &mut self.numeric_sensors {
            let _ = s.poll(mediator, sink).await;
        }
        for s in &mut self.state_sensors {
            let _ = s.poll(mediator, sink).await;
        }
        for e in &mut self.numeric_effecters {
            let _ = e.poll(mediator, sink).await;
        }
        for e in &mut self.state_effecters {
            let _ = e.poll(mediator, sink).await;
        }
    }

    /// Tear down in reverse order of construction.
    pub fn shutdown(&mut self, sink: &mut dyn PlatformSink) {
        for e in self.state_effecters.iter_mut().rev() {
            e.shutdown(sink);
        }
        for e in self.numeric_effecters.iter_mut().rev() {
            e.shutdown(sink);
        }
        for s in self.state_sensors.iter_mut().rev() {
            s.shutdown(sink);
        }
        for s in self.numeric_sensors.iter_mut().rev() {
            s.shutdown(sink);
        }
        info!("TID {}: platform state released", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deku::DekuContainerWrite;

    use crate::pdr::test_records;
    use crate::proto::SensorId;
    use crate::publish::{NumericReading, PlatformSink};

    fn e(t: u16, i: u16, c: u16) -> Entity {
        Entity {
            entity_type: t,
            entity_instance: i,
            container_id: c,
        }
    }

    fn assoc_record(
        handle: u32,
        container: Entity,
        children: &[Entity],
    ) -> Vec<u8> {
        let body = EntityAssociationPdr {
            container_id: container.container_id,
            association_type: 0,
            container,
            contained_count: children.len() as u8,
            contained: children.to_vec(),
        };
        test_records::wrap(
            handle,
            pdr_type::ENTITY_ASSOCIATION,
            body.to_bytes().unwrap(),
        )
    }

    fn entity_names_record(
        handle: u32,
        entity: Entity,
        name: &str,
        shared: u8,
    ) -> Vec<u8> {
        let mut names = b"en\0".to_vec();
        for u in name.encode_utf16() {
            names.extend_from_slice(&u.to_be_bytes());
        }
        names.extend_from_slice(&[0, 0]);
        let body = EntityAuxNamesPdr {
            entity,
            shared_name_count: shared,
            name_string_count: 1,
            names,
        };
        test_records::wrap(
            handle,
            pdr_type::ENTITY_AUXILIARY_NAMES,
            body.to_bytes().unwrap(),
        )
    }

    #[derive(Default)]
    struct Record {
        inventory: Vec<(String, Entity)>,
        sensors: Vec<(SensorId, String)>,
    }

    impl PlatformSink for Record {
        fn inventory_node(
            &mut self,
            _tid: Tid,
            path: &str,
            entity: Entity,
        ) {
            self.inventory.push((path.into(), entity));
        }

        fn sensor_node(&mut self, _tid: Tid, id: SensorId, path: &str) {
            self.sensors.push((id, path.into()));
        }

        fn numeric_sensor_reading(
            &mut self,
            _tid: Tid,
            _id: SensorId,
            _name: &str,
            _reading: &NumericReading,
        ) {
        }
    }

    #[test]
    fn build_inventory_and_handlers() {
        let board = e(1, 1, 100);
        let cpu = e(2, 1, 1);

        let mut repo = PdrRepo::new();
        repo.insert(1, test_records::terminus_locator(1, 1, 100));
        repo.insert(2, assoc_record(2, board, &[cpu]));
        repo.insert(3, entity_names_record(3, board, "Board", 0));
        repo.insert(4, test_records::numeric_sensor_u8(4, 7, cpu, 1.0, 0.0));

        let mut sink = Record::default();
        let t = PlatformTerminus::build(
            Tid(1),
            RetrievedRepo {
                repo,
                container_id: Some(100),
            },
            &mut sink,
        );

        assert_eq!(t.device_name, "Board_1");
        assert_eq!(t.numeric_sensors.len(), 1);
        assert_eq!(
            t.numeric_sensors[0].name(),
            "Board_1_Sensor_7"
        );

        assert_eq!(sink.inventory.len(), 2);
        assert!(sink
            .inventory
            .iter()
            .any(|(p, _)| p == "system/1/Board"));
        assert_eq!(sink.sensors.len(), 1);
        assert_eq!(
            sink.sensors[0].1,
            "system/1/Board/2_1_1/Board_1_Sensor_7"
        );
    }

    #[test]
    fn shared_entity_names_cover_range() {
        let mut repo = PdrRepo::new();
        repo.insert(1, entity_names_record(1, e(3, 5, 1), "Dimm", 2));

        let names = entity_aux_names(&repo);
        assert_eq!(names.get(&e(3, 5, 1)).map(String::as_str), Some("Dimm_0"));
        assert_eq!(names.get(&e(3, 6, 1)).map(String::as_str), Some("Dimm_1"));
        assert_eq!(names.get(&e(3, 7, 1)).map(String::as_str), Some("Dimm_2"));
        assert!(names.get(&e(3, 8, 1)).is_none());
    }
}
