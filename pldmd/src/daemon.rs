// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Device orchestration.
 *
 * Copyright (c) 2025 Code Construct
 */

//! The device orchestrator.
//!
//! Serialises device initialisation through a FIFO, owns the per-terminus
//! state, drives the sensor poll cycle, and runs firmware update sessions
//! exclusively.

use std::collections::{BTreeMap, VecDeque};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use pldmd_base::control::{self, CommandSupportTable};
use pldmd_base::mediator::Mediator;
use pldmd_base::transport::{Binding, Eid};
use pldmd_base::{PldmError, Tid};
use pldmd_fw::pkg::{Package, PldmPackageError};
use pldmd_fw::ua::{self, FwSink};
use pldmd_fw::{DeviceIdentifiers, FirmwareParameters, PLDM_TYPE_FW};
use pldmd_platform::publish::PlatformSink;
use pldmd_platform::terminus::PlatformTerminus;
use pldmd_platform::PLDM_TYPE_PLATFORM;

/// Daemon-level errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Base messaging failure
    #[error(transparent)]
    Pldm(#[from] PldmError),
    /// Firmware package failure
    #[error(transparent)]
    Package(#[from] PldmPackageError),
    /// Package file access failure
    #[error("package file error: {0}")]
    Io(#[from] std::io::Error),
    /// A firmware update session is already running
    #[error("firmware update already in progress")]
    UpdateInProgress,
    /// The package matches no initialised terminus
    #[error("no matching devices for package")]
    NoMatchingDevice,
}

/// Daemon result type.
pub type Result<T> = core::result::Result<T, Error>;

/// Firmware-update inventory of a terminus.
#[derive(Debug)]
pub struct FwDevice {
    /// Identifying descriptors, matched against package device records
    pub ids: DeviceIdentifiers,
    /// Component parameter table
    pub params: FirmwareParameters,
}

/// One initialised terminus.
pub struct Terminus {
    /// The assigned terminus ID
    pub tid: Tid,
    /// Types and commands the terminus supports
    pub support: CommandSupportTable,
    /// Monitoring & control state, when supported
    pub platform: Option<PlatformTerminus>,
    /// Firmware update inventory, when supported
    pub fw: Option<FwDevice>,
}

/// The daemon core.
///
/// Owns the mediator (and with it the transport) and every terminus. All
/// methods run on the single-threaded reactor; ordering guarantees come
/// from the cooperative serialisation here, not from locks.
pub struct Daemon<B: Binding, S: PlatformSink + FwSink> {
    mediator: Mediator<B>,
    sink: S,
    termini: BTreeMap<u8, Terminus>,
    init_queue: VecDeque<Eid>,
    init_running: bool,
    polling_paused: bool,
    fw_session_active: bool,
}

impl<B: Binding, S: PlatformSink + FwSink> Daemon<B, S> {
    /// Construct the daemon over a transport binding and a publication sink.
    pub fn new(binding: B, sink: S) -> Self {
        Daemon {
            mediator: Mediator::new(binding),
            sink,
            termini: BTreeMap::new(),
            init_queue: VecDeque::new(),
            init_running: false,
            polling_paused: false,
            fw_session_active: false,
        }
    }

    /// Access the publication sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The initialised termini, in TID order.
    pub fn termini(&self) -> impl Iterator<Item = &Terminus> {
        self.termini.values()
    }

    /// Look up one terminus.
    pub fn terminus(&self, tid: Tid) -> Option<&Terminus> {
        self.termini.get(&tid.0)
    }

    /// Pause the sensor poll driver.
    pub fn pause_polling(&mut self) {
        self.polling_paused = true;
    }

    /// Resume the sensor poll driver.
    pub fn resume_polling(&mut self) {
        self.polling_paused = false;
    }

    /// Handle a device-added discovery event.
    ///
    /// Inits are strictly serialised: when one is already running the EID
    /// queues and the running worker drains it before exiting.
    pub async fn device_added(&mut self, eid: Eid) {
        self.init_queue.push_back(eid);
        if self.init_running {
            warn!("Another device init in progress, adding EID to queue");
            return;
        }

        self.init_running = true;
        while let Some(eid) = self.init_queue.pop_front() {
            self.polling_paused = true;
            self.init_device(eid).await;
            self.polling_paused = false;
        }
        self.init_running = false;
    }

    async fn init_device(&mut self, eid: Eid) {
        info!("Initializing endpoint {eid}");

        if self.mediator.tid_map().tid(eid).is_some() {
            warn!("EID {eid} already initialised");
            return;
        }
        let Some(tid) = self.mediator.tid_map().next_free_tid() else {
            error!("No free TID for EID {eid}");
            return;
        };
        if self.mediator.tid_map_mut().add(tid, eid).is_err() {
            return;
        }

        let support = match control::negotiate(&mut self.mediator, tid).await
        {
            Ok(s) => s,
            Err(e) => {
                error!("PLDM base init failed for EID {eid}: {e}");
                self.mediator.tid_map_mut().remove(tid);
                return;
            }
        };

        let mut terminus = Terminus {
            tid,
            support,
            platform: None,
            fw: None,
        };

        if terminus.support.supports_type(PLDM_TYPE_PLATFORM) {
            match PlatformTerminus::init(&mut self.mediator, tid, &mut self.sink)
                .await
            {
                Ok(p) => {
                    self.publish_device_nodes(&p);
                    self.decorate_baseboard(&p);
                    terminus.platform = Some(p);
                }
                Err(e) => {
                    error!("PLDM platform init failed for TID {tid}: {e}")
                }
            }
        }

        if terminus.support.supports_type(PLDM_TYPE_FW) {
            match self.fw_init(tid).await {
                Ok(fw) => terminus.fw = Some(fw),
                Err(e) => {
                    error!(
                        "PLDM firmware update init failed for TID {tid}: {e}"
                    )
                }
            }
        }

        self.termini.insert(tid.0, terminus);
        info!("TID {tid}: device init complete");
    }

    #[cfg(feature = "expose-chassis")]
    fn publish_device_nodes(&mut self, platform: &PlatformTerminus) {
        use pldmd_platform::entity::Entity;

        // A per-device chassis node, named after the device
        let path = format!(
            "inventory/system/board/{}",
            platform.device_name
        );
        self.sink.inventory_node(
            platform.tid,
            &path,
            Entity {
                entity_type: 0,
                entity_instance: 0,
                container_id: 0,
            },
        );
    }

    #[cfg(not(feature = "expose-chassis"))]
    fn publish_device_nodes(&mut self, _platform: &PlatformTerminus) {}

    #[cfg(feature = "decorate-baseboard")]
    fn decorate_baseboard(&mut self, platform: &PlatformTerminus) {
        // Mirror this device's sensors onto the shared baseboard node
        for s in &platform.numeric_sensors {
            let path = format!("inventory/baseboard/{}", s.name());
            self.sink.sensor_node(platform.tid, s.id(), &path);
        }
        for s in &platform.state_sensors {
            let path = format!("inventory/baseboard/{}", s.name());
            self.sink.sensor_node(platform.tid, s.id(), &path);
        }
    }

    #[cfg(not(feature = "decorate-baseboard"))]
    fn decorate_baseboard(&mut self, _platform: &PlatformTerminus) {}

    async fn fw_init(&mut self, tid: Tid) -> ua::Result<FwDevice> {
        let ids =
            ua::query_device_identifiers(&mut self.mediator, tid).await?;
        let params =
            ua::query_firmware_parameters(&mut self.mediator, tid).await?;
        info!(
            "TID {tid}: firmware device {ids}, active version {}, {} \
             components",
            params.active,
            params.components.len()
        );
        Ok(FwDevice { ids, params })
    }

    /// Handle a device-removed discovery event.
    pub async fn device_removed(&mut self, eid: Eid) {
        let Some(tid) = self.mediator.tid_map().tid(eid) else {
            warn!("EID {eid} is not mapped to any TID");
            return;
        };
        self.remove_terminus(tid);
    }

    // Resources are released strictly in reverse order of init so no
    // dependent still references released state.
    fn remove_terminus(&mut self, tid: Tid) {
        info!("Delete PLDM device with TID {tid}");
        let Some(mut terminus) = self.termini.remove(&tid.0) else {
            return;
        };
        if terminus.fw.take().is_some() {
            info!("TID {tid}: firmware update device resources deleted");
        }
        if let Some(mut platform) = terminus.platform.take() {
            platform.shutdown(&mut self.sink);
        }
        self.mediator.tid_map_mut().remove(tid);
    }

    /// Poll every sensor and effecter of every terminus once.
    ///
    /// A no-op while polling is paused; the pause flag is checked between
    /// termini so a pause request preempts at the next terminus boundary.
    pub async fn poll_cycle(&mut self) {
        let tids: Vec<u8> = self.termini.keys().copied().collect();
        for tid in tids {
            if self.polling_paused {
                return;
            }
            if let Some(t) = self.termini.get_mut(&tid) {
                if let Some(platform) = t.platform.as_mut() {
                    platform
                        .poll_all(&mut self.mediator, &mut self.sink)
                        .await;
                }
            }
        }
    }

    /// Start a firmware update from a package file.
    ///
    /// Runs the session serially for every matched device; sensor polling
    /// pauses for the duration. Updated devices are re-initialised
    /// afterwards.
    pub async fn start_fw_update(&mut self, path: &str) -> Result<()> {
        if self.fw_session_active {
            error!(
                "Cannot start firmware update, another update is in progress"
            );
            return Err(Error::UpdateInProgress);
        }

        info!("StartFWUpdate: {path}");
        let file = std::fs::File::open(path)?;
        let package = Package::parse(file)?;

        let mut matched: Vec<(usize, Tid)> = Vec::new();
        for t in self.termini.values() {
            let Some(fw) = t.fw.as_ref() else { continue };
            for device_index in package.matching_devices(&fw.ids) {
                matched.push((device_index, t.tid));
            }
        }
        if matched.is_empty() {
            warn!("No PLDM termini match the package");
            return Err(Error::NoMatchingDevice);
        }

        self.fw_session_active = true;
        self.polling_paused = true;

        let outcome =
            ua::run_package(&mut self.mediator, &package, &matched, &mut self.sink)
                .await;

        self.polling_paused = false;
        self.fw_session_active = false;

        // Updated devices run with new firmware now; re-discover them
        for tid in outcome.updated {
            if let Some(eid) = self.mediator.tid_map().eid(tid) {
                self.remove_terminus(tid);
                self.device_added(eid).await;
            }
        }
        Ok(())
    }

    /// Set a numeric effecter through its terminus.
    pub async fn set_numeric_effecter(
        &mut self,
        tid: Tid,
        effecter_id: u16,
        value: f64,
    ) -> core::result::Result<(), pldmd_platform::SetError> {
        let handler = self
            .termini
            .get_mut(&tid.0)
            .and_then(|t| t.platform.as_mut())
            .and_then(|p| {
                p.numeric_effecters
                    .iter_mut()
                    .find(|e| e.id().0 == effecter_id)
            })
            .ok_or(pldmd_platform::SetError::Pldm(
                PldmError::InvalidArgument,
            ))?;
        handler
            .set(&mut self.mediator, &mut self.sink, value)
            .await
    }

    /// Set a state effecter through its terminus.
    pub async fn set_state_effecter(
        &mut self,
        tid: Tid,
        effecter_id: u16,
        state: u8,
    ) -> core::result::Result<(), pldmd_platform::SetError> {
        let handler = self
            .termini
            .get_mut(&tid.0)
            .and_then(|t| t.platform.as_mut())
            .and_then(|p| {
                p.state_effecters
                    .iter_mut()
                    .find(|e| e.id().0 == effecter_id)
            })
            .ok_or(pldmd_platform::SetError::Pldm(
                PldmError::InvalidArgument,
            ))?;
        handler
            .set(&mut self.mediator, &mut self.sink, state)
            .await
    }

    /// Tear down every terminus before stopping the reactor.
    pub async fn shutdown(&mut self) {
        self.polling_paused = true;
        let tids: Vec<u8> = self.termini.keys().copied().collect();
        for tid in tids {
            self.remove_terminus(Tid(tid));
        }
    }
}
