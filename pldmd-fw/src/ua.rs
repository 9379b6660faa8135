// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update: the Update Agent.
 *
 * Copyright (c) 2025 Code Construct
 */

//! The Update Agent engine.
//!
//! Drives the full DSP0267 dialog against one firmware device at a time:
//! RequestUpdate, the LEARN COMPONENTS data phases, PassComponentTable,
//! per-component UpdateComponent with the RequestFirmwareData pump and the
//! Transfer/Verify/Apply completions, and final ActivateFirmware. The engine
//! also answers the firmware-device-initiated commands, holds the link
//! bandwidth reservation for the session, and reports progress and the final
//! activation outcome.

use std::collections::HashSet;
use std::time::{Duration, Instant};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use nom::combinator::all_consuming;
use thiserror::Error;

use pldmd_base::mediator::Mediator;
use pldmd_base::transport::{Binding, Tag};
use pldmd_base::{CCode, PldmError, PldmRequest, PldmResponse, Tid};

use crate::pkg;
use crate::{
    fw_codes, transfer_flag, ApplyResult, Cmd, DataTransferReq,
    DeviceIdentifiers, FdState, FirmwareParameters, GetStatusResponse,
    RequestFirmwareDataReq, RequestUpdateResponse, TransferResult,
    UpdateComponentResponse, VerifyResult, PLDM_FW_BASELINE_TRANSFER,
    PLDM_TYPE_FW,
};

/// Firmware update result type
pub type Result<T> = core::result::Result<T, UpdateError>;

/// Errors from the Update Agent.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Base messaging failure
    #[error("PLDM error: {0}")]
    Pldm(#[from] PldmError),
    /// Malformed response or request
    #[error("PLDM protocol error: {0}")]
    Protocol(String),
    /// A command failed with a completion code
    #[error("PLDM command (0x{0:02x}) failed with 0x{1:02x}")]
    Command(u8, u8),
    /// Update sequencing failure
    #[error("PLDM update error: {0}")]
    Update(String),
    /// Package access failure
    #[error("PLDM package error: {0}")]
    Package(#[from] pkg::PldmPackageError),
}

impl UpdateError {
    fn new_command(cmd: Cmd, cc: u8) -> Self {
        Self::Command(cmd as u8, cc)
    }

    fn new_proto(desc: impl Into<String>) -> Self {
        Self::Protocol(desc.into())
    }

    fn new_update(desc: impl Into<String>) -> Self {
        Self::Update(desc.into())
    }
}

// Timeout for a single UA-initiated command exchange.
const CMD_TIMEOUT: Duration = Duration::from_millis(100);
const CMD_RETRIES: usize = 3;

// Idle timer while awaiting an FD-initiated command.
const FD_CMD_TIMEOUT: Duration = Duration::from_secs(5);
// The FD may take much longer between RequestFirmwareData pulls.
const FW_DATA_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

// Backoff before retrying RequestUpdate on RETRY_REQUEST_UPDATE.
const RETRY_REQUEST_UPDATE_DELAY: Duration = Duration::from_secs(5);
const RETRY_REQUEST_UPDATE_COUNT: usize = 3;

// Pacing between LEARN COMPONENTS commands.
const DELAY_BETWEEN: Duration = Duration::from_millis(500);

// Observed update throughput, for sizing the bandwidth reservation.
const BYTES_PER_SEC: usize = 2730;
// Re-reserve this many seconds before the reservation lapses.
const RESERVE_RENEW_MARGIN: u16 = 5;

// Unique transfer requests needed for `size` bytes.
fn unique_requests(size: usize) -> usize {
    size.div_ceil(PLDM_FW_BASELINE_TRANSFER).max(1)
}

// Overall packet budget for a data-bearing phase; allows re-queries but
// fails after a hard cap.
fn request_budget(size: usize) -> usize {
    4 * unique_requests(size)
}

/// Sink for update progress and the final activation outcome.
#[allow(unused_variables)]
pub trait FwSink {
    /// Component progress, percent of the component table walked.
    fn progress(&mut self, tid: Tid, percent: u8) {}

    /// Final session outcome over all matched devices.
    fn activation(&mut self, active: bool) {}
}

/// A sink that drops everything.
#[derive(Debug, Default)]
pub struct NullFwSink;

impl FwSink for NullFwSink {}

/// Query the descriptors identifying a firmware device.
pub async fn query_device_identifiers(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<DeviceIdentifiers> {
    let mut req =
        PldmRequest::new(PLDM_TYPE_FW, Cmd::QueryDeviceIdentifiers as u8);
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    if rsp.cc != 0 {
        return Err(UpdateError::new_command(
            Cmd::QueryDeviceIdentifiers,
            rsp.cc,
        ));
    }

    // device identifiers length prefix, then the count and descriptors
    let f = nom::multi::length_value(
        nom::combinator::map(nom::number::complete::le_u32, |l| l + 1),
        DeviceIdentifiers::parse,
    );
    let res = all_consuming(f)(&rsp.data);

    res.map(|(_, d)| d).map_err(|_e| {
        UpdateError::new_proto("can't parse QueryDeviceIdentifiers response")
    })
}

/// Query a firmware device's component parameter table.
pub async fn query_firmware_parameters(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<FirmwareParameters> {
    let mut req =
        PldmRequest::new(PLDM_TYPE_FW, Cmd::GetFirmwareParameters as u8);
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    if rsp.cc != 0 {
        return Err(UpdateError::new_command(
            Cmd::GetFirmwareParameters,
            rsp.cc,
        ));
    }

    let res = all_consuming(FirmwareParameters::parse)(&rsp.data);

    res.map(|(_, d)| d).map_err(|_e| {
        UpdateError::new_proto("can't parse GetFirmwareParameters response")
    })
}

/// One firmware update session: a single `(device ID record, TID)` pair.
///
/// Sessions are exclusive; the orchestrator runs them serially and pauses
/// sensor polling for the duration.
pub struct UpdateSession<'p> {
    tid: Tid,
    package: &'p pkg::Package,
    device_index: usize,
    state: FdState,
    update_mode: bool,
    applicable: Vec<usize>,
    fd_metadata_len: u16,
    fd_will_send_pkg_data: bool,
    fd_metadata: Vec<u8>,
    reserve_timeout: u16,
    reserved_at: Option<Instant>,
    component_updated: bool,
    /// RequestUpdate retry backoff; overridable for testing
    pub retry_delay: Duration,
}

impl<'p> UpdateSession<'p> {
    /// Create a session for device record `device_index` of `package`,
    /// updating the terminus at `tid`.
    pub fn new(
        tid: Tid,
        package: &'p pkg::Package,
        device_index: usize,
    ) -> UpdateSession<'p> {
        let applicable = package
            .devices
            .get(device_index)
            .map(|d| d.components.as_index_vec())
            .unwrap_or_default();

        let size = package.updatable_image_size(device_index);
        let reserve_timeout = (3 * (1 + size / BYTES_PER_SEC)).max(1) as u16;

        UpdateSession {
            tid,
            package,
            device_index,
            state: FdState::Idle,
            update_mode: false,
            applicable,
            fd_metadata_len: 0,
            fd_will_send_pkg_data: false,
            fd_metadata: Vec::new(),
            reserve_timeout,
            reserved_at: None,
            component_updated: false,
            retry_delay: RETRY_REQUEST_UPDATE_DELAY,
        }
    }

    /// The FD state the UA tracks for this session.
    pub fn state(&self) -> FdState {
        self.state
    }

    fn device(&self) -> &pkg::PackageDevice {
        &self.package.devices[self.device_index]
    }

    async fn xfer(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        cmd: Cmd,
        data: Vec<u8>,
    ) -> Result<PldmResponse> {
        let mut req = PldmRequest::new_data(PLDM_TYPE_FW, cmd as u8, data);
        let rsp = mediator
            .send_receive(self.tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;
        Ok(rsp)
    }

    async fn xfer_checked(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        cmd: Cmd,
        data: Vec<u8>,
    ) -> Result<PldmResponse> {
        let rsp = self.xfer(mediator, cmd, data).await?;
        if rsp.cc != 0 {
            return Err(UpdateError::new_command(cmd, rsp.cc));
        }
        Ok(rsp)
    }

    async fn send_error(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        tag: Tag,
        req: &PldmRequest,
        cc: u8,
    ) {
        let mut resp = req.response();
        resp.cc = cc;
        if let Err(e) = mediator
            .send_response(self.tid, tag, &resp, CMD_RETRIES)
            .await
        {
            error!(
                "TID {}: failed to send error completion code: {e}",
                self.tid
            );
        }
    }

    async fn send_ok(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        tag: Tag,
        req: &PldmRequest,
        data: Vec<u8>,
    ) -> Result<()> {
        let mut resp = req.response();
        resp.data = data;
        mediator
            .send_response(self.tid, tag, &resp, CMD_RETRIES)
            .await?;
        Ok(())
    }

    // Whether the FD may legally issue `cmd` in the current session state.
    fn fd_cmd_allowed(&self, cmd: u8) -> bool {
        if cmd == Cmd::RequestFirmwareData as u8
            || cmd == Cmd::TransferComplete as u8
        {
            self.state == FdState::Download
        } else if cmd == Cmd::VerifyComplete as u8 {
            self.state == FdState::Verify
        } else if cmd == Cmd::ApplyComplete as u8 {
            self.state == FdState::Apply
        } else if cmd == Cmd::GetPackageData as u8 {
            self.state == FdState::LearnComponents
        } else if cmd == Cmd::GetMetaData as u8 {
            !matches!(self.state, FdState::Idle | FdState::LearnComponents)
        } else {
            true
        }
    }

    /// Wait for the expected FD-initiated command.
    ///
    /// Packets for other TIDs or with a non-matching command are dropped
    /// with a debug log; a recognized FD command arriving in the wrong
    /// session state is answered with COMMAND_NOT_EXPECTED. While waiting
    /// for RequestFirmwareData a TransferComplete is also accepted.
    async fn expect_fd_request(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        expected: Cmd,
        timeout: Duration,
    ) -> Result<(Tag, PldmRequest)> {
        loop {
            let inbound = mediator
                .recv_timeout(timeout)
                .await
                .map_err(PldmError::from)?;
            let Some((tid, tag, req)) = inbound else {
                warn!(
                    "TID {}: timeout waiting for {expected:?} packet",
                    self.tid
                );
                return Err(UpdateError::new_update(format!(
                    "timeout waiting for {expected:?}"
                )));
            };

            if tid != self.tid {
                info!(
                    "Firmware update in progress for TID {}, dropping \
                     packet from TID {tid}",
                    self.tid
                );
                continue;
            }
            if req.typ != PLDM_TYPE_FW {
                debug!("TID {tid}: non-firmware request during update");
                continue;
            }

            if req.cmd == expected as u8 {
                return Ok((tag, req));
            }
            if expected == Cmd::RequestFirmwareData
                && req.cmd == Cmd::TransferComplete as u8
            {
                info!("TransferComplete received from TID {}", self.tid);
                return Ok((tag, req));
            }

            let is_fd = num_traits::FromPrimitive::from_u8(req.cmd)
                .map(|c: Cmd| c.is_fd())
                .unwrap_or(false);
            if is_fd && !self.fd_cmd_allowed(req.cmd) {
                debug!(
                    "TID {tid}: command 0x{:02x} not expected in state \
                     {:?}",
                    req.cmd, self.state
                );
                self.send_error(
                    mediator,
                    tag,
                    &req,
                    fw_codes::COMMAND_NOT_EXPECTED,
                )
                .await;
                continue;
            }
            debug!(
                "TID {tid}: dropping command 0x{:02x} while expecting \
                 {expected:?}",
                req.cmd
            );
        }
    }

    /// Put the FD into update mode.
    ///
    /// A RETRY_REQUEST_UPDATE completion is backed off and retried.
    pub async fn request_update(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if self.update_mode {
            return Err(UpdateError::new_update("already in update mode"));
        }
        if self.state != FdState::Idle {
            return Err(UpdateError::new_update("FD not idle"));
        }

        let device = self.device();
        let mut data = Vec::new();
        data.extend_from_slice(
            &(PLDM_FW_BASELINE_TRANSFER as u32).to_le_bytes(),
        );
        data.extend_from_slice(&(self.applicable.len() as u16).to_le_bytes());
        data.push(1); // MaximumOutstandingTransferRequests
        data.extend_from_slice(
            &(device.package_data.len() as u16).to_le_bytes(),
        );
        device.version.write_utf8_bytes(&mut data);

        let mut rsp = None;
        for attempt in 0..RETRY_REQUEST_UPDATE_COUNT {
            let r = self
                .xfer(mediator, Cmd::RequestUpdate, data.clone())
                .await?;
            if r.cc == fw_codes::RETRY_REQUEST_UPDATE {
                warn!(
                    "TID {}: FD not ready for update, retry {}",
                    self.tid,
                    attempt + 1
                );
                smol::Timer::after(self.retry_delay).await;
                continue;
            }
            rsp = Some(r);
            break;
        }
        let Some(rsp) = rsp else {
            return Err(UpdateError::new_command(
                Cmd::RequestUpdate,
                fw_codes::RETRY_REQUEST_UPDATE,
            ));
        };
        if rsp.cc != 0 {
            return Err(UpdateError::new_command(Cmd::RequestUpdate, rsp.cc));
        }

        let (_, r) = all_consuming(RequestUpdateResponse::parse)(&rsp.data)
            .map_err(|_| {
                UpdateError::new_proto("can't parse RequestUpdate response")
            })?;

        self.fd_metadata_len = r.fd_metadata_len;
        self.fd_will_send_pkg_data = r.fd_will_send_gpd == 0x01;
        self.update_mode = true;
        self.state = FdState::LearnComponents;
        info!("TID {}: FD changed state to LEARN COMPONENTS", self.tid);
        Ok(())
    }

    // Serve FD pulls of a UA-held data buffer: GetPackageData during LEARN
    // COMPONENTS, GetMetaData after apply.
    async fn serve_pull(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        cmd: Cmd,
        data: Vec<u8>,
    ) -> Result<()> {
        let size = data.len();
        let expected = unique_requests(size);
        let mut received: HashSet<u32> = HashSet::new();

        for _ in 0..request_budget(size) {
            let (tag, req) =
                self.expect_fd_request(mediator, cmd, FD_CMD_TIMEOUT).await?;

            let parsed = all_consuming(DataTransferReq::parse)(&req.data);
            let Ok((_, dt)) = parsed else {
                error!("TID {}: {cmd:?} decode request failed", self.tid);
                self.send_error(
                    mediator,
                    tag,
                    &req,
                    CCode::ERROR_INVALID_DATA as u8,
                )
                .await;
                return Err(UpdateError::new_proto("bad data transfer pull"));
            };

            // GetFirstPart rewinds to the start of the data, whether it is
            // the first request or a restart
            let offset;
            if dt.op == pldmd_base::control::xfer_op::GET_FIRSTPART {
                offset = 0;
                received.insert(0);
            } else {
                offset = dt.handle as usize * PLDM_FW_BASELINE_TRANSFER;
                received.insert(dt.handle);
            }

            let mut length = PLDM_FW_BASELINE_TRANSFER;
            if offset + length > size {
                if offset < size {
                    length = size - offset;
                } else {
                    self.send_error(mediator, tag, &req, CCode::ERROR as u8)
                        .await;
                    return Err(UpdateError::new_update(
                        "data pull outside buffer",
                    ));
                }
            }

            let mut payload = Vec::with_capacity(5 + length);
            payload.extend_from_slice(&(dt.handle + 1).to_le_bytes());
            payload.push(transfer_flag(offset, length, size));
            payload.extend_from_slice(&data[offset..offset + length]);
            self.send_ok(mediator, tag, &req, payload).await?;

            if received.len() == expected {
                info!("TID {}: {cmd:?} transfer complete", self.tid);
                return Ok(());
            }
        }

        error!("TID {}: {cmd:?} requests exceed limit", self.tid);
        Err(UpdateError::new_update("data pull requests exceed limit"))
    }

    /// Serve the firmware-device package data if the FD asked for it.
    pub async fn send_package_data(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if self.state != FdState::LearnComponents || !self.update_mode {
            return Err(UpdateError::new_update("command not expected"));
        }
        if !self.fd_will_send_pkg_data {
            return Ok(());
        }

        let data = self.device().package_data.clone();
        if data.is_empty() {
            error!(
                "TID {}: FD wants package data but the device record \
                 carries none",
                self.tid
            );
            return Err(UpdateError::new_update("no package data"));
        }
        self.serve_pull(mediator, Cmd::GetPackageData, data).await
    }

    /// Pull the firmware device metadata announced by RequestUpdate.
    pub async fn get_device_metadata(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if !self.update_mode {
            return Err(UpdateError::new_update("not in update mode"));
        }
        if self.state != FdState::LearnComponents {
            return Err(UpdateError::new_update("command not expected"));
        }
        if self.fd_metadata_len == 0 {
            return Ok(());
        }

        let mut handle = 0u32;
        let mut op = pldmd_base::control::xfer_op::GET_FIRSTPART;

        // Bounded number of parts; a terminus streaming more is broken
        for _ in 0..100 {
            let mut data = Vec::new();
            data.extend_from_slice(&handle.to_le_bytes());
            data.push(op);
            let rsp = self
                .xfer_checked(mediator, Cmd::GetDeviceMetaData, data)
                .await?;

            let parsed: nom::IResult<&[u8], (u32, u8, &[u8]), nom::error::Error<&[u8]>> =
                nom::sequence::tuple((
                    nom::number::complete::le_u32,
                    nom::number::complete::le_u8,
                    nom::combinator::rest,
                ))(rsp.data.as_slice());
            let Ok((_, (next_handle, flag, portion))) = parsed else {
                return Err(UpdateError::new_proto(
                    "can't parse GetDeviceMetaData response",
                ));
            };

            self.fd_metadata.extend_from_slice(portion);
            handle = next_handle;
            op = pldmd_base::control::xfer_op::GET_NEXTPART;

            use pldmd_base::control::xfer_flag;
            if flag == xfer_flag::END || flag == xfer_flag::START_AND_END {
                debug!(
                    "TID {}: GetDeviceMetaData received {} bytes",
                    self.tid,
                    self.fd_metadata.len()
                );
                return Ok(());
            }
        }

        error!("TID {}: GetDeviceMetaData responses exceed limit", self.tid);
        self.fd_metadata.clear();
        Err(UpdateError::new_update("metadata responses exceed limit"))
    }

    /// Serve the FD's metadata pulls after the component loop.
    pub async fn send_metadata(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if matches!(self.state, FdState::Idle | FdState::LearnComponents) {
            return Err(UpdateError::new_update("command not expected"));
        }
        if self.fd_metadata_len == 0 || self.fd_metadata.is_empty() {
            return Ok(());
        }
        let data = self.fd_metadata.clone();
        self.serve_pull(mediator, Cmd::GetMetaData, data).await
    }

    fn component_request(
        &self,
        comp: &pkg::PackageComponent,
        with_size: bool,
        flag: Option<u8>,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        if let Some(flag) = flag {
            data.push(flag);
        }
        let c = u16::from(&comp.classification);
        data.extend_from_slice(&c.to_le_bytes());
        data.extend_from_slice(&comp.identifier.to_le_bytes());
        data.push(0); // ComponentClassificationIndex
        data.extend_from_slice(&comp.comparison_stamp.to_le_bytes());
        if with_size {
            data.extend_from_slice(&(comp.file_size as u32).to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes()); // update options
        }
        comp.version.write_utf8_bytes(&mut data);
        data
    }

    /// Pass every applicable component to the FD.
    pub async fn pass_component_table(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if !self.update_mode {
            return Err(UpdateError::new_update("not in update mode"));
        }
        if self.state != FdState::LearnComponents {
            return Err(UpdateError::new_update("command not expected"));
        }

        let applicable = self.applicable.clone();
        let total = applicable.len();
        let mut accepted = 0usize;

        for (n, comp_idx) in applicable.iter().enumerate() {
            let Some(comp) = self.package.components.get(*comp_idx) else {
                warn!(
                    "TID {}: applicable component {comp_idx} not in package",
                    self.tid
                );
                continue;
            };
            let flag = crate::pass_component_flag(n, total);
            let data = self.component_request(comp, false, Some(flag));

            let rsp = match self
                .xfer_checked(mediator, Cmd::PassComponentTable, data)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        "TID {}: PassComponentTable failed for component \
                         {comp_idx}: {e}",
                        self.tid
                    );
                    continue;
                }
            };
            if rsp.data.len() < 2 {
                warn!(
                    "TID {}: invalid PassComponentTable response",
                    self.tid
                );
                continue;
            }
            if rsp.data[0] != 0 {
                warn!(
                    "TID {}: component {comp_idx} will not be updated, \
                     response code 0x{:02x}",
                    self.tid, rsp.data[1]
                );
                continue;
            }

            info!(
                "TID {}: PassComponentTable success, component {comp_idx}",
                self.tid
            );
            accepted += 1;
            smol::Timer::after(DELAY_BETWEEN).await;
        }

        if accepted == 0 {
            return Err(UpdateError::new_update("no component accepted"));
        }
        self.state = FdState::ReadyXfer;
        info!("TID {}: FD changed state to READY XFER", self.tid);
        Ok(())
    }

    /// Start the transfer of one component.
    pub async fn update_component(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        comp_idx: usize,
    ) -> Result<UpdateComponentResponse> {
        if !self.update_mode {
            return Err(UpdateError::new_update("not in update mode"));
        }
        if self.state != FdState::ReadyXfer {
            return Err(UpdateError::new_update("command not expected"));
        }
        let comp = self
            .package
            .components
            .get(comp_idx)
            .ok_or_else(|| UpdateError::new_update("invalid component"))?;
        let data = self.component_request(comp, true, None);

        let rsp = self
            .xfer_checked(mediator, Cmd::UpdateComponent, data)
            .await?;
        let (_, r) = all_consuming(UpdateComponentResponse::parse)(&rsp.data)
            .map_err(|_| {
                UpdateError::new_proto("can't parse UpdateComponent response")
            })?;
        Ok(r)
    }

    /// Serve RequestFirmwareData for the current component until the FD
    /// reports TransferComplete.
    ///
    /// Returns the TransferComplete request for completion handling.
    async fn pump_firmware_data(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        comp_idx: usize,
    ) -> Result<(Tag, PldmRequest)> {
        let comp = &self.package.components[comp_idx];
        let size = comp.file_size;
        let comp_no = comp_idx + 1;
        let mut prev_progress = 0usize;

        for _ in 0..request_budget(size) {
            let (tag, req) = self
                .expect_fd_request(
                    mediator,
                    Cmd::RequestFirmwareData,
                    FW_DATA_IDLE_TIMEOUT,
                )
                .await?;

            if req.cmd == Cmd::TransferComplete as u8 {
                return Ok((tag, req));
            }

            let parsed =
                all_consuming(RequestFirmwareDataReq::parse)(&req.data);
            let Ok((_, rfd)) = parsed else {
                error!(
                    "TID {}: RequestFirmwareData decode failed",
                    self.tid
                );
                self.send_error(
                    mediator,
                    tag,
                    &req,
                    CCode::ERROR_INVALID_DATA as u8,
                )
                .await;
                return Err(UpdateError::new_proto("bad RequestFirmwareData"));
            };

            let offset = rfd.offset as usize;
            let mut length = rfd.length as usize;
            if offset + length > size {
                if offset < size {
                    // the final portion is short of the requested length
                    length = size - offset;
                } else {
                    self.send_error(mediator, tag, &req, CCode::ERROR as u8)
                        .await;
                    return Err(UpdateError::new_update(
                        "firmware data request outside image",
                    ));
                }
            }

            let mut buf = vec![0u8; length];
            if let Err(e) =
                self.package.read_component(comp, rfd.offset, &mut buf)
            {
                error!("TID {}: update image read failed: {e}", self.tid);
                self.send_error(mediator, tag, &req, CCode::ERROR as u8)
                    .await;
                return Err(e.into());
            }

            self.send_ok(mediator, tag, &req, buf).await?;

            let progress = ((offset + length) * 100) / size;
            if progress - prev_progress >= 25 {
                prev_progress = progress;
                info!(
                    "TID {}: component {comp_no} update package \
                     transferred {progress}%",
                    self.tid
                );
            }
        }

        warn!(
            "TID {}: exceeded maximum RequestFirmwareData requests",
            self.tid
        );
        Err(UpdateError::new_update("firmware data requests exceed limit"))
    }

    /// Handle the FD's TransferComplete.
    async fn transfer_complete(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        tag: Tag,
        req: PldmRequest,
    ) -> Result<()> {
        if !self.update_mode || self.state != FdState::Download {
            self.send_error(
                mediator,
                tag,
                &req,
                fw_codes::COMMAND_NOT_EXPECTED,
            )
            .await;
            return Err(UpdateError::new_update("command not expected"));
        }

        let Some(&result) = req.data.first() else {
            self.send_error(
                mediator,
                tag,
                &req,
                CCode::ERROR_INVALID_LENGTH as u8,
            )
            .await;
            return Err(UpdateError::new_proto("short TransferComplete"));
        };
        if TransferResult::from(result) != TransferResult::Success {
            warn!(
                "TID {}: firmware transfer error 0x{result:02x}",
                self.tid
            );
            self.send_error(
                mediator,
                tag,
                &req,
                CCode::ERROR_INVALID_DATA as u8,
            )
            .await;
            return Err(UpdateError::new_update("transfer failed"));
        }

        self.send_ok(mediator, tag, &req, Vec::new()).await?;
        self.state = FdState::Verify;
        debug!("TID {}: FD changed state to VERIFY", self.tid);
        Ok(())
    }

    /// Handle the FD's VerifyComplete.
    async fn verify_complete(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        tag: Tag,
        req: PldmRequest,
    ) -> Result<()> {
        if !self.update_mode || self.state != FdState::Verify {
            self.send_error(
                mediator,
                tag,
                &req,
                fw_codes::COMMAND_NOT_EXPECTED,
            )
            .await;
            return Err(UpdateError::new_update("command not expected"));
        }

        let Some(&result) = req.data.first() else {
            self.send_error(
                mediator,
                tag,
                &req,
                CCode::ERROR_INVALID_LENGTH as u8,
            )
            .await;
            return Err(UpdateError::new_proto("short VerifyComplete"));
        };
        if VerifyResult::from(result) != VerifyResult::Success {
            warn!("TID {}: firmware verify error 0x{result:02x}", self.tid);
            self.send_error(
                mediator,
                tag,
                &req,
                CCode::ERROR_INVALID_DATA as u8,
            )
            .await;
            return Err(UpdateError::new_update("verify failed"));
        }

        self.send_ok(mediator, tag, &req, Vec::new()).await?;
        self.state = FdState::Apply;
        debug!("TID {}: FD changed state to APPLY", self.tid);
        Ok(())
    }

    /// Handle the FD's ApplyComplete.
    async fn apply_complete(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        tag: Tag,
        req: PldmRequest,
    ) -> Result<()> {
        if !self.update_mode || self.state != FdState::Apply {
            self.send_error(
                mediator,
                tag,
                &req,
                fw_codes::COMMAND_NOT_EXPECTED,
            )
            .await;
            return Err(UpdateError::new_update("command not expected"));
        }

        let Some(&result) = req.data.first() else {
            self.send_error(
                mediator,
                tag,
                &req,
                CCode::ERROR_INVALID_LENGTH as u8,
            )
            .await;
            return Err(UpdateError::new_proto("short ApplyComplete"));
        };
        let r = ApplyResult::from(result);
        if r != ApplyResult::Success && r != ApplyResult::SuccessModActivation
        {
            warn!("TID {}: firmware apply error 0x{result:02x}", self.tid);
            self.send_error(
                mediator,
                tag,
                &req,
                CCode::ERROR_INVALID_DATA as u8,
            )
            .await;
            return Err(UpdateError::new_update("apply failed"));
        }

        self.send_ok(mediator, tag, &req, Vec::new()).await?;
        self.state = FdState::ReadyXfer;
        debug!("TID {}: FD changed state to READY XFER", self.tid);
        Ok(())
    }

    /// Activate the transferred firmware. Terminal for the session.
    pub async fn activate_firmware(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<u16> {
        if !self.update_mode {
            return Err(UpdateError::new_update("not in update mode"));
        }
        if self.state != FdState::ReadyXfer {
            return Err(UpdateError::new_update("command not expected"));
        }

        let data = vec![1u8]; // self-contained activation
        let rsp = self
            .xfer_checked(mediator, Cmd::ActivateFirmware, data)
            .await?;
        let (_, secs): (&[u8], u16) =
            all_consuming::<_, _, nom::error::Error<&[u8]>, _>(nom::number::complete::le_u16)(
                rsp.data.as_slice(),
            )
            .map_err(|_| {
                UpdateError::new_proto(
                    "can't parse ActivateFirmware response",
                )
            })?;

        self.state = FdState::Activate;
        debug!("TID {}: FD changed state to ACTIVATE", self.tid);
        Ok(secs)
    }

    /// Cancel the current component. Valid in DOWNLOAD, VERIFY and APPLY.
    pub async fn cancel_update_component(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if !self.update_mode {
            return Err(UpdateError::new_update("not in update mode"));
        }
        if !matches!(
            self.state,
            FdState::Download | FdState::Verify | FdState::Apply
        ) {
            return Err(UpdateError::new_update("command not expected"));
        }

        self.xfer_checked(mediator, Cmd::CancelUpdateComponent, Vec::new())
            .await?;
        self.state = FdState::ReadyXfer;
        debug!("TID {}: FD changed state to READY XFER", self.tid);
        Ok(())
    }

    /// Cancel the whole update. Valid in any state but IDLE and ACTIVATE.
    pub async fn cancel_update(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<()> {
        if !self.update_mode {
            return Err(UpdateError::new_update("not in update mode"));
        }
        if matches!(self.state, FdState::Idle | FdState::Activate) {
            return Err(UpdateError::new_update("command not expected"));
        }

        self.xfer_checked(mediator, Cmd::CancelUpdate, Vec::new())
            .await?;
        self.state = FdState::Idle;
        self.update_mode = false;
        debug!("TID {}: FD changed state to IDLE", self.tid);
        Ok(())
    }

    /// Query the FD's update status.
    pub async fn get_status(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) -> Result<GetStatusResponse> {
        let rsp =
            self.xfer_checked(mediator, Cmd::GetStatus, Vec::new()).await?;
        let (_, status) =
            all_consuming(GetStatusResponse::parse)(rsp.data.as_slice())
                .map_err(|_| {
                    UpdateError::new_proto("can't parse GetStatus response")
                })?;
        debug!("TID {}: FD status {:?}", self.tid, status.current_state);
        Ok(status)
    }

    // Hold the bandwidth reservation, renewing before it lapses.
    async fn reserve_keepalive(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) {
        let renew = match self.reserved_at {
            None => true,
            Some(at) => {
                at.elapsed().as_secs()
                    >= self
                        .reserve_timeout
                        .saturating_sub(RESERVE_RENEW_MARGIN)
                        as u64
            }
        };
        if !renew {
            return;
        }
        match mediator
            .reserve(self.tid, PLDM_TYPE_FW, self.reserve_timeout)
            .await
        {
            Ok(()) => self.reserved_at = Some(Instant::now()),
            Err(e) => {
                warn!("TID {}: reserveBandwidth failed: {e}", self.tid)
            }
        }
    }

    async fn release_reservation(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) {
        if self.reserved_at.take().is_some() {
            if let Err(e) = mediator.release(self.tid, PLDM_TYPE_FW).await {
                error!("TID {}: releaseBandwidth failed: {e}", self.tid);
            }
        }
    }

    /// Run the full update dialog for this session.
    ///
    /// Component-level failures cancel that component and move on; a
    /// sequencing failure aborts. Returns the FD's estimated self-contained
    /// activation time in seconds.
    pub async fn run(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
        sink: &mut dyn FwSink,
    ) -> Result<u16> {
        self.request_update(mediator).await?;
        info!("TID {}: RequestUpdate command is success", self.tid);

        smol::Timer::after(DELAY_BETWEEN).await;
        self.reserve_keepalive(mediator).await;

        self.send_package_data(mediator).await?;
        self.get_device_metadata(mediator).await?;
        self.pass_component_table(mediator).await?;
        info!("TID {}: PassComponentTable command is success", self.tid);

        let comp_count = self.package.components.len();
        let progress_of = |n: usize| {
            ((n + 1) * 100 / comp_count.max(1)) as u8
        };

        for comp_idx in 0..comp_count {
            self.reserve_keepalive(mediator).await;

            if !self.applicable.contains(&comp_idx) {
                warn!(
                    "TID {}: component {comp_idx} not applicable, skipping",
                    self.tid
                );
                sink.progress(self.tid, progress_of(comp_idx));
                continue;
            }

            let ucr = match self.update_component(mediator, comp_idx).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        "TID {}: UpdateComponent failed for component \
                         {comp_idx}: {e}",
                        self.tid
                    );
                    continue;
                }
            };
            if ucr.response != 0 {
                warn!(
                    "TID {}: component {comp_idx} will not be updated, \
                     ComponentCompatibilityResponse code 0x{:02x}",
                    self.tid, ucr.response_code
                );
                sink.progress(self.tid, progress_of(comp_idx));
                continue;
            }

            self.state = FdState::Download;
            info!(
                "TID {}: UpdateComponent command is success, component \
                 {comp_idx}, FD changed state to DOWNLOAD",
                self.tid
            );

            let (tag, req) =
                match self.pump_firmware_data(mediator, comp_idx).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(
                            "TID {}: firmware data transfer failed for \
                             component {comp_idx}: {e}",
                            self.tid
                        );
                        if let Err(e) =
                            self.cancel_update_component(mediator).await
                        {
                            warn!(
                                "TID {}: CancelUpdateComponent failed: {e}",
                                self.tid
                            );
                        }
                        continue;
                    }
                };
            sink.progress(self.tid, progress_of(comp_idx));

            if let Err(e) =
                self.transfer_complete(mediator, tag, req).await
            {
                warn!(
                    "TID {}: TransferComplete failed for component \
                     {comp_idx}: {e}",
                    self.tid
                );
                if let Err(e) = self.cancel_update_component(mediator).await {
                    warn!(
                        "TID {}: CancelUpdateComponent failed: {e}",
                        self.tid
                    );
                }
                continue;
            }
            info!(
                "TID {}: TransferComplete command is success, component \
                 {comp_idx}",
                self.tid
            );

            let r = self
                .expect_fd_request(
                    mediator,
                    Cmd::VerifyComplete,
                    FD_CMD_TIMEOUT,
                )
                .await;
            let Ok((tag, req)) = r else {
                warn!(
                    "TID {}: timeout waiting for VerifyComplete, component \
                     {comp_idx}",
                    self.tid
                );
                continue;
            };
            if let Err(e) = self.verify_complete(mediator, tag, req).await {
                warn!(
                    "TID {}: VerifyComplete failed for component \
                     {comp_idx}: {e}",
                    self.tid
                );
                if let Err(e) = self.cancel_update_component(mediator).await {
                    warn!(
                        "TID {}: CancelUpdateComponent failed: {e}",
                        self.tid
                    );
                }
                continue;
            }
            info!(
                "TID {}: VerifyComplete command is success, component \
                 {comp_idx}",
                self.tid
            );

            let r = self
                .expect_fd_request(
                    mediator,
                    Cmd::ApplyComplete,
                    FD_CMD_TIMEOUT,
                )
                .await;
            let Ok((tag, req)) = r else {
                warn!(
                    "TID {}: timeout waiting for ApplyComplete, component \
                     {comp_idx}",
                    self.tid
                );
                continue;
            };
            if let Err(e) = self.apply_complete(mediator, tag, req).await {
                warn!(
                    "TID {}: ApplyComplete failed for component \
                     {comp_idx}: {e}",
                    self.tid
                );
                continue;
            }
            info!(
                "TID {}: ApplyComplete command is success, component \
                 {comp_idx}",
                self.tid
            );
            self.component_updated = true;
        }

        // The FD may pull its metadata back once every component is applied
        if self.fd_metadata_len != 0 {
            self.send_metadata(mediator).await?;
        }

        self.release_reservation(mediator).await;

        if !self.component_updated {
            error!("TID {}: firmware update failed", self.tid);
            return Err(UpdateError::new_update("no component updated"));
        }

        let secs = self.activate_firmware(mediator).await?;
        info!(
            "TID {}: firmware update completed successfully",
            self.tid
        );
        Ok(secs)
    }

    /// Abort the session: CancelUpdate and release the reservation.
    pub async fn terminate(
        &mut self,
        mediator: &mut Mediator<impl Binding>,
    ) {
        error!("TID {}: firmware update stopped", self.tid);
        if let Err(e) = self.cancel_update(mediator).await {
            error!("TID {}: unable to CancelUpdate: {e}", self.tid);
        }
        self.release_reservation(mediator).await;
    }
}

/// Outcome of a whole-package update.
#[derive(Debug)]
pub struct PackageUpdateOutcome {
    /// Whether at least one device reached ActivateFirmware
    pub active: bool,
    /// Devices that activated, for re-discovery by the caller
    pub updated: Vec<Tid>,
}

/// Run the update serially for each matched `(device ID record, TID)` pair.
///
/// After the last device finishes, waits the maximum of the reported
/// activation times and publishes the single Active/Failed outcome. Sensor
/// polling must be paused by the caller for the duration.
pub async fn run_package(
    mediator: &mut Mediator<impl Binding>,
    package: &pkg::Package,
    matched: &[(usize, Tid)],
    sink: &mut dyn FwSink,
) -> PackageUpdateOutcome {
    let mut updated = Vec::new();
    let mut max_secs = 0u16;

    for (device_index, tid) in matched {
        let mut session = UpdateSession::new(*tid, package, *device_index);
        match session.run(mediator, sink).await {
            Ok(secs) => {
                max_secs = max_secs.max(secs);
                updated.push(*tid);
            }
            Err(e) => {
                error!("runUpdate failed for TID {tid}: {e}");
                session.terminate(mediator).await;
            }
        }
    }

    // Give the devices their self-contained activation time before the
    // caller re-discovers them
    if max_secs > 0 {
        smol::Timer::after(Duration::from_secs(max_secs as u64)).await;
    }

    let active = !updated.is_empty();
    sink.activation(active);
    PackageUpdateOutcome { active, updated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::test_pkg::{build, TestComponent};
    use crate::Descriptor;
    use pldmd_base::transport::{
        Eid, Inbound, Result as TResult, TransportError,
    };
    use pldmd_base::MCTP_MSG_TYPE_PLDM;
    use std::collections::VecDeque;

    // A firmware device driven entirely by the UA's traffic.
    #[derive(Default)]
    struct MockFd {
        pending: VecDeque<Vec<u8>>,
        cur_size: usize,
        cur_offset: usize,
        iid: u8,
        request_updates: usize,
        rfd_responses: usize,
        transfer_completes: usize,
        verify_completes: usize,
        apply_completes: usize,
        activates: usize,
        cancel_updates: usize,
        reserves: usize,
        releases: usize,
        error_responses: Vec<(u8, u8)>,
        retry_update_ccs: VecDeque<u8>,
    }

    impl MockFd {
        fn push_fd_request(&mut self, cmd: Cmd, data: &[u8]) {
            self.iid = (self.iid + 1) & 0x1f;
            let mut req =
                PldmRequest::new_data(PLDM_TYPE_FW, cmd as u8, data.to_vec());
            req.iid = self.iid;
            self.pending.push_back(req.to_wire());
        }

        fn push_rfd(&mut self) {
            let mut data = Vec::new();
            data.extend_from_slice(&(self.cur_offset as u32).to_le_bytes());
            data.extend_from_slice(
                &(PLDM_FW_BASELINE_TRANSFER as u32).to_le_bytes(),
            );
            self.push_fd_request(Cmd::RequestFirmwareData, &data);
        }
    }

    impl Binding for MockFd {
        async fn transfer(
            &mut self,
            _eid: Eid,
            payload: &[u8],
            _timeout: Duration,
        ) -> TResult<Vec<u8>> {
            assert_eq!(payload[0], MCTP_MSG_TYPE_PLDM);
            let req = PldmRequest::from_buf(&payload[1..]).unwrap();
            let mut resp = req.response();

            if req.cmd == Cmd::RequestUpdate as u8 {
                self.request_updates += 1;
                match self.retry_update_ccs.pop_front() {
                    Some(cc) => resp.cc = cc,
                    None => {
                        // no metadata, no package data wanted
                        resp.data = vec![0x00, 0x00, 0x00];
                    }
                }
            } else if req.cmd == Cmd::PassComponentTable as u8 {
                resp.data = vec![0x00, 0x00];
            } else if req.cmd == Cmd::UpdateComponent as u8 {
                let size =
                    u32::from_le_bytes(req.data[9..13].try_into().unwrap());
                self.cur_size = size as usize;
                self.cur_offset = 0;
                self.push_rfd();
                // can be updated, no flags, no estimate
                resp.data = vec![0, 0, 0, 0, 0, 0, 0, 0];
            } else if req.cmd == Cmd::ActivateFirmware as u8 {
                self.activates += 1;
                resp.data = vec![0x00, 0x00];
            } else if req.cmd == Cmd::GetStatus as u8 {
                // download, 40% through
                resp.data = vec![3, 2, 0, 0, 40, 0, 0, 0, 0, 0];
            } else if req.cmd == Cmd::CancelUpdate as u8 {
                self.cancel_updates += 1;
            } else if req.cmd == Cmd::CancelUpdateComponent as u8 {
                // ok, empty
            } else {
                resp.cc = CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8;
            }
            Ok(resp.to_wire())
        }

        async fn send(
            &mut self,
            _eid: Eid,
            _tag: Tag,
            payload: &[u8],
        ) -> TResult<()> {
            assert_eq!(payload[0], MCTP_MSG_TYPE_PLDM);
            let resp = PldmResponse::from_buf(&payload[1..]).unwrap();
            if resp.cc != 0 {
                self.error_responses.push((resp.cmd, resp.cc));
                return Ok(());
            }
            if resp.cmd == Cmd::RequestFirmwareData as u8 {
                self.rfd_responses += 1;
                self.cur_offset += resp.data.len();
                if self.cur_offset >= self.cur_size {
                    self.push_fd_request(Cmd::TransferComplete, &[0x00]);
                } else {
                    self.push_rfd();
                }
            } else if resp.cmd == Cmd::TransferComplete as u8 {
                self.transfer_completes += 1;
                self.push_fd_request(Cmd::VerifyComplete, &[0x00]);
            } else if resp.cmd == Cmd::VerifyComplete as u8 {
                self.verify_completes += 1;
                self.push_fd_request(
                    Cmd::ApplyComplete,
                    &[0x00, 0x00, 0x00],
                );
            } else if resp.cmd == Cmd::ApplyComplete as u8 {
                self.apply_completes += 1;
            }
            Ok(())
        }

        async fn recv(&mut self) -> TResult<Inbound> {
            match self.pending.pop_front() {
                Some(payload) => Ok(Inbound {
                    eid: Eid(8),
                    tag: Tag {
                        value: 1,
                        owner: true,
                    },
                    payload,
                }),
                // nothing outstanding; fail fast rather than hang the test
                None => Err(TransportError::RxFailure),
            }
        }

        async fn reserve_bandwidth(
            &mut self,
            _eid: Eid,
            _timeout_secs: u16,
        ) -> TResult<()> {
            self.reserves += 1;
            Ok(())
        }

        async fn release_bandwidth(&mut self, _eid: Eid) -> TResult<()> {
            self.releases += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordSink {
        progress: Vec<u8>,
        activation: Option<bool>,
    }

    impl FwSink for RecordSink {
        fn progress(&mut self, _tid: Tid, percent: u8) {
            self.progress.push(percent);
        }

        fn activation(&mut self, active: bool) {
            self.activation = Some(active);
        }
    }

    fn ids() -> DeviceIdentifiers {
        DeviceIdentifiers {
            ids: vec![Descriptor::PciVid(0xccde), Descriptor::Iana(1234)],
        }
    }

    fn mediator(fd: MockFd) -> Mediator<MockFd> {
        let mut m = Mediator::new(fd);
        m.tid_map_mut().add(Tid(1), Eid(8)).unwrap();
        m
    }

    #[test]
    fn full_update_happy_path() {
        smol::block_on(async {
            let pkg = build(
                &[&ids()],
                &[
                    TestComponent {
                        identifier: 0x10,
                        image: vec![0xaa; 4096],
                    },
                    TestComponent {
                        identifier: 0x20,
                        image: vec![0xbb; 8192],
                    },
                ],
            );
            let mut m = mediator(MockFd::default());
            let mut sink = RecordSink::default();

            let matched = [(0usize, Tid(1))];
            let outcome =
                run_package(&mut m, &pkg, &matched, &mut sink).await;

            assert!(outcome.active);
            assert_eq!(outcome.updated, vec![Tid(1)]);
            assert_eq!(sink.activation, Some(true));
            assert_eq!(sink.progress, vec![50, 100]);

            let fd = m.binding_ref();
            assert_eq!(fd.request_updates, 1);
            assert_eq!(fd.rfd_responses, 4096 / 32 + 8192 / 32);
            assert_eq!(fd.transfer_completes, 2);
            assert_eq!(fd.verify_completes, 2);
            assert_eq!(fd.apply_completes, 2);
            assert_eq!(fd.activates, 1);
            assert!(fd.reserves >= 1);
            assert_eq!(fd.releases, 1);
            assert!(fd.error_responses.is_empty());
        })
    }

    #[test]
    fn request_update_retry_later() {
        smol::block_on(async {
            let pkg = build(
                &[&ids()],
                &[TestComponent {
                    identifier: 0x10,
                    image: vec![0xaa; 64],
                }],
            );
            let mut fd = MockFd::default();
            fd.retry_update_ccs = VecDeque::from(vec![
                fw_codes::RETRY_REQUEST_UPDATE,
                fw_codes::RETRY_REQUEST_UPDATE,
            ]);
            let mut m = mediator(fd);

            let mut session = UpdateSession::new(Tid(1), &pkg, 0);
            session.retry_delay = Duration::from_millis(1);
            session.request_update(&mut m).await.unwrap();
            assert_eq!(session.state(), FdState::LearnComponents);
            assert_eq!(m.binding_ref().request_updates, 3);
        })
    }

    #[test]
    fn request_update_retry_exhausted() {
        smol::block_on(async {
            let pkg = build(
                &[&ids()],
                &[TestComponent {
                    identifier: 0x10,
                    image: vec![0xaa; 64],
                }],
            );
            let mut fd = MockFd::default();
            fd.retry_update_ccs = VecDeque::from(vec![
                fw_codes::RETRY_REQUEST_UPDATE;
                RETRY_REQUEST_UPDATE_COUNT
            ]);
            let mut m = mediator(fd);

            let mut session = UpdateSession::new(Tid(1), &pkg, 0);
            session.retry_delay = Duration::from_millis(1);
            let e = session.request_update(&mut m).await.unwrap_err();
            assert!(matches!(e, UpdateError::Command(_, cc)
                if cc == fw_codes::RETRY_REQUEST_UPDATE));
            assert_eq!(session.state(), FdState::Idle);
        })
    }

    #[test]
    fn fd_state_gating() {
        smol::block_on(async {
            let pkg = build(
                &[&ids()],
                &[TestComponent {
                    identifier: 0x10,
                    image: vec![0xaa; 64],
                }],
            );
            let mut fd = MockFd::default();
            // a VerifyComplete arriving while DOWNLOAD is expected
            fd.iid = 0;
            fd.push_fd_request(Cmd::VerifyComplete, &[0x00]);
            fd.push_fd_request(Cmd::TransferComplete, &[0x00]);
            let mut m = mediator(fd);

            let mut session = UpdateSession::new(Tid(1), &pkg, 0);
            session.update_mode = true;
            session.state = FdState::Download;

            let (tag, req) = session
                .expect_fd_request(
                    &mut m,
                    Cmd::RequestFirmwareData,
                    Duration::from_millis(100),
                )
                .await
                .unwrap();
            assert_eq!(req.cmd, Cmd::TransferComplete as u8);

            // the out-of-state VerifyComplete was refused on the wire
            assert_eq!(
                m.binding_ref().error_responses,
                vec![(
                    Cmd::VerifyComplete as u8,
                    fw_codes::COMMAND_NOT_EXPECTED
                )]
            );

            // and the accepted TransferComplete advances the session
            session
                .transfer_complete(&mut m, tag, req)
                .await
                .unwrap();
            assert_eq!(session.state(), FdState::Verify);
        })
    }

    #[test]
    fn status_query() {
        smol::block_on(async {
            let pkg = build(
                &[&ids()],
                &[TestComponent {
                    identifier: 0x10,
                    image: vec![0xaa; 64],
                }],
            );
            let mut m = mediator(MockFd::default());
            let mut session = UpdateSession::new(Tid(1), &pkg, 0);

            let status = session.get_status(&mut m).await.unwrap();
            assert_eq!(status.current_state, FdState::Download);
            assert_eq!(status.progress_percent, 40);
        })
    }

    #[test]
    fn cancel_state_rules() {
        smol::block_on(async {
            let pkg = build(
                &[&ids()],
                &[TestComponent {
                    identifier: 0x10,
                    image: vec![0xaa; 64],
                }],
            );
            let mut m = mediator(MockFd::default());
            let mut session = UpdateSession::new(Tid(1), &pkg, 0);

            // no cancel while idle
            session.cancel_update(&mut m).await.unwrap_err();

            session.update_mode = true;
            session.state = FdState::ReadyXfer;
            // component cancel only during a component phase
            session.cancel_update_component(&mut m).await.unwrap_err();

            session.state = FdState::Download;
            session.cancel_update_component(&mut m).await.unwrap();
            assert_eq!(session.state(), FdState::ReadyXfer);

            session.cancel_update(&mut m).await.unwrap();
            assert_eq!(session.state(), FdState::Idle);
            assert_eq!(m.binding_ref().cancel_updates, 1);
        })
    }
}
