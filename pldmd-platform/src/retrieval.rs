// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Device PDR retrieval.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Multi-part PDR retrieval into the per-terminus repository.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crc::{Crc, CRC_8_SMBUS};
use deku::{DekuContainerRead, DekuContainerWrite};

use pldmd_base::control::xfer_flag;
use pldmd_base::mediator::Mediator;
use pldmd_base::transport::Binding;
use pldmd_base::{
    ccode_result, proto_error, PldmError, PldmRequest, Result, Tid,
    PLDM_MAX_MSGSIZE,
};

use crate::pdr::{
    pdr_type, tl_validity, PdrHeader, PdrRepo, TerminusLocatorPdr,
    TL_TID_OFFSET,
};
use crate::proto::{
    Cmd, GetPDRReq, GetPDRRepositoryInfoResp, GetPDRResp,
    PDRRepositoryState, TransferOperationFlag,
};
use crate::{CMD_RETRIES, CMD_TIMEOUT, PLDM_TYPE_PLATFORM};

/// 8-bit CRC over assembled multi-part records.
pub const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Whole-repository scan attempts before giving up on the terminus.
pub const SCAN_RETRIES: usize = 3;

// Cap on fragments per record; a terminus sending more is broken.
const MULTIPART_LIMIT: usize = 100;

// Record bytes requested per GetPDR, leaving response header room.
const REQUEST_COUNT: u16 = (PLDM_MAX_MSGSIZE - 16) as u16;

/// The outcome of PDR ingestion for one terminus.
#[derive(Debug)]
pub struct RetrievedRepo {
    /// The assembled record store
    pub repo: PdrRepo,
    /// Container id from the valid Terminus Locator PDR, when one was found
    pub container_id: Option<u16>,
}

/// Fetch and validate the repository info.
///
/// Retrieval proceeds only for an `Available` repository with a nonzero
/// record count.
pub async fn repository_info(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<GetPDRRepositoryInfoResp> {
    let mut req = PldmRequest::new(
        PLDM_TYPE_PLATFORM,
        Cmd::GetPDRRepositoryInfo as u8,
    );
    let rsp = mediator
        .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
        .await?;
    ccode_result(rsp.cc)?;

    let ((_, _), info) = GetPDRRepositoryInfoResp::from_bytes((&rsp.data, 0))
        .map_err(|e| {
            trace!("GetPDRRepositoryInfo parse error {e}");
            proto_error!("Bad GetPDRRepositoryInfo response")
        })?;

    debug!(
        "TID {tid}: PDR repository state {:?}, {} records, largest {}",
        info.state, info.record_count, info.largest_record_size
    );
    Ok(info)
}

/// Fetch one record through the multi-part GetPDR loop.
///
/// Returns the assembled record, or `None` when the record was discarded
/// (CRC failure, oversize, or fragment cap), together with the next record
/// handle to continue the scan with.
async fn fetch_record(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
    record_handle: u32,
    largest_record_size: u32,
) -> Result<(Option<Vec<u8>>, u32)> {
    let mut record: Vec<u8> = Vec::new();
    let mut op = TransferOperationFlag::FirstPart;
    let mut data_transfer_handle = 0u32;
    let mut record_change_number = 0u16;
    let mut fragments = MULTIPART_LIMIT;

    loop {
        let gp = GetPDRReq {
            record_handle,
            data_transfer_handle,
            transfer_operation_flag: op,
            request_count: REQUEST_COUNT,
            record_change_number,
        };
        let data = gp.to_bytes().map_err(|_| PldmError::NoSpace)?;
        let mut req =
            PldmRequest::new_data(PLDM_TYPE_PLATFORM, Cmd::GetPDR as u8, data);
        let rsp = mediator
            .send_receive(tid, &mut req, CMD_TIMEOUT, CMD_RETRIES)
            .await?;
        ccode_result(rsp.cc)?;

        let ((_, _), part) = GetPDRResp::from_bytes((&rsp.data, 0))
            .map_err(|e| {
                trace!("GetPDR parse error {e}");
                proto_error!("Bad GetPDR response")
            })?;

        record.extend_from_slice(&part.record_data);
        data_transfer_handle = part.next_data_transfer_handle;

        if part.transfer_flag == xfer_flag::START {
            // The change number from the first fragment's header governs
            // the rest of the transfer
            if let Some(hdr) = PdrHeader::parse(&record) {
                record_change_number = hdr.record_change_num;
            }
        }

        match part.transfer_flag {
            xfer_flag::END | xfer_flag::START_AND_END => {
                if part.transfer_flag == xfer_flag::END {
                    let calculated = CRC8.checksum(&record);
                    if part.crc != Some(calculated) {
                        warn!(
                            "TID {tid}: PDR record {record_handle} CRC check \
                             failed, discarding"
                        );
                        return Ok((None, part.next_record_handle));
                    }
                }
                if record.len() as u32 > largest_record_size {
                    warn!(
                        "TID {tid}: PDR record {record_handle} exceeds \
                         largest record size, discarding"
                    );
                    return Ok((None, part.next_record_handle));
                }
                return Ok((Some(record), part.next_record_handle));
            }
            _ => {
                op = TransferOperationFlag::NextPart;
            }
        }

        if record.len() as u32 > largest_record_size {
            warn!(
                "TID {tid}: PDR record {record_handle} exceeds largest \
                 record size mid-transfer, discarding"
            );
            return Ok((None, part.next_record_handle));
        }
        fragments -= 1;
        if fragments == 0 {
            warn!(
                "TID {tid}: PDR record {record_handle} exceeded fragment \
                 limit, discarding"
            );
            return Ok((None, part.next_record_handle));
        }
    }
}

// One pass over the whole repository. Transport-level failure aborts the
// pass; a discarded record just moves to the next handle.
async fn scan(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
    info: &GetPDRRepositoryInfoResp,
) -> Result<Vec<(u32, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut handle = 0u32;
    let mut remaining = info.record_count;

    loop {
        let (record, next) =
            fetch_record(mediator, tid, handle, info.largest_record_size)
                .await?;

        if let Some(record) = record {
            if !record.is_empty() {
                match PdrHeader::parse(&record) {
                    Some(hdr) => records.push((hdr.record_handle, record)),
                    None => warn!("TID {tid}: record without header, discarding"),
                }
            }
        }

        handle = next;
        remaining -= 1;
        if handle == 0 || remaining == 0 {
            break;
        }
    }

    if remaining > 0 {
        warn!(
            "TID {tid}: possible erroneous PDR repository: end of chain with \
             {remaining} records still expected"
        );
    }
    if handle != 0 {
        warn!(
            "TID {tid}: possible erroneous PDR repository: record count \
             exhausted but next record handle is {handle}"
        );
    }
    Ok(records)
}

/// Retrieve the terminus's full PDR repository.
///
/// The scan is retried [`SCAN_RETRIES`] times from scratch on transport
/// failure. Exactly one valid Terminus Locator PDR is permitted; its TID
/// field is rewritten to the locally assigned `tid` before insertion and its
/// container id seeds the entity tree.
pub async fn fetch_repository(
    mediator: &mut Mediator<impl Binding>,
    tid: Tid,
) -> Result<RetrievedRepo> {
    let info = repository_info(mediator, tid).await?;

    if info.state != PDRRepositoryState::Available {
        warn!("TID {tid}: device PDR record data is unavailable");
        return Err(proto_error!("PDR repository not available"));
    }
    if info.record_count == 0 {
        warn!("TID {tid}: no PDR records to fetch");
        return Err(proto_error!("Empty PDR repository"));
    }

    let mut records = Vec::new();
    let mut tries = SCAN_RETRIES;
    loop {
        match scan(mediator, tid, &info).await {
            Ok(r) => {
                records = r;
                break;
            }
            Err(e) => {
                tries -= 1;
                if tries == 0 {
                    error!(
                        "TID {tid}: unable to fetch PDRs after \
                         {SCAN_RETRIES} tries: {e}"
                    );
                    return Err(e);
                }
                warn!("TID {tid}: PDR scan failed, retrying: {e}");
            }
        }
    }

    let mut repo = PdrRepo::new();
    let mut container_id = None;

    for (handle, mut record) in records {
        if crate::pdr::record_type(&record) == Some(pdr_type::TERMINUS_LOCATOR)
        {
            let parsed: Option<TerminusLocatorPdr> =
                crate::pdr::parse_record(&record);
            if let Some(tl) = parsed {
                if tl.validity == tl_validity::VALID {
                    if container_id.is_some() {
                        error!(
                            "TID {tid}: multiple valid Terminus Locator PDRs \
                             found"
                        );
                        return Err(proto_error!(
                            "Multiple valid Terminus Locator PDRs"
                        ));
                    }
                    // The repository carries the device's own TID; store
                    // the locally assigned one
                    record[TL_TID_OFFSET] = tid.0;
                    container_id = Some(tl.container_id);
                }
            }
        }
        repo.insert(handle, record);
    }

    if container_id.is_none() {
        warn!("TID {tid}: Terminus Locator PDR not found");
    }

    let fetched = repo.len() as u32;
    if fetched != info.record_count {
        warn!(
            "TID {tid}: unable to fetch all PDR records, expected {} got \
             {fetched}",
            info.record_count
        );
    } else {
        info!("TID {tid}: GetPDR success, {fetched} records");
    }

    Ok(RetrievedRepo { repo, container_id })
}

#[cfg(test)]
pub(crate) mod pdr_server {
    //! A scripted terminus serving GetPDR for tests.

    use super::*;
    use crate::proto::Timestamp104;
    use pldmd_base::transport::{
        Eid, Inbound, Result as TResult, Tag, TransportError,
    };
    use pldmd_base::{PldmResponse, MCTP_MSG_TYPE_PLDM};
    use std::time::Duration;

    pub struct ServedRecord {
        pub handle: u32,
        pub data: Vec<u8>,
        pub corrupt_crc: bool,
    }

    /// Serves a PDR repository over the [`Binding`] trait.
    pub struct PdrServer {
        pub records: Vec<ServedRecord>,
        pub fragment_size: usize,
        pub largest_record_size: u32,
        /// transfer() call indices that fail with a timeout
        pub fail_on: Vec<usize>,
        pub served: usize,
    }

    impl PdrServer {
        pub fn new(records: Vec<ServedRecord>, fragment_size: usize) -> Self {
            let largest = records
                .iter()
                .map(|r| r.data.len() as u32)
                .max()
                .unwrap_or(0);
            Self {
                records,
                fragment_size,
                largest_record_size: largest,
                fail_on: Vec::new(),
                served: 0,
            }
        }

        fn record_at(&self, handle: u32) -> Option<(usize, &ServedRecord)> {
            if handle == 0 {
                return self.records.first().map(|r| (0, r));
            }
            self.records
                .iter()
                .enumerate()
                .find(|(_, r)| r.handle == handle)
        }

        fn handle_get_pdr(&self, req: &PldmRequest) -> PldmResponse {
            let ((_, _), gp) =
                GetPDRReq::from_bytes((&req.data, 0)).unwrap();
            let (idx, record) = self.record_at(gp.record_handle).unwrap();
            let next_record_handle = self
                .records
                .get(idx + 1)
                .map(|r| r.handle)
                .unwrap_or(0);

            let offset = match gp.transfer_operation_flag {
                TransferOperationFlag::FirstPart => 0,
                TransferOperationFlag::NextPart => {
                    gp.data_transfer_handle as usize
                }
            };
            let len = self.fragment_size.min(record.data.len() - offset);
            let end = offset + len >= record.data.len();
            let transfer_flag = match (offset == 0, end) {
                (true, true) => xfer_flag::START_AND_END,
                (true, false) => xfer_flag::START,
                (false, false) => xfer_flag::MIDDLE,
                (false, true) => xfer_flag::END,
            };

            // the CRC trails any fragment with the END bit set
            let crc = if transfer_flag & xfer_flag::END != 0 {
                let mut c = CRC8.checksum(&record.data);
                if record.corrupt_crc {
                    c = c.wrapping_add(1);
                }
                Some(c)
            } else {
                None
            };

            let resp = GetPDRResp {
                next_record_handle,
                next_data_transfer_handle: (offset + len) as u32,
                transfer_flag,
                record_data: record.data[offset..offset + len].to_vec(),
                crc,
            };
            let mut r = req.response();
            r.data = resp.to_bytes().unwrap();
            r
        }

        fn handle_info(&self, req: &PldmRequest) -> PldmResponse {
            let resp = GetPDRRepositoryInfoResp {
                state: PDRRepositoryState::Available,
                update_time: Timestamp104::default(),
                oem_update_time: Timestamp104::default(),
                record_count: self.records.len() as u32,
                repository_size: self
                    .records
                    .iter()
                    .map(|r| r.data.len() as u32)
                    .sum(),
                largest_record_size: self.largest_record_size,
                data_transfer_handle_timeout: 0,
            };
            let mut r = req.response();
            r.data = resp.to_bytes().unwrap();
            r
        }
    }

    impl Binding for PdrServer {
        async fn transfer(
            &mut self,
            _eid: Eid,
            payload: &[u8],
            _timeout: Duration,
        ) -> TResult<Vec<u8>> {
            let idx = self.served;
            self.served += 1;
            if self.fail_on.contains(&idx) {
                return Err(TransportError::TimedOut);
            }
            assert_eq!(payload[0], MCTP_MSG_TYPE_PLDM);
            let req = PldmRequest::from_buf(&payload[1..]).unwrap();
            let resp = match req.cmd {
                c if c == Cmd::GetPDRRepositoryInfo as u8 => {
                    self.handle_info(&req)
                }
                c if c == Cmd::GetPDR as u8 => self.handle_get_pdr(&req),
                _ => {
                    let mut r = req.response();
                    r.cc = pldmd_base::CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8;
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
}
