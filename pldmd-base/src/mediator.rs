// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM transport mediator.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Request/response mediation between PLDM engines and the transport.
//!
//! The mediator owns the TID↔EID mapping, allocates per-terminus instance
//! IDs, frames PLDM messages with the MCTP message type byte, retries
//! malformed or mismatched responses, and arbitrates the link bandwidth
//! reservation.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::HashMap;
use std::time::Duration;

use crate::transport::{Binding, Eid, Inbound, Tag, TransportError};
use crate::{
    proto_error, PldmError, PldmRequest, PldmResponse, Result, Tid,
    MCTP_MSG_TYPE_PLDM, PLDM_IID_MASK, PLDM_RESP_HDR_SIZE,
};

/// Upper cap on retries for any mediated operation.
pub const MAX_RETRIES: usize = 5;

/// Bijective TID to EID mapping.
#[derive(Debug, Default)]
pub struct TidMap {
    map: HashMap<Tid, Eid>,
}

impl TidMap {
    /// Map `tid` to `eid`.
    ///
    /// Fails if `eid` is already mapped to another TID.
    pub fn add(&mut self, tid: Tid, eid: Eid) -> Result<()> {
        if self.map.values().any(|e| *e == eid) {
            error!("Mapper: EID {eid} is already mapped to another TID");
            return Err(PldmError::InvalidArgument);
        }
        self.map.insert(tid, eid);
        info!("Mapper: TID {tid} mapped to EID {eid}");
        Ok(())
    }

    /// Remove the mapping for `tid`, if any.
    pub fn remove(&mut self, tid: Tid) {
        if self.map.remove(&tid).is_some() {
            info!("TID {tid} removed from mapper");
        }
    }

    /// Look up the EID mapped to `tid`.
    pub fn eid(&self, tid: Tid) -> Option<Eid> {
        self.map.get(&tid).copied()
    }

    /// Look up the TID an EID is mapped to.
    pub fn tid(&self, eid: Eid) -> Option<Tid> {
        self.map
            .iter()
            .find(|(_, e)| **e == eid)
            .map(|(t, _)| *t)
    }

    /// All currently mapped TIDs.
    pub fn tids(&self) -> Vec<Tid> {
        self.map.keys().copied().collect()
    }

    /// Lowest unassigned TID, starting from 1.
    pub fn next_free_tid(&self) -> Option<Tid> {
        (1..=0xfeu8).map(Tid).find(|t| !self.map.contains_key(t))
    }
}

/// Transport mediator.
///
/// All PLDM traffic for every terminus flows through one mediator; the
/// bandwidth reservation and instance ID state are process-wide singletons
/// carried here rather than as globals.
pub struct Mediator<B: Binding> {
    binding: B,
    tids: TidMap,
    iids: HashMap<Tid, u8>,
    reservation: Option<(Tid, u8)>,
}

impl<B: Binding> Mediator<B> {
    /// Construct a mediator over a transport binding.
    pub fn new(binding: B) -> Self {
        Self {
            binding,
            tids: TidMap::default(),
            iids: HashMap::new(),
            reservation: None,
        }
    }

    /// Access the TID mapping.
    pub fn tid_map(&self) -> &TidMap {
        &self.tids
    }

    /// Mutable access to the TID mapping.
    pub fn tid_map_mut(&mut self) -> &mut TidMap {
        &mut self.tids
    }

    /// Access the underlying transport binding.
    pub fn binding_ref(&self) -> &B {
        &self.binding
    }

    /// Mutable access to the underlying transport binding.
    pub fn binding_mut(&mut self) -> &mut B {
        &mut self.binding
    }

    /// Allocate the next instance ID for `tid`.
    ///
    /// A 5-bit counter per terminus, advanced modulo 32 on each outbound
    /// request.
    pub fn next_iid(&mut self, tid: Tid) -> u8 {
        let iid = self.iids.entry(tid).or_insert(0);
        *iid = (*iid + 1) & PLDM_IID_MASK;
        *iid
    }

    /// Returns whether the reservation blocks traffic for `{tid, typ}`.
    fn reservation_blocks(&self, tid: Tid, typ: u8) -> bool {
        match self.reservation {
            Some((rtid, rtyp)) => !(rtid == tid && rtyp == typ),
            None => false,
        }
    }

    /// Send a request to `tid` and await the matching response.
    ///
    /// The request's instance ID is allocated here and written back. A retry
    /// is forced when there is no transport response within `timeout`, the
    /// response is shorter than the PLDM header, the payload is not typed
    /// PLDM, the rq/D bit marks the packet as a request, or the instance ID
    /// does not match. `retries` is capped at [`MAX_RETRIES`].
    pub async fn send_receive(
        &mut self,
        tid: Tid,
        req: &mut PldmRequest,
        timeout: Duration,
        retries: usize,
    ) -> Result<PldmResponse> {
        if self.reservation_blocks(tid, req.typ) {
            let (rtid, rtyp) = self.reservation.unwrap();
            info!(
                "send_receive not allowed, bandwidth reserved for \
                 TID {rtid} type {rtyp}"
            );
            return Err(PldmError::Busy);
        }

        req.iid = self.next_iid(tid);
        let wire = req.to_wire();
        let retries = retries.min(MAX_RETRIES);

        for _ in 0..retries {
            // A terminus removal can invalidate the mapping mid-retry, so
            // resolve the EID on each attempt.
            let Some(eid) = self.tids.eid(tid) else {
                error!("PLDM message send failed, TID {tid} not mapped");
                return Err(PldmError::InvalidArgument);
            };

            let resp = match self.binding.transfer(eid, &wire, timeout).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("TID {tid} transfer failed: {e}");
                    continue;
                }
            };

            if resp.len() < 1 + PLDM_RESP_HDR_SIZE {
                warn!("TID {tid}: invalid response length {}", resp.len());
                continue;
            }

            if resp[0] != MCTP_MSG_TYPE_PLDM {
                warn!("TID {tid}: response is not of message type PLDM");
                continue;
            }

            let rsp = match PldmResponse::from_buf(&resp[1..]) {
                Ok(r) => r,
                Err(e) => {
                    warn!("TID {tid}: {e}");
                    continue;
                }
            };

            if rsp.iid != req.iid {
                warn!(
                    "TID {tid}: instance ID check failed, expected \
                     0x{:02x} got 0x{:02x}",
                    req.iid, rsp.iid
                );
                continue;
            }

            if rsp.typ != req.typ || rsp.cmd != req.cmd {
                warn!(
                    "TID {tid}: mismatched reply, type 0x{:02x} command \
                     0x{:02x}",
                    rsp.typ, rsp.cmd
                );
                continue;
            }

            return Ok(rsp);
        }

        error!("TID {tid}: retry count exceeded, no response");
        Err(PldmError::Timeout)
    }

    /// Send a response message without awaiting a reply.
    ///
    /// Used when the core acts as a responder to firmware-device-initiated
    /// commands. `tag` is the request tag; the owner bit is cleared here.
    pub async fn send_response(
        &mut self,
        tid: Tid,
        tag: Tag,
        resp: &PldmResponse,
        retries: usize,
    ) -> Result<()> {
        if self.reservation_blocks(tid, resp.typ) {
            info!("send_response not allowed, bandwidth reservation active");
            return Err(PldmError::Busy);
        }

        let Some(eid) = self.tids.eid(tid) else {
            error!("PLDM message send failed, TID {tid} not mapped");
            return Err(PldmError::InvalidArgument);
        };

        let wire = resp.to_wire();
        let retries = retries.min(MAX_RETRIES);
        let mut last = None;
        for _ in 0..retries {
            match self.binding.send(eid, tag.response(), &wire).await {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        let e = last.unwrap_or(TransportError::TxFailure);
        warn!("TID {tid}: send failed, retry count exceeded: {e}");
        Err(e.into())
    }

    /// Wait for a remote-initiated PLDM request.
    ///
    /// Messages that are not typed PLDM, come from an unmapped endpoint, or
    /// do not parse as requests are dropped with a debug log.
    pub async fn recv(&mut self) -> Result<(Tid, Tag, PldmRequest)> {
        loop {
            let Inbound { eid, tag, payload } = self.binding.recv().await?;

            if payload.first() != Some(&MCTP_MSG_TYPE_PLDM) {
                debug!("EID {eid}: discarding non-PLDM message");
                continue;
            }

            // Packets from uninitialised termini are not processed.
            let Some(tid) = self.tids.tid(eid) else {
                warn!("EID {eid} is not mapped to any TID, discarding");
                continue;
            };

            match PldmRequest::from_buf(&payload[1..]) {
                Ok(req) => return Ok((tid, tag, req)),
                Err(e) => {
                    debug!("TID {tid}: dropping inbound message: {e}");
                }
            }
        }
    }

    /// [`recv`](Self::recv) bounded by an idle timer.
    ///
    /// Returns `Ok(None)` when the timer fires first.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(Tid, Tag, PldmRequest)>> {
        let recv = async { self.recv().await.map(Some) };
        let idle = async {
            smol::Timer::after(timeout).await;
            Ok(None)
        };
        futures_lite::future::or(recv, idle).await
    }

    /// Reserve link bandwidth for `{tid, typ}`.
    ///
    /// At most one pair holds the reservation; the current holder may
    /// re-reserve to extend it.
    pub async fn reserve(
        &mut self,
        tid: Tid,
        typ: u8,
        timeout_secs: u16,
    ) -> Result<()> {
        if self.reservation_blocks(tid, typ) {
            let (rtid, rtyp) = self.reservation.unwrap();
            info!(
                "Reserve bandwidth already active for TID {rtid} type {rtyp}"
            );
            return Err(PldmError::Busy);
        }
        let Some(eid) = self.tids.eid(tid) else {
            return Err(PldmError::InvalidArgument);
        };
        self.binding.reserve_bandwidth(eid, timeout_secs).await?;
        self.reservation = Some((tid, typ));
        Ok(())
    }

    /// Release the bandwidth reservation.
    ///
    /// Authoritative only for the current holder.
    pub async fn release(&mut self, tid: Tid, typ: u8) -> Result<()> {
        if self.reservation.is_none() {
            error!("releaseBandwidth: reserve bandwidth is not active");
            return Err(PldmError::InvalidArgument);
        }
        if self.reservation != Some((tid, typ)) {
            error!("releaseBandwidth: invalid TID or PLDM type");
            return Err(PldmError::InvalidArgument);
        }
        let Some(eid) = self.tids.eid(tid) else {
            return Err(PldmError::InvalidArgument);
        };
        self.binding.release_bandwidth(eid).await?;
        self.reservation = None;
        Ok(())
    }

    /// Whether a bandwidth reservation is currently held.
    pub fn reservation_active(&self) -> bool {
        self.reservation.is_some()
    }

    /// Issue a request and check the response for success.
    ///
    /// Convenience for commands whose response carries only a completion
    /// code.
    pub async fn send_receive_cc(
        &mut self,
        tid: Tid,
        req: &mut PldmRequest,
        timeout: Duration,
        retries: usize,
    ) -> Result<()> {
        let rsp = self.send_receive(tid, req, timeout, retries).await?;
        if rsp.cc != 0 {
            return Err(PldmError::CompletionCode(rsp.cc));
        }
        if !rsp.data.is_empty() {
            return Err(proto_error!("Extra response data"));
        }
        Ok(())
    }
}
