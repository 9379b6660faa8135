// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Framed Unix-socket transport binding.
 *
 * Copyright (c) 2025 Code Construct
 */

//! A message transport over a Unix stream socket.
//!
//! Each frame is `{len: u16 LE, eid: u8, tag: u8, flags: u8, payload}` with
//! `len` covering everything after itself; flags bit 0 is the tag owner
//! bit. Requests carry the owner bit; responses clear it. This binding is
//! the binary's stand-in for a kernel MCTP socket; the peer is expected to
//! be a local endpoint simulator.

use std::collections::VecDeque;
use std::time::Duration;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::unix::UnixStream;

use pldmd_base::transport::{
    Binding, Eid, Inbound, Result, Tag, TransportError,
};

const FLAG_TAG_OWNER: u8 = 0x01;

/// Transport binding over a connected Unix stream.
pub struct UnixBinding {
    stream: UnixStream,
    queued: VecDeque<Inbound>,
}

impl UnixBinding {
    /// Connect to the peer socket at `path`.
    pub async fn connect(path: &str) -> std::io::Result<UnixBinding> {
        let stream = UnixStream::connect(path).await?;
        Ok(UnixBinding {
            stream,
            queued: VecDeque::new(),
        })
    }

    async fn write_frame(
        &mut self,
        eid: Eid,
        tag: Tag,
        payload: &[u8],
    ) -> Result<()> {
        let len = (payload.len() + 3) as u16;
        let mut frame = Vec::with_capacity(2 + len as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.push(eid.0);
        frame.push(tag.value);
        frame.push(if tag.owner { FLAG_TAG_OWNER } else { 0 });
        frame.extend_from_slice(payload);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|_| TransportError::TxFailure)?;
        Ok(())
    }

    // Not cancel-safe: abandoning this future mid-frame desynchronises the
    // stream. The transfer timeout races whole frames only because the
    // peer is a local, prompt endpoint.
    async fn read_frame(&mut self) -> Result<(Eid, Tag, Vec<u8>)> {
        let mut hdr = [0u8; 2];
        self.stream
            .read_exact(&mut hdr)
            .await
            .map_err(|_| TransportError::RxFailure)?;
        let len = u16::from_le_bytes(hdr) as usize;
        if len < 3 {
            return Err(TransportError::RxFailure);
        }
        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|_| TransportError::RxFailure)?;
        let eid = Eid(body[0]);
        let tag = Tag {
            value: body[1],
            owner: body[2] & FLAG_TAG_OWNER != 0,
        };
        Ok((eid, tag, body[3..].to_vec()))
    }
}

impl Binding for UnixBinding {
    async fn transfer(
        &mut self,
        eid: Eid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.write_frame(
            eid,
            Tag {
                value: 0,
                owner: true,
            },
            payload,
        )
        .await?;

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .ok_or(TransportError::TimedOut)?;

            let frame = {
                let read = async { Some(self.read_frame().await) };
                let timer = async {
                    smol::Timer::after(remaining).await;
                    None
                };
                futures_lite::future::or(read, timer).await
            };

            match frame {
                None => return Err(TransportError::TimedOut),
                Some(Err(e)) => return Err(e),
                Some(Ok((feid, tag, data))) => {
                    if !tag.owner && feid == eid {
                        return Ok(data);
                    }
                    // an unsolicited message slipped in mid-exchange
                    self.queued.push_back(Inbound {
                        eid: feid,
                        tag,
                        payload: data,
                    });
                }
            }
        }
    }

    async fn send(
        &mut self,
        eid: Eid,
        tag: Tag,
        payload: &[u8],
    ) -> Result<()> {
        self.write_frame(eid, tag, payload).await
    }

    async fn recv(&mut self) -> Result<Inbound> {
        if let Some(queued) = self.queued.pop_front() {
            return Ok(queued);
        }
        loop {
            let (eid, tag, payload) = self.read_frame().await?;
            if !tag.owner {
                debug!("EID {eid}: dropping unmatched response frame");
                continue;
            }
            return Ok(Inbound { eid, tag, payload });
        }
    }

    async fn reserve_bandwidth(
        &mut self,
        eid: Eid,
        timeout_secs: u16,
    ) -> Result<()> {
        // The framed socket carries no link arbitration; the mediator's
        // process-wide interlock still applies.
        debug!("EID {eid}: reserve bandwidth for {timeout_secs}s");
        Ok(())
    }

    async fn release_bandwidth(&mut self, eid: Eid) -> Result<()> {
        debug!("EID {eid}: release bandwidth");
        Ok(())
    }
}
