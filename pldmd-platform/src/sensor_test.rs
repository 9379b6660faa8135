// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Scripted transport binding shared by the engine tests.

use std::collections::VecDeque;
use std::time::Duration;

use pldmd_base::transport::{
    Binding, Eid, Inbound, Result as TResult, Tag, TransportError,
};
use pldmd_base::{PldmRequest, MCTP_MSG_TYPE_PLDM};

enum Action {
    Respond { cc: u8, data: Vec<u8> },
    Timeout,
}

/// Replies to each request with the next scripted action, echoing the
/// request's instance ID.
#[derive(Default)]
pub struct ScriptBinding {
    actions: VecDeque<Action>,
    /// Decoded requests, for assertions
    pub requests: Vec<PldmRequest>,
}

impl ScriptBinding {
    /// Queue a success response with `data` as the payload after the cc.
    pub fn push_ok(&mut self, data: &[u8]) {
        self.actions.push_back(Action::Respond {
            cc: 0,
            data: data.to_vec(),
        });
    }

    /// Queue an error completion code response.
    pub fn push_cc(&mut self, cc: u8) {
        self.actions.push_back(Action::Respond {
            cc,
            data: Vec::new(),
        });
    }

    /// Queue a transport timeout.
    pub fn push_timeout(&mut self) {
        self.actions.push_back(Action::Timeout);
    }

    /// Whether every scripted action was consumed.
    pub fn drained(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Binding for ScriptBinding {
    async fn transfer(
        &mut self,
        _eid: Eid,
        payload: &[u8],
        _timeout: Duration,
    ) -> TResult<Vec<u8>> {
        assert_eq!(payload[0], MCTP_MSG_TYPE_PLDM);
        let req = PldmRequest::from_buf(&payload[1..]).unwrap();
        let action = self.actions.pop_front().unwrap_or(Action::Timeout);
        match action {
            Action::Respond { cc, data } => {
                let mut resp = req.response();
                resp.cc = cc;
                resp.data = data;
                self.requests.push(req);
                Ok(resp.to_wire())
            }
            Action::Timeout => {
                self.requests.push(req);
                Err(TransportError::TimedOut)
            }
        }
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
