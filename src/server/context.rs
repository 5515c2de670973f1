// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use tokio_tungstenite::tungstenite::http::HeaderMap;

use crate::cfg::config::SessionConfig;

/// View handed to the accept hook before a session is admitted.
///
/// The hook may inspect the upgrade request headers, stage extra response
/// headers, and mutate the session config; the config freezes once the
/// upgrade completes.
pub struct SessionInfo<'a> {
    /// Process-unique id of the session being accepted.
    pub session_id: u64,
    /// The client's ip address.
    pub remote_address: &'a str,
    /// Headers of the client's upgrade request.
    pub request_headers: &'a HeaderMap,
    /// Extra fields appended to the upgrade response.
    pub response_headers: &'a mut Vec<(String, String)>,
    /// Per-session settings, mutable only inside this hook.
    pub config: &'a mut SessionConfig,
}

/// View handed to a bound RPC handler for one inbound frame.
pub struct SessionContext<'a> {
    session_id: u64,
    remote_address: &'a str,
    call_id: u32,
    data: &'a Bytes,
    /// Bytes sent back to the caller when non-empty, correlated with the
    /// request's result id.
    pub response: Vec<u8>,
    /// Set to request a graceful teardown after this dispatch.
    pub close: bool,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(
        session_id: u64,
        remote_address: &'a str,
        call_id: u32,
        data: &'a Bytes,
    ) -> Self {
        Self {
            session_id,
            remote_address,
            call_id,
            data,
            response: Vec::new(),
            close: false,
        }
    }

    #[inline]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[inline]
    pub fn remote_address(&self) -> &str {
        self.remote_address
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Payload of the inbound frame, borrowed from the receive path.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Identity of a session as seen by the disconnect hook.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: u64,
    pub remote_address: String,
}
