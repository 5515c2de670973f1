// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;

use crate::proto::header::encode_frame;

/// One pre-assembled outbound frame (`envelope || payload`) shared by all
/// recipients. The payload is copied exactly once at construction; every
/// queue entry and in-flight write holds the same refcounted buffer.
pub struct Push {
    frame: Bytes,
    pending: Option<Arc<AtomicUsize>>,
}

impl Push {
    /// A server response to one RPC dispatch; echoes the request's ids.
    pub fn response(call_id: u32, result_id: u64, payload: &[u8]) -> Self {
        Self {
            frame: encode_frame(call_id, result_id, payload),
            pending: None,
        }
    }

    /// A broadcast frame. The counter was incremented by the caller and is
    /// decremented once the last recipient releases the push.
    pub fn broadcast(call_id: u32, payload: &[u8], pending: Arc<AtomicUsize>) -> Self {
        Self {
            frame: encode_frame(call_id, 0, payload),
            pending: Some(pending),
        }
    }

    #[inline]
    pub fn frame(&self) -> Bytes {
        self.frame.clone()
    }
}

impl Drop for Push {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
