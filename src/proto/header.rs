// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{Bytes, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::error::{Result, RpcError};

/// Wire size of the envelope prepended to every application frame.
pub const HEADER_LEN: usize = 16;

/// Envelope prepended to all application data transferred between the two
/// hosts. All fields travel in network byte order.
///
/// `call_id` selects a handler on the receiving side; `result_id` correlates
/// a response with its originating request. A zero `result_id` marks a
/// broadcast or a fire-and-forget send.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IoHeader {
    /// The id to call on the remote host.
    call_id: U32<BigEndian>,
    /// Reserved field used as padding.
    pad0: U32<BigEndian>,
    /// The id which will be sent back to the caller.
    result_id: U64<BigEndian>,
}

impl IoHeader {
    pub fn new(call_id: u32, result_id: u64) -> Self {
        Self {
            call_id: U32::new(call_id),
            pad0: U32::new(0),
            result_id: U64::new(result_id),
        }
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id.get()
    }

    #[inline]
    pub fn result_id(&self) -> u64 {
        self.result_id.get()
    }

    /// Decodes the envelope from the front of a buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(RpcError::InvalidHeader);
        }
        Self::read_from_bytes(&buf[..HEADER_LEN]).map_err(|_| RpcError::InvalidHeader)
    }
}

/// Splits a received frame into its envelope and payload without copying the
/// payload bytes.
pub fn split_frame(frame: &Bytes) -> Result<(IoHeader, Bytes)> {
    let header = IoHeader::decode(frame)?;
    Ok((header, frame.slice(HEADER_LEN..)))
}

/// Assembles `envelope || payload` into one contiguous outbound frame. The
/// payload is copied exactly once; broadcast recipients share the resulting
/// buffer by refcount.
pub fn encode_frame(call_id: u32, result_id: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(IoHeader::new(call_id, result_id).as_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}
