// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Failure kinds surfaced by the public client and server operations.
///
/// Transport failures inside the read or write loops are never surfaced
/// directly; they are latched into session state flags and the session is
/// torn down. Callers observe the consequences on their next operation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The TCP/TLS/WebSocket establishment sequence was rejected or timed
    /// out before the session reached the established state.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An operation was attempted without a live session.
    #[error("no session is connected")]
    NotConnected,

    /// The response cache or the write queue reached its configured bound.
    /// The call aborts without touching the wire.
    #[error("queue limit reached")]
    QueueFull,

    /// A send or response deadline expired.
    #[error("operation timed out")]
    TimedOut,

    /// The peer sent a close frame; subsequent operations fail.
    #[error("remote host closed the session")]
    RemoteClosed,

    /// An I/O error from the underlying stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fewer than `HEADER_LEN` bytes where an envelope was expected.
    #[error("inbound frame is shorter than the io header")]
    InvalidHeader,

    /// An attempt to bind a call id that already has a handler.
    #[error("call id {0} is already bound")]
    HandlerExists(u32),

    /// The operation is not permitted in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
