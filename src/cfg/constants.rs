// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

/// Exclusive upper bound for application call ids. Handler tables on both
/// sides are direct-indexed arrays of this size.
pub const MAX_CALL_ID: u32 = 256;

/// Maximum outstanding `send_recv` correlation entries per session.
pub const QUEUE_RECV_MAX: usize = 500;

/// Maximum queued outbound frames per session, and the bound for
/// simultaneously pending broadcasts on the server.
pub const QUEUE_SEND_MAX: usize = 500;

/// Upper bound for waiting on a session to tear itself down. Exceeding it
/// means an I/O worker is hung and is reported loudly.
pub const DEADLOCK_SECS: u64 = 30;

/// Bound for draining the read/write workers after a close was initiated.
pub const IO_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
