// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::Cell, time::Duration};

// One-shot per-thread overrides, consumed and reset by the next operation
// entered on the same thread. No cross-thread visibility.
thread_local! {
    static SEND_OVERRIDE: Cell<Option<Duration>> = const { Cell::new(None) };
    static RESPONSE_OVERRIDE: Cell<Option<Duration>> = const { Cell::new(None) };
}

/// Stores a send-timeout override for the next `send`/`send_recv` on this
/// thread. A zero duration removes a pending override.
pub fn set_send_timeout(timeout: Duration) {
    SEND_OVERRIDE.with(|cell| {
        cell.set((!timeout.is_zero()).then_some(timeout));
    });
}

/// Stores a response-timeout override for the next `send_recv`/`ping` on
/// this thread. A zero duration removes a pending override.
pub fn set_response_timeout(timeout: Duration) {
    RESPONSE_OVERRIDE.with(|cell| {
        cell.set((!timeout.is_zero()).then_some(timeout));
    });
}

/// Consumes the pending send-timeout override, if any.
pub fn take_send_timeout() -> Option<Duration> {
    SEND_OVERRIDE.with(Cell::take)
}

/// Consumes the pending response-timeout override, if any.
pub fn take_response_timeout() -> Option<Duration> {
    RESPONSE_OVERRIDE.with(Cell::take)
}
