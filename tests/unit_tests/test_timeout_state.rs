// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use wsrpc_rs::core::timeout::{
    set_response_timeout, set_send_timeout, take_response_timeout, take_send_timeout,
};

#[test]
fn overrides_are_one_shot() {
    assert_eq!(take_send_timeout(), None);

    set_send_timeout(Duration::from_millis(250));
    assert_eq!(take_send_timeout(), Some(Duration::from_millis(250)));
    // Consumed by the first take.
    assert_eq!(take_send_timeout(), None);
}

#[test]
fn send_and_response_slots_are_independent() {
    set_send_timeout(Duration::from_millis(100));
    set_response_timeout(Duration::from_millis(200));

    assert_eq!(take_response_timeout(), Some(Duration::from_millis(200)));
    assert_eq!(take_send_timeout(), Some(Duration::from_millis(100)));
}

#[test]
fn zero_removes_a_pending_override() {
    set_response_timeout(Duration::from_millis(300));
    set_response_timeout(Duration::ZERO);
    assert_eq!(take_response_timeout(), None);
}

#[test]
fn overrides_do_not_cross_threads() {
    set_send_timeout(Duration::from_millis(150));
    let other = std::thread::spawn(take_send_timeout)
        .join()
        .expect("thread should finish");
    assert_eq!(other, None);
    assert_eq!(take_send_timeout(), Some(Duration::from_millis(150)));
}
