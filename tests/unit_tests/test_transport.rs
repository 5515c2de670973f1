// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use wsrpc_rs::proto::transport::is_tls_client_hello;

#[test]
fn a_tls_client_hello_starts_with_a_handshake_record() {
    assert!(is_tls_client_hello(0x16));
}

#[test]
fn a_plaintext_upgrade_request_does_not() {
    // "GET / HTTP/1.1" starts with ascii 'G'.
    assert!(!is_tls_client_hello(b'G'));
    assert!(!is_tls_client_hello(0x00));
    assert!(!is_tls_client_hello(0x17));
}
