// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serial_test::serial;
use wsrpc_rs::error::RpcError;

use super::common::{ECHO_ID, build_server, client_for, echo_server, session_config, start, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn connect_retries_spend_the_configured_delay() {
    // Grab a free port, then close it again so nobody listens there.
    let port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };

    let client = client_for(port);
    let started = tokio::time::Instant::now();
    let result = client.connect_attempts(3, Duration::from_millis(100)).await;
    let elapsed = started.elapsed();

    assert!(result.is_err());
    // Two inter-attempt delays at minimum.
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn disconnect_is_idempotent() {
    let server = echo_server();
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1).await);

    client.disconnect().await;
    client.disconnect().await;
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 0).await);

    // A fresh connect still works after repeated disconnects.
    client.connect().await.expect("reconnect");
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1).await);

    client.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn listener_binding_rules_are_enforced() {
    let server = echo_server();
    let port = start(&server).await;

    let client = client_for(port);
    client
        .listen_broadcast(10, |_| {})
        .await
        .expect("first bind");

    // Rebinding an occupied id is an error.
    assert!(matches!(
        client.listen_broadcast(10, |_| {}).await,
        Err(RpcError::HandlerExists(10))
    ));
    // Out-of-range ids are refused.
    assert!(client.listen_broadcast(100_000, |_| {}).await.is_err());

    client.connect().await.expect("connect");
    // The table is frozen while a session is connected.
    assert!(matches!(
        client.listen_broadcast(11, |_| {}).await,
        Err(RpcError::InvalidState(_))
    ));

    client.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn server_binding_rules_are_enforced() {
    let server = build_server(session_config());
    server.bind(1, |_| {}).expect("first bind");
    assert!(matches!(
        server.bind(1, |_| {}),
        Err(RpcError::HandlerExists(1))
    ));

    let port = start(&server).await;
    let _ = port;
    // Binds are refused while the server runs.
    assert!(matches!(
        server.bind(2, |_| {}),
        Err(RpcError::InvalidState(_))
    ));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn connections_tracks_registered_sessions() {
    let server = echo_server();
    let port = start(&server).await;

    let first = client_for(port);
    let second = client_for(port);
    first.connect().await.expect("connect");
    second.connect().await.expect("connect");
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 2).await);
    assert_eq!(server.get_session_ids().len(), 2);

    first.close().await;
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1).await);

    second.close().await;
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 0).await);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn handshake_headers_flow_both_ways() {
    let server = build_server(session_config());
    server
        .bind(ECHO_ID, |ctx| {
            ctx.response = ctx.data().to_vec();
        })
        .expect("bind echo");
    server
        .bind_accept(|info| {
            let authorized = info
                .request_headers
                .get("x-token")
                .is_some_and(|v| v.as_bytes() == b"sesame");
            if authorized {
                info.response_headers
                    .push(("x-session-accepted".to_string(), "yes".to_string()));
            }
            authorized
        })
        .expect("bind accept");
    let port = start(&server).await;

    // Without the token the accept hook rejects before admission.
    let rejected = client_for(port);
    assert!(matches!(
        rejected.connect().await,
        Err(RpcError::HandshakeFailed(_))
    ));
    assert_eq!(server.connections(), 0);

    // With the token the session is admitted and the amended response is
    // visible to the caller.
    let accepted = client_for(port);
    accepted
        .set_handshake_request(vec![("x-token".to_string(), "sesame".to_string())])
        .await;
    accepted.connect().await.expect("connect");
    let response = accepted.get_handshake_response().await;
    assert!(
        response
            .iter()
            .any(|(name, value)| name == "x-session-accepted" && value == "yes")
    );

    accepted.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn the_listen_hook_can_drop_sockets_before_the_upgrade() {
    let server = echo_server();
    server.bind_listen(|_remote| false).expect("bind listen");
    let port = start(&server).await;

    let client = client_for(port);
    assert!(client.connect().await.is_err());
    assert_eq!(server.connections(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn the_disconnect_hook_fires_on_teardown() {
    let server = echo_server();
    let disconnected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnected);
    server
        .bind_disconnect(move |meta| {
            assert_ne!(meta.session_id, 0);
            counter.fetch_add(1, Ordering::AcqRel);
        })
        .expect("bind disconnect");
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1).await);

    client.close().await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            disconnected.load(Ordering::Acquire) == 1
        })
        .await,
        "disconnect hook should fire exactly once"
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn stopping_the_server_cancels_live_sessions() {
    let server = echo_server();
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1).await);

    server.stop().await;
    assert!(wait_until(Duration::from_secs(5), || server.connections() == 0).await);

    // The client observes the teardown on its next call.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.send_recv(ECHO_ID, b"anyone").await.is_err());

    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn a_closed_client_refuses_to_reconnect() {
    let server = echo_server();
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");
    client.close().await;

    assert!(matches!(
        client.connect().await,
        Err(RpcError::InvalidState(_))
    ));

    server.stop().await;
}
