// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serial_test::serial;

use super::common::{build_server, client_for, echo_server, session_config, start, wait_until};

const NEWS_ID: u32 = 7;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn broadcast_fans_out_to_every_listener() {
    let server = echo_server();
    let port = start(&server).await;

    let mut clients = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..3 {
        let client = client_for(port);
        let hits = Arc::new(AtomicUsize::new(0));
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::clone(&hits);
        let seen = Arc::clone(&payloads);
        client
            .listen_broadcast(NEWS_ID, move |payload| {
                seen.lock().expect("payload log").push(payload.to_vec());
                counter.fetch_add(1, Ordering::AcqRel);
            })
            .await
            .expect("listen_broadcast");
        client.connect().await.expect("connect");
        clients.push(client);
        counters.push((hits, payloads));
    }

    assert!(
        wait_until(Duration::from_secs(2), || server.connections() == 3).await,
        "three sessions should be registered"
    );

    server.broadcast(NEWS_ID, &[0xAA]).await.expect("broadcast");

    for (hits, payloads) in &counters {
        let hits = Arc::clone(hits);
        assert!(
            wait_until(Duration::from_secs(2), move || {
                hits.load(Ordering::Acquire) == 1
            })
            .await,
            "every client observes exactly one invocation"
        );
        assert_eq!(
            payloads.lock().expect("payload log").as_slice(),
            &[vec![0xAA]]
        );
    }

    for client in &clients {
        client.close().await;
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn targeted_broadcast_reaches_only_the_named_session() {
    let server = echo_server();
    let port = start(&server).await;

    let mut clients = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..3 {
        let client = client_for(port);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        client
            .listen_broadcast(NEWS_ID, move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            })
            .await
            .expect("listen_broadcast");
        client.connect().await.expect("connect");
        clients.push(client);
        counters.push(hits);
    }

    assert!(wait_until(Duration::from_secs(2), || server.connections() == 3).await);
    let ids = server.get_session_ids();
    assert_eq!(ids.len(), 3);

    server
        .broadcast_to(NEWS_ID, b"for one", &ids[..1])
        .await
        .expect("broadcast_to");

    let total = || -> usize {
        counters
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    };
    assert!(
        wait_until(Duration::from_secs(2), || total() == 1).await,
        "exactly one listener observes the frame"
    );
    // Grace period: nobody else may receive it late.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(total(), 1);

    for client in &clients {
        client.close().await;
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn ping_confirms_liveness() {
    let server = echo_server();
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");
    assert!(client.ping().await);

    client.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn the_server_side_ping_keeps_an_idle_session_alive() {
    let session_cfg = wsrpc_rs::cfg::config::SessionConfig {
        ping_delay: Duration::from_millis(50),
        ..session_config()
    };
    let server = build_server(session_cfg);
    server
        .bind(super::common::ECHO_ID, |ctx| {
            ctx.response = ctx.data().to_vec();
        })
        .expect("bind echo");
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1).await);

    // Stay idle across several ping periods; the stream answers the pings
    // under the hood and the session must survive.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.connections(), 1);

    let reply = client
        .send_recv(super::common::ECHO_ID, b"after idling")
        .await
        .expect("send_recv");
    assert_eq!(reply.as_ref(), b"after idling");

    client.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn a_broadcast_with_no_sessions_is_a_cheap_no_op() {
    let server = echo_server();
    let _port = start(&server).await;

    server.broadcast(NEWS_ID, b"into the void").await.expect("broadcast");
    server.stop().await;
}
