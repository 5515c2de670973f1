// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use serial_test::serial;

use super::common::{ECHO_ID, build_server, client_for, echo_server, session_config, start, wait_until};

const NEWS_ID: u32 = 7;
const LOG_ID: u32 = 9;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn many_clients_echo_concurrently() {
    let server = echo_server();
    let port = start(&server).await;

    let mut runners = Vec::new();
    for _ in 0..8 {
        runners.push(tokio::spawn(async move {
            let client = client_for(port);
            client.connect().await.expect("connect");
            for _ in 0..10 {
                let mut payload = vec![0u8; 512];
                rand::rng().fill_bytes(&mut payload);
                let reply = client
                    .send_recv(ECHO_ID, &payload)
                    .await
                    .expect("send_recv");
                assert_eq!(reply.as_ref(), payload.as_slice());
            }
            client.close().await;
        }));
    }
    for runner in runners {
        runner.await.expect("client task");
    }

    assert!(wait_until(Duration::from_secs(5), || server.connections() == 0).await);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn repeated_broadcasts_reach_every_listener() {
    let server = echo_server();
    let port = start(&server).await;

    const LISTENERS: usize = 5;
    const ROUNDS: usize = 20;

    let mut clients = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..LISTENERS {
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
    assert!(
        wait_until(Duration::from_secs(2), || {
            server.connections() == LISTENERS as i64
        })
        .await
    );

    for round in 0..ROUNDS {
        server
            .broadcast(NEWS_ID, &[round as u8])
            .await
            .expect("broadcast");
    }

    for hits in &counters {
        let hits = Arc::clone(hits);
        assert!(
            wait_until(Duration::from_secs(5), move || {
                hits.load(Ordering::Acquire) == ROUNDS
            })
            .await,
            "every listener sees every round"
        );
    }

    for client in &clients {
        client.close().await;
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn enqueue_order_equals_wire_order() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let server = build_server(session_config());
    let log = Arc::clone(&received);
    server
        .bind(LOG_ID, move |ctx| {
            log.lock().expect("receive log").push(ctx.data().to_vec());
        })
        .expect("bind log");
    server
        .bind(ECHO_ID, |ctx| {
            ctx.response = ctx.data().to_vec();
        })
        .expect("bind echo");
    let port = start(&server).await;

    let client = client_for(port);
    client.connect().await.expect("connect");

    const FRAMES: u8 = 50;
    for seq in 0..FRAMES {
        client.send(LOG_ID, &[seq]).await.expect("send");
    }
    // The echo marker rides the same queue, so its reply implies all
    // earlier frames were written.
    let reply = client.send_recv(ECHO_ID, b"marker").await.expect("send_recv");
    assert_eq!(reply.as_ref(), b"marker");

    let expected: Vec<Vec<u8>> = (0..FRAMES).map(|seq| vec![seq]).collect();
    assert!(
        wait_until(Duration::from_secs(2), || {
            received.lock().expect("receive log").len() == FRAMES as usize
        })
        .await
    );
    assert_eq!(*received.lock().expect("receive log"), expected);

    client.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn rapid_connect_disconnect_cycles_leave_no_residue() {
    let server = echo_server();
    let port = start(&server).await;

    let client = client_for(port);
    for cycle in 0..10 {
        client.connect().await.expect("connect");
        let reply = client
            .send_recv(ECHO_ID, &[cycle])
            .await
            .expect("send_recv");
        assert_eq!(reply.as_ref(), &[cycle]);
        client.disconnect().await;
    }

    assert!(wait_until(Duration::from_secs(5), || server.connections() == 0).await);
    server.stop().await;
}
