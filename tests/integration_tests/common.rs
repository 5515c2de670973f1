// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use wsrpc_rs::{
    cfg::{
        config::{
            ClientConfig, ClientTimeouts, ServerConfig, ServerTimeouts, SessionConfig,
        },
        enums::StreamMode,
    },
    client::Client,
    server::Server,
};

/// Call id bound to an echo handler by [`echo_server`].
pub const ECHO_ID: u32 = 2;

pub fn server_config() -> ServerConfig {
    ServerConfig {
        host_address: "127.0.0.1".to_string(),
        port: 0,
        workers: 2,
        max_sessions: 64,
        max_handshake_bytes: 1024,
        mode: StreamMode::Plain,
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        max_transfer_bytes: 1024 * 1024,
        ping_delay: Duration::ZERO,
    }
}

/// A plain server with the given session config and no handlers bound yet.
pub fn build_server(session_cfg: SessionConfig) -> Arc<Server> {
    Server::new(server_config(), ServerTimeouts::default(), session_cfg)
}

/// A plain server with an echo handler on [`ECHO_ID`], already bound.
pub fn echo_server() -> Arc<Server> {
    let server = build_server(session_config());
    server
        .bind(ECHO_ID, |ctx| {
            ctx.response = ctx.data().to_vec();
        })
        .expect("echo handler should bind");
    server
}

/// Starts the accept loop and waits until the listener reports its address.
pub async fn start(server: &Arc<Server>) -> u16 {
    server.async_start(None);
    assert!(
        wait_until(Duration::from_secs(2), || server.local_addr().is_some()).await,
        "server did not come up"
    );
    server.local_addr().expect("listen address").port()
}

pub fn client_for(port: u16) -> Client {
    Client::new(
        ClientConfig {
            host_address: "127.0.0.1".to_string(),
            port,
            max_read_bytes: 2 * 1024 * 1024,
            send_attempts: 1,
            send_attempt_delay: Duration::from_millis(50),
        },
        ClientTimeouts::default(),
    )
}

/// Polls `cond` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
