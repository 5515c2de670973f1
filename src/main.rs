// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use wsrpc_rs::{
    cfg::{
        config::{
            ClientConfig, ClientTimeouts, Config, ServerConfig, ServerTimeouts,
            SessionConfig, resolve_config_path,
        },
        enums::StreamMode,
        logger::init_logger,
    },
    client::Client,
    server::Server,
};
use tracing::info;

const ECHO_ID: u32 = 2;
const NEWS_ID: u32 = 7;

fn main() -> Result<()> {
    let _logger = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let server_settings = cfg.server.clone().unwrap_or_else(default_server_settings);
    let workers = server_settings.config.workers.max(1) as usize;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(run(cfg, server_settings))
}

async fn run(
    cfg: Config,
    server_settings: wsrpc_rs::cfg::config::ServerSettings,
) -> Result<()> {
    let server = Server::new(
        server_settings.config.clone(),
        server_settings.timeouts,
        server_settings.session,
    );
    server
        .bind(ECHO_ID, |ctx| {
            ctx.response = ctx.data().to_vec();
        })
        .context("failed to bind echo handler")?;
    server
        .bind_listen(|remote| {
            info!(remote, "incoming connection");
            true
        })
        .context("failed to bind listen hook")?;
    server.async_start(None);

    // Give the listener a moment to come up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let Some(addr) = server.local_addr() else {
        anyhow::bail!("server did not start");
    };

    let client_settings = cfg.client.unwrap_or_else(|| default_client_settings(addr.port()));
    let client = Client::new(client_settings.config, client_settings.timeouts);
    client
        .listen_broadcast(NEWS_ID, |payload| {
            info!(bytes = payload.len(), "broadcast received");
        })
        .await
        .ok();
    client
        .connect_attempts(3, Duration::from_millis(200))
        .await
        .context("client failed to connect")?;

    let pong = client.ping().await;
    info!(pong, "liveness probe");

    let echoed = client.send_recv(ECHO_ID, b"hello over websocket").await?;
    info!(bytes = echoed.len(), "echo round trip done");
    anyhow::ensure!(
        echoed.as_ref() == b"hello over websocket",
        "echo payload mismatch"
    );

    server.broadcast(NEWS_ID, b"breaking news").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.close().await;
    server.stop().await;
    info!("demo finished");
    Ok(())
}

fn default_server_settings() -> wsrpc_rs::cfg::config::ServerSettings {
    wsrpc_rs::cfg::config::ServerSettings {
        config: ServerConfig {
            host_address: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            max_sessions: 64,
            max_handshake_bytes: 1024,
            mode: StreamMode::Plain,
        },
        timeouts: ServerTimeouts::default(),
        session: SessionConfig {
            max_transfer_bytes: 1024 * 1024,
            ping_delay: Duration::from_secs(5),
        },
    }
}

fn default_client_settings(port: u16) -> wsrpc_rs::cfg::config::ClientSettings {
    wsrpc_rs::cfg::config::ClientSettings {
        config: ClientConfig {
            host_address: "127.0.0.1".to_string(),
            port,
            max_read_bytes: 1024 * 1024,
            send_attempts: 3,
            send_attempt_delay: Duration::from_millis(100),
        },
        timeouts: ClientTimeouts::default(),
    }
}
