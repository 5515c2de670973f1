// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::{
    constants::{
        DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SEND_TIMEOUT,
    },
    enums::StreamMode,
};

/// Combined client + server settings as loaded from a single YAML document.
///
/// Either section may be omitted when a process only plays one role.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Settings consumed by [`crate::client::Client`].
    #[serde(default)]
    pub client: Option<ClientSettings>,
    /// Settings consumed by [`crate::server::Server`].
    #[serde(default)]
    pub server: Option<ServerSettings>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientSettings {
    pub config: ClientConfig,
    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerSettings {
    pub config: ServerConfig,
    #[serde(default)]
    pub timeouts: ServerTimeouts,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Connection parameters of the client facade.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(rename = "HostAddress")]
    /// The address to connect to.
    pub host_address: String,

    #[serde(rename = "Port")]
    /// The port to open.
    pub port: u16,

    #[serde(rename = "MaxReadBytes")]
    /// Maximum message size to receive.
    pub max_read_bytes: usize,

    #[serde(rename = "SendAttempts")]
    /// The amount of attempts to send a message. Coerced to at least one
    /// at call time.
    pub send_attempts: u32,

    #[serde(rename = "SendAttemptDelay", with = "serde_millis")]
    /// The delay after a failed attempt.
    pub send_attempt_delay: Duration,
}

/// Deadlines applied by the client facade.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientTimeouts {
    #[serde(rename = "HandshakeTimeout", with = "serde_millis")]
    /// Covers resolve, TCP connect, TLS and the WebSocket upgrade.
    pub handshake_timeout: Duration,

    #[serde(rename = "SendTimeout", with = "serde_millis")]
    /// Deadline for a frame to reach the wire in `send()` / `send_recv()`.
    pub send_timeout: Duration,

    #[serde(rename = "ResponseTimeout", with = "serde_millis")]
    /// Deadline for a correlated response in `send_recv()` or a pong in
    /// `ping()`.
    pub response_timeout: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Listener parameters of the server facade.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "HostAddress")]
    /// The address to host on, usually "0.0.0.0".
    pub host_address: String,

    #[serde(rename = "Port")]
    /// The port to open.
    pub port: u16,

    #[serde(rename = "Workers")]
    /// The amount of runtime workers to drive the I/O.
    pub workers: u32,

    #[serde(rename = "MaxSessions")]
    /// The maximum amount of simultaneously established sessions.
    pub max_sessions: u32,

    #[serde(rename = "MaxHandshakeBytes")]
    /// The maximum upgrade-request size accepted from clients.
    pub max_handshake_bytes: usize,

    #[serde(rename = "Mode", default = "default_stream_mode")]
    /// The transport variants this server accepts.
    pub mode: StreamMode,
}

fn default_stream_mode() -> StreamMode {
    StreamMode::Plain
}

/// Deadlines applied by the server.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerTimeouts {
    #[serde(rename = "HandshakeOrCloseTimeout", with = "serde_millis")]
    /// The timeout used for handshake or close.
    pub handshake_or_close_timeout: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            handshake_or_close_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Per-session settings; the accept hook may mutate them before the session
/// is admitted, after which they are frozen.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(rename = "MaxTransferBytes")]
    /// Maximum payload size of each received message.
    pub max_transfer_bytes: usize,

    #[serde(rename = "PingDelay", with = "serde_millis")]
    /// The delay between liveness pings to the client. Zero disables the
    /// server-side ping.
    pub ping_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_transfer_bytes: 1024 * 1024,
            ping_delay: Duration::ZERO,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants on whichever sections are present.
    pub fn validate(&self) -> Result<()> {
        if let Some(client) = &self.client {
            client.config.validate()?;
        }
        if let Some(server) = &self.server {
            server.config.validate()?;
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host_address.is_empty(), "HostAddress must not be empty");
        ensure!(self.port != 0, "Port must not be zero");
        ensure!(self.max_read_bytes > 0, "MaxReadBytes must be > 0");
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host_address.is_empty(), "HostAddress must not be empty");
        ensure!(self.workers >= 1, "Workers must be >= 1");
        ensure!(self.max_sessions >= 1, "MaxSessions must be >= 1");
        ensure!(
            self.max_handshake_bytes >= 128,
            "MaxHandshakeBytes is too small for an upgrade request"
        );
        Ok(())
    }
}

/// Resolves a possibly relative config path against the current working
/// directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
