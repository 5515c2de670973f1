// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{
    net::{TcpStream, lookup_host},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::WebSocketConfig},
};
use tracing::{debug, error, warn};

use crate::{
    cfg::{
        config::{ClientConfig, ClientTimeouts},
        constants::{DEFAULT_CLOSE_TIMEOUT, IO_TIMEOUT_SECS},
    },
    core::queue::WriteJob,
    error::{Result, RpcError},
    proto::{header::HEADER_LEN, transport::ClientTransport},
};

use super::session::{BroadcastTable, ClientSession};

/// Header fields merged into the WebSocket upgrade request and captured from
/// the upgrade response.
pub type HandshakeHeaders = Vec<(String, String)>;

/// Owns one established [`ClientSession`] together with its two I/O workers.
///
/// Establishment runs resolve, TCP connect, the optional TLS handshake and
/// the WebSocket upgrade under the configured handshake deadline; any
/// failure surfaces as `HandshakeFailed` and leaves nothing behind.
pub struct Connector {
    session: Arc<ClientSession>,
    res_handshake: HandshakeHeaders,
    workers: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Connector {
    /// Builds a connection and arms its read/write workers.
    pub async fn run(
        cfg: &ClientConfig,
        timeouts: &ClientTimeouts,
        tls: Option<&TlsConnector>,
        req_headers: &HandshakeHeaders,
        handlers: Arc<BroadcastTable>,
    ) -> Result<Arc<Self>> {
        let deadline = timeouts.handshake_timeout;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(cfg.max_read_bytes + HEADER_LEN))
            .max_frame_size(Some(cfg.max_read_bytes + HEADER_LEN));

        let transport = Self::open_transport(cfg, tls, deadline).await?;

        let request = format!("ws://{}:{}/", cfg.host_address, cfg.port)
            .into_client_request()
            .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;
        let mut request = request;
        for (name, value) in req_headers {
            let (Ok(name), Ok(value)) = (
                name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                value.parse::<tokio_tungstenite::tungstenite::http::HeaderValue>(),
            ) else {
                warn!(name = %name, "connector: skipping invalid handshake header");
                continue;
            };
            request.headers_mut().append(name, value);
        }

        let (ws, response) = timeout(
            deadline,
            client_async_with_config(request, transport, Some(ws_config)),
        )
        .await
        .map_err(|_| RpcError::HandshakeFailed("websocket upgrade timed out".into()))?
        .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;

        let res_handshake = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let session = Arc::new(ClientSession::new(handlers));
        let (sink, source) = ws.split();
        let read_worker = tokio::spawn(Arc::clone(&session).read_loop(source));
        let write_worker = tokio::spawn(Arc::clone(&session).write_loop(sink));
        debug!(
            host = %cfg.host_address,
            port = cfg.port,
            "connector: connection established"
        );

        Ok(Arc::new(Self {
            session,
            res_handshake,
            workers: Mutex::new(Some((read_worker, write_worker))),
        }))
    }

    async fn open_transport(
        cfg: &ClientConfig,
        tls: Option<&TlsConnector>,
        deadline: Duration,
    ) -> Result<ClientTransport> {
        let mut addrs = timeout(
            deadline,
            lookup_host((cfg.host_address.as_str(), cfg.port)),
        )
        .await
        .map_err(|_| RpcError::HandshakeFailed("resolve timed out".into()))?
        .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;
        let addr = addrs
            .next()
            .ok_or_else(|| RpcError::HandshakeFailed("address resolved to nothing".into()))?;

        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::HandshakeFailed("tcp connect timed out".into()))?
            .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        match tls {
            None => Ok(ClientTransport::Plain(stream)),
            Some(connector) => {
                let server_name = rustls::pki_types::ServerName::try_from(
                    cfg.host_address.clone(),
                )
                .map_err(|_| {
                    RpcError::HandshakeFailed("host is not a valid server name".into())
                })?;
                let tls_stream = timeout(deadline, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| RpcError::HandshakeFailed("tls handshake timed out".into()))?
                    .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;
                Ok(ClientTransport::Tls(Box::new(tls_stream)))
            },
        }
    }

    pub fn session(&self) -> Arc<ClientSession> {
        Arc::clone(&self.session)
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    /// Response headers captured during the WebSocket upgrade.
    pub fn res_handshake(&self) -> &HandshakeHeaders {
        &self.res_handshake
    }

    /// Idempotent teardown: attempts the closing handshake, then drains the
    /// workers within bounded time, aborting them as a last resort.
    pub async fn close(&self) {
        let already_closing = self.session.close_initiated.swap(true, std::sync::atomic::Ordering::AcqRel);
        if !already_closing {
            self.session.queue.push_control(WriteJob::Close).await;
        }

        let Some((mut read_worker, mut write_worker)) = self.workers.lock().await.take()
        else {
            return;
        };

        // Give the write worker a chance to put the close frame on the wire.
        if timeout(DEFAULT_CLOSE_TIMEOUT, &mut write_worker).await.is_err() {
            self.session.cancel.cancel();
            if timeout(Duration::from_secs(IO_TIMEOUT_SECS), &mut write_worker)
                .await
                .is_err()
            {
                error!("connector: write worker is stuck, aborting");
                write_worker.abort();
            }
        } else {
            self.session.cancel.cancel();
        }

        if timeout(Duration::from_secs(IO_TIMEOUT_SECS), &mut read_worker)
            .await
            .is_err()
        {
            error!("connector: read worker is stuck, aborting");
            read_worker.abort();
        }
        debug!("connector: closed");
    }
}
