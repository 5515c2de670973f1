// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{
        config::{ServerTimeouts, SessionConfig},
        enums::StreamMode,
    },
    proto::transport::{ServerTransport, is_tls_client_hello},
};

use super::{
    manager::SessionManager,
    session::{ServerSession, TransportVariant},
};

/// Accept loop: applies the listen hook and the session cap, routes each
/// socket to its transport variant, and hands it off to a fresh session
/// task.
pub(crate) struct Listener {
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) server_timeout: ServerTimeouts,
    pub(crate) session_cfg: SessionConfig,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) cancel: CancellationToken,
}

impl Listener {
    pub(crate) async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    let this = Arc::clone(&self);
                    let remote = peer.ip().to_string();
                    tokio::spawn(async move {
                        this.route(socket, remote).await;
                    });
                },
                Err(e) => {
                    warn!("listener: accept failed: {e}");
                },
            }
        }
        debug!("listener: stopped");
    }

    async fn route(&self, socket: TcpStream, remote: String) {
        if let Some(hook) = self.manager.listen_hook() {
            if !hook(&remote) {
                debug!(%remote, "listener: rejected by listen hook");
                return;
            }
        }
        if self.manager.is_full() {
            debug!(%remote, "listener: session limit reached");
            return;
        }

        let mode = self.manager.server_cfg.mode;
        let use_tls = match (mode, self.tls.as_ref()) {
            (StreamMode::Plain, _) => false,
            (StreamMode::Tls, Some(_)) => true,
            (StreamMode::PlainTls, Some(_)) => match self.sniff_tls(&socket).await {
                Some(is_tls) => is_tls,
                None => return,
            },
            // TLS-capable modes without a context cannot serve TLS.
            (StreamMode::Tls, None) => {
                warn!("listener: tls mode without a tls context, dropping connection");
                return;
            },
            (StreamMode::PlainTls, None) => false,
        };

        let max_handshake = self.manager.server_cfg.max_handshake_bytes;
        let (transport, variant) = if use_tls {
            let Some(acceptor) = self.tls.clone() else {
                return;
            };
            let handshake = timeout(
                self.server_timeout.handshake_or_close_timeout,
                acceptor.accept(socket),
            )
            .await;
            match handshake {
                Ok(Ok(stream)) => (
                    ServerTransport::tls(stream).with_handshake_budget(max_handshake),
                    TransportVariant::Tls,
                ),
                Ok(Err(e)) => {
                    debug!(%remote, "listener: tls handshake failed: {e}");
                    return;
                },
                Err(_) => {
                    debug!(%remote, "listener: tls handshake timed out");
                    return;
                },
            }
        } else {
            (
                ServerTransport::plain(socket).with_handshake_budget(max_handshake),
                TransportVariant::Plain,
            )
        };

        let session = ServerSession::new(
            remote,
            Arc::clone(&self.manager),
            self.server_timeout.clone(),
            self.session_cfg.clone(),
            variant,
            &self.cancel,
        );
        session.run(transport).await;
    }

    /// Peeks the first byte of the stream to tell a TLS ClientHello from a
    /// plaintext upgrade request. `None` means the peer vanished or never
    /// sent a byte within the handshake deadline.
    async fn sniff_tls(&self, socket: &TcpStream) -> Option<bool> {
        let mut first = [0u8; 1];
        let peeked = timeout(
            self.server_timeout.handshake_or_close_timeout,
            socket.peek(&mut first),
        )
        .await;
        match peeked {
            Ok(Ok(n)) if n > 0 => Some(is_tls_client_hello(first[0])),
            Ok(Ok(_)) | Ok(Err(_)) => {
                debug!("listener: connection closed during sniff");
                None
            },
            Err(_) => {
                debug!("listener: sniff timed out");
                None
            },
        }
    }
}
