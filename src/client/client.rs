// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{Mutex, RwLock},
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, warn};

use crate::{
    cfg::{
        config::{ClientConfig, ClientTimeouts},
        constants::{DEADLOCK_SECS, MAX_CALL_ID},
    },
    core::timeout as timeout_state,
    error::{Result, RpcError},
};

use super::{
    connector::{Connector, HandshakeHeaders},
    session::{BroadcastHandler, BroadcastTable},
};

/// Public client facade.
///
/// Holds at most one live [`Connector`]. Connect and disconnect serialize on
/// the session slot in write mode; the send paths take it in read mode and
/// only touch the session behind it.
pub struct Client {
    cfg: ClientConfig,
    timeouts: ClientTimeouts,
    tls: Option<TlsConnector>,
    session: RwLock<Option<Arc<Connector>>>,
    req_handshake: Mutex<HandshakeHeaders>,
    listeners: Mutex<BroadcastTable>,
    closing: AtomicBool,
}

impl Client {
    /// A client connecting over plain TCP.
    pub fn new(cfg: ClientConfig, timeouts: ClientTimeouts) -> Self {
        Self::with_tls_opt(cfg, timeouts, None)
    }

    /// A client connecting through the given, already configured TLS
    /// context. Certificate policy is entirely the caller's.
    pub fn new_tls(cfg: ClientConfig, timeouts: ClientTimeouts, tls: TlsConnector) -> Self {
        Self::with_tls_opt(cfg, timeouts, Some(tls))
    }

    fn with_tls_opt(
        cfg: ClientConfig,
        timeouts: ClientTimeouts,
        tls: Option<TlsConnector>,
    ) -> Self {
        let listeners: BroadcastTable =
            (0..MAX_CALL_ID).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            cfg,
            timeouts,
            tls,
            session: RwLock::new(None),
            req_handshake: Mutex::new(Vec::new()),
            listeners: Mutex::new(listeners),
            closing: AtomicBool::new(false),
        }
    }

    /// Installs a listener for server-initiated frames carrying `call_id`.
    ///
    /// The listener table is frozen while a session is connected; rebinding
    /// an occupied id is an error.
    pub async fn listen_broadcast<F>(&self, call_id: u32, handler: F) -> Result<()>
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        if call_id >= MAX_CALL_ID {
            return Err(RpcError::InvalidState("call id is out of bounds"));
        }
        let slot = self.session.read().await;
        if slot.as_ref().is_some_and(|c| c.is_alive()) {
            return Err(RpcError::InvalidState(
                "cannot assign listeners while a session is connected",
            ));
        }
        drop(slot);

        let mut listeners = self.listeners.lock().await;
        let entry = &mut listeners[call_id as usize];
        if entry.is_some() {
            return Err(RpcError::HandlerExists(call_id));
        }
        *entry = Some(Arc::new(handler) as BroadcastHandler);
        Ok(())
    }

    /// Replaces the extra header fields merged into the next upgrade
    /// request.
    pub async fn set_handshake_request(&self, headers: HandshakeHeaders) {
        *self.req_handshake.lock().await = headers;
    }

    /// Response headers captured during the current session's upgrade.
    pub async fn get_handshake_response(&self) -> HandshakeHeaders {
        let slot = self.session.read().await;
        match slot.as_ref() {
            Some(conn) => conn.res_handshake().clone(),
            None => Vec::new(),
        }
    }

    /// Establishes a session. A no-op when one is already alive.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.session.write().await;
        self.connect_locked(&mut slot).await
    }

    /// Establishes a session, retrying up to `attempts` times with `delay`
    /// between attempts.
    pub async fn connect_attempts(&self, attempts: u32, delay: Duration) -> Result<()> {
        let mut slot = self.session.write().await;
        let attempts = attempts.max(1);
        let mut last = RpcError::NotConnected;
        for attempt in 0..attempts {
            if attempt != 0 {
                sleep(delay).await;
            }
            debug!(attempt = attempt + 1, attempts, "client: connect attempt");
            match self.connect_locked(&mut slot).await {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    async fn connect_locked(&self, slot: &mut Option<Arc<Connector>>) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RpcError::InvalidState("client is shutting down"));
        }
        if let Some(conn) = slot.as_ref() {
            if conn.is_alive() {
                return Ok(());
            }
        }
        // The previous session must be fully torn down before a new one may
        // exist. close() is itself bounded; exceeding the outer deadline
        // means an I/O worker is hung, which must not pass silently.
        if let Some(old) = slot.take() {
            if timeout(Duration::from_secs(DEADLOCK_SECS), old.close())
                .await
                .is_err()
            {
                error!("client: previous session did not tear down in time");
                return Err(RpcError::InvalidState("previous session is stuck"));
            }
        }

        let handlers: Arc<BroadcastTable> = Arc::new(self.listeners.lock().await.clone());
        let req_headers = self.req_handshake.lock().await.clone();
        let conn =
            Connector::run(&self.cfg, &self.timeouts, self.tls.as_ref(), &req_headers, handlers)
                .await?;
        *slot = Some(conn);
        Ok(())
    }

    /// Tears down the current session. Idempotent; a hard cancel for every
    /// parked waiter and queued frame.
    pub async fn disconnect(&self) {
        let mut slot = self.session.write().await;
        if let Some(conn) = slot.take() {
            if timeout(Duration::from_secs(DEADLOCK_SECS), conn.close())
                .await
                .is_err()
            {
                error!("client: session did not tear down in time");
            }
        }
    }

    /// Pings the server, reconnecting first if the session expired.
    pub async fn ping(&self) -> bool {
        let response_timeout = timeout_state::take_response_timeout()
            .unwrap_or(self.timeouts.response_timeout);
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        if self.connect().await.is_err() {
            return false;
        }
        let session = {
            let slot = self.session.read().await;
            slot.as_ref().map(|c| c.session())
        };
        match session {
            Some(session) => session.ping(response_timeout).await,
            None => false,
        }
    }

    /// Sends a fire-and-forget frame, retrying per the configured attempt
    /// policy. On failure the broken session is torn down before the next
    /// attempt; an expired session triggers a reconnect.
    pub async fn send(&self, call_id: u32, payload: &[u8]) -> Result<()> {
        let send_timeout =
            timeout_state::take_send_timeout().unwrap_or(self.timeouts.send_timeout);
        let attempts = self.cfg.send_attempts.max(1);
        let mut last = RpcError::NotConnected;
        for attempt in 0..attempts {
            if attempt != 0 {
                sleep(self.cfg.send_attempt_delay).await;
            }
            match self.live_session().await {
                None => {
                    if let Err(e) = self.connect().await {
                        warn!("client: reconnect failed: {e}");
                        last = e;
                    }
                },
                Some(session) => {
                    match session.send(call_id, payload, send_timeout).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            debug!("client: send failed: {e}");
                            last = e;
                            self.disconnect().await;
                        },
                    }
                },
            }
        }
        Err(last)
    }

    /// Sends a request and waits for the correlated response, retrying per
    /// the configured attempt policy.
    ///
    /// An empty buffer means the session was torn down while the call was
    /// parked; the frame may or may not have reached the server.
    pub async fn send_recv(&self, call_id: u32, payload: &[u8]) -> Result<Bytes> {
        let send_timeout =
            timeout_state::take_send_timeout().unwrap_or(self.timeouts.send_timeout);
        let response_timeout = timeout_state::take_response_timeout()
            .unwrap_or(self.timeouts.response_timeout);
        let attempts = self.cfg.send_attempts.max(1);
        let mut last = RpcError::NotConnected;
        for attempt in 0..attempts {
            if attempt != 0 {
                sleep(self.cfg.send_attempt_delay).await;
            }
            match self.live_session().await {
                None => {
                    if let Err(e) = self.connect().await {
                        warn!("client: reconnect failed: {e}");
                        last = e;
                    }
                },
                Some(session) => {
                    match session
                        .send_recv(call_id, payload, send_timeout, response_timeout)
                        .await
                    {
                        Ok(buffer) => return Ok(buffer),
                        Err(e) => {
                            debug!("client: send_recv failed: {e}");
                            last = e;
                            self.disconnect().await;
                        },
                    }
                },
            }
        }
        Err(last)
    }

    /// One-shot send-timeout override for the next call on this thread.
    pub fn set_send_timeout(&self, timeout: Duration) {
        timeout_state::set_send_timeout(timeout);
    }

    /// One-shot response-timeout override for the next call on this thread.
    pub fn set_response_timeout(&self, timeout: Duration) {
        timeout_state::set_response_timeout(timeout);
    }

    /// Permanently shuts the client down and tears down any live session.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.disconnect().await;
    }

    async fn live_session(&self) -> Option<Arc<super::session::ClientSession>> {
        let slot = self.session.read().await;
        slot.as_ref().filter(|c| c.is_alive()).map(|c| c.session())
    }
}
