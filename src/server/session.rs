// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async_with_config,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::WebSocketConfig,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{
        config::{ServerTimeouts, SessionConfig},
        constants::{IO_TIMEOUT_SECS, MAX_CALL_ID, QUEUE_SEND_MAX},
    },
    core::{
        push::Push,
        queue::{WriteJob, WriteQueue},
    },
    error::{Result, RpcError},
    proto::{header, header::HEADER_LEN, transport::ServerTransport},
};

use super::{
    context::{SessionContext, SessionInfo, SessionMeta},
    manager::SessionManager,
};

/// Which registry map a session lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportVariant {
    Plain,
    Tls,
}

type WsSink = SplitSink<WebSocketStream<ServerTransport>, Message>;
type WsSource = SplitStream<WebSocketStream<ServerTransport>>;

/// One accepted connection on the server.
///
/// Lifecycle: constructed on the raw socket, runs the upgrade (TLS read
/// already done by the listener's router), consults the accept hook, then
/// enters the established read/write/ping workers until either side closes.
/// Destruction removes the session from the manager and fires the
/// disconnect hook.
pub struct ServerSession {
    id: u64,
    remote_address: String,
    manager: Arc<SessionManager>,
    server_timeout: ServerTimeouts,
    config: Mutex<SessionConfig>,
    queue: WriteQueue,
    variant: TransportVariant,
    established: AtomicBool,
    closing: AtomicBool,
    remote_closed: AtomicBool,
    read_error: AtomicBool,
    write_error: AtomicBool,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl ServerSession {
    /// The session id is derived from the allocation address, which stays
    /// stable for the whole session life.
    pub(crate) fn new(
        remote_address: String,
        manager: Arc<SessionManager>,
        server_timeout: ServerTimeouts,
        session_cfg: SessionConfig,
        variant: TransportVariant,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: weak.as_ptr() as u64,
            remote_address,
            manager,
            server_timeout,
            config: Mutex::new(session_cfg),
            queue: WriteQueue::new(QUEUE_SEND_MAX),
            variant,
            established: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            read_error: AtomicBool::new(false),
            write_error: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            cancel: parent_cancel.child_token(),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn variant(&self) -> TransportVariant {
        self.variant
    }

    fn session_config(&self) -> SessionConfig {
        self.config.lock().expect("session config poisoned").clone()
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity clock poisoned") = Instant::now();
    }

    /// Queues a shared frame for this session. Silently dropped when the
    /// session is closing or its queue is full.
    pub(crate) async fn send_shared(&self, push: Arc<Push>) {
        if self.closing.load(Ordering::Acquire)
            || self.remote_closed.load(Ordering::Acquire)
            || self.read_error.load(Ordering::Acquire)
            || self.write_error.load(Ordering::Acquire)
        {
            return;
        }
        if !self.queue.push_shared(push).await {
            debug!(id = self.id, "server_session: send queue is full");
        }
    }

    /// Latches the closing state and cancels the workers; queued writes are
    /// resolved as failed, the stream tears down naturally.
    pub(crate) fn close_session(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }

    /// Runs the whole session lifecycle on the freshly routed transport.
    pub(crate) async fn run(self: Arc<Self>, transport: ServerTransport) {
        let ws = match self.accept(transport).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(remote = %self.remote_address, "server_session: accept failed: {e}");
                return;
            },
        };

        self.established.store(true, Ordering::Release);
        self.manager.add_session(&self);
        debug!(id = self.id, remote = %self.remote_address, "server_session: established");

        let (sink, source) = ws.split();
        let write_worker = tokio::spawn(Arc::clone(&self).write_loop(sink));
        let ping_worker = tokio::spawn(Arc::clone(&self).ping_loop());

        Arc::clone(&self).read_loop(source).await;

        self.cancel.cancel();
        ping_worker.abort();
        if timeout(Duration::from_secs(IO_TIMEOUT_SECS), write_worker)
            .await
            .is_err()
        {
            warn!(id = self.id, "server_session: write worker is stuck");
        }
    }

    /// Performs the WebSocket upgrade: capture the request handshake, give
    /// the accept hook a chance to inspect, configure and reject, then
    /// complete the upgrade with the possibly amended response.
    async fn accept(
        self: &Arc<Self>,
        transport: ServerTransport,
    ) -> Result<WebSocketStream<ServerTransport>> {
        let hook = self.manager.accept_hook();
        let session_id = self.id;
        let remote = self.remote_address.clone();
        let cfg_cell = Arc::new(Mutex::new(self.session_config()));
        let hook_cell = Arc::clone(&cfg_cell);

        let callback = move |req: &Request, mut res: Response| -> std::result::Result<Response, ErrorResponse> {
            let Some(hook) = hook else {
                return Ok(res);
            };
            let mut response_headers: Vec<(String, String)> = Vec::new();
            let accepted = {
                let mut cfg = hook_cell.lock().expect("session config poisoned");
                let mut info = SessionInfo {
                    session_id,
                    remote_address: &remote,
                    request_headers: req.headers(),
                    response_headers: &mut response_headers,
                    config: &mut cfg,
                };
                hook(&mut info)
            };
            if !accepted {
                let mut rejection = ErrorResponse::new(None);
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                return Err(rejection);
            }
            for (name, value) in response_headers {
                let (Ok(name), Ok(value)) = (
                    name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                    value.parse::<tokio_tungstenite::tungstenite::http::HeaderValue>(),
                ) else {
                    warn!(name = %name, "server_session: skipping invalid response header");
                    continue;
                };
                res.headers_mut().append(name, value);
            }
            Ok(res)
        };

        // The stream-level limit is armed with the pre-hook transfer size;
        // a hook-shrunk limit is enforced per frame in the read worker.
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.session_config().max_transfer_bytes + HEADER_LEN));

        let mut ws = timeout(
            self.server_timeout.handshake_or_close_timeout,
            accept_hdr_async_with_config(transport, callback, Some(ws_config)),
        )
        .await
        .map_err(|_| RpcError::HandshakeFailed("upgrade timed out".into()))?
        .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;
        ws.get_mut().clear_handshake_budget();

        // Freeze whatever the hook decided.
        let frozen = cfg_cell.lock().expect("session config poisoned").clone();
        *self.config.lock().expect("session config poisoned") = frozen;
        Ok(ws)
    }

    /// Read worker: parses each inbound frame and dispatches it to the bound
    /// handler.
    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = source.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    self.touch();
                    let max_transfer = self.session_config().max_transfer_bytes;
                    if data.len() > max_transfer + HEADER_LEN {
                        warn!(
                            id = self.id,
                            bytes = data.len(),
                            "server_session: oversized frame, closing"
                        );
                        self.close_session();
                        break;
                    }
                    self.dispatch(data).await;
                    if self.closing.load(Ordering::Acquire) {
                        break;
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => self.touch(),
                Some(Ok(Message::Close(_))) => {
                    debug!(id = self.id, "server_session: close received");
                    self.remote_closed.store(true, Ordering::Release);
                    self.touch();
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    if !self.remote_closed.load(Ordering::Acquire)
                        && !self.closing.load(Ordering::Acquire)
                    {
                        debug!(id = self.id, "server_session: read error: {e}");
                        self.read_error.store(true, Ordering::Release);
                    }
                    break;
                },
                None => break,
            }
        }
        self.queue.clear().await;
        self.close_session();
    }

    async fn dispatch(self: &Arc<Self>, frame: Bytes) {
        let (hdr, payload) = match header::split_frame(&frame) {
            Ok(parts) => parts,
            Err(_) => {
                debug!(id = self.id, "server_session: invalid buffer, frame dropped");
                return;
            },
        };
        if hdr.call_id() >= MAX_CALL_ID {
            debug!(
                id = self.id,
                call_id = hdr.call_id(),
                "server_session: call id is out of bounds"
            );
            return;
        }
        let Some(handler) = self.manager.handler(hdr.call_id()) else {
            debug!(
                id = self.id,
                call_id = hdr.call_id(),
                "server_session: call id was not bound to any function"
            );
            return;
        };

        let mut ctx =
            SessionContext::new(self.id, &self.remote_address, hdr.call_id(), &payload);
        // A panicking handler kills this dispatch, not the session.
        if catch_unwind(AssertUnwindSafe(|| handler(&mut ctx))).is_err() {
            warn!(
                id = self.id,
                call_id = hdr.call_id(),
                "server_session: handler panicked, dispatch dropped"
            );
            return;
        }

        if ctx.close {
            debug!(id = self.id, "server_session: handler requested close");
            self.close_session();
            return;
        }
        if !ctx.response.is_empty() {
            let push = Arc::new(Push::response(hdr.call_id(), hdr.result_id(), &ctx.response));
            self.send_shared(push).await;
        }
    }

    /// Write worker: keeps at most one write in flight, in queue order.
    async fn write_loop(self: Arc<Self>, mut sink: WsSink) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.queue.pop() => job,
            };
            let res = match &job {
                WriteJob::Frame { frame, .. } => sink.send(Message::Binary(frame.clone())).await,
                WriteJob::Push(push) => sink.send(Message::Binary(push.frame())).await,
                WriteJob::Ping => sink.send(Message::Ping(Bytes::new())).await,
                WriteJob::Close => {
                    if !self.remote_closed.load(Ordering::Acquire) {
                        let _ = sink.send(Message::Close(None)).await;
                    }
                    break;
                },
            };
            if let Err(e) = res {
                if !self.remote_closed.load(Ordering::Acquire) {
                    debug!(id = self.id, "server_session: write error: {e}");
                    self.write_error.store(true, Ordering::Release);
                }
                break;
            }
            if let WriteJob::Frame {
                done: Some(done), ..
            } = job
            {
                let _ = done.send(true);
            }
        }
        self.queue.clear().await;
        self.close_session();
    }

    /// Liveness worker: pings the client whenever the connection was idle
    /// for a full `ping_delay`. Any inbound frame pushes the deadline out.
    async fn ping_loop(self: Arc<Self>) {
        let delay = self.session_config().ping_delay;
        if delay.is_zero() {
            return;
        }
        let mut last_ping = Instant::now();
        loop {
            let deadline = {
                let last_activity =
                    *self.last_activity.lock().expect("activity clock poisoned");
                last_activity.max(last_ping) + delay
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(deadline) => {},
            }
            if self.closing.load(Ordering::Acquire)
                || self.remote_closed.load(Ordering::Acquire)
                || self.read_error.load(Ordering::Acquire)
                || self.write_error.load(Ordering::Acquire)
            {
                break;
            }
            let last_activity = *self.last_activity.lock().expect("activity clock poisoned");
            if last_activity + delay <= Instant::now() {
                debug!(id = self.id, "server_session: sending ping");
                self.queue.push_control(WriteJob::Ping).await;
            }
            last_ping = Instant::now();
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if !self.established.load(Ordering::Acquire) {
            return;
        }
        self.manager.remove_session(self.variant, self.id);
        if let Some(hook) = self.manager.disconnect_hook() {
            hook(&SessionMeta {
                session_id: self.id,
                remote_address: self.remote_address.clone(),
            });
        }
        debug!(id = self.id, "server_session: destroyed");
    }
}
