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
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::constants::{MAX_CALL_ID, QUEUE_RECV_MAX, QUEUE_SEND_MAX},
    core::{
        cache::ResponseCache,
        queue::{WriteJob, WriteQueue},
    },
    error::{Result, RpcError},
    proto::{header, transport::ClientTransport},
};

/// Handler invoked for server-initiated broadcast frames. Receives the
/// payload borrowed from the session's receive path.
pub type BroadcastHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// Direct-indexed listener table, frozen for the lifetime of a session.
pub type BroadcastTable = Box<[Option<BroadcastHandler>]>;

pub(crate) type WsSink = SplitSink<WebSocketStream<ClientTransport>, Message>;
pub(crate) type WsSource = SplitStream<WebSocketStream<ClientTransport>>;

struct PingState {
    in_flight: bool,
    pong: bool,
}

/// Per-connection data plane of the client.
///
/// One read worker and one write worker own the two stream halves; all other
/// threads interact through the cache, the queue and the status flags.
pub struct ClientSession {
    pub(crate) cache: ResponseCache,
    pub(crate) queue: WriteQueue,
    ping: Mutex<PingState>,
    pong_notify: Notify,
    pub(crate) close_initiated: AtomicBool,
    pub(crate) close_received: AtomicBool,
    pub(crate) read_error: AtomicBool,
    pub(crate) write_error: AtomicBool,
    handlers: Arc<BroadcastTable>,
    pub(crate) cancel: CancellationToken,
}

impl ClientSession {
    pub(crate) fn new(handlers: Arc<BroadcastTable>) -> Self {
        Self {
            cache: ResponseCache::new(QUEUE_RECV_MAX),
            queue: WriteQueue::new(QUEUE_SEND_MAX),
            ping: Mutex::new(PingState {
                in_flight: false,
                pong: false,
            }),
            pong_notify: Notify::new(),
            close_initiated: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            read_error: AtomicBool::new(false),
            write_error: AtomicBool::new(false),
            handlers,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the session can still accept operations.
    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
            && !self.close_initiated.load(Ordering::Acquire)
            && !self.close_received.load(Ordering::Acquire)
            && !self.read_error.load(Ordering::Acquire)
            && !self.write_error.load(Ordering::Acquire)
    }

    fn refuse_if_closing(&self) -> Result<()> {
        if self.close_received.load(Ordering::Acquire) {
            return Err(RpcError::RemoteClosed);
        }
        if !self.is_alive() {
            return Err(RpcError::NotConnected);
        }
        Ok(())
    }

    /// Sends a fire-and-forget frame and waits until it reached the wire.
    ///
    /// On `TimedOut` the outgoing frame may still be queued; the facade must
    /// tear the session down before retrying.
    pub async fn send(
        &self,
        call_id: u32,
        payload: &[u8],
        send_timeout: Duration,
    ) -> Result<()> {
        self.refuse_if_closing()?;
        let frame = header::encode_frame(call_id, 0, payload);
        let (done, written) = oneshot::channel();
        if !self.queue.push_frame(frame, done).await {
            return Err(RpcError::QueueFull);
        }
        debug!(call_id, bytes = payload.len(), "session: send queued");
        self.await_written(written, send_timeout).await
    }

    /// Sends a request frame and waits for the correlated response.
    ///
    /// An empty buffer without an error means the session was torn down
    /// while the call was parked; callers tell the cases apart by
    /// `buffer.is_empty()`.
    pub async fn send_recv(
        &self,
        call_id: u32,
        payload: &[u8],
        send_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Bytes> {
        self.refuse_if_closing()?;
        // The entry outlives the waiter long enough for a late reply to be
        // matched instead of mistaken for a new one.
        let result_id = self.cache.queue(response_timeout * 2).await?;
        let frame = header::encode_frame(call_id, result_id, payload);
        let (done, written) = oneshot::channel();
        if !self.queue.push_frame(frame, done).await {
            return Err(RpcError::QueueFull);
        }
        debug!(
            call_id,
            result_id,
            bytes = payload.len(),
            "session: send_recv queued"
        );
        self.await_written(written, send_timeout).await?;

        match self.cache.wait(result_id, response_timeout).await {
            Some(buffer) => Ok(buffer),
            None => Err(RpcError::TimedOut),
        }
    }

    /// Pings the server and waits for the pong.
    pub async fn ping(&self, response_timeout: Duration) -> bool {
        if self.refuse_if_closing().is_err() {
            return false;
        }
        {
            let mut st = self.ping.lock().await;
            if st.in_flight {
                return false;
            }
            st.in_flight = true;
            st.pong = false;
        }
        self.queue.push_control(WriteJob::Ping).await;

        // Predicate-guarded wait: stale wakeups re-check the pong flag.
        let deadline = tokio::time::Instant::now() + response_timeout;
        let pong = loop {
            let notified = self.pong_notify.notified();
            if self.ping.lock().await.pong {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("session: ping timeout");
                break false;
            }
        };
        self.ping.lock().await.in_flight = false;
        pong
    }

    async fn await_written(
        &self,
        written: oneshot::Receiver<bool>,
        send_timeout: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(send_timeout, written).await {
            Ok(Ok(true)) => Ok(()),
            // Queue was cleared underneath us: the session failed while the
            // frame was pending.
            Ok(Ok(false)) | Ok(Err(_)) => {
                Err(RpcError::Transport("session closed while sending".into()))
            },
            Err(_) => {
                debug!("session: timeout on send");
                Err(RpcError::TimedOut)
            },
        }
    }

    /// Latches the closing state and cancels both workers.
    pub(crate) fn close_session(&self) {
        if self.close_initiated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }

    /// Read worker: consumes every inbound frame until error, close or
    /// cancellation, then releases all parked waiters.
    pub(crate) async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = source.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    self.dispatch_frame(data).await;
                },
                Some(Ok(Message::Pong(_))) => {
                    debug!("session: pong received");
                    let mut st = self.ping.lock().await;
                    st.pong = true;
                    drop(st);
                    self.pong_notify.notify_one();
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("session: close received");
                    // Any further close initiation is suppressed; the
                    // stream finishes its own closing handshake.
                    self.close_received.store(true, Ordering::Release);
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    if !self.close_received.load(Ordering::Acquire)
                        && !self.close_initiated.load(Ordering::Acquire)
                    {
                        warn!("session: read error: {e}");
                        self.read_error.store(true, Ordering::Release);
                    }
                    break;
                },
                None => {
                    if !self.close_received.load(Ordering::Acquire)
                        && !self.close_initiated.load(Ordering::Acquire)
                    {
                        debug!("session: stream ended");
                        self.read_error.store(true, Ordering::Release);
                    }
                    break;
                },
            }
        }
        // Wake every parked waiter with an empty result and stop the writer.
        self.cache.clear().await;
        self.queue.clear().await;
        self.cancel.cancel();
    }

    async fn dispatch_frame(&self, frame: Bytes) {
        let (hdr, payload) = match header::split_frame(&frame) {
            Ok(parts) => parts,
            Err(_) => {
                debug!(bytes = frame.len(), "session: invalid buffer, frame dropped");
                return;
            },
        };
        if hdr.result_id() != 0 {
            self.cache.swap_notify(hdr.result_id(), payload).await;
        } else if hdr.call_id() >= MAX_CALL_ID {
            debug!(call_id = hdr.call_id(), "session: call id is out of bounds");
        } else if let Some(handler) = &self.handlers[hdr.call_id() as usize] {
            handler(&payload);
        } else {
            debug!(
                call_id = hdr.call_id(),
                "session: call id was not bound to any listener"
            );
        }
        self.cache.remove_obsolete().await;
    }

    /// Write worker: keeps at most one write in flight and resolves each
    /// entry's completion promise once its frame reached the sink.
    pub(crate) async fn write_loop(self: Arc<Self>, mut sink: WsSink) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.queue.pop() => job,
            };
            match job {
                WriteJob::Frame { frame, done } => {
                    let res = sink.send(Message::Binary(frame)).await;
                    match res {
                        Ok(()) => {
                            if let Some(done) = done {
                                let _ = done.send(true);
                            }
                        },
                        Err(e) => {
                            warn!("session: write error: {e}");
                            self.write_error.store(true, Ordering::Release);
                            if let Some(done) = done {
                                let _ = done.send(false);
                            }
                            break;
                        },
                    }
                },
                WriteJob::Push(push) => {
                    if let Err(e) = sink.send(Message::Binary(push.frame())).await {
                        warn!("session: write error: {e}");
                        self.write_error.store(true, Ordering::Release);
                        break;
                    }
                },
                WriteJob::Ping => {
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        warn!("session: ping write error: {e}");
                        self.write_error.store(true, Ordering::Release);
                        break;
                    }
                },
                WriteJob::Close => {
                    // Best effort closing handshake; the read worker sees
                    // the peer's echo or EOF and finishes teardown.
                    if !self.close_received.load(Ordering::Acquire) {
                        let _ = sink.send(Message::Close(None)).await;
                    }
                    break;
                },
            }
        }
        self.queue.clear().await;
        self.close_session();
    }
}
