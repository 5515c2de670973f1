// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, oneshot};

use crate::core::push::Push;

/// One queued outbound item, consumed by the session's write worker.
pub enum WriteJob {
    /// A client frame with an optional completion promise; `true` is sent
    /// once the frame reached the sink, `false` when the queue is cleared.
    Frame {
        frame: Bytes,
        done: Option<oneshot::Sender<bool>>,
    },
    /// A shared response/broadcast frame.
    Push(Arc<Push>),
    /// WebSocket ping control frame.
    Ping,
    /// Initiate the closing handshake; the write worker exits after sending.
    Close,
}

/// Bounded FIFO of pending outbound frames.
///
/// A deque so entries could be prioritized later. Data entries respect the
/// bound; control entries (ping, close) bypass it. The queue is drained by a
/// single write worker, which keeps at most one write in flight per session,
/// so enqueue order equals on-wire order.
pub struct WriteQueue {
    max_entries: usize,
    entries: Mutex<VecDeque<WriteJob>>,
    ready: Notify,
}

impl WriteQueue {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Queues a client frame. Returns false when the queue is full; the
    /// caller aborts without touching the wire.
    pub async fn push_frame(&self, frame: Bytes, done: oneshot::Sender<bool>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries {
            return false;
        }
        entries.push_back(WriteJob::Frame {
            frame,
            done: Some(done),
        });
        drop(entries);
        self.ready.notify_one();
        true
    }

    /// Queues a shared response/broadcast frame. Returns false when full.
    pub async fn push_shared(&self, push: Arc<Push>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries {
            return false;
        }
        entries.push_back(WriteJob::Push(push));
        drop(entries);
        self.ready.notify_one();
        true
    }

    /// Queues a control frame regardless of the data bound.
    pub async fn push_control(&self, job: WriteJob) {
        self.entries.lock().await.push_back(job);
        self.ready.notify_one();
    }

    /// Takes the next entry, waiting until one is available.
    pub async fn pop(&self) -> WriteJob {
        loop {
            let ready = self.ready.notified();
            if let Some(job) = self.entries.lock().await.pop_front() {
                return job;
            }
            ready.await;
        }
    }

    /// Drains the queue, resolving every pending completion promise with
    /// `false`. Used on session teardown.
    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        for job in entries.drain(..) {
            if let WriteJob::Frame {
                done: Some(done), ..
            } = job
            {
                let _ = done.send(false);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
