// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    mem,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tracing::debug;

use crate::error::{Result, RpcError};

type DropCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Created, nobody parked on it yet.
    Queued,
    /// A consumer is parked on the entry.
    Waiting,
    /// The reply arrived (or the cache was bulk-cleared).
    Swapped,
}

struct EntryState {
    phase: Phase,
    buffer: Bytes,
}

/// Bookkeeping slot for one outstanding request.
struct CacheEntry {
    created_at: Instant,
    ttl: Duration,
    state: Mutex<EntryState>,
    arrived: Notify,
    on_drop: std::sync::Mutex<Option<DropCallback>>,
}

impl CacheEntry {
    fn new(ttl: Duration, on_drop: Option<DropCallback>) -> Self {
        Self {
            created_at: Instant::now(),
            ttl,
            state: Mutex::new(EntryState {
                phase: Phase::Queued,
                buffer: Bytes::new(),
            }),
            arrived: Notify::new(),
            on_drop: std::sync::Mutex::new(on_drop),
        }
    }

    fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        if let Ok(slot) = self.on_drop.get_mut() {
            if let Some(cb) = slot.take() {
                cb();
            }
        }
    }
}

struct CacheInner {
    id_counter: u64,
    entries: HashMap<u64, Arc<CacheEntry>>,
}

/// Correlation registry for outstanding `send_recv` calls.
///
/// Two-level locking: the registry mutex guards the id map, each entry has
/// its own state mutex. Lock order is strictly registry before entry, and
/// the registry lock is never held across a wait.
pub struct ResponseCache {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(CacheInner {
                id_counter: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Allocates an empty entry to be filled later by [`Self::swap_notify`]
    /// and returns its non-zero id. `ttl` bounds how long the entry may
    /// linger in the cache without a waiter.
    pub async fn queue(&self, ttl: Duration) -> Result<u64> {
        self.insert(ttl, None).await
    }

    /// Same as [`Self::queue`], with a callback invoked when the entry is
    /// finally released.
    pub async fn queue_with(
        &self,
        ttl: Duration,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Result<u64> {
        self.insert(ttl, Some(Box::new(on_drop))).await
    }

    async fn insert(&self, ttl: Duration, on_drop: Option<DropCallback>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.max_entries {
            return Err(RpcError::QueueFull);
        }
        inner.id_counter += 1;
        let id = inner.id_counter;
        inner.entries.insert(id, Arc::new(CacheEntry::new(ttl, on_drop)));
        debug!(id, "cache: queued entry");
        Ok(id)
    }

    /// Waits for the data queued under `id`.
    ///
    /// Returns `None` for an unknown id or on timeout; `Some` with the
    /// received buffer otherwise. A bulk-cancelled entry yields an empty
    /// buffer, which is how cancelled waiters are told apart from replies.
    pub async fn wait(&self, id: u64, timeout: Duration) -> Option<Bytes> {
        let entry = {
            let mut inner = self.inner.lock().await;
            let entry = inner.entries.get(&id)?.clone();
            {
                let mut st = entry.state.lock().await;
                if st.phase == Phase::Swapped {
                    // The swap beat us; consume without parking.
                    let buf = mem::take(&mut st.buffer);
                    drop(st);
                    inner.entries.remove(&id);
                    return Some(buf);
                }
                st.phase = Phase::Waiting;
            }
            entry
        };

        match tokio::time::timeout(timeout, entry.arrived.notified()).await {
            Ok(()) => {
                let mut st = entry.state.lock().await;
                Some(mem::take(&mut st.buffer))
            },
            Err(_) => {
                debug!(id, "cache: wait timed out");
                None
            },
        }
    }

    /// Moves a received buffer into the entry and wakes its waiter if one is
    /// parked. If the swap beats the waiter, the entry stays registered so
    /// the waiter observes the swapped state on its own path.
    pub async fn swap_notify(&self, id: u64, buffer: Bytes) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get(&id).cloned() else {
            debug!(id, "cache: swap for unknown id");
            return;
        };
        let prev = {
            let mut st = entry.state.lock().await;
            let prev = st.phase;
            st.buffer = buffer;
            st.phase = Phase::Swapped;
            prev
        };
        if prev == Phase::Waiting {
            inner.entries.remove(&id);
            entry.arrived.notify_one();
        }
    }

    /// Evicts entries whose TTL elapsed and that have no parked waiter.
    pub async fn remove_obsolete(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|_, entry| match entry.state.try_lock() {
            Ok(st) => !(st.phase != Phase::Waiting && entry.expired()),
            // Entry lock contended means someone is touching it right now.
            Err(_) => true,
        });
    }

    /// Forces every entry to the swapped state with an empty buffer and
    /// wakes all waiters. Used on session teardown so parked callers return
    /// promptly with an empty result.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        for (_, entry) in inner.entries.drain() {
            {
                let mut st = entry.state.lock().await;
                st.phase = Phase::Swapped;
                st.buffer = Bytes::new();
            }
            entry.arrived.notify_one();
        }
    }

    /// Current registry cardinality.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}
