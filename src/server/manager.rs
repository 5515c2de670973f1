// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, RwLock, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    cfg::{
        config::ServerConfig,
        constants::{MAX_CALL_ID, QUEUE_SEND_MAX},
    },
    core::push::Push,
    error::{Result, RpcError},
};

use super::{
    context::{SessionContext, SessionInfo, SessionMeta},
    session::{ServerSession, TransportVariant},
};

/// Handler bound to a call id, dispatched on the session's read worker.
pub type RpcHandler = Arc<dyn Fn(&mut SessionContext<'_>) + Send + Sync>;
/// Hook deciding whether a handshake-read connection is admitted.
pub type AcceptHandler = Arc<dyn Fn(&mut SessionInfo<'_>) -> bool + Send + Sync>;
/// Hook deciding whether a freshly accepted socket is kept.
pub type ListenHandler = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// Hook invoked when an established session is destroyed.
pub type DisconnectHandler = Arc<dyn Fn(&SessionMeta) + Send + Sync>;

/// Process-wide registry of live sessions plus the handler tables shared by
/// all of them.
///
/// Sessions are held weakly, one map per transport variant, so the registry
/// never extends a session's life past its I/O.
pub struct SessionManager {
    pub(crate) server_cfg: ServerConfig,
    plain_sessions: DashMap<u64, Weak<ServerSession>>,
    tls_sessions: DashMap<u64, Weak<ServerSession>>,
    pending_broadcasts: Arc<AtomicUsize>,
    handlers: RwLock<Box<[Option<RpcHandler>]>>,
    on_accept: RwLock<Option<AcceptHandler>>,
    on_listen: RwLock<Option<ListenHandler>>,
    on_disconnect: RwLock<Option<DisconnectHandler>>,
    running: AtomicBool,
}

impl SessionManager {
    pub fn new(server_cfg: ServerConfig) -> Self {
        let handlers: Box<[Option<RpcHandler>]> =
            (0..MAX_CALL_ID).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            server_cfg,
            plain_sessions: DashMap::new(),
            tls_sessions: DashMap::new(),
            pending_broadcasts: Arc::new(AtomicUsize::new(0)),
            handlers: RwLock::new(handlers),
            on_accept: RwLock::new(None),
            on_listen: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn refuse_while_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) || self.connections() != 0 {
            return Err(RpcError::InvalidState(
                "handlers can only be bound while the server is down",
            ));
        }
        Ok(())
    }

    /// Binds a handler to `call_id`. Allowed only while the server is not
    /// running and has no connections; rebinding an id is an error.
    pub fn bind(&self, call_id: u32, handler: RpcHandler) -> Result<()> {
        self.refuse_while_running()?;
        if call_id >= MAX_CALL_ID {
            return Err(RpcError::InvalidState("call id is out of bounds"));
        }
        let mut handlers = self.handlers.write().expect("handler table poisoned");
        let slot = &mut handlers[call_id as usize];
        if slot.is_some() {
            return Err(RpcError::HandlerExists(call_id));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn bind_accept(&self, handler: AcceptHandler) -> Result<()> {
        self.refuse_while_running()?;
        *self.on_accept.write().expect("hook slot poisoned") = Some(handler);
        Ok(())
    }

    pub fn bind_listen(&self, handler: ListenHandler) -> Result<()> {
        self.refuse_while_running()?;
        *self.on_listen.write().expect("hook slot poisoned") = Some(handler);
        Ok(())
    }

    pub fn bind_disconnect(&self, handler: DisconnectHandler) -> Result<()> {
        self.refuse_while_running()?;
        *self.on_disconnect.write().expect("hook slot poisoned") = Some(handler);
        Ok(())
    }

    pub(crate) fn handler(&self, call_id: u32) -> Option<RpcHandler> {
        if call_id >= MAX_CALL_ID {
            return None;
        }
        self.handlers.read().expect("handler table poisoned")[call_id as usize].clone()
    }

    pub(crate) fn accept_hook(&self) -> Option<AcceptHandler> {
        self.on_accept.read().expect("hook slot poisoned").clone()
    }

    pub(crate) fn listen_hook(&self) -> Option<ListenHandler> {
        self.on_listen.read().expect("hook slot poisoned").clone()
    }

    pub(crate) fn disconnect_hook(&self) -> Option<DisconnectHandler> {
        self.on_disconnect.read().expect("hook slot poisoned").clone()
    }

    fn map_for(&self, variant: TransportVariant) -> &DashMap<u64, Weak<ServerSession>> {
        match variant {
            TransportVariant::Plain => &self.plain_sessions,
            TransportVariant::Tls => &self.tls_sessions,
        }
    }

    pub(crate) fn add_session(&self, session: &Arc<ServerSession>) {
        self.map_for(session.variant())
            .insert(session.id(), Arc::downgrade(session));
    }

    pub(crate) fn remove_session(&self, variant: TransportVariant, id: u64) {
        self.map_for(variant).remove(&id);
    }

    /// The number of currently registered, post-handshake sessions.
    pub fn connections(&self) -> i64 {
        let alive = |map: &DashMap<u64, Weak<ServerSession>>| {
            map.iter().filter(|e| e.value().strong_count() > 0).count() as i64
        };
        alive(&self.plain_sessions) + alive(&self.tls_sessions)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.connections() >= i64::from(self.server_cfg.max_sessions)
    }

    /// Ids of all live sessions across both transport variants.
    pub fn get_session_ids(&self) -> Vec<u64> {
        let mut ids =
            Vec::with_capacity(self.plain_sessions.len() + self.tls_sessions.len());
        for map in [&self.plain_sessions, &self.tls_sessions] {
            for entry in map.iter() {
                if entry.value().strong_count() > 0 {
                    ids.push(*entry.key());
                }
            }
        }
        ids
    }

    /// Fans a frame out to every live session, or to `target_ids` only.
    ///
    /// One shared [`Push`] carries the payload to all recipients; its release
    /// decrements the pending-broadcast counter that provides back-pressure.
    /// The session maps are only touched to snapshot (id, weak) pairs; no
    /// application-visible code runs under a map lock.
    pub async fn broadcast(
        &self,
        call_id: u32,
        payload: &[u8],
        target_ids: Option<&[u64]>,
    ) -> Result<()> {
        if self.pending_broadcasts.load(Ordering::Acquire) >= QUEUE_SEND_MAX {
            debug!("manager: broadcast queue is full");
            return Err(RpcError::QueueFull);
        }
        if self.connections() == 0 {
            return Ok(());
        }

        self.pending_broadcasts.fetch_add(1, Ordering::AcqRel);
        let push = Arc::new(Push::broadcast(
            call_id,
            payload,
            Arc::clone(&self.pending_broadcasts),
        ));

        for map in [&self.plain_sessions, &self.tls_sessions] {
            let snapshot: Vec<Weak<ServerSession>> = match target_ids {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| map.get(id).map(|e| e.value().clone()))
                    .collect(),
                None => map.iter().map(|e| e.value().clone()).collect(),
            };
            for weak in snapshot {
                if let Some(session) = weak.upgrade() {
                    session.send_shared(Arc::clone(&push)).await;
                }
            }
        }
        Ok(())
    }
}
