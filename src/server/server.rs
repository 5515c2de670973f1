// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{net::TcpListener, sync::watch, task::JoinHandle, time::timeout};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::{
        config::{ServerConfig, ServerTimeouts, SessionConfig},
        constants::IO_TIMEOUT_SECS,
    },
    error::{Result, RpcError},
    server::context::{SessionContext, SessionInfo, SessionMeta},
};

use super::{
    listener::Listener,
    manager::SessionManager,
};

/// Public server facade.
///
/// Owns the session manager and the accept loop; `start()` runs until a
/// signal or [`Server::stop`], `async_start()` detaches the same loop onto
/// the runtime.
pub struct Server {
    server_timeout: ServerTimeouts,
    session_cfg: SessionConfig,
    manager: Arc<SessionManager>,
    tls: Option<TlsAcceptor>,
    cancel: Mutex<CancellationToken>,
    started: AtomicBool,
    state_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    run_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// A server accepting plain TCP connections.
    pub fn new(
        server_cfg: ServerConfig,
        server_timeout: ServerTimeouts,
        session_cfg: SessionConfig,
    ) -> Arc<Self> {
        Self::with_tls_opt(server_cfg, server_timeout, session_cfg, None)
    }

    /// A server accepting TLS (or, in `PlainTls` mode, both) through the
    /// given, already configured TLS context.
    pub fn new_tls(
        server_cfg: ServerConfig,
        server_timeout: ServerTimeouts,
        session_cfg: SessionConfig,
        tls: TlsAcceptor,
    ) -> Arc<Self> {
        Self::with_tls_opt(server_cfg, server_timeout, session_cfg, Some(tls))
    }

    fn with_tls_opt(
        server_cfg: ServerConfig,
        server_timeout: ServerTimeouts,
        session_cfg: SessionConfig,
        tls: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(false);
        Arc::new(Self {
            server_timeout,
            session_cfg,
            manager: Arc::new(SessionManager::new(server_cfg)),
            tls,
            cancel: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
            state_tx,
            local_addr: Mutex::new(None),
            run_worker: Mutex::new(None),
        })
    }

    /// Binds `handler` to `call_id` for inbound RPC frames. Only allowed
    /// while the server is down and connection-free.
    pub fn bind<F>(&self, call_id: u32, handler: F) -> Result<()>
    where
        F: Fn(&mut SessionContext<'_>) + Send + Sync + 'static,
    {
        self.manager.bind(call_id, Arc::new(handler))
    }

    /// Installs the accept hook consulted for every upgrade request.
    pub fn bind_accept<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&mut SessionInfo<'_>) -> bool + Send + Sync + 'static,
    {
        self.manager.bind_accept(Arc::new(handler))
    }

    /// Installs the listen hook consulted for every accepted socket.
    pub fn bind_listen<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.manager.bind_listen(Arc::new(handler))
    }

    /// Installs the hook fired when an established session is destroyed.
    pub fn bind_disconnect<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&SessionMeta) + Send + Sync + 'static,
    {
        self.manager.bind_disconnect(Arc::new(handler))
    }

    /// Runs the accept loop until `INT`/`TERM` or [`Server::stop`].
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::InvalidState("server is already running"));
        }
        let token = {
            let mut guard = self.cancel.lock().expect("cancel token poisoned");
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };
        self.manager.set_running(true);
        let _ = self.state_tx.send(true);

        let run = self.run_listener(token.clone()).await;

        token.cancel();
        self.manager.set_running(false);
        self.started.store(false, Ordering::Release);
        let _ = self.state_tx.send(false);
        run
    }

    async fn run_listener(&self, token: CancellationToken) -> Result<()> {
        let cfg = &self.manager.server_cfg;
        let listener = TcpListener::bind((cfg.host_address.as_str(), cfg.port)).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().expect("local addr poisoned") = Some(local);
        info!(%local, mode = %cfg.mode, "server: listening");

        let accept_loop = Arc::new(Listener {
            manager: Arc::clone(&self.manager),
            server_timeout: self.server_timeout.clone(),
            session_cfg: self.session_cfg.clone(),
            tls: self.tls.clone(),
            cancel: token.clone(),
        });

        tokio::select! {
            () = accept_loop.run(listener) => {},
            () = shutdown_signal() => {
                info!("server: shutdown signal received");
            },
        }
        Ok(())
    }

    /// Detaches the accept loop onto the runtime and returns immediately.
    /// `on_stopped` fires once the loop has fully wound down.
    pub fn async_start(
        self: &Arc<Self>,
        on_stopped: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let server = Arc::clone(self);
        let worker = tokio::spawn(async move {
            if let Err(e) = server.start().await {
                warn!("server: run loop ended: {e}");
            }
            if let Some(cb) = on_stopped {
                cb();
            }
        });
        *self.run_worker.lock().expect("run worker poisoned") = Some(worker);
    }

    /// Stops the accept loop and tears down every session. Idempotent;
    /// waits until the run loop has fully wound down.
    pub async fn stop(&self) {
        self.cancel.lock().expect("cancel token poisoned").cancel();
        let mut state = self.state_tx.subscribe();
        while *state.borrow() {
            if state.changed().await.is_err() {
                break;
            }
        }
        let worker = self.run_worker.lock().expect("run worker poisoned").take();
        if let Some(worker) = worker {
            if timeout(Duration::from_secs(IO_TIMEOUT_SECS), worker)
                .await
                .is_err()
            {
                warn!("server: run worker did not wind down in time");
            }
        }
    }

    /// Fans `payload` out to every live session.
    pub async fn broadcast(&self, call_id: u32, payload: &[u8]) -> Result<()> {
        self.manager.broadcast(call_id, payload, None).await
    }

    /// Fans `payload` out to the sessions named in `session_ids` only.
    pub async fn broadcast_to(
        &self,
        call_id: u32,
        payload: &[u8],
        session_ids: &[u64],
    ) -> Result<()> {
        self.manager.broadcast(call_id, payload, Some(session_ids)).await
    }

    /// The number of currently registered, post-handshake sessions.
    pub fn connections(&self) -> i64 {
        self.manager.connections()
    }

    /// Ids of all live sessions.
    pub fn get_session_ids(&self) -> Vec<u64> {
        self.manager.get_session_ids()
    }

    /// The bound listen address once the server runs; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr poisoned")
    }
}

/// Resolves when the process receives `INT` or `TERM`.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!("server: cannot install SIGINT handler: {e}");
                std::future::pending::<()>().await;
                return;
            },
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("server: cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
                return;
            },
        };
        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
