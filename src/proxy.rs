// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tokio::{net::TcpListener, sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    backend::{director::Director, io::Backend},
    cache::{expiry::ExpiryIndex, index::CacheIndex, storage::Storage},
    cfg::config::Config,
    policy::Policy,
    session::Session,
    stats::GlobalStats,
};

/// Process-wide shared state: configuration, the cache and its collaborators,
/// backends, counters, and the live policy program. Sessions and workers both
/// hold an `Arc` of this.
#[derive(Debug)]
pub struct ProxyCore {
    pub cfg: Config,
    pub cache: CacheIndex,
    pub exp: ExpiryIndex,
    pub storage: Storage,
    pub backends: Vec<Arc<Backend>>,
    pub director: Director,
    pub stats: GlobalStats,
    policy: Mutex<Arc<dyn Policy>>,
    pool_tx: OnceCell<UnboundedSender<Box<Session>>>,
    pub cancel: CancellationToken,
}

impl ProxyCore {
    pub fn new(cfg: Config, policy: Arc<dyn Policy>) -> Arc<Self> {
        let backends = cfg.net.backends.iter().map(|b| Arc::new(Backend::new(b))).collect();
        let director = Director::new(cfg.net.director);
        let storage = Storage::new(cfg.cache.storage_size);
        Arc::new(Self {
            cache: CacheIndex::new(),
            exp: ExpiryIndex::new(),
            storage,
            backends,
            director,
            stats: GlobalStats::default(),
            policy: Mutex::new(policy),
            pool_tx: OnceCell::new(),
            cancel: CancellationToken::new(),
            cfg,
        })
    }

    /// Must be called once when the worker pool is spawned.
    pub fn attach_pool(&self, tx: UnboundedSender<Box<Session>>) {
        let _ = self.pool_tx.set(tx);
    }

    /// The policy program new requests attach to.
    pub fn current_policy(&self) -> Arc<dyn Policy> {
        match self.policy.lock() {
            Ok(g) => Arc::clone(&g),
            Err(p) => Arc::clone(&p.into_inner()),
        }
    }

    /// Swaps the live policy; in-flight requests finish on the one they hold.
    pub fn set_policy(&self, p: Arc<dyn Policy>) {
        if let Ok(mut g) = self.policy.lock() {
            *g = p;
        }
    }

    /// Hands a runnable session (back) to the worker pool, preserving its
    /// step. Used by the acceptor, the waiter, and busy-list wakeups.
    pub fn enqueue(&self, sess: Box<Session>) {
        let Some(tx) = self.pool_tx.get() else {
            warn!("session dropped: worker pool not attached");
            return;
        };
        if tx.send(sess).is_err() {
            warn!("session dropped: worker pool gone");
        }
    }
}

/// Binds the listener, spawns the worker pool, the expiry reaper, and the
/// acceptor. Returns the bound address (the config may say port 0).
pub async fn bind_and_serve(core: Arc<ProxyCore>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(&core.cfg.net.listen)
        .await
        .with_context(|| format!("bind {}", core.cfg.net.listen))?;
    let addr = listener.local_addr()?;

    crate::worker::spawn_pool(&core);
    crate::cache::expiry::spawn_reaper(Arc::clone(&core));

    let accept_core = Arc::clone(&core);
    let handle = tokio::spawn(async move {
        accept_loop(accept_core, listener).await;
    });
    info!("listening on {addr}");
    Ok((addr, handle))
}

async fn accept_loop(core: Arc<ProxyCore>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let sess = Session::new(Arc::clone(&core), stream, peer);
                    core.enqueue(sess);
                },
                Err(e) => {
                    warn!("accept failed: {e}");
                },
            },
        }
    }
}
