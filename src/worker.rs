// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use tokio::{
    sync::{
        Mutex,
        mpsc::{UnboundedReceiver, unbounded_channel},
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::debug;

use crate::{
    engine::{self, Step},
    policy::Policy,
    proxy::ProxyCore,
    session::Session,
    stats::WorkerStats,
};

/// A worker's execution environment: the policy program it currently holds,
/// its stats block, and the per-run log ring. All request state lives on the
/// session's `ReqCtx`, never here.
pub struct Worker {
    pub id: usize,
    pub core: Arc<ProxyCore>,
    pub policy: Arc<dyn Policy>,
    pub stats: WorkerStats,
    log: Vec<(&'static str, String)>,
}

impl Worker {
    pub fn new(id: usize, core: Arc<ProxyCore>) -> Self {
        let policy = core.current_policy();
        Self {
            id,
            core,
            policy,
            stats: WorkerStats::default(),
            log: Vec::with_capacity(32),
        }
    }

    /// Appends a record to the log ring; flushed when the dispatcher exits.
    pub fn vlog(&mut self, tag: &'static str, msg: impl Into<String>) {
        self.log.push((tag, msg.into()));
    }

    pub fn flush_log(&mut self) {
        for (tag, msg) in self.log.drain(..) {
            debug!(worker = self.id, "{tag} {msg}");
        }
    }

    /// Folds worker counters into the globals once the request rate warrants.
    pub fn maybe_flush_stats(&mut self) {
        if self.stats.client_req >= self.core.cfg.threads.wthread_stats_rate {
            let core = Arc::clone(&self.core);
            core.stats.absorb(&mut self.stats);
        }
    }
}

/// Spawns the bounded worker pool. Workers pull runnable sessions from one
/// shared queue; the lock around the receiver serializes only the dequeue.
pub fn spawn_pool(core: &Arc<ProxyCore>) -> Vec<JoinHandle<()>> {
    let (tx, rx) = unbounded_channel::<Box<Session>>();
    core.attach_pool(tx);
    let rx = Arc::new(Mutex::new(rx));

    let n = core.cfg.threads.pool_size;
    let mut handles = Vec::with_capacity(n);
    for id in 0..n {
        handles.push(tokio::spawn(worker_loop(
            id,
            Arc::clone(core),
            Arc::clone(&rx),
        )));
    }
    handles
}

async fn worker_loop(
    id: usize,
    core: Arc<ProxyCore>,
    rx: Arc<Mutex<UnboundedReceiver<Box<Session>>>>,
) {
    let mut wrk = Worker::new(id, Arc::clone(&core));
    loop {
        let sess = tokio::select! {
            _ = core.cancel.cancelled() => break,
            s = async { rx.lock().await.recv().await } => match s {
                Some(s) => s,
                None => break,
            },
        };
        engine::run(&mut wrk, sess).await;
    }
    core.stats.absorb(&mut wrk.stats);
}

/// Hands an idle keep-alive session to the waiter: a small task that waits
/// for the socket to turn readable (or the idle timeout) and then requeues
/// the session with its step preserved as Wait.
pub fn park_on_waiter(mut sess: Box<Session>) {
    let core = Arc::clone(&sess.core);
    tokio::spawn(async move {
        let idle = core.cfg.timeouts.timeout_idle;
        tokio::select! {
            _ = core.cancel.cancelled() => {
                sess.htc.shutdown().await;
            },
            r = timeout(idle, sess.htc.wait_readable()) => match r {
                Ok(Ok(())) => {
                    sess.step = Step::Wait;
                    core.enqueue(sess);
                },
                _ => {
                    sess.htc.shutdown().await;
                    core.stats.sess_closed.fetch_add(1, Ordering::Relaxed);
                },
            },
        }
    });
}
