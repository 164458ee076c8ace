// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use tokio::{task::JoinHandle, time::interval};
use tracing::debug;

use crate::{
    cache::{index::CacheIndex, index::ObjCore, object::Object},
    proxy::ProxyCore,
    utils,
};

/// Registry of published cache entries, scanned by the reaper. Insertion
/// happens at unbusy time; entries leave when their ttl+grace+keep elapses.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    entries: Mutex<Vec<Arc<ObjCore>>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, core: Arc<ObjCore>) {
        if let Ok(mut g) = self.entries.lock() {
            g.push(core);
        }
    }

    /// LRU touch; suppressed by the engine inside `lru_timeout`.
    pub fn touch(&self, obj: &Object, now: f64) {
        obj.touch_lru(now);
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(g) => g.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts every matured entry, returning how many went.
    pub fn reap(&self, cache: &CacheIndex, now: f64) -> usize {
        let matured: Vec<Arc<ObjCore>> = match self.entries.lock() {
            Ok(mut g) => {
                let (gone, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *g)
                    .into_iter()
                    .partition(|c| now >= c.exp().reap_at());
                *g = keep;
                gone
            },
            Err(_) => Vec::new(),
        };
        let n = matured.len();
        for core in matured {
            cache.evict(&core);
        }
        n
    }
}

/// Background task sweeping the expiry index until shutdown.
pub fn spawn_reaper(core: Arc<ProxyCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(core.cfg.cache.reap_interval);
        loop {
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = tick.tick() => {
                    let n = core.exp.reap(&core.cache, utils::now());
                    if n > 0 {
                        debug!("expiry reaped {n} objects");
                    }
                }
            }
        }
    })
}
