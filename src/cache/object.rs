// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Result, bail};
use bytes::Bytes;

use crate::{
    body::esi::EsiSeg,
    cache::storage::{Storage, StorageHint, StoragePool},
    http::msg::HttpMsg,
};

/// Object lifetime bookkeeping. `ttl < 0` marks an object that must never be
/// served from cache (pass fetches).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpSpec {
    pub entered: f64,
    pub ttl: f64,
    pub grace: f64,
    pub keep: f64,
}

impl ExpSpec {
    /// Usable for a cache hit right now.
    pub fn fresh(&self, now: f64) -> bool {
        self.ttl >= 0.0 && now < self.entered + self.ttl
    }

    /// Instant after which the reaper may remove the entry. Grace and keep
    /// delay eviction but never extend hit freshness.
    pub fn reap_at(&self) -> f64 {
        self.entered + self.ttl.max(0.0) + self.grace.max(0.0) + self.keep.max(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lru {
    pub last_use: f64,
    pub last_lru: f64,
}

/// A cached (or in-flight) response artifact.
///
/// Exclusively owned by the fetching session while its ObjCore is BUSY; the
/// `Arc` wrap happens at publish time, after which everything but the LRU
/// block is immutable. Body bytes are stored as the chunk list the fetch
/// pipeline produced.
#[derive(Debug)]
pub struct Object {
    pub xid: u64,
    pub response: u16,
    pub http: HttpMsg,
    pub last_modified: f64,
    pub gziped: bool,
    pub vary: Option<Vec<u8>>,
    pub esidata: Option<Vec<EsiSeg>>,
    body: Vec<Bytes>,
    len: u64,
    charged: u64,
    pool: Arc<StoragePool>,
    n_gauge: Arc<AtomicU64>,
    lru: Mutex<Lru>,
}

impl Object {
    /// Allocates an empty object, charging the header estimate against the
    /// chosen pool. None when the pool budget is exhausted.
    pub fn alloc(
        storage: &Storage,
        hint: StorageHint,
        hdr_estimate: u64,
        now: f64,
    ) -> Option<Object> {
        let pool = storage.pool(hint);
        if !pool.try_charge(hdr_estimate) {
            return None;
        }
        storage.n_object.fetch_add(1, Ordering::Relaxed);
        Some(Object {
            xid: 0,
            response: 0,
            http: HttpMsg::default(),
            last_modified: f64::NAN,
            gziped: false,
            vary: None,
            esidata: None,
            body: Vec::new(),
            len: 0,
            charged: hdr_estimate,
            pool,
            n_gauge: Arc::clone(&storage.n_object),
            lru: Mutex::new(Lru {
                last_use: now,
                last_lru: now,
            }),
        })
    }

    pub fn is_transient(&self) -> bool {
        self.pool.name == "transient"
    }

    /// Appends a body chunk, charging the pool. Fails when the pool budget
    /// runs out mid-fetch.
    pub fn append_chunk(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let n = chunk.len() as u64;
        if !self.pool.try_charge(n) {
            bail!("storage pool '{}' exhausted", self.pool.name);
        }
        self.charged += n;
        self.len += n;
        self.body.push(chunk);
        Ok(())
    }

    pub fn body_chunks(&self) -> &[Bytes] {
        &self.body
    }

    /// Contiguous copy of the body (ESI parsing, tests).
    pub fn body_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for c in &self.body {
            out.extend_from_slice(c);
        }
        out
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Collapses the chunk list into one contiguous chunk so byte offsets
    /// (ESI segment spans) index the body directly.
    pub fn reassemble(&mut self) {
        if self.body.len() <= 1 {
            return;
        }
        let joined = Bytes::from(self.body_vec());
        self.body.clear();
        self.body.push(joined);
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lru(&self) -> Lru {
        match self.lru.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn touch_lru(&self, now: f64) {
        if let Ok(mut g) = self.lru.lock() {
            g.last_lru = now;
        }
    }

    pub fn touch_use(&self, now: f64) {
        if let Ok(mut g) = self.lru.lock() {
            g.last_use = now;
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.pool.release(self.charged);
        self.n_gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
