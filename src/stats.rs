// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counter block. Cheap plain integers on the hot path, absorbed
/// into [`GlobalStats`] every `wthread_stats_rate` requests and when the
/// worker retires.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub sess_accepted: u64,
    pub sess_closed: u64,
    pub sess_readahead: u64,
    pub sess_linger: u64,
    pub sess_herd: u64,
    pub client_req: u64,
    pub cache_hit: u64,
    pub cache_hitpass: u64,
    pub cache_miss: u64,
    pub backend_req: u64,
    pub backend_retry: u64,
    pub fetch_failed: u64,
    pub s_pipe: u64,
    pub s_pass: u64,
    pub s_bodybytes: u64,
}

impl WorkerStats {
    pub fn is_zero(&self) -> bool {
        self.client_req == 0
            && self.sess_accepted == 0
            && self.sess_closed == 0
            && self.s_bodybytes == 0
    }
}

/// Process-wide counters, updated only through `absorb`.
#[derive(Debug, Default)]
pub struct GlobalStats {
    pub sess_accepted: AtomicU64,
    pub sess_closed: AtomicU64,
    pub sess_readahead: AtomicU64,
    pub sess_linger: AtomicU64,
    pub sess_herd: AtomicU64,
    pub client_req: AtomicU64,
    pub cache_hit: AtomicU64,
    pub cache_hitpass: AtomicU64,
    pub cache_miss: AtomicU64,
    pub backend_req: AtomicU64,
    pub backend_retry: AtomicU64,
    pub fetch_failed: AtomicU64,
    pub s_pipe: AtomicU64,
    pub s_pass: AtomicU64,
    pub s_bodybytes: AtomicU64,
    pub n_object: AtomicU64,
}

impl GlobalStats {
    /// Folds a worker block into the globals and zeroes it.
    pub fn absorb(&self, w: &mut WorkerStats) {
        macro_rules! fold {
            ($g:expr, $w:expr, $($f:ident),+) => {
                $($g.$f.fetch_add($w.$f, Ordering::Relaxed);)+
            };
        }
        fold!(
            self,
            w,
            sess_accepted,
            sess_closed,
            sess_readahead,
            sess_linger,
            sess_herd,
            client_req,
            cache_hit,
            cache_hitpass,
            cache_miss,
            backend_req,
            backend_retry,
            fetch_failed,
            s_pipe,
            s_pass,
            s_bodybytes
        );
        *w = WorkerStats::default();
    }

    pub fn object_created(&self) {
        self.n_object.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_destroyed(&self) {
        self.n_object.fetch_sub(1, Ordering::Relaxed);
    }
}
