// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Storage pool selector. `Transient` is the uncached overflow pool used for
/// shortlived and pass objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageHint {
    Default,
    Transient,
}

/// A byte-budgeted allocation pool. cap == 0 means unlimited.
#[derive(Debug)]
pub struct StoragePool {
    pub name: &'static str,
    cap: u64,
    used: AtomicU64,
}

impl StoragePool {
    pub fn new(name: &'static str, cap: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            cap,
            used: AtomicU64::new(0),
        })
    }

    /// Charges `n` bytes against the budget; false when it would overflow.
    pub fn try_charge(&self, n: u64) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(n);
            if self.cap != 0 && next > self.cap {
                return false;
            }
            match self.used.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(v) => cur = v,
            }
        }
    }

    pub fn release(&self, n: u64) {
        self.used.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

/// The two process-wide pools plus the live-object gauge.
#[derive(Debug)]
pub struct Storage {
    pub default_pool: Arc<StoragePool>,
    pub transient_pool: Arc<StoragePool>,
    pub n_object: Arc<AtomicU64>,
}

impl Storage {
    pub fn new(default_cap: u64) -> Self {
        Self {
            default_pool: StoragePool::new("default", default_cap),
            transient_pool: StoragePool::new("transient", 0),
            n_object: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pool(&self, hint: StorageHint) -> Arc<StoragePool> {
        match hint {
            StorageHint::Default => Arc::clone(&self.default_pool),
            StorageHint::Transient => Arc::clone(&self.transient_pool),
        }
    }
}
