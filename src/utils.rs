// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use rand::{RngExt, SeedableRng, rngs::StdRng};

/// Process-wide request id counter. Seeded from a random source once so ids
/// stay unique across daemon restarts; wrap-around is harmless (ids are only
/// logged). 0 is reserved for "no active request".
static XID: Lazy<AtomicU64> =
    Lazy::new(|| AtomicU64::new(rand::rng().random::<u64>() | 1));

/// Allocates the next request id. Never returns 0.
pub fn next_xid() -> u64 {
    loop {
        let x = XID.fetch_add(1, Ordering::Relaxed);
        if x != 0 {
            return x;
        }
    }
}

/// Reads the current xid counter without consuming a value.
pub fn peek_xid() -> u64 {
    XID.load(Ordering::Relaxed)
}

/// Rewinds or fast-forwards the xid counter (admin/test use).
pub fn set_xid(v: u64) {
    XID.store(v, Ordering::Relaxed);
}

/// Seedable process PRNG behind `debug.srandom`; seed 1 is the portable
/// reproducible value.
static PRNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::seed_from_u64(1)));

pub fn srandom(seed: u64) {
    if let Ok(mut g) = PRNG.lock() {
        *g = StdRng::seed_from_u64(seed);
    }
}

/// Draws from the process PRNG.
pub fn prandom_u32() -> u32 {
    match PRNG.lock() {
        Ok(mut g) => g.random::<u32>(),
        Err(_) => 0,
    }
}

/// Wall clock as fractional epoch seconds. All four session timestamps use
/// this; NaN marks "not stamped".
pub fn now() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(_) => 0.0,
    }
}
