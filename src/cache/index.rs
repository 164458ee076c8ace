// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use bitflags::bitflags;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::Notify;

use crate::{
    cache::object::{ExpSpec, Object},
    http::msg::HttpMsg,
    session::Session,
    utils,
    ws::Workspace,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjFlags: u8 {
        /// Fetch in flight; peers park until unbusy or drop.
        const BUSY = 1 << 0;
        /// Negative cache entry forcing the pass route.
        const PASS = 1 << 1;
    }
}

/// The index handle for one (hash, vary) entry. Created busy at miss time,
/// carries the published object afterwards.
#[derive(Debug)]
pub struct ObjCore {
    flags: Mutex<ObjFlags>,
    obj: OnceCell<Arc<Object>>,
    exp: Mutex<ExpSpec>,
    head: Weak<ObjHead>,
}

impl ObjCore {
    fn new_busy(head: &Arc<ObjHead>) -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(ObjFlags::BUSY),
            obj: OnceCell::new(),
            exp: Mutex::new(ExpSpec::default()),
            head: Arc::downgrade(head),
        })
    }

    pub fn flags(&self) -> ObjFlags {
        match self.flags.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(ObjFlags::BUSY)
    }

    pub fn is_pass(&self) -> bool {
        self.flags().contains(ObjFlags::PASS)
    }

    /// Marks this entry hit-for-pass. Set before unbusy publishes it.
    pub fn set_pass(&self) {
        if let Ok(mut g) = self.flags.lock() {
            g.insert(ObjFlags::PASS);
        }
    }

    pub fn object(&self) -> Option<Arc<Object>> {
        self.obj.get().cloned()
    }

    pub fn exp(&self) -> ExpSpec {
        match self.exp.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn head(&self) -> Option<Arc<ObjHead>> {
        self.head.upgrade()
    }
}

/// One hash slot: the candidate list plus the busy waiting list.
#[derive(Debug)]
pub struct ObjHead {
    pub digest: [u8; 32],
    inner: Mutex<HeadInner>,
    /// Wakes embedded (ESI) requests that wait in place instead of parking.
    pub notify: Notify,
}

#[derive(Debug, Default)]
struct HeadInner {
    cores: Vec<Arc<ObjCore>>,
    waiting: Vec<Box<Session>>,
}

impl ObjHead {
    fn new(digest: [u8; 32]) -> Arc<Self> {
        Arc::new(Self {
            digest,
            inner: Mutex::new(HeadInner::default()),
            notify: Notify::new(),
        })
    }

    pub fn core_count(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.cores.len(),
            Err(_) => 0,
        }
    }
}

/// What a lookup resolved to. `Parked` means the session moved onto the busy
/// list and must not be touched again on this stack.
#[derive(Debug)]
pub enum LookupReply {
    Miss(Arc<ObjCore>),
    Hit(Arc<ObjCore>, Arc<Object>),
    HitPass(Arc<ObjCore>, Arc<Object>),
    Parked,
}

/// Non-consuming probe used by embedded requests that wait inline.
#[derive(Debug)]
pub enum ProbeReply {
    Miss(Arc<ObjCore>),
    Hit(Arc<ObjCore>, Arc<Object>),
    HitPass(Arc<ObjCore>, Arc<Object>),
    Busy(Arc<ObjHead>),
}

/// The shared hash index. Only one fetcher per (hash, vary) exists at a time:
/// lookups that race a busy entry park instead of inserting a duplicate.
#[derive(Debug, Default)]
pub struct CacheIndex {
    heads: DashMap<[u8; 32], Arc<ObjHead>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self {
            heads: DashMap::new(),
        }
    }

    fn head_for(&self, digest: [u8; 32]) -> Arc<ObjHead> {
        self.heads
            .entry(digest)
            .or_insert_with(|| ObjHead::new(digest))
            .clone()
    }

    /// Top-level lookup. Consumes the session; on `Parked` it now lives on
    /// the head's waiting list and will be re-enqueued by unbusy/drop.
    pub fn lookup(&self, mut sess: Box<Session>) -> (Option<Box<Session>>, LookupReply) {
        let head = self.head_for(sess.digest);
        sess.hash_objhead = Some(Arc::clone(&head));

        let mut inner = match head.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };

        match probe_locked(
            &mut inner.cores,
            &head,
            &sess.req,
            &mut sess.ws,
            sess.hash_always_miss,
            sess.hash_ignore_busy,
        ) {
            ProbeReply::Busy(_) => {
                inner.waiting.push(sess);
                (None, LookupReply::Parked)
            },
            ProbeReply::Miss(core) => (Some(sess), LookupReply::Miss(core)),
            ProbeReply::Hit(core, obj) => (Some(sess), LookupReply::Hit(core, obj)),
            ProbeReply::HitPass(core, obj) => {
                (Some(sess), LookupReply::HitPass(core, obj))
            },
        }
    }

    /// Inline probe for embedded requests: never parks, the caller awaits
    /// `head.notify` and probes again.
    pub fn probe(&self, sess: &mut Session) -> ProbeReply {
        let head = self.head_for(sess.digest);
        sess.hash_objhead = Some(Arc::clone(&head));
        let mut inner = match head.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        probe_locked(
            &mut inner.cores,
            &head,
            &sess.req,
            &mut sess.ws,
            sess.hash_always_miss,
            sess.hash_ignore_busy,
        )
    }

    /// Publishes a fetched object: the core stops being busy, becomes
    /// visible to lookups, and every parked peer is requeued.
    pub fn unbusy(&self, core: &Arc<ObjCore>, obj: Arc<Object>, exp: ExpSpec) {
        if let Ok(mut g) = core.exp.lock() {
            *g = exp;
        }
        let _ = core.obj.set(obj);
        if let Ok(mut g) = core.flags.lock() {
            g.remove(ObjFlags::BUSY);
        }
        if let Some(head) = core.head.upgrade() {
            self.wake_head(&head);
        }
    }

    /// Abandons a busy entry (failed or uncacheable fetch): removes it from
    /// the index and releases parked peers to probe again.
    pub fn drop_busy(&self, core: &Arc<ObjCore>) {
        let Some(head) = core.head.upgrade() else {
            return;
        };
        if let Ok(mut g) = head.inner.lock() {
            g.cores.retain(|c| !Arc::ptr_eq(c, core));
        }
        self.wake_head(&head);
    }

    /// Removes a retired (non-busy) entry; reaper path.
    pub fn evict(&self, core: &Arc<ObjCore>) {
        let Some(head) = core.head.upgrade() else {
            return;
        };
        let empty = match head.inner.lock() {
            Ok(mut g) => {
                g.cores.retain(|c| !Arc::ptr_eq(c, core));
                g.cores.is_empty() && g.waiting.is_empty()
            },
            Err(_) => false,
        };
        if empty {
            self.heads
                .remove_if(&head.digest, |_, h| Arc::ptr_eq(h, &head));
        }
    }

    fn wake_head(&self, head: &Arc<ObjHead>) {
        let waiting = match head.inner.lock() {
            Ok(mut g) => std::mem::take(&mut g.waiting),
            Err(_) => Vec::new(),
        };
        for sess in waiting {
            let core = Arc::clone(&sess.core);
            core.enqueue(sess);
        }
        head.notify.notify_waiters();
    }
}

fn probe_locked(
    cores: &mut Vec<Arc<ObjCore>>,
    head: &Arc<ObjHead>,
    req: &HttpMsg,
    ws: &mut Workspace,
    always_miss: bool,
    ignore_busy: bool,
) -> ProbeReply {
    let now = utils::now();
    let mut busy_peer = false;

    if !always_miss {
        for core in cores.iter() {
            let flags = core.flags();
            if flags.contains(ObjFlags::BUSY) {
                if !ignore_busy {
                    busy_peer = true;
                }
                continue;
            }
            let Some(obj) = core.object() else {
                continue;
            };
            if !core.exp().fresh(now) {
                continue;
            }
            if !vary_match(obj.vary.as_deref(), req, ws) {
                continue;
            }
            return if flags.contains(ObjFlags::PASS) {
                ProbeReply::HitPass(Arc::clone(core), obj)
            } else {
                ProbeReply::Hit(Arc::clone(core), obj)
            };
        }
    }

    if busy_peer {
        return ProbeReply::Busy(Arc::clone(head));
    }

    let core = ObjCore::new_busy(head);
    cores.push(Arc::clone(&core));
    ProbeReply::Miss(core)
}

// ── vary ────────────────────────────────────────────────────────────────────

/// Serializes the request values the backend declared significant. Lines are
/// `name: value` with the value captured from the fetching request; absent
/// headers record an empty value. `Vary: *` yields no spec (the policy turns
/// those into hit-for-pass).
pub fn build_vary_spec(beresp: &HttpMsg, bereq: &HttpMsg) -> Option<Vec<u8>> {
    let vary = beresp.get("vary")?;
    let mut spec = Vec::new();
    for name in vary.split(',') {
        let name = name.trim();
        if name.is_empty() || name == "*" {
            continue;
        }
        spec.extend_from_slice(name.to_ascii_lowercase().as_bytes());
        spec.extend_from_slice(b": ");
        if let Some(v) = bereq.get(name) {
            spec.extend_from_slice(v.trim().as_bytes());
        }
        spec.push(b'\n');
    }
    if spec.is_empty() { None } else { Some(spec) }
}

/// Compares a stored vary spec against the current request. The candidate
/// line is rendered into the session workspace reservation so the probe does
/// not allocate per candidate.
pub fn vary_match(spec: Option<&[u8]>, req: &HttpMsg, ws: &mut Workspace) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    let had_reservation = ws.is_reserved();
    if !had_reservation && ws.reserve().is_err() {
        return vary_match_unbuffered(spec, req);
    }

    let mut matched = true;
    for line in spec.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if render_candidate(line, req, ws).is_err() {
            matched = vary_match_unbuffered(spec, req);
            break;
        }
        if ws.reserved_slice() != line {
            matched = false;
            break;
        }
    }

    if !had_reservation {
        ws.release(0);
    }
    matched
}

/// Renders `name: current-request-value` for the stored line into the open
/// workspace reservation.
fn render_candidate(line: &[u8], req: &HttpMsg, ws: &mut Workspace) -> Result<()> {
    let name_end = line
        .iter()
        .position(|b| *b == b':')
        .unwrap_or(line.len());
    let name = String::from_utf8_lossy(&line[..name_end]);

    ws.release(0);
    let _ = ws.reserve();
    ws.push_reserved(&line[..name_end])?;
    ws.push_reserved(b": ")?;
    if let Some(v) = req.get(&name) {
        ws.push_reserved(v.trim().as_bytes())?;
    }
    Ok(())
}

fn vary_match_unbuffered(spec: &[u8], req: &HttpMsg) -> bool {
    for line in spec.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return false;
        };
        let name = String::from_utf8_lossy(&line[..colon]);
        let stored = String::from_utf8_lossy(&line[colon + 1..]);
        let current = req.get(&name).map(str::trim).unwrap_or("");
        if stored.trim() != current {
            return false;
        }
    }
    true
}
