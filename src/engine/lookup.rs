// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    cache::index::{LookupReply, ProbeReply},
    engine::{Step, StepOutcome},
    session::{ObjRef, Session},
    worker::Worker,
};

/// Probe the cache index. A fresh entry reserves the workspace tail for vary
/// candidate construction; a busy-list re-entry arrives with the reservation
/// still open and keeps it until the probe resolves.
pub(crate) async fn lookup(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    if !sess.ws.is_reserved() {
        let _ = sess.ws.reserve();
    }

    if sess.esi_level > 0 {
        return lookup_inline(wrk, sess).await;
    }

    let core = sess.core.clone();
    let (sess_back, reply) = core.cache.lookup(sess);
    match reply {
        LookupReply::Parked => {
            // The session now lives on the busy list; unbusy/drop requeues it
            // with step == Lookup and the reservation intact.
            wrk.vlog("Busy", "parked on busy objhead");
            StepOutcome::Gone
        },
        reply => {
            let mut sess = sess_back.expect("session returned for non-parked lookup");
            resolve(wrk, &mut sess, reply);
            StepOutcome::Continue(sess)
        },
    }
}

/// Embedded requests wait for busy peers in place: parking would suspend the
/// parent's delivery, so they re-probe on the head's notify instead.
async fn lookup_inline(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    loop {
        let core = sess.core.clone();
        match core.cache.probe(&mut sess) {
            ProbeReply::Busy(head) => {
                let notified = head.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                // Re-probe with the waiter armed so an unbusy between the
                // two probes cannot be missed.
                match core.cache.probe(&mut sess) {
                    ProbeReply::Busy(_) => notified.await,
                    other => {
                        resolve(wrk, &mut sess, lift(other));
                        return StepOutcome::Continue(sess);
                    },
                }
            },
            other => {
                resolve(wrk, &mut sess, lift(other));
                return StepOutcome::Continue(sess);
            },
        }
    }
}

fn lift(p: ProbeReply) -> LookupReply {
    match p {
        ProbeReply::Miss(c) => LookupReply::Miss(c),
        ProbeReply::Hit(c, o) => LookupReply::Hit(c, o),
        ProbeReply::HitPass(c, o) => LookupReply::HitPass(c, o),
        ProbeReply::Busy(_) => unreachable!("busy probe lifted"),
    }
}

fn resolve(wrk: &mut Worker, sess: &mut Session, reply: LookupReply) {
    if sess.ws.is_reserved() {
        sess.ws.release(0);
    }
    sess.hash_objhead = None;

    match reply {
        LookupReply::Miss(core) => {
            wrk.stats.cache_miss += 1;
            wrk.vlog("CacheMiss", format!("xid {}", sess.xid));
            sess.ctx.objcore = Some(core);
            sess.step = Step::Miss;
        },
        LookupReply::Hit(core, obj) => {
            wrk.stats.cache_hit += 1;
            wrk.vlog("CacheHit", format!("xid {} obj {}", sess.xid, obj.xid));
            drop(core);
            sess.ctx.obj = Some(ObjRef::Shared(obj));
            sess.step = Step::Hit;
        },
        LookupReply::HitPass(core, obj) => {
            wrk.stats.cache_hitpass += 1;
            wrk.vlog("CacheHitPass", format!("xid {} obj {}", sess.xid, obj.xid));
            // hit-for-pass delivers nothing from the entry: drop both refs
            drop(core);
            drop(obj);
            sess.step = Step::Pass;
        },
        LookupReply::Parked => unreachable!("parked reply resolved"),
    }
}
