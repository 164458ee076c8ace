// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod conn;
pub mod deliver;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod lookup;
pub mod recv;

use crate::{session::Session, worker::Worker};

/// The nodes of the request state machine. A closed set, matched directly:
/// no dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    First,
    Start,
    Wait,
    Recv,
    Lookup,
    Hit,
    Miss,
    Pass,
    Pipe,
    Fetch,
    FetchBody,
    StreamBody,
    PrepResp,
    Deliver,
    Error,
    Done,
}

/// What a step handler did with the session it was handed.
#[derive(Debug)]
pub enum StepOutcome {
    /// Keep walking; the next step is written into the session.
    Continue(Box<Session>),
    /// The session parked (waiter or busy list) or was destroyed; this
    /// worker must not touch it again.
    Gone,
    /// Done at esi_level > 0: control returns to the parent include driver.
    ParentReturn(Box<Session>),
}

/// Runs a session until it parks or retires. Entry is restricted to the
/// accept and wake-up states; anything else is a scheduling bug.
pub async fn run(wrk: &mut Worker, sess: Box<Session>) {
    assert!(
        matches!(
            sess.step,
            Step::First | Step::Start | Step::Wait | Step::Lookup | Step::Recv
        ),
        "dispatcher entered at {:?}",
        sess.step
    );

    let mut cur = sess;
    loop {
        paranoia(&cur);
        match dispatch_one(wrk, cur).await {
            StepOutcome::Continue(next) => cur = next,
            StepOutcome::Gone => break,
            StepOutcome::ParentReturn(_) => {
                unreachable!("embedded request escaped to the top-level dispatcher")
            },
        }
    }
    wrk.flush_log();
}

/// One step. Also the entry point for the inline driver of embedded (ESI)
/// requests, which loops it until `ParentReturn`.
pub(crate) async fn dispatch_one(wrk: &mut Worker, sess: Box<Session>) -> StepOutcome {
    match sess.step {
        Step::First => conn::first(wrk, sess).await,
        Step::Start => conn::start(wrk, sess).await,
        Step::Wait => conn::wait(wrk, sess).await,
        Step::Done => conn::done(wrk, sess).await,
        Step::Recv => recv::recv(wrk, sess).await,
        Step::Lookup => lookup::lookup(wrk, sess).await,
        Step::Hit => dispatch::hit(wrk, sess).await,
        Step::Miss => dispatch::miss(wrk, sess).await,
        Step::Pass => dispatch::pass(wrk, sess).await,
        Step::Pipe => dispatch::pipe(wrk, sess).await,
        Step::Fetch => fetch::fetch(wrk, sess).await,
        Step::FetchBody => fetch::fetch_body(wrk, sess).await,
        Step::PrepResp => deliver::prep_resp(wrk, sess).await,
        Step::Deliver => deliver::deliver(wrk, sess).await,
        Step::StreamBody => deliver::stream_body(wrk, sess).await,
        Step::Error => error::error_step(wrk, sess).await,
    }
}

/// Structural assertions checked on every iteration. Inconsistencies here
/// are programming errors: fail loudly rather than leak.
fn paranoia(sess: &Session) {
    // An active request always has an id.
    debug_assert!(
        sess.xid != 0
            || matches!(
                sess.step,
                Step::First | Step::Start | Step::Wait | Step::Done
            ),
        "xid == 0 in {:?}",
        sess.step
    );

    // An open workspace reservation only survives a busy-list park.
    debug_assert!(
        !sess.ws.is_reserved() || sess.step == Step::Lookup,
        "workspace reservation leaked into {:?}",
        sess.step
    );

    // A live backend connection is only held across the fetch family.
    if let Some(bo) = sess.ctx.busyobj.as_ref()
        && bo.vbc.is_some()
    {
        debug_assert!(
            matches!(
                sess.step,
                Step::Fetch | Step::FetchBody | Step::PrepResp | Step::StreamBody
            ),
            "backend connection held in {:?}",
            sess.step
        );
    }
}
