// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::ErrorKind,
    time::Duration,
};

use tokio::time::{Instant, timeout};

use crate::{
    engine::{Step, StepOutcome},
    http::{conn::RxStatus, msg::parse_request_head},
    session::Session,
    utils,
    worker::{Worker, park_on_waiter},
};

/// Once per TCP connection: snapshot the workspace high-water so later
/// requests on this connection can reset to it, and charge the session.
pub(crate) async fn first(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    sess.ws_ses = sess.ws.snapshot();
    wrk.stats.sess_accepted += 1;
    wrk.vlog("SessionOpen", format!("{}", sess.peer));
    sess.step = Step::Wait;
    StepOutcome::Continue(sess)
}

/// Once per request: assign the xid, stamp the request, attach a policy
/// program, dissect the head and settle Connection/Expect.
pub(crate) async fn start(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    sess.xid = utils::next_xid();
    sess.t_req = utils::now();
    sess.ws_req = sess.ws.snapshot();
    sess.policy = Some(sess.core.current_policy());
    wrk.vlog("ReqStart", format!("{} xid {}", sess.peer, sess.xid));

    let head = sess.htc.take_head();
    let req = match parse_request_head(&head) {
        Ok(req) => req,
        Err(e) if e.status() == 400 => {
            sess.set_close("junk");
            sess.step = Step::Done;
            return StepOutcome::Continue(sess);
        },
        Err(e) => {
            sess.err_code = e.status();
            sess.step = Step::Error;
            return StepOutcome::Continue(sess);
        },
    };

    // Keep-alive decision from the request line and Connection header.
    if req.has_token("connection", "close") {
        sess.set_close("Connection: close");
    } else if !req.is_http11() && !req.has_token("connection", "keep-alive") {
        sess.set_close("not HTTP/1.1");
    }

    sess.http0 = Some(req.clone());
    sess.req = req;

    if let Some(expect) = sess.req.get("expect").map(str::to_owned) {
        if expect.eq_ignore_ascii_case("100-continue") {
            sess.htc
                .write_best_effort(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await;
            sess.req.unset("expect");
            if let Some(h0) = sess.http0.as_mut() {
                h0.unset("expect");
            }
        } else {
            sess.err_code = 417;
            sess.step = Step::Error;
            return StepOutcome::Continue(sess);
        }
    }

    sess.step = Step::Recv;
    StepOutcome::Continue(sess)
}

/// Wait for a complete request head without tying up a worker: poll within
/// the linger window, then hand the session to the waiter.
pub(crate) async fn wait(_wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    let linger = Duration::from_millis(sess.core.cfg.timeouts.session_linger_ms);
    let deadline = Instant::now() + linger;

    loop {
        match sess.htc.complete() {
            RxStatus::Complete => {
                sess.step = Step::Start;
                return StepOutcome::Continue(sess);
            },
            RxStatus::Overflow => {
                sess.set_close("overflow");
                sess.step = Step::Done;
                return StepOutcome::Continue(sess);
            },
            RxStatus::Empty | RxStatus::Partial => {},
        }

        let remain = deadline.saturating_duration_since(Instant::now());
        if remain.is_zero() {
            park_on_waiter(sess);
            return StepOutcome::Gone;
        }

        match timeout(remain, sess.htc.rx_more()).await {
            Err(_) => {
                // linger expired with the request still incomplete
                park_on_waiter(sess);
                return StepOutcome::Gone;
            },
            Ok(Ok(0)) => {
                if sess.htc.has_bytes() {
                    sess.set_close("error");
                } else {
                    sess.set_close("EOF");
                }
                sess.step = Step::Done;
                return StepOutcome::Continue(sess);
            },
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                let benign = e.kind() == ErrorKind::ConnectionReset;
                if benign && !sess.htc.has_bytes() {
                    sess.set_close("EOF");
                } else {
                    sess.set_close("error");
                }
                sess.step = Step::Done;
                return StepOutcome::Continue(sess);
            },
        }
    }
}

/// Terminal per-request step: account, log, reset scratch, and either close,
/// continue with a pipelined request, or park on the waiter.
pub(crate) async fn done(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    // Charge accounting and clear fetch state.
    wrk.stats.s_bodybytes += sess.ctx.acct_bodybytes;
    sess.ctx.acct_bodybytes = 0;
    if let Some(mut bo) = sess.ctx.busyobj.take()
        && let Some(vbc) = bo.vbc.take()
    {
        vbc.close().await;
    }
    sess.ctx.assert_clean();

    // Embedded requests return control to the parent include; they never
    // touch close accounting.
    if sess.esi_level > 0 {
        sess.t_end = utils::now();
        return StepOutcome::ParentReturn(sess);
    }

    // Rotate the policy reference onto the worker.
    if let Some(p) = sess.policy.take() {
        wrk.policy = p;
    }

    sess.t_end = utils::now();
    if sess.xid != 0 {
        wrk.stats.client_req += 1;
        let handshake = sess.t_req - sess.t_open;
        let processing = sess.t_resp - sess.t_req;
        let delivery = sess.t_end - sess.t_resp;
        wrk.vlog(
            "ReqEnd",
            format!(
                "xid {} t_req {:.6} t_end {:.6} hs {:.6} proc {:.6} del {:.6} rxbody {}",
                sess.xid,
                sess.t_req,
                sess.t_end,
                handshake,
                processing,
                delivery,
                sess.req_bodybytes
            ),
        );
    }

    sess.reset_scratch();

    if sess.doclose.is_some() {
        wrk.vlog("SessionClose", sess.doclose.unwrap_or(""));
        sess.htc.shutdown().await;
        wrk.stats.sess_closed += 1;
        wrk.maybe_flush_stats();
        return StepOutcome::Gone;
    }

    wrk.maybe_flush_stats();
    sess.ws.reset(sess.ws_ses);

    match sess.htc.reinit() {
        RxStatus::Complete => {
            // pipelined request already buffered
            sess.step = Step::Start;
            StepOutcome::Continue(sess)
        },
        RxStatus::Partial | RxStatus::Overflow => {
            wrk.stats.sess_readahead += 1;
            sess.step = Step::Wait;
            StepOutcome::Continue(sess)
        },
        RxStatus::Empty => {
            if sess.core.cfg.timeouts.session_linger_ms > 0 {
                wrk.stats.sess_linger += 1;
                sess.step = Step::Wait;
                StepOutcome::Continue(sess)
            } else {
                wrk.stats.sess_herd += 1;
                park_on_waiter(sess);
                StepOutcome::Gone
            }
        },
    }
}
