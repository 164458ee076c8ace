// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::{
    engine::{Step, StepOutcome},
    http::msg::FilterSet,
    policy::Handling,
    session::{BusyObj, Session},
    worker::Worker,
};

/// Consumes a pending request body so the connection stays in sync for the
/// next request. Bodies beyond the configured cap force a close instead.
async fn drain_req_body(sess: &mut Session) -> Result<()> {
    if sess.req_body.is_some() {
        return Ok(());
    }
    let Some(cl) = sess.req.content_length() else {
        return Ok(());
    };
    if cl == 0 {
        return Ok(());
    }
    let max = sess.core.cfg.engine.max_req_body;
    let timeouts = sess.core.cfg.timeouts.clone();
    let cancel = sess.core.cancel.clone();
    let body = sess
        .htc
        .read_body(cl, max, timeouts.between_bytes_timeout, &cancel)
        .await?;
    sess.req_bodybytes = body.len() as u64;
    sess.req_body = Some(body);
    Ok(())
}

pub(crate) async fn hit(_wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    let policy = sess.policy.clone().expect("hit without policy");
    let handling = policy.hit(&mut sess);
    sess.handling = handling;

    match handling {
        Handling::Deliver => {
            if drain_req_body(&mut sess).await.is_err() {
                sess.ctx.deref_obj();
                sess.set_close("req body read error");
                sess.step = Step::Done;
                return StepOutcome::Continue(sess);
            }
            sess.step = Step::PrepResp;
        },
        Handling::Pass => {
            sess.ctx.deref_obj();
            sess.step = Step::Pass;
        },
        Handling::Error => {
            sess.ctx.deref_obj();
            sess.step = Step::Error;
        },
        Handling::Restart => {
            sess.ctx.deref_obj();
            sess.restarts += 1;
            sess.step = Step::Recv;
        },
        other => panic!("hit: illegal handling {other:?}"),
    }
    StepOutcome::Continue(sess)
}

pub(crate) async fn miss(_wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    assert!(
        sess.ctx.objcore.as_ref().is_some_and(|c| c.is_busy()),
        "miss without a busy objcore"
    );

    // Build the backend request under the fetch rule set: the cache always
    // asks for the full document.
    let mut bereq = sess.req.filter_fields(FilterSet::BereqFetch);
    bereq.method = "GET".into();
    // the client body is not forwarded on a fill
    bereq.unset("content-length");
    bereq.unset("content-type");
    if sess.core.cfg.engine.http_gzip_support {
        if sess.req.has_token("accept-encoding", "gzip") {
            bereq.set("Accept-Encoding", "gzip");
        } else {
            bereq.unset("accept-encoding");
        }
    }
    sess.ctx.busyobj = Some(BusyObj::new(bereq, sess.director));

    let policy = sess.policy.clone().expect("miss without policy");
    let handling = policy.miss(&mut sess);
    sess.handling = handling;

    match handling {
        Handling::Fetch => {
            // The body of the client request is not forwarded on a fill;
            // drain it to keep the connection usable.
            if drain_req_body(&mut sess).await.is_err() {
                abandon_busy(&mut sess);
                sess.set_close("req body read error");
                sess.step = Step::Done;
                return StepOutcome::Continue(sess);
            }
            sess.step = Step::Fetch;
        },
        Handling::Error => {
            abandon_busy(&mut sess);
            sess.step = Step::Error;
        },
        Handling::Pass => {
            abandon_busy(&mut sess);
            sess.step = Step::Pass;
        },
        Handling::Restart => panic!("miss: restart not implemented"),
        other => panic!("miss: illegal handling {other:?}"),
    }
    StepOutcome::Continue(sess)
}

/// Drops the busy index entry this miss holds and wakes parked peers.
pub(crate) fn abandon_busy(sess: &mut Session) {
    if let Some(core) = sess.ctx.objcore.take() {
        sess.core.cache.drop_busy(&core);
    }
    sess.ctx.busyobj = None;
}

pub(crate) async fn pass(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    sess.ws.reset(sess.ws_req);
    let bereq = sess.req.filter_fields(FilterSet::BereqPass);

    let policy = sess.policy.clone().expect("pass without policy");
    let handling = policy.pass(&mut sess);
    sess.handling = handling;

    match handling {
        Handling::Pass => {
            wrk.stats.s_pass += 1;
            sess.ctx.busyobj = Some(BusyObj::new(bereq, sess.director));
            sess.sendbody = true;
            sess.step = Step::Fetch;
        },
        Handling::Error => {
            sess.step = Step::Error;
        },
        other => panic!("pass: illegal handling {other:?}"),
    }
    StepOutcome::Continue(sess)
}

pub(crate) async fn pipe(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    assert_eq!(sess.esi_level, 0, "pipe inside an embedded request");
    let bereq = sess.req.filter_fields(FilterSet::BereqPipe);

    let policy = sess.policy.clone().expect("pipe without policy");
    let handling = policy.pipe(&mut sess);
    sess.handling = handling;
    if handling != Handling::Pipe {
        panic!("pipe: illegal handling {handling:?}");
    }

    wrk.stats.s_pipe += 1;
    wrk.stats.backend_req += 1;

    let core = sess.core.clone();
    let backend = core.backends[sess.director].clone();
    let timeouts = core.cfg.timeouts.clone();
    let cancel = core.cancel.clone();

    let head = bereq.serialize_request();
    let initial = sess.htc.drain_buffered();

    let relay = async {
        let mut conn = backend.get_conn(&timeouts, &cancel).await?;
        let res = crate::backend::io::pipe_relay(
            sess.htc.stream_mut(),
            &mut conn,
            &head,
            initial,
            &timeouts,
            &cancel,
        )
        .await;
        conn.close().await;
        res
    };

    match relay.await {
        Ok((up, down)) => {
            wrk.vlog("PipeDone", format!("xid {} up {} down {}", sess.xid, up, down));
        },
        Err(e) => {
            wrk.vlog("PipeError", format!("xid {} {e:#}", sess.xid));
        },
    }

    // A piped connection is out of HTTP sync; it always closes.
    sess.set_close("pipe");
    sess.step = Step::Done;
    StepOutcome::Continue(sess)
}
