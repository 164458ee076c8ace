// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::{
    cache::{object::Object, storage::StorageHint},
    engine::{Step, StepOutcome},
    http::{
        msg::HttpMsg,
        status::{http_date, reason},
    },
    policy::Handling,
    session::{ObjRef, Session},
    utils,
    worker::Worker,
};

fn default_error_body(status: u16, phrase: &str, xid: u64) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <!DOCTYPE html>\n\
         <html>\n  <head>\n    <title>{status} {phrase}</title>\n  </head>\n\
         \x20 <body>\n    <h1>Error {status} {phrase}</h1>\n    <p>{phrase}</p>\n\
         \x20   <h3>Guru Meditation:</h3>\n    <p>XID: {xid}</p>\n    <hr>\n\
         \x20   <p>Varnish cache server</p>\n  </body>\n</html>\n"
    )
}

/// Materializes a synthetic response object for a failed request. Synthetic
/// responses never keep the connection alive.
pub(crate) async fn error_step(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    // Fetch paths release their backend state before routing here; anything
    // left is closed now.
    if let Some(bo) = sess.ctx.busyobj.as_mut()
        && let Some(vbc) = bo.vbc.take()
    {
        vbc.close().await;
    }
    sess.ctx.busyobj = None;

    let now = utils::now();
    if sess.ctx.obj.is_none() {
        let est = 512;
        let obj = Object::alloc(&sess.core.storage, StorageHint::Default, est, now)
            .or_else(|| {
                Object::alloc(&sess.core.storage, StorageHint::Transient, est, now)
            });
        let Some(mut obj) = obj else {
            wrk.vlog("Error", format!("xid {} out of objects", sess.xid));
            sess.set_close("Out of objects");
            sess.step = Step::Done;
            return StepOutcome::Continue(sess);
        };
        obj.xid = sess.xid;
        sess.ctx.obj = Some(ObjRef::Owned(Box::new(obj)));
    }

    if !(100..=999).contains(&sess.err_code) {
        sess.err_code = 501;
    }
    let status = sess.err_code;
    let phrase = sess
        .err_reason
        .clone()
        .unwrap_or_else(|| reason(status).to_string());

    {
        let obj = sess
            .ctx
            .obj
            .as_mut()
            .and_then(ObjRef::get_mut)
            .expect("error object is exclusively owned");
        obj.response = status;
        obj.http = HttpMsg::new_response(status, &phrase);
        obj.http.set("Date", &http_date(now));
        obj.http.set("Server", "Varnish");
        obj.http.set("Content-Type", "text/html; charset=utf-8");
    }
    wrk.vlog("Error", format!("xid {} status {}", sess.xid, status));

    let policy = sess.policy.clone().expect("error without policy");
    let handling = policy.error(&mut sess);
    sess.handling = handling;

    let max_restarts = sess.core.cfg.engine.max_restarts;
    match handling {
        Handling::Restart if sess.restarts < max_restarts => {
            sess.ctx.deref_obj();
            sess.err_code = 0;
            sess.err_reason = None;
            sess.restarts += 1;
            sess.step = Step::Recv;
            return StepOutcome::Continue(sess);
        },
        // a restart above the cap delivers the synthetic response instead
        Handling::Restart | Handling::Deliver => {},
        other => panic!("error: illegal handling {other:?}"),
    }

    let body = sess
        .synth_body
        .take()
        .unwrap_or_else(|| default_error_body(status, &phrase, sess.xid));
    {
        let obj = sess
            .ctx
            .obj
            .as_mut()
            .and_then(ObjRef::get_mut)
            .expect("error object is exclusively owned");
        if obj.append_chunk(Bytes::from(body)).is_err() {
            // out of storage for the page; deliver the bare status line
        }
    }

    sess.set_close("error");
    sess.wantbody = true;
    sess.step = Step::PrepResp;
    StepOutcome::Continue(sess)
}
