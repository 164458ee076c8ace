// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use sha2::{Digest, Sha256};

use crate::{
    engine::{Step, StepOutcome},
    policy::Handling,
    session::Session,
    worker::Worker,
};

/// Policy entry point of every request (and every restart): route the
/// request and compute its hash digest.
pub(crate) async fn recv(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    // A restart re-enters here with the pre-modification header snapshot.
    if sess.restarts > 0
        && let Some(h0) = sess.http0.as_ref()
    {
        sess.req = h0.clone();
    }

    sess.director = 0;
    sess.req.collapse("cache-control");

    let policy = sess
        .policy
        .clone()
        .expect("recv without an attached policy program");
    let handling = policy.recv(&mut sess);
    sess.handling = handling;

    // The restart cap is enforced before dispatching on the hook's choice.
    let max_restarts = sess.core.cfg.engine.max_restarts;
    if sess.restarts >= max_restarts {
        if sess.err_code == 0 {
            sess.err_code = 503;
        }
        sess.step = Step::Error;
        return StepOutcome::Continue(sess);
    }

    // Canonical encoding negotiation towards the backend: one token or none.
    if sess.core.cfg.engine.http_gzip_support
        && handling != Handling::Pipe
        && handling != Handling::Pass
    {
        if sess.req.has_token("accept-encoding", "gzip") {
            sess.req.set("Accept-Encoding", "gzip");
        } else {
            sess.req.unset("accept-encoding");
        }
    }

    let mut sha = Sha256::new();
    policy.hash(&mut sess, &mut sha);
    sess.digest = sha.finalize().into();
    wrk.vlog(
        "Hash",
        format!("xid {} digest {}", sess.xid, hex::encode(sess.digest)),
    );

    sess.wantbody = !sess.req.method.eq_ignore_ascii_case("HEAD");
    sess.sendbody = false;

    match handling {
        Handling::Lookup => sess.step = Step::Lookup,
        Handling::Pipe => {
            if sess.esi_level > 0 {
                // A pipe inside an include cannot relay; abort the fragment.
                wrk.vlog("EsiPipeIncomplete", format!("xid {}", sess.xid));
                sess.step = Step::Done;
            } else {
                sess.step = Step::Pipe;
            }
        },
        Handling::Pass => sess.step = Step::Pass,
        Handling::Error => sess.step = Step::Error,
        Handling::Restart => {
            sess.restarts += 1;
            sess.step = Step::Recv;
        },
        other => panic!("recv: illegal handling {other:?}"),
    }
    StepOutcome::Continue(sess)
}
