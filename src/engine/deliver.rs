// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    body::{esi::EsiSeg, gzip::GunzipStream, make_vfp},
    engine::{Step, StepOutcome, dispatch_one, fetch},
    http::{
        conn::HttpConn,
        msg::{HttpMsg, conditional_match},
        status::{http_date, reason},
    },
    policy::Handling,
    session::{ObjRef, ResMode, Session},
    utils,
    worker::Worker,
};

/// Response-mode selection, LRU touch, response head assembly and the
/// deliver hook.
pub(crate) async fn prep_resp(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    let now = utils::now();
    sess.t_resp = now;

    let gzip_on = sess.core.cfg.engine.http_gzip_support;
    let lru_timeout = sess.core.cfg.cache.lru_timeout;
    let client_gzip = sess.req.has_token("accept-encoding", "gzip");

    let bo_present = sess.ctx.busyobj.is_some();
    let (do_stream, do_gzip, do_gunzip) = sess
        .ctx
        .busyobj
        .as_ref()
        .map_or((false, false, false), |bo| {
            (bo.do_stream, bo.do_gzip, bo.do_gunzip)
        });

    let mut mode = ResMode::empty();
    let mut resp;
    {
        let obj = sess
            .ctx
            .obj
            .as_ref()
            .expect("prepresp without object")
            .get();

        // Framing selection; later rules may clear LEN again.
        if !bo_present {
            mode |= ResMode::LEN;
        } else if (obj.http.has("content-length") || !do_stream)
            && !do_gzip
            && !do_gunzip
        {
            mode |= ResMode::LEN;
        }
        if obj.esidata.is_some() && !sess.disable_esi {
            mode.remove(ResMode::LEN);
            mode |= ResMode::ESI;
        }
        if sess.esi_level > 0 {
            mode.remove(ResMode::LEN);
            mode |= ResMode::ESI_CHILD;
        }
        if gzip_on && obj.gziped && !client_gzip {
            mode.remove(ResMode::LEN);
            mode |= ResMode::GUNZIP;
        }
        if !mode.intersects(ResMode::LEN | ResMode::CHUNKED | ResMode::EOF) {
            if obj.is_empty() && !do_stream {
                mode |= ResMode::LEN;
            } else if !sess.wantbody || mode.contains(ResMode::ESI_CHILD) {
                // no framing: HEAD has no body, children ride the parent's
            } else if sess.req.is_http11() {
                mode |= ResMode::CHUNKED;
            } else {
                mode |= ResMode::EOF;
            }
        }

        // LRU bookkeeping; suppressed inside the touch window. A HEAD hits
        // this exactly like a GET.
        let lru = obj.lru();
        if now - lru.last_lru > lru_timeout {
            sess.core.exp.touch(obj, now);
        }
        obj.touch_use(now);

        // Assemble the response head from the stored one.
        resp = HttpMsg::new_response(
            obj.response,
            if obj.http.reason.is_empty() {
                reason(obj.response)
            } else {
                &obj.http.reason
            },
        );
        for (n, v) in obj.http.fields() {
            resp.add(n, v);
        }
        if !resp.has("date") {
            resp.set("Date", &http_date(now));
        }
        let entered = sess
            .ctx
            .objcore
            .as_ref()
            .map(|c| c.exp().entered)
            .unwrap_or(now);
        let entered = if entered > 0.0 { entered } else { now };
        resp.set("Age", &format!("{}", (now - entered).max(0.0) as u64));
        resp.set("Via", "1.1 varnish");
        if obj.xid != 0 && obj.xid != sess.xid {
            resp.set("X-Varnish", &format!("{} {}", sess.xid, obj.xid));
        } else {
            resp.set("X-Varnish", &format!("{}", sess.xid));
        }

        if mode.contains(ResMode::CHUNKED) {
            resp.unset("content-length");
            resp.set("Transfer-Encoding", "chunked");
        } else if mode.intersects(ResMode::GUNZIP | ResMode::ESI) {
            resp.unset("content-length");
        } else if mode.contains(ResMode::LEN) && !resp.has("content-length") {
            resp.set("Content-Length", &format!("{}", obj.len()));
        }
        if mode.contains(ResMode::GUNZIP) {
            resp.unset("content-encoding");
        }
    }

    if mode.contains(ResMode::EOF) {
        sess.set_close("EOF mode");
    }
    sess.ctx.res_mode = mode;
    sess.ctx.resp = Some(resp);

    let policy = sess.policy.clone().expect("prepresp without policy");
    let handling = policy.deliver(&mut sess);
    sess.handling = handling;

    let max_restarts = sess.core.cfg.engine.max_restarts;
    let deliver_now = match handling {
        Handling::Deliver => true,
        // restarts above the cap fall through to delivery
        Handling::Restart if sess.restarts >= max_restarts => true,
        Handling::Restart => false,
        other => panic!("deliver: illegal handling {other:?}"),
    };

    if !deliver_now {
        // Null the backend state first.
        if let Some(bo) = sess.ctx.busyobj.as_mut()
            && let Some(vbc) = bo.vbc.take()
        {
            vbc.close().await;
        }
        // Drop the object: a still-busy core is withdrawn, a published one
        // only loses this reference.
        if sess.ctx.objcore.as_ref().is_some_and(|c| c.is_busy())
            && let Some(core) = sess.ctx.objcore.take()
        {
            sess.core.cache.drop_busy(&core);
        }
        sess.ctx.busyobj = None;
        sess.ctx.deref_obj();
        sess.ctx.resp = None;
        sess.ctx.res_mode = ResMode::empty();
        sess.restarts += 1;
        sess.step = Step::Recv;
        return StepOutcome::Continue(sess);
    }

    // Conditional client, unstreamed 200: send a 304 shell instead.
    if !do_stream {
        let lm = sess.ctx.obj.as_ref().map_or(f64::NAN, |o| o.get().last_modified);
        let etag = sess
            .ctx
            .resp
            .as_ref()
            .and_then(|r| r.get("etag"))
            .map(str::to_owned);
        if sess
            .ctx
            .resp
            .as_ref()
            .is_some_and(|r| r.status == 200)
            && conditional_match(&sess.req, lm, etag.as_deref())
        {
            if let Some(resp) = sess.ctx.resp.as_mut() {
                resp.status = 304;
                resp.reason = reason(304).to_string();
                resp.unset("content-length");
                resp.unset("transfer-encoding");
            }
        }
    }

    wrk.vlog(
        "ResMode",
        format!("xid {} mode {:?}", sess.xid, sess.ctx.res_mode),
    );

    sess.step = if do_stream {
        Step::StreamBody
    } else {
        Step::Deliver
    };
    StepOutcome::Continue(sess)
}

/// Client-side chunk framing for one write.
async fn write_piece(
    htc: &mut HttpConn,
    chunked: bool,
    data: &[u8],
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u64> {
    if data.is_empty() {
        return Ok(0);
    }
    if chunked {
        let head = format!("{:x}\r\n", data.len());
        htc.write_all(head.as_bytes(), io_timeout, cancel).await?;
        htc.write_all(data, io_timeout, cancel).await?;
        htc.write_all(b"\r\n", io_timeout, cancel).await?;
    } else {
        htc.write_all(data, io_timeout, cancel).await?;
    }
    Ok(data.len() as u64)
}

async fn write_last_chunk(
    htc: &mut HttpConn,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    htc.write_all(b"0\r\n\r\n", io_timeout, cancel).await
}

/// Writes the response head and the object body in the selected mode, then
/// retires the object reference.
pub(crate) async fn deliver(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    let timeouts = sess.core.cfg.timeouts.clone();
    let cancel = sess.core.cancel.clone();
    let io = timeouts.send_timeout;
    let mode = sess.ctx.res_mode;

    let resp = sess.ctx.resp.take().unwrap_or_else(|| {
        HttpMsg::new_response(500, reason(500))
    });

    // Children never write a head; the parent already did.
    if sess.esi_level == 0 {
        let mut resp = resp;
        resp.set(
            "Connection",
            if sess.doclose.is_some() {
                "close"
            } else {
                "keep-alive"
            },
        );
        let head = resp.serialize_response();
        if sess
            .htc
            .write_all(&head, io, &cancel)
            .await
            .is_err()
        {
            sess.set_close("senderr");
            sess.ctx.deref_obj();
            sess.step = Step::Done;
            return StepOutcome::Continue(sess);
        }

        let send_body = sess.wantbody
            && resp.status != 304
            && resp.status != 204
            && mode.intersects(ResMode::LEN | ResMode::CHUNKED | ResMode::EOF);
        if !send_body {
            sess.ctx.deref_obj();
            sess.step = Step::Done;
            return StepOutcome::Continue(sess);
        }
    } else if !sess.wantbody {
        sess.ctx.deref_obj();
        sess.step = Step::Done;
        return StepOutcome::Continue(sess);
    }

    let chunked = if sess.esi_level == 0 {
        mode.contains(ResMode::CHUNKED)
    } else {
        sess.esi_wrap_chunked
    };

    let res = if mode.contains(ResMode::ESI) {
        let (back, r) = esi_deliver(wrk, sess, chunked).await;
        sess = back;
        r
    } else if mode.contains(ResMode::GUNZIP) {
        write_gunzipped(&mut sess, chunked, io).await
    } else {
        write_plain(&mut sess, chunked, io).await
    };

    if res.is_err() {
        sess.set_close("senderr");
    } else if chunked && sess.esi_level == 0 {
        if write_last_chunk(&mut sess.htc, io, &cancel).await.is_err() {
            sess.set_close("senderr");
        }
    }

    sess.ctx.deref_obj();
    sess.step = Step::Done;
    StepOutcome::Continue(sess)
}

/// Plain body write: the stored chunks in order, framed as selected.
async fn write_plain(sess: &mut Session, chunked: bool, io: Duration) -> Result<()> {
    let cancel = sess.core.cancel.clone();
    let chunks: Vec<Bytes> = sess
        .ctx
        .obj
        .as_ref()
        .map(|o| o.get().body_chunks().to_vec())
        .unwrap_or_default();
    for c in chunks {
        let n = write_piece(&mut sess.htc, chunked, &c, io, &cancel).await?;
        sess.ctx.acct_bodybytes += n;
    }
    Ok(())
}

/// GUNZIP overlay: inflate the stored gzip body for a client that does not
/// accept gzip; bounded bounce buffer, stored object untouched.
async fn write_gunzipped(sess: &mut Session, chunked: bool, io: Duration) -> Result<()> {
    let cancel = sess.core.cancel.clone();
    let buf = sess.core.cfg.engine.gzip_stack_buffer;
    let chunks: Vec<Bytes> = sess
        .ctx
        .obj
        .as_ref()
        .map(|o| o.get().body_chunks().to_vec())
        .unwrap_or_default();

    let mut gz = GunzipStream::new(buf);
    for c in chunks {
        for piece in gz.push(&c)? {
            let n = write_piece(&mut sess.htc, chunked, &piece, io, &cancel).await?;
            sess.ctx.acct_bodybytes += n;
        }
    }
    for piece in gz.finish()? {
        let n = write_piece(&mut sess.htc, chunked, &piece, io, &cancel).await?;
        sess.ctx.acct_bodybytes += n;
    }
    Ok(())
}

/// Saved request state around one embedded include.
struct ChildSave {
    req: HttpMsg,
    http0: Option<HttpMsg>,
    wantbody: bool,
    sendbody: bool,
    digest: [u8; 32],
    err_code: u16,
    err_reason: Option<String>,
    synth_body: Option<String>,
    restarts: u32,
    req_body: Option<Bytes>,
    req_bodybytes: u64,
    res_mode: ResMode,
    t_req: f64,
    t_resp: f64,
    t_end: f64,
    wrap_chunked: bool,
}

/// Walks the esidata segments: literals straight from the stored body,
/// includes as embedded requests driven inline through the engine.
async fn esi_deliver(
    wrk: &mut Worker,
    mut sess: Box<Session>,
    chunked: bool,
) -> (Box<Session>, Result<()>) {
    let io = sess.core.cfg.timeouts.send_timeout;
    let cancel = sess.core.cancel.clone();
    let max_depth = sess.core.cfg.engine.max_esi_depth;

    let (body, segs) = {
        let obj = sess.ctx.obj.as_ref().expect("esi without object").get();
        let body = obj
            .body_chunks()
            .first()
            .cloned()
            .unwrap_or_else(Bytes::new);
        let segs = obj.esidata.clone().expect("esi without esidata");
        (body, segs)
    };

    for seg in segs {
        match seg {
            EsiSeg::Literal { off, len } => {
                let piece = body.slice(off..off + len);
                match write_piece(&mut sess.htc, chunked, &piece, io, &cancel).await {
                    Ok(n) => sess.ctx.acct_bodybytes += n,
                    Err(e) => return (sess, Err(e)),
                }
            },
            EsiSeg::Include { src } => {
                if sess.esi_level + 1 > max_depth {
                    wrk.vlog("EsiDepth", format!("include {src} over depth cap"));
                    continue;
                }
                sess = run_include(wrk, sess, &src, chunked).await;
            },
        }
    }
    (sess, Ok(()))
}

/// Executes one `<esi:include>` as an embedded request on the same session:
/// save, rewrite, drive the machine from Recv until Done hands control back,
/// restore.
async fn run_include(
    wrk: &mut Worker,
    mut sess: Box<Session>,
    src: &str,
    chunked: bool,
) -> Box<Session> {
    let saved = ChildSave {
        req: sess.req.clone(),
        http0: sess.http0.take(),
        wantbody: sess.wantbody,
        sendbody: sess.sendbody,
        digest: sess.digest,
        err_code: sess.err_code,
        err_reason: sess.err_reason.take(),
        synth_body: sess.synth_body.take(),
        restarts: sess.restarts,
        req_body: sess.req_body.take(),
        req_bodybytes: sess.req_bodybytes,
        res_mode: sess.ctx.res_mode,
        t_req: sess.t_req,
        t_resp: sess.t_resp,
        t_end: sess.t_end,
        wrap_chunked: sess.esi_wrap_chunked,
    };

    let mut creq = saved.req.clone();
    creq.method = "GET".into();
    creq.url = src.to_string();
    creq.unset("if-modified-since");
    creq.unset("if-none-match");
    creq.unset("range");
    creq.unset("content-length");
    sess.http0 = Some(creq.clone());
    sess.req = creq;

    sess.esi_level += 1;
    sess.esi_wrap_chunked = chunked;
    sess.wantbody = true;
    sess.sendbody = false;
    sess.restarts = 0;
    sess.err_code = 0;
    sess.handling = crate::policy::Handling::Undefined;
    sess.step = Step::Recv;

    loop {
        match Box::pin(dispatch_one(wrk, sess)).await {
            StepOutcome::Continue(s) => sess = s,
            StepOutcome::ParentReturn(s) => {
                sess = s;
                break;
            },
            StepOutcome::Gone => {
                panic!("embedded include lost its session")
            },
        }
    }

    sess.esi_level -= 1;
    sess.req = saved.req;
    sess.http0 = saved.http0;
    sess.wantbody = saved.wantbody;
    sess.sendbody = saved.sendbody;
    sess.digest = saved.digest;
    sess.err_code = saved.err_code;
    sess.err_reason = saved.err_reason;
    sess.synth_body = saved.synth_body;
    sess.restarts = saved.restarts;
    sess.req_body = saved.req_body;
    sess.req_bodybytes = saved.req_bodybytes;
    sess.ctx.res_mode = saved.res_mode;
    sess.t_req = saved.t_req;
    sess.t_resp = saved.t_resp;
    sess.t_end = saved.t_end;
    sess.esi_wrap_chunked = saved.wrap_chunked;
    sess
}

/// Overlapped fetch and delivery for a still-busy object: the fetch loop
/// appends to the exclusively-owned object and forwards each transformed
/// chunk to the client on the same task.
pub(crate) async fn stream_body(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    assert_eq!(sess.esi_level, 0, "streaming inside an embedded request");

    let timeouts = sess.core.cfg.timeouts.clone();
    let cancel = sess.core.cancel.clone();
    let io = timeouts.send_timeout;
    let mode = sess.ctx.res_mode;
    let chunked = mode.contains(ResMode::CHUNKED);
    let gunzip_buf = sess.core.cfg.engine.gzip_stack_buffer;

    // stream start: the response head goes out before the body exists
    let mut resp = sess
        .ctx
        .resp
        .take()
        .unwrap_or_else(|| HttpMsg::new_response(500, reason(500)));
    resp.set(
        "Connection",
        if sess.doclose.is_some() {
            "close"
        } else {
            "keep-alive"
        },
    );
    let head = resp.serialize_response();
    let mut write_failed = sess.htc.write_all(&head, io, &cancel).await.is_err();

    let mut obj = match sess.ctx.obj.take() {
        Some(ObjRef::Owned(o)) => o,
        _ => unreachable!("streaming without an owned object"),
    };

    let mut gz = if mode.contains(ResMode::GUNZIP) {
        Some(GunzipStream::new(gunzip_buf))
    } else {
        None
    };

    // fetch + deliver loop
    let mut fetch_err: Option<anyhow::Error> = None;
    let mut acct: u64 = 0;
    {
        let Session { htc, ctx, .. } = &mut *sess;
        let bo = ctx.busyobj.as_mut().expect("stream without busyobj");
        let mut vfp = make_vfp(bo.vfp, bo.is_gzip);
        let body_status = bo.body_status;

        if let Err(e) = vfp.begin() {
            fetch_err = Some(e);
        } else {
            let conn = bo.vbc.as_mut().expect("stream without backend conn");
            let mut rdr = crate::backend::io::BodyReader::new(conn, body_status);
            let mut out: Vec<Bytes> = Vec::new();
            loop {
                let chunk = match rdr.next_chunk(&timeouts, &cancel).await {
                    Ok(Some(c)) => Some(c),
                    Ok(None) => None,
                    Err(e) => {
                        fetch_err = Some(e);
                        break;
                    },
                };
                let finished = chunk.is_none();
                let step_res = match chunk {
                    Some(c) => vfp.push(&mut out, &c),
                    None => vfp.finish(&mut out),
                };
                if let Err(e) = step_res {
                    fetch_err = Some(e);
                    break;
                }
                for c in out.drain(..) {
                    if let Err(e) = obj.append_chunk(c.clone()) {
                        fetch_err = Some(e);
                        break;
                    }
                    if write_failed {
                        continue;
                    }
                    write_failed = !stream_write(
                        htc, &mut gz, chunked, &c, io, &cancel, &mut acct,
                    )
                    .await;
                }
                if fetch_err.is_some() || finished {
                    break;
                }
            }
        }
    }
    sess.ctx.acct_bodybytes += acct;

    // stream end
    if fetch_err.is_none()
        && !write_failed
        && let Some(gz) = gz.as_mut()
    {
        match gz.finish() {
            Ok(pieces) => {
                for p in pieces {
                    match write_piece(&mut sess.htc, chunked, &p, io, &cancel).await {
                        Ok(n) => sess.ctx.acct_bodybytes += n,
                        Err(_) => {
                            write_failed = true;
                            break;
                        },
                    }
                }
            },
            Err(_) => write_failed = true,
        }
    }
    if fetch_err.is_none() && !write_failed && chunked {
        write_failed = write_last_chunk(&mut sess.htc, io, &cancel)
            .await
            .is_err();
    }
    if write_failed {
        sess.set_close("senderr");
    }

    match fetch_err {
        None => {
            if let Some(objcore) = sess.ctx.objcore.clone() {
                let exp = sess
                    .ctx
                    .busyobj
                    .as_ref()
                    .map(|bo| bo.exp)
                    .unwrap_or_default();
                let shared = ObjRef::Owned(obj).into_shared();
                sess.core.exp.insert(objcore.clone());
                sess.core.cache.unbusy(&objcore, shared, exp);
            } else {
                drop(obj);
            }
            fetch::release_backend(&mut sess).await;
        },
        Some(e) => {
            wrk.stats.fetch_failed += 1;
            wrk.vlog("StreamError", format!("xid {} {e:#}", sess.xid));
            sess.set_close("Stream error");
            drop(obj);
            // withdraw the busy entry and close the broken backend side
            if let Some(bo) = sess.ctx.busyobj.as_mut()
                && let Some(vbc) = bo.vbc.take()
            {
                vbc.close().await;
            }
            if let Some(core) = sess.ctx.objcore.take() {
                sess.core.cache.drop_busy(&core);
            }
        },
    }

    sess.ctx.deref_obj();
    sess.step = Step::Done;
    StepOutcome::Continue(sess)
}

/// One streamed piece to the client, through the gunzip bounce buffer when
/// GUNZIP framing is active. Returns false on a write failure.
async fn stream_write(
    htc: &mut HttpConn,
    gz: &mut Option<GunzipStream>,
    chunked: bool,
    data: &Bytes,
    io: Duration,
    cancel: &CancellationToken,
    acct: &mut u64,
) -> bool {
    match gz {
        Some(gz) => {
            let pieces = match gz.push(data) {
                Ok(p) => p,
                Err(_) => return false,
            };
            for p in pieces {
                match write_piece(htc, chunked, &p, io, cancel).await {
                    Ok(n) => *acct += n,
                    Err(_) => return false,
                }
            }
            true
        },
        None => match write_piece(htc, chunked, data, io, cancel).await {
            Ok(n) => {
                *acct += n;
                true
            },
            Err(_) => false,
        },
    }
}
