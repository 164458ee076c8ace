// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;

use crate::{
    backend::io::{Backend, BackendConn, BodyReader, classify_body},
    body::{VfpKind, esi, make_vfp},
    cache::{
        index::build_vary_spec,
        object::{ExpSpec, Object},
        storage::StorageHint,
    },
    cfg::config::CacheConfig,
    engine::{Step, StepOutcome, dispatch::abandon_busy},
    http::{
        msg::{FilterSet, HttpMsg, conditional_match},
        status::{parse_http_date, reason},
    },
    policy::Handling,
    session::{ObjRef, Session},
    utils,
    worker::Worker,
};

/// Default TTL per RFC 2616 semantics: s-maxage, then max-age, then
/// Expires-Date, then the configured default; statuses outside the cacheable
/// set never enter the cache.
pub(crate) fn rfc2616_ttl(beresp: &HttpMsg, now: f64, cfg: &CacheConfig) -> ExpSpec {
    let mut ttl = match beresp.status {
        200 | 203 | 300 | 301 | 302 | 404 | 410 => cfg.default_ttl,
        _ => -1.0,
    };

    if ttl >= 0.0 {
        if let Some(cc) = beresp.get("cache-control") {
            if let Some(v) = cc_seconds(cc, "s-maxage") {
                ttl = v;
            } else if let Some(v) = cc_seconds(cc, "max-age") {
                ttl = v;
            } else if let Some(v) = expires_delta(beresp, now) {
                ttl = v;
            }
        } else if let Some(v) = expires_delta(beresp, now) {
            ttl = v;
        }
    }

    ExpSpec {
        entered: now,
        ttl,
        grace: cfg.default_grace,
        keep: cfg.default_keep,
    }
}

fn cc_seconds(cc: &str, key: &str) -> Option<f64> {
    for part in cc.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix(key)
            && let Some(v) = v.strip_prefix('=')
        {
            return v.trim().trim_matches('"').parse::<f64>().ok();
        }
    }
    None
}

fn expires_delta(beresp: &HttpMsg, now: f64) -> Option<f64> {
    let exp = parse_http_date(beresp.get("expires")?)?;
    let base = beresp
        .get("date")
        .and_then(parse_http_date)
        .unwrap_or(now);
    Some(exp - base)
}

/// Backend header fetch with exactly one retry: recycled connections race
/// the server's idle timeout, so a loss on one is retried on a fresh dial.
pub(crate) async fn fetch(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    // A pass forwards the client body; read it before talking upstream.
    if sess.sendbody
        && sess.req_body.is_none()
        && let Some(cl) = sess.req.content_length()
        && cl > 0
    {
        let max = sess.core.cfg.engine.max_req_body;
        let timeouts = sess.core.cfg.timeouts.clone();
        let cancel = sess.core.cancel.clone();
        match sess
            .htc
            .read_body(cl, max, timeouts.between_bytes_timeout, &cancel)
            .await
        {
            Ok(body) => {
                sess.req_bodybytes = body.len() as u64;
                sess.req_body = Some(body);
            },
            Err(_) => {
                abandon_busy(&mut sess);
                sess.set_close("req body read error");
                sess.step = Step::Done;
                return StepOutcome::Continue(sess);
            },
        }
    }

    let core = sess.core.clone();
    let timeouts = core.cfg.timeouts.clone();
    let cancel = core.cancel.clone();
    let bo = sess.ctx.busyobj.as_ref().expect("fetch without busyobj");
    let backend = core.backends[bo.backend_idx].clone();
    let head = bo.bereq.serialize_request();
    let fwd_body = if sess.sendbody {
        sess.req_body.clone()
    } else {
        None
    };

    let mut attempt = 0u32;
    let (conn, beresp) = loop {
        attempt += 1;
        match try_fetch_headers(&backend, &head, fwd_body.as_ref(), &timeouts, &cancel)
            .await
        {
            Ok(pair) => break pair,
            Err(retryable) => {
                if retryable && attempt == 1 {
                    wrk.stats.backend_retry += 1;
                    wrk.vlog("BackendRetry", format!("xid {}", sess.xid));
                    continue;
                }
                wrk.stats.fetch_failed += 1;
                sess.handling = Handling::Error;
                sess.err_code = 503;
                abandon_busy(&mut sess);
                sess.step = Step::Error;
                return StepOutcome::Continue(sess);
            },
        }
    };

    wrk.stats.backend_req += 1;
    wrk.vlog(
        "BackendStatus",
        format!("xid {} status {}", sess.xid, beresp.status),
    );

    let is_pass = sess.ctx.objcore.is_none();
    let now = utils::now();
    let cache_cfg = sess.core.cfg.cache.clone();
    {
        let bo = sess.ctx.busyobj.as_mut().expect("fetch without busyobj");
        let mut beresp = beresp;
        beresp.collapse("cache-control");
        beresp.collapse("vary");
        bo.body_status = classify_body(&bo.bereq.method, &beresp);
        bo.should_close = beresp.has_token("connection", "close")
            || (!beresp.is_http11() && !beresp.has_token("connection", "keep-alive"));
        bo.exp = rfc2616_ttl(&beresp, now, &cache_cfg);
        if is_pass {
            // a pass object must never be cached
            bo.exp.ttl = -1.0;
        }
        bo.beresp = Some(beresp);
        bo.vbc = Some(conn);
    }

    let policy = sess.policy.clone().expect("fetch without policy");
    let handling = policy.fetch(&mut sess);
    sess.handling = handling;

    match handling {
        Handling::HitForPass => {
            if let Some(core) = sess.ctx.objcore.as_ref() {
                core.set_pass();
            }
            sess.step = Step::FetchBody;
        },
        Handling::Deliver => sess.step = Step::FetchBody,
        Handling::Restart => {
            fetch_cleanup(&mut sess).await;
            sess.restarts += 1;
            sess.step = Step::Recv;
        },
        Handling::Error => {
            fetch_cleanup(&mut sess).await;
            sess.step = Step::Error;
        },
        other => panic!("fetch: illegal handling {other:?}"),
    }
    StepOutcome::Continue(sess)
}

async fn try_fetch_headers(
    backend: &Backend,
    head: &[u8],
    body: Option<&Bytes>,
    timeouts: &crate::cfg::config::Timeouts,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(BackendConn, HttpMsg), bool> {
    let mut conn = match backend.get_conn(timeouts, cancel).await {
        Ok(c) => c,
        Err(_) => return Err(false),
    };
    let recycled = conn.recycled;
    if let Err(_e) = conn.send_request(head, body, timeouts, cancel).await {
        conn.close().await;
        return Err(recycled);
    }
    match conn.read_response_head(timeouts, cancel).await {
        Ok(beresp) => Ok((conn, beresp)),
        Err(_) => {
            conn.close().await;
            Err(recycled)
        },
    }
}

/// Backend-side teardown for restart/error leaving the fetch family.
pub(crate) async fn fetch_cleanup(sess: &mut Session) {
    if let Some(bo) = sess.ctx.busyobj.as_mut()
        && let Some(vbc) = bo.vbc.take()
    {
        vbc.close().await;
    }
    abandon_busy(sess);
}

/// The storage and delivery pipeline decision, then the body fetch itself
/// (unless streaming hands it to StreamBody).
pub(crate) async fn fetch_body(wrk: &mut Worker, mut sess: Box<Session>) -> StepOutcome {
    let gzip_on = sess.core.cfg.engine.http_gzip_support;
    let shortlived = sess.core.cfg.cache.shortlived;
    let is_pass = sess.ctx.objcore.is_none();
    let esi_level = sess.esi_level;
    let wantbody = sess.wantbody;

    // Pipeline selection: later clamps respect earlier ones.
    {
        let bo = sess.ctx.busyobj.as_mut().expect("fetchbody without busyobj");
        let beresp = bo.beresp.as_mut().expect("fetchbody without beresp");

        if !gzip_on {
            bo.do_gzip = false;
            bo.do_gunzip = false;
        }
        let ce = beresp.get("content-encoding").map(str::trim);
        bo.is_gzip = ce.is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        bo.is_gunzip = ce.is_none();
        if !bo.is_gzip {
            bo.do_gunzip = false;
        }
        if bo.do_gunzip {
            beresp.unset("content-encoding");
        }
        if !bo.is_gunzip {
            bo.do_gzip = false;
        }
        if bo.do_gzip {
            beresp.set("Content-Encoding", "gzip");
        }
        bo.assert_encoding_invariants();

        bo.vfp = if bo.do_esi {
            VfpKind::Esi
        } else if bo.do_gunzip {
            VfpKind::Gunzip
        } else if bo.do_gzip {
            VfpKind::Gzip
        } else if bo.is_gzip {
            VfpKind::TestGzip
        } else {
            VfpKind::Identity
        };

        if bo.vfp == VfpKind::Esi || esi_level > 0 || !wantbody {
            bo.do_stream = false;
        }

        if !is_pass {
            bo.vary = build_vary_spec(
                bo.beresp.as_ref().expect("beresp set above"),
                &bo.bereq,
            );
        }
    }

    // Header allocation estimate and storage selection.
    let (filtered, hdr_est, mut hint) = {
        let bo = sess.ctx.busyobj.as_ref().expect("busyobj");
        let beresp = bo.beresp.as_ref().expect("beresp");
        let filtered = beresp.filter_fields(if is_pass {
            FilterSet::ObjPass
        } else {
            FilterSet::ObjInsert
        });
        let vary_len = bo.vary.as_ref().map_or(0, Vec::len);
        // padding covers a rewritten Content-Length
        let est = (filtered.estimate_bytes() + vary_len + 64) as u64;
        let hint = if bo.exp.ttl < shortlived || is_pass {
            StorageHint::Transient
        } else {
            StorageHint::Default
        };
        (filtered, est, hint)
    };

    let now = utils::now();
    let mut obj = Object::alloc(&sess.core.storage, hint, hdr_est, now);
    if obj.is_none() && hint == StorageHint::Default {
        // fall back to transient and clamp the lifetime accordingly
        hint = StorageHint::Transient;
        let bo = sess.ctx.busyobj.as_mut().expect("busyobj");
        bo.exp.ttl = bo.exp.ttl.min(shortlived);
        bo.exp.grace = 0.0;
        bo.exp.keep = 0.0;
        obj = Object::alloc(&sess.core.storage, hint, hdr_est, now);
    }
    let Some(mut obj) = obj else {
        wrk.stats.fetch_failed += 1;
        sess.err_code = 503;
        fetch_cleanup(&mut sess).await;
        sess.step = Step::Error;
        return StepOutcome::Continue(sess);
    };

    // Populate the stored headers.
    {
        let bo = sess.ctx.busyobj.as_ref().expect("busyobj");
        let beresp = bo.beresp.as_ref().expect("beresp");
        obj.xid = sess.xid;
        obj.response = beresp.status;
        obj.http = filtered;
        obj.http.proto = "HTTP/1.1".into();
        obj.http.status = beresp.status;
        obj.http.reason = if beresp.reason.is_empty() {
            reason(beresp.status).to_string()
        } else {
            beresp.reason.clone()
        };
        obj.last_modified = beresp
            .get("last-modified")
            .and_then(parse_http_date)
            .unwrap_or_else(|| bo.exp.entered.floor());
        obj.gziped = matches!(bo.vfp, VfpKind::Gzip | VfpKind::TestGzip);
        obj.vary = bo.vary.clone();
        // a transforming pipeline invalidates the backend's length
        if !matches!(bo.vfp, VfpKind::Identity | VfpKind::TestGzip) {
            obj.http.unset("content-length");
        }
    }

    // 304 decision: a conditional client may still get a 304, which rules
    // out streaming the 200 body.
    let cond_may_304 = obj.response == 200
        && conditional_match(&sess.req, obj.last_modified, obj.http.get("etag"));
    if cond_may_304
        && let Some(bo) = sess.ctx.busyobj.as_mut()
    {
        bo.do_stream = false;
    }

    let do_stream = sess
        .ctx
        .busyobj
        .as_ref()
        .is_some_and(|bo| bo.do_stream);

    if do_stream {
        // streaming a fully cached object is impossible
        debug_assert!(
            sess.ctx
                .objcore
                .as_ref()
                .map_or(true, |c| c.is_busy() || c.is_pass()),
            "streaming over a settled objcore"
        );
        sess.ctx.obj = Some(ObjRef::Owned(Box::new(obj)));
        sess.step = Step::PrepResp;
        return StepOutcome::Continue(sess);
    }

    // Unstreamed: run the transform pipeline to EOF right here.
    match run_fetch_body(&mut sess, &mut obj).await {
        Ok(()) => {},
        Err(e) => {
            wrk.stats.fetch_failed += 1;
            wrk.vlog("FetchError", format!("xid {} {e:#}", sess.xid));
            drop(obj);
            sess.err_code = 503;
            fetch_cleanup(&mut sess).await;
            sess.step = Step::Error;
            return StepOutcome::Continue(sess);
        },
    }

    // ESI processing over the complete body.
    let do_esi = sess
        .ctx
        .busyobj
        .as_ref()
        .is_some_and(|bo| bo.vfp == VfpKind::Esi);
    if do_esi {
        let body = obj.body_vec();
        if let Some(segs) = esi::parse(&body) {
            obj.reassemble();
            obj.esidata = Some(segs);
        }
        // a gzipped source was inflated for parsing; the stored body is plain
        obj.http.unset("content-encoding");
        obj.gziped = false;
    }

    release_backend(&mut sess).await;

    // Publish (miss) or keep exclusively (pass).
    if let Some(objcore) = sess.ctx.objcore.clone() {
        let exp = sess
            .ctx
            .busyobj
            .as_ref()
            .map(|bo| bo.exp)
            .unwrap_or_default();
        let shared = ObjRef::Owned(Box::new(obj)).into_shared();
        sess.core.exp.insert(objcore.clone());
        sess.core.cache.unbusy(&objcore, shared.clone(), exp);
        sess.ctx.obj = Some(ObjRef::Shared(shared));
    } else {
        sess.ctx.obj = Some(ObjRef::Owned(Box::new(obj)));
    }

    sess.step = Step::PrepResp;
    StepOutcome::Continue(sess)
}

/// Returns the backend connection to the idle stack or closes it, honoring
/// the server's keep-alive intent.
pub(crate) async fn release_backend(sess: &mut Session) {
    let (vbc, should_close, backend_idx) = {
        let Some(bo) = sess.ctx.busyobj.as_mut() else {
            return;
        };
        let Some(vbc) = bo.vbc.take() else {
            return;
        };
        (vbc, bo.should_close, bo.backend_idx)
    };
    if should_close {
        vbc.close().await;
    } else {
        sess.core.backends[backend_idx].recycle(vbc);
    }
}

/// Drives the backend body through the chosen transform into the object.
pub(crate) async fn run_fetch_body(
    sess: &mut Session,
    obj: &mut Object,
) -> Result<()> {
    let timeouts = sess.core.cfg.timeouts.clone();
    let cancel = sess.core.cancel.clone();
    let bo = sess.ctx.busyobj.as_mut().expect("fetch body without busyobj");

    let mut vfp = make_vfp(bo.vfp, bo.is_gzip);
    vfp.begin()?;

    let body_status = bo.body_status;
    let conn = bo.vbc.as_mut().expect("fetch body without backend conn");
    let mut rdr = BodyReader::new(conn, body_status);
    let mut out: Vec<Bytes> = Vec::new();

    while let Some(chunk) = rdr.next_chunk(&timeouts, &cancel).await? {
        vfp.push(&mut out, &chunk)?;
        for c in out.drain(..) {
            obj.append_chunk(c)?;
        }
    }
    vfp.finish(&mut out)?;
    for c in out.drain(..) {
        obj.append_chunk(c)?;
    }
    Ok(())
}
