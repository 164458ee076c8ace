// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use revcache_rs::{
    body::gzip::{gunzip_all, gzip_all},
    policy::{Handling, Policy},
    session::Session,
};

use crate::common::{
    OriginReply, connect, get_request, roundtrip, spawn_origin, start_proxy,
    test_config,
};

/// Streams every fetch; everything else is builtin.
#[derive(Debug)]
struct StreamingPolicy;

impl Policy for StreamingPolicy {
    fn fetch(&self, sess: &mut Session) -> Handling {
        if let Some(bo) = sess.ctx.busyobj.as_mut() {
            bo.do_stream = true;
        }
        Handling::Deliver
    }
}

fn gz_response(body_gz: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Encoding: gzip\r\n\r\n",
        body_gz.len()
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body_gz);
    out
}

/// A gzip backend body streamed to a client that only accepts identity:
/// GUNZIP response mode inflates on the way out while the stored object
/// keeps the gzip bytes for gzip-capable clients.
#[tokio::test]
async fn test_streamed_gunzip_delivery_and_gzip_reuse() -> Result<()> {
    let plain: Vec<u8> = b"streamable payload ".repeat(20_000);
    let gz = gzip_all(&plain)?;
    let (head, tail) = gz.split_at(gz.len() / 2);

    let (head_v, tail_v) = (head.to_vec(), tail.to_vec());
    let origin = spawn_origin(move |_, _| {
        let resp = gz_response(&[head_v.clone(), tail_v.clone()].concat());
        let split_at = resp.len() - tail_v.len();
        OriginReply {
            delay_before: Duration::ZERO,
            parts: vec![
                (resp[..split_at].to_vec(), Duration::from_millis(150)),
                (resp[split_at..].to_vec(), Duration::ZERO),
            ],
        }
    })
    .await?;
    let (core, addr) =
        start_proxy(test_config(&origin.addr), Arc::new(StreamingPolicy)).await?;

    // identity client: inflated bytes, chunked framing
    let mut c = connect(&addr).await?;
    let r1 = roundtrip(
        &mut c,
        &get_request("/big", &[("Accept-Encoding", "identity")]),
    )
    .await?;
    assert_eq!(r1.status, 200);
    assert_eq!(r1.header("content-encoding"), None);
    assert_eq!(
        r1.header("transfer-encoding").map(str::to_ascii_lowercase),
        Some("chunked".into())
    );
    assert_eq!(r1.body, plain);
    assert_eq!(origin.hits(), 1);

    // gzip client: the stored object is still the gzip stream
    let mut c2 = connect(&addr).await?;
    let r2 = roundtrip(&mut c2, &get_request("/big", &[("Accept-Encoding", "gzip")]))
        .await?;
    assert_eq!(r2.status, 200);
    assert_eq!(r2.header("content-encoding"), Some("gzip"));
    assert_eq!(gunzip_all(&r2.body)?, plain);
    assert_eq!(origin.hits(), 1, "gzip client is served from cache");

    core.cancel.cancel();
    Ok(())
}
