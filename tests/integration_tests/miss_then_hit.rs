// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use revcache_rs::policy::BuiltinPolicy;

use crate::common::{
    OriginReply, connect, get_request, http_response, roundtrip, spawn_origin,
    start_proxy, test_config,
};

#[tokio::test]
async fn test_miss_store_then_hit() -> Result<()> {
    let origin = spawn_origin(|_, _| {
        OriginReply::simple(http_response(200, &[], b"hello"))
    })
    .await?;
    let (core, addr) =
        start_proxy(test_config(&origin.addr), Arc::new(BuiltinPolicy)).await?;

    let mut c = connect(&addr).await?;
    let r1 = roundtrip(&mut c, &get_request("/a", &[])).await?;
    assert_eq!(r1.status, 200);
    assert_eq!(r1.header("content-length"), Some("5"));
    assert_eq!(r1.body, b"hello");
    assert_eq!(origin.hits(), 1);

    // second request on the same keep-alive connection is served from cache
    let r2 = roundtrip(&mut c, &get_request("/a", &[])).await?;
    assert_eq!(r2.status, 200);
    assert_eq!(r2.body, b"hello");
    assert_eq!(origin.hits(), 1, "hit must not touch the origin");
    assert!(r2.header("age").is_some());
    assert_eq!(r2.header("via"), Some("1.1 varnish"));

    // a different url misses again
    let mut c2 = connect(&addr).await?;
    let r3 = roundtrip(&mut c2, &get_request("/other", &[])).await?;
    assert_eq!(r3.status, 200);
    assert_eq!(origin.hits(), 2);

    core.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn test_uncacheable_status_fetched_every_time() -> Result<()> {
    let origin = spawn_origin(|_, _| {
        OriginReply::simple(http_response(500, &[], b"boom"))
    })
    .await?;
    let (core, addr) =
        start_proxy(test_config(&origin.addr), Arc::new(BuiltinPolicy)).await?;

    let mut c = connect(&addr).await?;
    let r1 = roundtrip(&mut c, &get_request("/e", &[])).await?;
    assert_eq!(r1.status, 500);
    let r2 = roundtrip(&mut c, &get_request("/e", &[])).await?;
    assert_eq!(r2.status, 500);
    assert_eq!(origin.hits(), 2, "a 500 must not be served from cache");

    core.cancel.cancel();
    Ok(())
}
