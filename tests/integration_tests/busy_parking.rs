// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use revcache_rs::policy::BuiltinPolicy;
use tokio::time::sleep;

use crate::common::{
    OriginReply, connect, get_request, http_response, roundtrip, spawn_origin,
    start_proxy, test_config,
};

/// Two concurrent requests for the same url: only one backend fetch happens.
/// The second session parks on the busy objhead and takes the hit path once
/// the first publishes.
#[tokio::test]
async fn test_second_request_parks_until_unbusy() -> Result<()> {
    let origin = spawn_origin(|_, _| OriginReply {
        delay_before: Duration::from_millis(400),
        parts: vec![(http_response(200, &[], b"slow-body"), Duration::ZERO)],
    })
    .await?;
    let (core, addr) =
        start_proxy(test_config(&origin.addr), Arc::new(BuiltinPolicy)).await?;

    let addr2 = addr.clone();
    let first = tokio::spawn(async move {
        let mut c = connect(&addr2).await?;
        roundtrip(&mut c, &get_request("/c", &[])).await
    });

    // let the first request reach the backend before the second arrives
    sleep(Duration::from_millis(100)).await;
    let mut c2 = connect(&addr).await?;
    let r2 = roundtrip(&mut c2, &get_request("/c", &[])).await?;
    let r1 = first.await.expect("join")?;

    assert_eq!(r1.status, 200);
    assert_eq!(r2.status, 200);
    assert_eq!(r1.body, b"slow-body");
    assert_eq!(r2.body, b"slow-body");
    assert_eq!(origin.hits(), 1, "exactly one fetcher per (hash, vary)");

    core.cancel.cancel();
    Ok(())
}
