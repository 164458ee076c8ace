// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use revcache_rs::{
    policy::{Handling, Policy},
    session::Session,
};

use crate::common::{
    OriginReply, connect, get_request, http_response, roundtrip, spawn_origin,
    start_proxy, test_config,
};

/// Restarts forever; the engine must cut the loop at max_restarts.
#[derive(Debug)]
struct AlwaysRestart;

impl Policy for AlwaysRestart {
    fn recv(&self, _sess: &mut Session) -> Handling {
        Handling::Restart
    }
}

#[tokio::test]
async fn test_restart_cap_yields_synthetic_503() -> Result<()> {
    let origin = spawn_origin(|_, _| {
        OriginReply::simple(http_response(200, &[], b"unreached"))
    })
    .await?;
    let mut cfg = test_config(&origin.addr);
    cfg.engine.max_restarts = 2;
    let (core, addr) = start_proxy(cfg, Arc::new(AlwaysRestart)).await?;

    let mut c = connect(&addr).await?;
    let resp = roundtrip(&mut c, &get_request("/loop", &[])).await?;

    assert_eq!(resp.status, 503);
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(resp.header("server"), Some("Varnish"));
    assert!(
        String::from_utf8_lossy(&resp.body).contains("503"),
        "synthetic body names the status"
    );
    assert_eq!(origin.hits(), 0, "the loop never reaches the backend");

    core.cancel.cancel();
    Ok(())
}

/// One restart below the cap succeeds: the policy restarts the first pass
/// and routes to lookup on the second.
#[derive(Debug)]
struct RestartOnce;

impl Policy for RestartOnce {
    fn recv(&self, sess: &mut Session) -> Handling {
        if sess.restarts == 0 {
            Handling::Restart
        } else {
            Handling::Lookup
        }
    }
}

#[tokio::test]
async fn test_restart_below_cap_proceeds() -> Result<()> {
    let origin = spawn_origin(|_, _| {
        OriginReply::simple(http_response(200, &[], b"made it"))
    })
    .await?;
    let mut cfg = test_config(&origin.addr);
    cfg.engine.max_restarts = 2;
    let (core, addr) = start_proxy(cfg, Arc::new(RestartOnce)).await?;

    let mut c = connect(&addr).await?;
    let resp = roundtrip(&mut c, &get_request("/once", &[])).await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"made it");
    assert_eq!(origin.hits(), 1);

    core.cancel.cancel();
    Ok(())
}
