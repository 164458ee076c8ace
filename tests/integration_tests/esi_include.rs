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

/// Enables ESI processing for the container page only.
#[derive(Debug)]
struct EsiPolicy;

impl Policy for EsiPolicy {
    fn fetch(&self, sess: &mut Session) -> Handling {
        if let Some(bo) = sess.ctx.busyobj.as_mut()
            && bo.bereq.url == "/page"
        {
            bo.do_esi = true;
        }
        Handling::Deliver
    }
}

#[tokio::test]
async fn test_include_assembled_from_fragments() -> Result<()> {
    let origin = spawn_origin(|_, head| {
        let url = head
            .split_ascii_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();
        match url.as_str() {
            "/page" => OriginReply::simple(http_response(
                200,
                &[],
                b"AA<esi:include src=\"/frag\"/>BB",
            )),
            "/frag" => OriginReply::simple(http_response(200, &[], b"FRAG")),
            _ => OriginReply::simple(http_response(404, &[], b"")),
        }
    })
    .await?;
    let (core, addr) =
        start_proxy(test_config(&origin.addr), Arc::new(EsiPolicy)).await?;

    let mut c = connect(&addr).await?;
    let r1 = roundtrip(&mut c, &get_request("/page", &[])).await?;
    assert_eq!(r1.status, 200);
    assert_eq!(
        r1.header("transfer-encoding").map(str::to_ascii_lowercase),
        Some("chunked".into())
    );
    assert_eq!(r1.body, b"AAFRAGBB");
    assert_eq!(origin.hits(), 2, "container plus one fragment fetch");

    // both the page and the fragment are now cached
    let r2 = roundtrip(&mut c, &get_request("/page", &[])).await?;
    assert_eq!(r2.body, b"AAFRAGBB");
    assert_eq!(origin.hits(), 2);

    core.cancel.cancel();
    Ok(())
}

/// A fragment that itself fails becomes that include's synthetic error
/// output; the surrounding literals still deliver.
#[tokio::test]
async fn test_missing_fragment_does_not_break_page() -> Result<()> {
    let origin = spawn_origin(|_, head| {
        let url = head
            .split_ascii_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();
        if url == "/page" {
            OriginReply::simple(http_response(
                200,
                &[],
                b"X<esi:include src=\"/gone\"/>Y",
            ))
        } else {
            OriginReply::simple(http_response(404, &[], b"nope"))
        }
    })
    .await?;
    let (core, addr) =
        start_proxy(test_config(&origin.addr), Arc::new(EsiPolicy)).await?;

    let mut c = connect(&addr).await?;
    let r = roundtrip(&mut c, &get_request("/page", &[])).await?;
    assert_eq!(r.status, 200);
    let body = String::from_utf8_lossy(&r.body);
    assert!(body.starts_with('X'));
    assert!(body.ends_with('Y'));
    assert!(body.contains("nope"), "fragment body still delivered");

    core.cancel.cancel();
    Ok(())
}
