// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use revcache_rs::http::{
    msg::{DissectError, FilterSet, HttpMsg, parse_request_head, parse_response_head},
    status::{http_date, parse_http_date, reason},
};

#[test]
fn test_request_head_roundtrip() -> Result<()> {
    let raw = b"GET /x/y?q=1 HTTP/1.1\r\nHost: example.org\r\nUser-Agent: t\r\n\r\n";
    let msg = parse_request_head(raw)?;
    assert_eq!(msg.method, "GET");
    assert_eq!(msg.url, "/x/y?q=1");
    assert_eq!(msg.get("HOST"), Some("example.org"));

    let out = msg.serialize_request();
    let again = parse_request_head(&out)?;
    assert_eq!(again.url, msg.url);
    assert_eq!(again.field_count(), msg.field_count());
    Ok(())
}

#[test]
fn test_response_head_parse() -> Result<()> {
    let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
    let msg = parse_response_head(raw)?;
    assert_eq!(msg.status, 404);
    assert_eq!(msg.reason, "Not Found");
    assert_eq!(msg.content_length(), Some(0));
    Ok(())
}

#[test]
fn test_response_without_reason() -> Result<()> {
    let msg = parse_response_head(b"HTTP/1.1 200\r\n\r\n")?;
    assert_eq!(msg.status, 200);
    assert_eq!(msg.reason, "");
    Ok(())
}

#[test]
fn test_obs_fold_continuation() -> Result<()> {
    let raw = b"GET / HTTP/1.1\r\nX-Long: a\r\n b\r\nHost: h\r\n\r\n";
    let msg = parse_request_head(raw)?;
    assert_eq!(msg.get("x-long"), Some("a b"));
    Ok(())
}

#[test]
fn test_junk_and_protocol_errors() {
    assert_eq!(
        parse_request_head(b"FOO\r\n\r\n").unwrap_err(),
        DissectError::Junk
    );
    assert_eq!(
        parse_request_head(b"G=T / HTTP/1.1\r\n\r\n").unwrap_err(),
        DissectError::Junk
    );
    assert_eq!(
        parse_request_head(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
        DissectError::Protocol
    );
    assert_eq!(DissectError::Protocol.status(), 505);
    assert_eq!(DissectError::Junk.status(), 400);
}

#[test]
fn test_hop_by_hop_always_dropped() {
    let mut req = HttpMsg::new_request("GET", "/");
    req.add("Transfer-Encoding", "chunked");
    req.add("Upgrade", "h2c");
    req.add("Host", "h");
    for set in [
        FilterSet::BereqFetch,
        FilterSet::BereqPass,
        FilterSet::BereqPipe,
    ] {
        let out = req.filter_fields(set);
        assert!(!out.has("transfer-encoding"), "{set:?}");
        assert!(!out.has("upgrade"), "{set:?}");
        assert!(out.has("host"), "{set:?}");
    }
}

#[test]
fn test_obj_insert_drops_set_cookie() {
    let mut resp = HttpMsg::new_response(200, "OK");
    resp.add("Set-Cookie", "a=1");
    resp.add("Content-Type", "text/plain");
    assert!(!resp.filter_fields(FilterSet::ObjInsert).has("set-cookie"));
    assert!(resp.filter_fields(FilterSet::ObjPass).has("set-cookie"));
}

#[test]
fn test_token_scan_ignores_params() {
    let mut m = HttpMsg::new_request("GET", "/");
    m.add("Cache-Control", "max-age=0, no-cache;reason=x");
    assert!(m.has_token("cache-control", "no-cache"));
    assert!(!m.has_token("cache-control", "no-store"));
}

#[test]
fn test_reason_and_dates() {
    assert_eq!(reason(503), "Service Unavailable");
    let t = parse_http_date("Thu, 01 Jan 1970 00:00:10 GMT").expect("epoch+10");
    assert_eq!(t, 10.0);
    assert_eq!(http_date(10.0), "Thu, 01 Jan 1970 00:00:10 GMT");
}
