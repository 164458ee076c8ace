// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use revcache_rs::{
    cache::index::{build_vary_spec, vary_match},
    http::msg::HttpMsg,
    ws::Workspace,
};

fn req_with(pairs: &[(&str, &str)]) -> HttpMsg {
    let mut m = HttpMsg::new_request("GET", "/");
    for (n, v) in pairs {
        m.add(n, v);
    }
    m
}

#[test]
fn test_spec_records_absent_headers_as_empty() {
    let mut beresp = HttpMsg::new_response(200, "OK");
    beresp.add("Vary", "X-Tenant");
    let spec =
        build_vary_spec(&beresp, &req_with(&[])).expect("spec for absent header");
    assert_eq!(spec, b"x-tenant: \n");

    let mut ws = Workspace::new(256);
    assert!(vary_match(Some(&spec), &req_with(&[]), &mut ws));
    assert!(!vary_match(
        Some(&spec),
        &req_with(&[("X-Tenant", "acme")]),
        &mut ws
    ));
}

#[test]
fn test_multi_header_spec_all_must_match() {
    let mut beresp = HttpMsg::new_response(200, "OK");
    beresp.add("Vary", "Accept-Encoding, X-Tenant");
    let bereq = req_with(&[("Accept-Encoding", "gzip"), ("X-Tenant", "acme")]);
    let spec = build_vary_spec(&beresp, &bereq).expect("spec");

    let mut ws = Workspace::new(256);
    assert!(vary_match(Some(&spec), &bereq, &mut ws));
    assert!(!vary_match(
        Some(&spec),
        &req_with(&[("Accept-Encoding", "gzip")]),
        &mut ws
    ));
    assert!(!vary_match(
        Some(&spec),
        &req_with(&[("Accept-Encoding", "gzip"), ("X-Tenant", "other")]),
        &mut ws
    ));
}

#[test]
fn test_value_whitespace_trimmed() {
    let mut beresp = HttpMsg::new_response(200, "OK");
    beresp.add("Vary", "X-K");
    let spec =
        build_vary_spec(&beresp, &req_with(&[("X-K", "  v  ")])).expect("spec");
    let mut ws = Workspace::new(256);
    assert!(vary_match(Some(&spec), &req_with(&[("X-K", "v")]), &mut ws));
}

#[test]
fn test_no_vary_header_no_spec() {
    let beresp = HttpMsg::new_response(200, "OK");
    assert!(build_vary_spec(&beresp, &req_with(&[])).is_none());
}

#[test]
fn test_match_survives_open_reservation() {
    // a busy-list re-entry arrives with the tail already reserved
    let mut beresp = HttpMsg::new_response(200, "OK");
    beresp.add("Vary", "X-K");
    let bereq = req_with(&[("X-K", "v")]);
    let spec = build_vary_spec(&beresp, &bereq).expect("spec");

    let mut ws = Workspace::new(256);
    let _ = ws.reserve().expect("reserve");
    assert!(vary_match(Some(&spec), &bereq, &mut ws));
    assert!(ws.is_reserved());
    ws.release(0);
}
