// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use revcache_rs::body::{
    VfpKind,
    gzip::{GunzipStream, gzip_all, gunzip_all},
    make_vfp,
};

fn collect(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|b| b.to_vec()).collect()
}

fn run_vfp(kind: VfpKind, src_gzip: bool, input: &[u8], step: usize) -> Result<Vec<u8>> {
    let mut vfp = make_vfp(kind, src_gzip);
    let mut out = Vec::new();
    vfp.begin()?;
    for part in input.chunks(step) {
        vfp.push(&mut out, part)?;
    }
    vfp.finish(&mut out)?;
    Ok(collect(&out))
}

#[test]
fn test_gzip_vfp_stores_decodable_stream() -> Result<()> {
    let plain = b"all work and no play makes jack a dull boy\n".repeat(200);
    let stored = run_vfp(VfpKind::Gzip, false, &plain, 61)?;
    assert!(stored.len() < plain.len());
    assert_eq!(gunzip_all(&stored)?, plain);
    Ok(())
}

#[test]
fn test_gunzip_vfp_restores_original() -> Result<()> {
    let plain = b"0123456789abcdef".repeat(333);
    let gz = gzip_all(&plain)?;
    let stored = run_vfp(VfpKind::Gunzip, true, &gz, 17)?;
    assert_eq!(stored, plain);
    Ok(())
}

#[test]
fn test_testgzip_verifies_and_keeps_bytes() -> Result<()> {
    let gz = gzip_all(b"payload kept compressed in the cache")?;
    let stored = run_vfp(VfpKind::TestGzip, true, &gz, 5)?;
    assert_eq!(stored, gz);
    Ok(())
}

#[test]
fn test_testgzip_detects_truncation() {
    let gz = gzip_all(b"truncate me please, a lot of text to compress here")
        .expect("gzip");
    let cut = &gz[..gz.len() - 4];
    assert!(run_vfp(VfpKind::TestGzip, true, cut, 7).is_err());
}

#[test]
fn test_esi_vfp_inflates_gzipped_source() -> Result<()> {
    let page = b"<p>hello</p>".repeat(10);
    let gz = gzip_all(&page)?;
    let stored = run_vfp(VfpKind::Esi, true, &gz, 11)?;
    assert_eq!(stored, page);
    // a plain source passes through untouched
    let stored = run_vfp(VfpKind::Esi, false, &page, 11)?;
    assert_eq!(stored, page);
    Ok(())
}

#[test]
fn test_gunzip_stream_respects_buffer_bound() -> Result<()> {
    let plain = vec![42u8; 100_000];
    let gz = gzip_all(&plain)?;

    let mut gs = GunzipStream::new(4096);
    let mut pieces = Vec::new();
    for part in gz.chunks(777) {
        pieces.extend(gs.push(part)?);
    }
    pieces.extend(gs.finish()?);

    assert!(pieces.iter().all(|p| p.len() <= 4096 && !p.is_empty()));
    assert_eq!(collect(&pieces), plain);
    Ok(())
}

#[test]
fn test_roundtrip_gzip_store_then_gunzip_deliver() -> Result<()> {
    // what FetchBody does with do_gzip, then what GUNZIP delivery undoes
    let origin_body = b"the backend never sent gzip but we stored it gzipped".to_vec();
    let stored = run_vfp(VfpKind::Gzip, false, &origin_body, 13)?;

    let mut gs = GunzipStream::new(1024);
    let mut delivered = Vec::new();
    for part in stored.chunks(9) {
        delivered.extend(gs.push(part)?);
    }
    delivered.extend(gs.finish()?);
    assert_eq!(collect(&delivered), origin_body);
    Ok(())
}
