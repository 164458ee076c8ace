// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use revcache_rs::{
    cache::{
        index::ProbeReply,
        object::{ExpSpec, Object},
        storage::StorageHint,
    },
    cfg::config::Config,
    policy::BuiltinPolicy,
    proxy::ProxyCore,
    session::{ObjRef, Session},
    utils,
};
use tokio::net::{TcpListener, TcpStream};

async fn mk_sess(core: &Arc<ProxyCore>) -> Result<(Box<Session>, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client = TcpStream::connect(addr).await?;
    let (server, peer) = listener.accept().await?;
    Ok((Session::new(Arc::clone(core), server, peer), client))
}

fn mk_core() -> Arc<ProxyCore> {
    ProxyCore::new(Config::default(), Arc::new(BuiltinPolicy))
}

fn publishable(core: &Arc<ProxyCore>, body: &[u8]) -> (Arc<Object>, ExpSpec) {
    let mut obj = Object::alloc(&core.storage, StorageHint::Default, 64, utils::now())
        .expect("alloc");
    obj.response = 200;
    obj.append_chunk(Bytes::copy_from_slice(body)).expect("body");
    let exp = ExpSpec {
        entered: utils::now(),
        ttl: 60.0,
        grace: 5.0,
        keep: 0.0,
    };
    (ObjRef::Owned(Box::new(obj)).into_shared(), exp)
}

#[tokio::test]
async fn test_miss_then_busy_then_hit() -> Result<()> {
    let core = mk_core();
    let (mut s1, _c1) = mk_sess(&core).await?;
    let (mut s2, _c2) = mk_sess(&core).await?;
    s1.digest = [7u8; 32];
    s2.digest = [7u8; 32];

    // first prober inserts the busy entry
    let busy_core = match core.cache.probe(&mut s1) {
        ProbeReply::Miss(c) => c,
        other => panic!("expected miss, got {other:?}"),
    };
    assert!(busy_core.is_busy());

    // a racing prober sees the busy peer, never a duplicate insert
    match core.cache.probe(&mut s2) {
        ProbeReply::Busy(head) => assert_eq!(head.core_count(), 1),
        other => panic!("expected busy, got {other:?}"),
    }

    // publish and look again
    let (obj, exp) = publishable(&core, b"hello");
    core.cache.unbusy(&busy_core, obj, exp);
    assert!(!busy_core.is_busy());

    match core.cache.probe(&mut s2) {
        ProbeReply::Hit(_, obj) => assert_eq!(obj.body_vec(), b"hello"),
        other => panic!("expected hit, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_pass_flag_classifies_hitpass() -> Result<()> {
    let core = mk_core();
    let (mut s1, _c1) = mk_sess(&core).await?;
    s1.digest = [9u8; 32];

    let busy_core = match core.cache.probe(&mut s1) {
        ProbeReply::Miss(c) => c,
        other => panic!("expected miss, got {other:?}"),
    };
    busy_core.set_pass();
    let (obj, exp) = publishable(&core, b"x");
    core.cache.unbusy(&busy_core, obj, exp);

    match core.cache.probe(&mut s1) {
        ProbeReply::HitPass(core_ref, _) => assert!(core_ref.is_pass()),
        other => panic!("expected hitpass, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_dropped_busy_entry_reprobes_as_miss() -> Result<()> {
    let core = mk_core();
    let (mut s1, _c1) = mk_sess(&core).await?;
    s1.digest = [3u8; 32];

    let busy_core = match core.cache.probe(&mut s1) {
        ProbeReply::Miss(c) => c,
        other => panic!("expected miss, got {other:?}"),
    };
    core.cache.drop_busy(&busy_core);

    match core.cache.probe(&mut s1) {
        ProbeReply::Miss(_) => {},
        other => panic!("expected miss after drop, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_stale_entry_not_served() -> Result<()> {
    let core = mk_core();
    let (mut s1, _c1) = mk_sess(&core).await?;
    s1.digest = [5u8; 32];

    let busy_core = match core.cache.probe(&mut s1) {
        ProbeReply::Miss(c) => c,
        other => panic!("expected miss, got {other:?}"),
    };
    let (obj, _) = publishable(&core, b"old");
    let expired = ExpSpec {
        entered: utils::now() - 100.0,
        ttl: 1.0,
        grace: 0.0,
        keep: 0.0,
    };
    core.cache.unbusy(&busy_core, obj, expired);

    // stale entries are skipped and a fresh fetch starts
    match core.cache.probe(&mut s1) {
        ProbeReply::Miss(_) => {},
        other => panic!("expected miss past ttl, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_always_miss_inserts_fresh_entry() -> Result<()> {
    let core = mk_core();
    let (mut s1, _c1) = mk_sess(&core).await?;
    s1.digest = [6u8; 32];

    let busy_core = match core.cache.probe(&mut s1) {
        ProbeReply::Miss(c) => c,
        other => panic!("expected miss, got {other:?}"),
    };
    let (obj, exp) = publishable(&core, b"cached");
    core.cache.unbusy(&busy_core, obj, exp);

    s1.hash_always_miss = true;
    match core.cache.probe(&mut s1) {
        ProbeReply::Miss(_) => {},
        other => panic!("always_miss must insert, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_expiry_reap_removes_matured() -> Result<()> {
    let core = mk_core();
    let (mut s1, _c1) = mk_sess(&core).await?;
    s1.digest = [8u8; 32];

    let busy_core = match core.cache.probe(&mut s1) {
        ProbeReply::Miss(c) => c,
        other => panic!("expected miss, got {other:?}"),
    };
    let (obj, _) = publishable(&core, b"bye");
    let exp = ExpSpec {
        entered: utils::now() - 10.0,
        ttl: 1.0,
        grace: 1.0,
        keep: 1.0,
    };
    core.exp.insert(busy_core.clone());
    core.cache.unbusy(&busy_core, obj, exp);

    assert_eq!(core.exp.len(), 1);
    let n = core.exp.reap(&core.cache, utils::now());
    assert_eq!(n, 1);
    assert!(core.exp.is_empty());
    Ok(())
}
