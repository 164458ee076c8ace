// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod esi;
pub mod gzip;

use anyhow::Result;
use bytes::Bytes;

use crate::body::gzip::{GunzipVfp, GzipVfp, TestGzipVfp};

/// Which body transform the fetch pipeline runs. Selection order in
/// FetchBody: ESI supersedes everything, then gunzip, then gzip, then
/// verify-only, then identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfpKind {
    #[default]
    Identity,
    Gzip,
    Gunzip,
    TestGzip,
    Esi,
}

/// A fetch-side body transform. `push` consumes backend bytes and appends
/// transformed chunks to `out`; `finish` flushes whatever the codec still
/// buffers. The driver owns delivery of `out`, which keeps transforms
/// synchronous and the streaming path single-tasked.
pub trait Vfp: Send {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn push(&mut self, out: &mut Vec<Bytes>, buf: &[u8]) -> Result<()>;

    fn finish(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        let _ = out;
        Ok(())
    }
}

/// Pass-through transform.
#[derive(Debug, Default)]
pub struct IdentityVfp;

impl Vfp for IdentityVfp {
    fn push(&mut self, out: &mut Vec<Bytes>, buf: &[u8]) -> Result<()> {
        if !buf.is_empty() {
            out.push(Bytes::copy_from_slice(buf));
        }
        Ok(())
    }
}

/// Instantiates the transform for `kind`. ESI bodies are collected verbatim
/// here and parsed once the fetch completes (ESI always runs unstreamed);
/// a gzipped ESI source is inflated on the way in so the parser and the
/// stored body are plain text.
pub fn make_vfp(kind: VfpKind, src_is_gzip: bool) -> Box<dyn Vfp> {
    match kind {
        VfpKind::Identity => Box::new(IdentityVfp),
        VfpKind::Gzip => Box::new(GzipVfp::new()),
        VfpKind::Gunzip => Box::new(GunzipVfp::new()),
        VfpKind::TestGzip => Box::new(TestGzipVfp::new()),
        VfpKind::Esi => {
            if src_is_gzip {
                Box::new(GunzipVfp::new())
            } else {
                Box::new(IdentityVfp)
            }
        },
    }
}
