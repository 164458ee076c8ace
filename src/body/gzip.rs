// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Write;

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::{
    Compression,
    write::{GzDecoder, GzEncoder},
};

use crate::body::Vfp;

fn drain(inner: &mut Vec<u8>, out: &mut Vec<Bytes>) {
    if !inner.is_empty() {
        out.push(Bytes::from(std::mem::take(inner)));
    }
}

/// Compresses a plain backend body for storage.
pub struct GzipVfp {
    enc: Option<GzEncoder<Vec<u8>>>,
}

impl GzipVfp {
    pub fn new() -> Self {
        Self {
            enc: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }
}

impl Default for GzipVfp {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfp for GzipVfp {
    fn push(&mut self, out: &mut Vec<Bytes>, buf: &[u8]) -> Result<()> {
        let enc = self.enc.as_mut().context("gzip transform already finished")?;
        enc.write_all(buf).context("gzip compress")?;
        enc.flush().context("gzip flush")?;
        drain(enc.get_mut(), out);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        let enc = self.enc.take().context("gzip transform already finished")?;
        let tail = enc.finish().context("gzip finish")?;
        if !tail.is_empty() {
            out.push(Bytes::from(tail));
        }
        Ok(())
    }
}

/// Inflates a gzipped backend body for storage.
pub struct GunzipVfp {
    dec: Option<GzDecoder<Vec<u8>>>,
}

impl GunzipVfp {
    pub fn new() -> Self {
        Self {
            dec: Some(GzDecoder::new(Vec::new())),
        }
    }
}

impl Default for GunzipVfp {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfp for GunzipVfp {
    fn push(&mut self, out: &mut Vec<Bytes>, buf: &[u8]) -> Result<()> {
        let dec = self.dec.as_mut().context("gunzip transform already finished")?;
        dec.write_all(buf).context("gunzip inflate")?;
        dec.flush().context("gunzip flush")?;
        drain(dec.get_mut(), out);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        let dec = self.dec.take().context("gunzip transform already finished")?;
        let tail = dec.finish().context("truncated gzip stream from backend")?;
        if !tail.is_empty() {
            out.push(Bytes::from(tail));
        }
        Ok(())
    }
}

/// Stores the gzipped bytes verbatim while inflating a shadow copy to verify
/// the stream is well-formed end to end.
pub struct TestGzipVfp {
    dec: Option<GzDecoder<Sink>>,
}

/// Discarding writer for the shadow inflate.
struct Sink;

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TestGzipVfp {
    pub fn new() -> Self {
        Self {
            dec: Some(GzDecoder::new(Sink)),
        }
    }
}

impl Default for TestGzipVfp {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfp for TestGzipVfp {
    fn push(&mut self, out: &mut Vec<Bytes>, buf: &[u8]) -> Result<()> {
        let dec = self
            .dec
            .as_mut()
            .context("testgzip transform already finished")?;
        dec.write_all(buf)
            .context("invalid gzip stream from backend")?;
        if !buf.is_empty() {
            out.push(Bytes::copy_from_slice(buf));
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<Bytes>) -> Result<()> {
        let dec = self
            .dec
            .take()
            .context("testgzip transform already finished")?;
        dec.finish().context("truncated gzip stream from backend")?;
        Ok(())
    }
}

/// Delivery-side streaming gunzip: inflates stored gzip chunks into bounded
/// pieces for the client writer (GUNZIP response mode).
pub struct GunzipStream {
    dec: Option<GzDecoder<Vec<u8>>>,
    chunk: usize,
}

impl GunzipStream {
    pub fn new(chunk: usize) -> Self {
        Self {
            dec: Some(GzDecoder::new(Vec::new())),
            chunk: chunk.max(1),
        }
    }

    /// Inflates `buf`, returning output sliced into at-most-`chunk` pieces.
    pub fn push(&mut self, buf: &[u8]) -> Result<Vec<Bytes>> {
        let dec = self.dec.as_mut().context("gunzip stream already finished")?;
        dec.write_all(buf).context("stored object is not valid gzip")?;
        dec.flush().context("gunzip stream flush")?;
        Ok(self.split_inner())
    }

    pub fn finish(&mut self) -> Result<Vec<Bytes>> {
        let dec = self.dec.take().context("gunzip stream already finished")?;
        let inner = dec.finish().context("stored gzip object truncated")?;
        let mut pieces = Vec::new();
        split_into(&mut pieces, inner, self.chunk);
        Ok(pieces)
    }

    fn split_inner(&mut self) -> Vec<Bytes> {
        let mut pieces = Vec::new();
        if let Some(dec) = self.dec.as_mut() {
            let inner = std::mem::take(dec.get_mut());
            split_into(&mut pieces, inner, self.chunk);
        }
        pieces
    }
}

fn split_into(pieces: &mut Vec<Bytes>, data: Vec<u8>, chunk: usize) {
    let mut rest = Bytes::from(data);
    while !rest.is_empty() {
        let take = rest.len().min(chunk);
        pieces.push(rest.split_to(take));
    }
}

/// One-shot helper used by tests and the error path.
pub fn gzip_all(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).context("gzip")?;
    enc.finish().context("gzip finish")
}

pub fn gunzip_all(data: &[u8]) -> Result<Vec<u8>> {
    let mut dec = GzDecoder::new(Vec::new());
    dec.write_all(data).context("gunzip")?;
    dec.finish().context("gunzip finish")
}
