// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// What the pipeline buffer currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// A full request head is buffered.
    Complete,
    /// Bytes present, terminator not yet seen.
    Partial,
    /// Buffer empty.
    Empty,
    /// Head does not fit the buffer.
    Overflow,
}

/// Applies the deadline and the shutdown gate to one I/O future. Both
/// surface as plain errors so the step that issued the I/O can turn them
/// into its own close reason.
pub(crate) async fn guarded_io<T>(
    what: &'static str,
    deadline: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    if cancel.is_cancelled() {
        bail!("{what}: shutting down");
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => bail!("{what}: shutting down"),
        res = timeout(deadline, fut) => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(anyhow!(e).context(what)),
            Err(_) => bail!("{what}: deadline exceeded"),
        },
    }
}

/// The client side of a session: the accepted TCP stream plus the pipeline
/// read buffer that survives across requests on the same connection.
///
/// Reading and head-scanning are separated: `rx_more` pulls bytes, `complete`
/// only inspects the buffer, so the Wait step owns every read decision.
#[derive(Debug)]
pub struct HttpConn {
    stream: TcpStream,
    pub peer: SocketAddr,
    buf: BytesMut,
    cap: usize,
}

impl HttpConn {
    pub fn new(stream: TcpStream, peer: SocketAddr, cap: usize) -> Self {
        Self {
            stream,
            peer,
            buf: BytesMut::with_capacity(cap),
            cap,
        }
    }

    /// Scans the buffered bytes for a complete request head.
    pub fn complete(&self) -> RxStatus {
        if self.buf.is_empty() {
            return RxStatus::Empty;
        }
        if find_head_end(&self.buf).is_some() {
            return RxStatus::Complete;
        }
        if self.buf.len() >= self.cap {
            return RxStatus::Overflow;
        }
        RxStatus::Partial
    }

    /// Alias for `complete` used after a request retires; the buffer may
    /// already hold the next pipelined head.
    pub fn reinit(&self) -> RxStatus {
        self.complete()
    }

    pub fn has_bytes(&self) -> bool {
        !self.buf.is_empty()
    }

    /// One read into the pipeline buffer. Ok(0) is EOF.
    pub async fn rx_more(&mut self) -> std::io::Result<usize> {
        if self.buf.len() >= self.cap {
            // Full buffer with no terminator; complete() reports Overflow.
            return Ok(0);
        }
        self.stream.read_buf(&mut self.buf).await
    }

    /// Waits until the socket is readable (waiter parking).
    pub async fn wait_readable(&self) -> std::io::Result<()> {
        self.stream.readable().await
    }

    /// Splits off and returns the buffered head, leaving any pipelined tail.
    /// Must only be called after `complete()` returned `Complete`.
    pub fn take_head(&mut self) -> Bytes {
        let end = find_head_end(&self.buf).expect("take_head without complete head");
        self.buf.split_to(end).freeze()
    }

    /// Consumes exactly `len` request-body bytes, buffer first, then socket.
    pub async fn read_body(
        &mut self,
        len: u64,
        max: u64,
        io_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if len > max {
            bail!("request body too large: {len} > {max}");
        }
        let want = len as usize;
        let mut body = BytesMut::with_capacity(want.min(64 << 10));

        let from_buf = want.min(self.buf.len());
        body.extend_from_slice(&self.buf.split_to(from_buf));

        while body.len() < want {
            let before = body.len();
            guarded_io(
                "read request body",
                io_timeout,
                cancel,
                self.stream.read_buf(&mut body),
            )
            .await?;
            if body.len() == before {
                bail!("client EOF inside request body");
            }
        }
        // read_buf may overshoot into the next pipelined request
        if body.len() > want {
            let tail = body.split_off(want);
            let mut rebuilt = BytesMut::with_capacity(tail.len() + self.buf.len());
            rebuilt.extend_from_slice(&tail);
            rebuilt.extend_from_slice(&self.buf);
            self.buf = rebuilt;
        }
        Ok(body.freeze())
    }

    pub async fn write_all(
        &mut self,
        data: &[u8],
        io_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        guarded_io(
            "client write",
            io_timeout,
            cancel,
            self.stream.write_all(data),
        )
        .await
    }

    /// Best-effort write that never fails the caller (100-continue).
    pub async fn write_best_effort(&mut self, data: &[u8]) {
        let _ = self.stream.write_all(data).await;
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Raw stream access for the pipe relay.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drains whatever is buffered (pipe forwards it before relaying).
    pub fn drain_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
