// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::{BackendConfig, Timeouts},
    http::{
        conn::guarded_io,
        msg::{HttpMsg, parse_response_head},
    },
};

/// How the backend frames the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyStatus {
    #[default]
    None,
    Length(u64),
    Chunked,
    Eof,
}

/// One configured origin server with its idle-connection stack.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub addr: String,
    idle: Mutex<Vec<TcpStream>>,
}

impl Backend {
    pub fn new(cfg: &BackendConfig) -> Self {
        Self {
            name: cfg.name.clone().unwrap_or_else(|| cfg.address.clone()),
            addr: cfg.address.clone(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Pops a recycled connection or dials a fresh one. Recycled connections
    /// race the server's idle timeout; the caller retries exactly once on
    /// such a loss.
    pub async fn get_conn(
        &self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<BackendConn> {
        if let Some(stream) = self.pop_idle() {
            return Ok(BackendConn {
                stream,
                recycled: true,
                buf: BytesMut::with_capacity(8 << 10),
            });
        }
        let stream = guarded_io(
            "backend connect",
            timeouts.connect_timeout,
            cancel,
            TcpStream::connect(self.addr.clone()),
        )
        .await
        .with_context(|| format!("connect to backend {}", self.name))?;
        stream.set_nodelay(true)?;
        Ok(BackendConn {
            stream,
            recycled: false,
            buf: BytesMut::with_capacity(8 << 10),
        })
    }

    fn pop_idle(&self) -> Option<TcpStream> {
        match self.idle.lock() {
            Ok(mut g) => g.pop(),
            Err(_) => None,
        }
    }

    /// Returns a drained connection to the idle stack. Connections with
    /// unread bytes are discarded, they are out of sync.
    pub fn recycle(&self, conn: BackendConn) {
        if !conn.buf.is_empty() {
            return;
        }
        if let Ok(mut g) = self.idle.lock() {
            g.push(conn.stream);
        }
    }
}

/// A live TCP connection to one backend, plus its read buffer.
#[derive(Debug)]
pub struct BackendConn {
    stream: TcpStream,
    pub recycled: bool,
    buf: BytesMut,
}

impl BackendConn {
    /// Writes the serialized request head plus an optional forwarded body.
    pub async fn send_request(
        &mut self,
        head: &[u8],
        body: Option<&Bytes>,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        guarded_io(
            "backend write head",
            timeouts.between_bytes_timeout,
            cancel,
            self.stream.write_all(head),
        )
        .await?;
        if let Some(b) = body
            && !b.is_empty()
        {
            guarded_io(
                "backend write body",
                timeouts.between_bytes_timeout,
                cancel,
                self.stream.write_all(b),
            )
            .await?;
        }
        Ok(())
    }

    /// Reads and parses the response head. The body tail stays buffered.
    pub async fn read_response_head(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<HttpMsg> {
        let mut first = true;
        loop {
            if let Some(end) = find_head_end(&self.buf) {
                let head = self.buf.split_to(end);
                return parse_response_head(&head)
                    .map_err(|e| anyhow::anyhow!("backend response head: {e}"));
            }
            let deadline = if first {
                timeouts.first_byte_timeout
            } else {
                timeouts.between_bytes_timeout
            };
            let n = guarded_io(
                "backend read head",
                deadline,
                cancel,
                self.stream.read_buf(&mut self.buf),
            )
            .await?;
            if n == 0 {
                bail!("backend EOF before response head");
            }
            first = false;
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Classifies response framing per RFC 7230 ordering: no-body statuses,
/// then Transfer-Encoding, then Content-Length, then read-to-EOF.
pub fn classify_body(req_method: &str, resp: &HttpMsg) -> BodyStatus {
    if req_method.eq_ignore_ascii_case("HEAD") {
        return BodyStatus::None;
    }
    if resp.status == 204 || resp.status == 304 || (100..200).contains(&resp.status) {
        return BodyStatus::None;
    }
    if resp.has_token("transfer-encoding", "chunked") {
        return BodyStatus::Chunked;
    }
    if let Some(n) = resp.content_length() {
        return if n == 0 {
            BodyStatus::None
        } else {
            BodyStatus::Length(n)
        };
    }
    BodyStatus::Eof
}

/// Pull-based body reader driving the chosen framing to completion.
#[derive(Debug)]
pub struct BodyReader<'a> {
    conn: &'a mut BackendConn,
    status: BodyStatus,
    remaining: u64,
    done: bool,
}

impl<'a> BodyReader<'a> {
    pub fn new(conn: &'a mut BackendConn, status: BodyStatus) -> Self {
        let remaining = match status {
            BodyStatus::Length(n) => n,
            _ => 0,
        };
        Self {
            conn,
            status,
            remaining,
            done: matches!(status, BodyStatus::None),
        }
    }

    /// Next body chunk, None at end of body.
    pub async fn next_chunk(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.status {
            BodyStatus::None => Ok(None),
            BodyStatus::Length(_) => self.next_length(timeouts, cancel).await,
            BodyStatus::Eof => self.next_eof(timeouts, cancel).await,
            BodyStatus::Chunked => self.next_chunked(timeouts, cancel).await,
        }
    }

    async fn fill(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        guarded_io(
            "backend read body",
            timeouts.between_bytes_timeout,
            cancel,
            self.conn.stream.read_buf(&mut self.conn.buf),
        )
        .await
    }

    async fn next_length(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            self.done = true;
            return Ok(None);
        }
        if self.conn.buf.is_empty() {
            let n = self.fill(timeouts, cancel).await?;
            if n == 0 {
                bail!("backend EOF with {} body bytes missing", self.remaining);
            }
        }
        let take = (self.conn.buf.len() as u64).min(self.remaining) as usize;
        let chunk = self.conn.buf.split_to(take).freeze();
        self.remaining -= chunk.len() as u64;
        if self.remaining == 0 {
            self.done = true;
        }
        Ok(Some(chunk))
    }

    async fn next_eof(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        if !self.conn.buf.is_empty() {
            return Ok(Some(self.conn.buf.split().freeze()));
        }
        let n = self.fill(timeouts, cancel).await?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(self.conn.buf.split().freeze()))
    }

    async fn next_chunked(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        loop {
            // inside a chunk: hand out what is buffered
            if self.remaining > 0 {
                if self.conn.buf.is_empty() {
                    let n = self.fill(timeouts, cancel).await?;
                    if n == 0 {
                        bail!("backend EOF inside chunk");
                    }
                }
                let take = (self.conn.buf.len() as u64).min(self.remaining) as usize;
                let chunk = self.conn.buf.split_to(take).freeze();
                self.remaining -= chunk.len() as u64;
                if self.remaining == 0 {
                    self.consume_crlf(timeouts, cancel).await?;
                }
                return Ok(Some(chunk));
            }

            // at a chunk-size line
            let line = self.read_line(timeouts, cancel).await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_str, 16)
                .with_context(|| format!("bad chunk size {size_str:?}"))?;
            if size == 0 {
                self.consume_trailers(timeouts, cancel).await?;
                self.done = true;
                return Ok(None);
            }
            self.remaining = size;
        }
    }

    async fn read_line(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<String> {
        loop {
            if let Some(pos) = self.conn.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.conn.buf.split_to(pos);
                let _ = self.conn.buf.split_to(2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let n = self.fill(timeouts, cancel).await?;
            if n == 0 {
                bail!("backend EOF inside chunk framing");
            }
        }
    }

    async fn consume_crlf(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while self.conn.buf.len() < 2 {
            let n = self.fill(timeouts, cancel).await?;
            if n == 0 {
                bail!("backend EOF at chunk boundary");
            }
        }
        let crlf = self.conn.buf.split_to(2);
        if &crlf[..] != b"\r\n" {
            bail!("missing CRLF after chunk data");
        }
        Ok(())
    }

    async fn consume_trailers(
        &mut self,
        timeouts: &Timeouts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let line = self.read_line(timeouts, cancel).await?;
            if line.is_empty() {
                return Ok(());
            }
        }
    }
}

/// Bidirectional relay for the pipe path. `initial` holds client bytes that
/// were already buffered past the request head.
pub async fn pipe_relay(
    client: &mut TcpStream,
    conn: &mut BackendConn,
    head: &[u8],
    initial: Bytes,
    timeouts: &Timeouts,
    cancel: &CancellationToken,
) -> Result<(u64, u64)> {
    conn.send_request(head, Some(&initial), timeouts, cancel)
        .await?;
    let relay = copy_bidirectional(client, &mut conn.stream);
    tokio::select! {
        _ = cancel.cancelled() => bail!("pipe cancelled"),
        res = relay => {
            let (a, b) = res.context("pipe relay")?;
            Ok((a, b))
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
