// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use revcache_rs::{
    cfg::config::{BackendConfig, Config},
    policy::Policy,
    proxy::{ProxyCore, bind_and_serve},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::sleep,
};

/// One scripted origin reply: an optional delay, then byte runs each
/// followed by a pause (for streaming tests).
#[derive(Debug, Clone, Default)]
pub struct OriginReply {
    pub delay_before: Duration,
    pub parts: Vec<(Vec<u8>, Duration)>,
}

impl OriginReply {
    pub fn simple(bytes: Vec<u8>) -> Self {
        Self {
            delay_before: Duration::ZERO,
            parts: vec![(bytes, Duration::ZERO)],
        }
    }
}

/// Builds a full response with Content-Length framing.
pub fn http_response(status: u16, extra: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} X\r\nContent-Length: {}\r\n", body.len());
    for (n, v) in extra {
        out.push_str(&format!("{n}: {v}\r\n"));
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub struct Origin {
    pub addr: String,
    pub hits: Arc<AtomicU32>,
}

impl Origin {
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Spawns a keep-alive origin server; `handler(hit_no, request_head)`
/// scripts each response. Request bodies are drained per Content-Length.
pub async fn spawn_origin<F>(handler: F) -> Result<Origin>
where
    F: Fn(u32, &str) -> OriginReply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let hits = Arc::new(AtomicU32::new(0));
    let handler = Arc::new(handler);

    let hits_l = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let hits = Arc::clone(&hits_l);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _ = origin_conn(stream, hits, handler).await;
            });
        }
    });

    Ok(Origin { addr, hits })
}

async fn origin_conn<F>(
    mut stream: TcpStream,
    hits: Arc<AtomicU32>,
    handler: Arc<F>,
) -> Result<()>
where
    F: Fn(u32, &str) -> OriginReply + Send + Sync + 'static,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        // read one request head
        let head_end = loop {
            if let Some(p) = find_sub(&buf, b"\r\n\r\n") {
                break p + 4;
            }
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&tmp[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        buf.drain(..head_end);

        // drain the request body if the head declares one
        if let Some(cl) = content_length_of(&head) {
            while buf.len() < cl {
                let mut tmp = [0u8; 4096];
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    bail!("origin: EOF inside request body");
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            buf.drain(..cl);
        }

        let hit = hits.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = handler(hit, &head);
        if reply.delay_before > Duration::ZERO {
            sleep(reply.delay_before).await;
        }
        for (part, pause) in &reply.parts {
            stream.write_all(part).await?;
            stream.flush().await?;
            if *pause > Duration::ZERO {
                sleep(*pause).await;
            }
        }
    }
}

fn content_length_of(head: &str) -> Option<usize> {
    for line in head.lines() {
        if let Some((n, v)) = line.split_once(':')
            && n.trim().eq_ignore_ascii_case("content-length")
        {
            return v.trim().parse().ok();
        }
    }
    None
}

pub fn find_sub(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Test config: ephemeral listen port, one backend, quick timeouts.
pub fn test_config(backend_addr: &str) -> Config {
    let mut cfg = Config::default();
    cfg.net.listen = "127.0.0.1:0".into();
    cfg.net.backends = vec![BackendConfig {
        address: backend_addr.to_string(),
        name: Some("origin".into()),
    }];
    cfg.threads.pool_size = 4;
    cfg.timeouts.timeout_idle = Duration::from_secs(2);
    cfg.timeouts.first_byte_timeout = Duration::from_secs(5);
    cfg.timeouts.between_bytes_timeout = Duration::from_secs(5);
    cfg
}

/// Boots a proxy over the given origin with the given policy; returns the
/// core (for shutdown/stats) and the client-facing address.
pub async fn start_proxy(
    cfg: Config,
    policy: Arc<dyn Policy>,
) -> Result<(Arc<ProxyCore>, String)> {
    let core = ProxyCore::new(cfg, policy);
    let (addr, _handle) = bind_and_serve(Arc::clone(&core)).await?;
    Ok((core, addr.to_string()))
}

/// A parsed client-side response.
#[derive(Debug)]
pub struct ClientResp {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ClientResp {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends raw request bytes and reads one full response, decoding chunked
/// framing when the proxy chose it.
pub async fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> Result<ClientResp> {
    stream.write_all(request).await?;
    stream.flush().await?;
    read_response(stream).await
}

pub async fn read_response(stream: &mut TcpStream) -> Result<ClientResp> {
    let mut buf: Vec<u8> = Vec::new();
    let head_end = loop {
        if let Some(p) = find_sub(&buf, b"\r\n\r\n") {
            break p + 4;
        }
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await.context("read response head")?;
        if n == 0 {
            bail!("EOF before response head");
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().context("status line")?;
    let status: u16 = status_line
        .split_ascii_whitespace()
        .nth(1)
        .context("status code")?
        .parse()?;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((n, v)) = line.split_once(':') {
            headers.push((n.trim().to_string(), v.trim().to_string()));
        }
    }
    buf.drain(..head_end);

    let resp = ClientResp {
        status,
        headers,
        body: Vec::new(),
    };

    let body = if resp
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked_body(stream, &mut buf).await?
    } else if let Some(cl) = resp.header("content-length") {
        let cl: usize = cl.parse()?;
        while buf.len() < cl {
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                bail!("EOF inside body");
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        buf.drain(..cl).collect()
    } else if status == 304 || status == 204 {
        Vec::new()
    } else {
        // EOF framing
        let mut rest = buf;
        let mut tmp = [0u8; 4096];
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&tmp[..n]);
        }
        rest
    };

    Ok(ClientResp { body, ..resp })
}

async fn read_chunked_body(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(p) = find_sub(buf, b"\r\n") {
                break p;
            }
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                bail!("EOF in chunk framing");
            }
            buf.extend_from_slice(&tmp[..n]);
        };
        let size_line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
        buf.drain(..line_end + 2);
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("").trim(), 16)
            .with_context(|| format!("chunk size {size_line:?}"))?;

        while buf.len() < size + 2 {
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                bail!("EOF in chunk data");
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
        if size == 0 {
            return Ok(body);
        }
    }
}

pub async fn connect(addr: &str) -> Result<TcpStream> {
    Ok(TcpStream::connect(addr).await?)
}

pub fn get_request(url: &str, extra: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!("GET {url} HTTP/1.1\r\nHost: test\r\n");
    for (n, v) in extra {
        out.push_str(&format!("{n}: {v}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}
