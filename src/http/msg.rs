// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::http::status::parse_http_date;

/// A parsed HTTP/1.x message head: start line plus an ordered field list.
///
/// Requests populate `method`/`url`, responses `status`/`reason`; `proto`
/// is shared. Field names compare case-insensitively, values keep their
/// original bytes.
#[derive(Debug, Clone, Default)]
pub struct HttpMsg {
    pub proto: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub reason: String,
    fields: Vec<(String, String)>,
}

/// Dissection failure mapped to the status code the engine reacts on:
/// 400 is "junk, close", everything else routes through the Error step.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DissectError {
    #[error("malformed request")]
    Junk,
    #[error("unsupported protocol")]
    Protocol,
    #[error("header overflow")]
    Overflow,
}

impl DissectError {
    pub fn status(self) -> u16 {
        match self {
            DissectError::Junk => 400,
            DissectError::Protocol => 505,
            DissectError::Overflow => 413,
        }
    }
}

/// Which field filter applies when deriving one message from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSet {
    /// Client request -> bereq for a cache fill. Conditionals and ranges are
    /// stripped so the cache always receives a full 200.
    BereqFetch,
    /// Client request -> bereq for pass; conditionals travel through.
    BereqPass,
    /// Client request -> bereq for pipe.
    BereqPipe,
    /// Backend response -> stored object headers.
    ObjInsert,
    /// Backend response -> pass-through object headers.
    ObjPass,
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const FETCH_ONLY_DROP: &[&str] = &["range", "if-modified-since", "if-none-match"];

impl HttpMsg {
    pub fn new_request(method: &str, url: &str) -> Self {
        Self {
            proto: "HTTP/1.1".into(),
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn new_response(status: u16, reason: &str) -> Self {
        Self {
            proto: "HTTP/1.1".into(),
            status,
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn is_http11(&self) -> bool {
        self.proto.eq_ignore_ascii_case("HTTP/1.1")
    }

    /// First field value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a field, keeping any existing ones with the same name.
    pub fn add(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Replaces every field called `name` with a single one.
    pub fn set(&mut self, name: &str, value: &str) {
        self.unset(name);
        self.add(name, value);
    }

    pub fn unset(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Folds repeated `name` fields into one comma-joined line, preserving
    /// the position of the first occurrence.
    pub fn collapse(&mut self, name: &str) {
        let mut joined: Option<String> = None;
        for (n, v) in &self.fields {
            if n.eq_ignore_ascii_case(name) {
                match &mut joined {
                    Some(j) => {
                        j.push_str(", ");
                        j.push_str(v);
                    },
                    None => joined = Some(v.clone()),
                }
            }
        }
        if let Some(j) = joined {
            let idx = self
                .fields
                .iter()
                .position(|(n, _)| n.eq_ignore_ascii_case(name))
                .expect("collapse: first occurrence");
            self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
            self.fields.insert(idx, (name.to_string(), j));
        }
    }

    /// True when the comma-separated list in `name` contains `token`
    /// (case-insensitive, parameters after ';' ignored).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| {
                v.split(',').any(|part| {
                    part.split(';')
                        .next()
                        .map(str::trim)
                        .is_some_and(|t| t.eq_ignore_ascii_case(token))
                })
            })
    }

    /// Content-Length as a number, if present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// Derives a filtered copy of this message under `set`.
    pub fn filter_fields(&self, set: FilterSet) -> HttpMsg {
        let mut out = HttpMsg {
            proto: self.proto.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            status: self.status,
            reason: self.reason.clone(),
            fields: Vec::with_capacity(self.fields.len()),
        };
        for (n, v) in &self.fields {
            if !keep_field(n, set) {
                continue;
            }
            out.fields.push((n.clone(), v.clone()));
        }
        out
    }

    /// Serializes the request head for the backend wire.
    pub fn serialize_request(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.proto.as_bytes());
        out.extend_from_slice(b"\r\n");
        serialize_fields(&mut out, &self.fields);
        out
    }

    /// Serializes the response head for the client wire.
    pub fn serialize_response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.proto.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        serialize_fields(&mut out, &self.fields);
        out
    }

    /// Rough byte estimate of the serialized head; used to size the stored
    /// header allocation.
    pub fn estimate_bytes(&self) -> usize {
        let lines: usize = self
            .fields
            .iter()
            .map(|(n, v)| n.len() + 2 + v.len() + 2)
            .sum();
        self.proto.len() + self.url.len() + self.method.len() + self.reason.len()
            + 16
            + lines
    }
}

fn serialize_fields(out: &mut Vec<u8>, fields: &[(String, String)]) {
    for (n, v) in fields {
        out.extend_from_slice(n.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn keep_field(name: &str, set: FilterSet) -> bool {
    let lower = name.to_ascii_lowercase();
    if HOP_BY_HOP.contains(&lower.as_str()) {
        return false;
    }
    match set {
        FilterSet::BereqFetch => !FETCH_ONLY_DROP.contains(&lower.as_str()),
        FilterSet::BereqPass | FilterSet::BereqPipe | FilterSet::ObjPass => true,
        FilterSet::ObjInsert => lower != "set-cookie",
    }
}

/// Parses a request head (start line + fields, no body).
pub fn parse_request_head(buf: &[u8]) -> Result<HttpMsg, DissectError> {
    let text = std::str::from_utf8(buf).map_err(|_| DissectError::Junk)?;
    let mut lines = text.split("\r\n");

    let start = lines.next().ok_or(DissectError::Junk)?;
    let mut parts = start.split_ascii_whitespace();
    let method = parts.next().ok_or(DissectError::Junk)?;
    let url = parts.next().ok_or(DissectError::Junk)?;
    let proto = parts.next().ok_or(DissectError::Junk)?;
    if parts.next().is_some() || method.is_empty() || url.is_empty() {
        return Err(DissectError::Junk);
    }
    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(DissectError::Junk);
    }
    if !proto.eq_ignore_ascii_case("HTTP/1.1") && !proto.eq_ignore_ascii_case("HTTP/1.0")
    {
        return Err(DissectError::Protocol);
    }

    let mut msg = HttpMsg {
        proto: proto.to_string(),
        method: method.to_string(),
        url: url.to_string(),
        ..Default::default()
    };
    parse_fields(lines, &mut msg)?;
    Ok(msg)
}

/// Parses a response head received from a backend.
pub fn parse_response_head(buf: &[u8]) -> Result<HttpMsg, DissectError> {
    let text = std::str::from_utf8(buf).map_err(|_| DissectError::Junk)?;
    let mut lines = text.split("\r\n");

    let start = lines.next().ok_or(DissectError::Junk)?;
    let (proto, rest) = start.split_once(' ').ok_or(DissectError::Junk)?;
    if !proto.starts_with("HTTP/1.") {
        return Err(DissectError::Protocol);
    }
    let (code, reason) = match rest.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (rest, ""),
    };
    let status: u16 = code.trim().parse().map_err(|_| DissectError::Junk)?;
    if !(100..=999).contains(&status) {
        return Err(DissectError::Junk);
    }

    let mut msg = HttpMsg {
        proto: proto.to_string(),
        status,
        reason: reason.trim().to_string(),
        ..Default::default()
    };
    parse_fields(lines, &mut msg)?;
    Ok(msg)
}

fn parse_fields<'a>(
    lines: impl Iterator<Item = &'a str>,
    msg: &mut HttpMsg,
) -> Result<(), DissectError> {
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold continuation joins the previous field value
            match msg.fields.last_mut() {
                Some((_, v)) => {
                    v.push(' ');
                    v.push_str(line.trim());
                },
                None => return Err(DissectError::Junk),
            }
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(DissectError::Junk)?;
        if name.is_empty() || name.contains(' ') {
            return Err(DissectError::Junk);
        }
        msg.fields
            .push((name.to_string(), value.trim().to_string()));
    }
    Ok(())
}

/// Evaluates the client's conditional headers against a stored object.
/// True means the client copy is current and a 304 may be served.
pub fn conditional_match(req: &HttpMsg, last_modified: f64, etag: Option<&str>) -> bool {
    if let (Some(inm), Some(tag)) = (req.get("if-none-match"), etag) {
        return inm.trim() == "*" || inm.split(',').any(|c| c.trim() == tag.trim());
    }
    if let Some(ims) = req.get("if-modified-since")
        && let Some(t) = parse_http_date(ims)
    {
        return last_modified.is_finite() && last_modified.floor() <= t;
    }
    false
}
