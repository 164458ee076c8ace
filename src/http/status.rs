// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Standard reason phrase for a status code. Unknown codes fall back to the
/// class phrase.
pub fn reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        410 => "Gone",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        s if (200..300).contains(&s) => "OK",
        s if (300..400).contains(&s) => "Redirect",
        s if (400..500).contains(&s) => "Client Error",
        _ => "Server Error",
    }
}

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats epoch seconds as an IMF-fixdate (RFC 7231 `Date` form).
pub fn http_date(t: f64) -> String {
    let secs = t.max(0.0) as i64;
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format(IMF_FIXDATE).to_string(),
        _ => Utc.timestamp_opt(0, 0).single().map_or_else(
            || "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
            |dt: DateTime<Utc>| dt.format(IMF_FIXDATE).to_string(),
        ),
    }
}

/// Parses an IMF-fixdate into epoch seconds. Returns None on any malformed
/// input; obsolete RFC 850 / asctime forms are not accepted.
pub fn parse_http_date(s: &str) -> Option<f64> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), IMF_FIXDATE).ok()?;
    Some(naive.and_utc().timestamp() as f64)
}
