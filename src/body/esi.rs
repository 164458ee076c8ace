// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// One delivery instruction of a processed edge-side-include body.
/// Literal spans index into the object's assembled body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsiSeg {
    Literal { off: usize, len: usize },
    Include { src: String },
}

/// Recognized constructs:
///   `<esi:include src="..."/>`: replaced by the fetched sub-request
///   `<esi:remove> ... </esi:remove>`: dropped
///   `<!--esi ... -->`: unwrapped, inner bytes delivered verbatim
///
/// Returns None when the body contains no ESI construct at all, so plain
/// objects skip segment-walking delivery entirely.
pub fn parse(body: &[u8]) -> Option<Vec<EsiSeg>> {
    let mut segs: Vec<EsiSeg> = Vec::new();
    let mut pos = 0usize;
    let mut found = false;

    while pos < body.len() {
        let Some(lt) = find(body, pos, b"<") else {
            push_literal(&mut segs, pos, body.len());
            break;
        };
        if lt > pos {
            push_literal(&mut segs, pos, lt);
        }
        pos = lt;

        if starts_with(body, pos, b"<esi:include") {
            let Some(end) = find(body, pos, b">") else {
                // unterminated tag: treat the rest as literal
                push_literal(&mut segs, pos, body.len());
                break;
            };
            let tag = &body[pos..=end];
            if let Some(src) = attr_value(tag, b"src") {
                segs.push(EsiSeg::Include { src });
                found = true;
            }
            pos = end + 1;
        } else if starts_with(body, pos, b"<esi:remove") {
            let close = b"</esi:remove>";
            match find(body, pos, close) {
                Some(c) => pos = c + close.len(),
                None => break,
            }
            found = true;
        } else if starts_with(body, pos, b"<!--esi") {
            let open_len = b"<!--esi".len();
            let close = b"-->";
            match find(body, pos, close) {
                Some(c) => {
                    let mut inner_start = pos + open_len;
                    if body.get(inner_start) == Some(&b'\n') {
                        inner_start += 1;
                    } else if body.get(inner_start) == Some(&b' ') {
                        inner_start += 1;
                    }
                    if c > inner_start {
                        push_literal(&mut segs, inner_start, c);
                    }
                    pos = c + close.len();
                    found = true;
                },
                None => {
                    push_literal(&mut segs, pos, body.len());
                    break;
                },
            }
        } else {
            // ordinary '<': scan past it
            push_literal(&mut segs, pos, pos + 1);
            pos += 1;
        }
    }

    if found { Some(coalesce(segs)) } else { None }
}

fn push_literal(segs: &mut Vec<EsiSeg>, from: usize, to: usize) {
    if to > from {
        segs.push(EsiSeg::Literal {
            off: from,
            len: to - from,
        });
    }
}

/// Merges adjacent literal spans produced by the scanner.
fn coalesce(segs: Vec<EsiSeg>) -> Vec<EsiSeg> {
    let mut out: Vec<EsiSeg> = Vec::with_capacity(segs.len());
    for seg in segs {
        let merged = match (out.last_mut(), &seg) {
            (
                Some(EsiSeg::Literal { off, len }),
                EsiSeg::Literal { off: o2, len: l2 },
            ) if *off + *len == *o2 => {
                *len += l2;
                true
            },
            _ => false,
        };
        if !merged {
            out.push(seg);
        }
    }
    out
}

fn find(hay: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= hay.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn starts_with(hay: &[u8], at: usize, prefix: &[u8]) -> bool {
    hay.len() >= at + prefix.len() && &hay[at..at + prefix.len()] == prefix
}

/// Extracts a quoted attribute value from a raw tag slice.
fn attr_value(tag: &[u8], name: &[u8]) -> Option<String> {
    let mut pat = Vec::with_capacity(name.len() + 2);
    pat.extend_from_slice(name);
    pat.extend_from_slice(b"=\"");
    let start = find(tag, 0, &pat)? + pat.len();
    let end = find(tag, start, b"\"")?;
    String::from_utf8(tag[start..end].to_vec()).ok()
}
