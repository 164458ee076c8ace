// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use revcache_rs::body::esi::{EsiSeg, parse};

/// Renders segments the way delivery would, with includes replaced by a
/// marker.
fn render(body: &[u8], segs: &[EsiSeg]) -> String {
    let mut out = String::new();
    for seg in segs {
        match seg {
            EsiSeg::Literal { off, len } => {
                out.push_str(&String::from_utf8_lossy(&body[*off..*off + *len]));
            },
            EsiSeg::Include { src } => {
                out.push('[');
                out.push_str(src);
                out.push(']');
            },
        }
    }
    out
}

#[test]
fn test_no_esi_constructs() {
    assert!(parse(b"plain <b>html</b> body").is_none());
    assert!(parse(b"").is_none());
}

#[test]
fn test_multiple_includes_in_order() {
    let body = b"<esi:include src=\"/a\"/>mid<esi:include src=\"/b\"/>";
    let segs = parse(body).expect("esi");
    assert_eq!(render(body, &segs), "[/a]mid[/b]");
}

#[test]
fn test_mixed_remove_comment_include() {
    let body = b"start<esi:remove><esi:include src=\"/hidden\"/></esi:remove>\
                 <!--esi <i>raw</i>-->end<esi:include src=\"/tail\"/>";
    let segs = parse(body).expect("esi");
    assert_eq!(render(body, &segs), "start<i>raw</i>end[/tail]");
}

#[test]
fn test_literals_coalesced() {
    let body = b"a < b < c <esi:include src=\"/x\"/>";
    let segs = parse(body).expect("esi");
    // everything before the include folds into one literal span
    let lits: Vec<_> = segs
        .iter()
        .filter(|s| matches!(s, EsiSeg::Literal { .. }))
        .collect();
    assert_eq!(lits.len(), 1);
    assert_eq!(render(body, &segs), "a < b < c [/x]");
}

#[test]
fn test_unterminated_tag_kept_literal() {
    let body = b"x<esi:include src=\"/a\"";
    assert!(parse(body).is_none());
}

#[test]
fn test_include_offsets_index_into_body() {
    let body = b"head<esi:include src=\"/f\"/>tail";
    let segs = parse(body).expect("esi");
    match &segs[..] {
        [
            EsiSeg::Literal { off: 0, len: 4 },
            EsiSeg::Include { src },
            EsiSeg::Literal { off, len },
        ] => {
            assert_eq!(src, "/f");
            assert_eq!(&body[*off..*off + *len], b"tail");
        },
        other => panic!("unexpected segments {other:?}"),
    }
}
