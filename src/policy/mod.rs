// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Debug;

use sha2::{Digest, Sha256};

use crate::session::Session;

/// Return code a policy hook hands back to the engine. Which codes are legal
/// depends on the hook; an illegal code is a programming error and aborts the
/// engine loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handling {
    #[default]
    Undefined,
    Lookup,
    Pipe,
    Pass,
    Error,
    Deliver,
    Fetch,
    HitForPass,
    Restart,
}

/// The host binding for the policy program: nine hooks invoked by name at
/// fixed points of the request lifecycle. Hooks read and mutate the session
/// (and its bereq/beresp/resp through `ReqCtx`) and return a [`Handling`].
///
/// The default bodies implement the builtin rules, so a custom policy only
/// overrides the hooks it cares about.
pub trait Policy: Send + Sync + Debug {
    fn recv(&self, sess: &mut Session) -> Handling {
        let m = sess.req.method.as_str();
        let known = matches!(
            m,
            "GET" | "HEAD" | "PUT" | "POST" | "TRACE" | "OPTIONS" | "DELETE"
        );
        if !known {
            return Handling::Pipe;
        }
        if m != "GET" && m != "HEAD" {
            return Handling::Pass;
        }
        if sess.req.has("authorization") || sess.req.has("cookie") {
            return Handling::Pass;
        }
        Handling::Lookup
    }

    /// Feeds the hash input. No handling code: hash always proceeds.
    fn hash(&self, sess: &mut Session, sha: &mut Sha256) {
        sha.update(sess.req.url.as_bytes());
        sha.update([0u8]);
        if let Some(host) = sess.req.get("host") {
            sha.update(host.as_bytes());
        }
        sha.update([0u8]);
    }

    fn pipe(&self, _sess: &mut Session) -> Handling {
        Handling::Pipe
    }

    fn pass(&self, _sess: &mut Session) -> Handling {
        Handling::Pass
    }

    fn miss(&self, _sess: &mut Session) -> Handling {
        Handling::Fetch
    }

    fn hit(&self, _sess: &mut Session) -> Handling {
        Handling::Deliver
    }

    fn fetch(&self, sess: &mut Session) -> Handling {
        let Some(bo) = sess.ctx.busyobj.as_ref() else {
            return Handling::Deliver;
        };
        let Some(beresp) = bo.beresp.as_ref() else {
            return Handling::Deliver;
        };
        if beresp.has("set-cookie") {
            return Handling::HitForPass;
        }
        if beresp.has_token("cache-control", "no-cache")
            || beresp.has_token("cache-control", "no-store")
            || beresp.has_token("cache-control", "private")
        {
            return Handling::HitForPass;
        }
        if beresp.get("vary").map(str::trim) == Some("*") {
            return Handling::HitForPass;
        }
        Handling::Deliver
    }

    fn deliver(&self, _sess: &mut Session) -> Handling {
        Handling::Deliver
    }

    fn error(&self, _sess: &mut Session) -> Handling {
        Handling::Deliver
    }
}

/// The builtin rule set alone, used when no custom program is loaded.
#[derive(Debug, Default)]
pub struct BuiltinPolicy;

impl Policy for BuiltinPolicy {}
