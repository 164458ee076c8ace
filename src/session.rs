// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use bitflags::bitflags;
use bytes::Bytes;
use tokio::net::TcpStream;

use crate::{
    backend::io::{BackendConn, BodyStatus},
    body::VfpKind,
    cache::{
        index::{ObjCore, ObjHead},
        object::{ExpSpec, Object},
    },
    engine::Step,
    http::{conn::HttpConn, msg::HttpMsg},
    policy::{Handling, Policy},
    proxy::ProxyCore,
    utils,
    ws::Workspace,
};

bitflags! {
    /// Delivery framing decision: exactly one of LEN/CHUNKED/EOF for a body
    /// that goes on the wire, with ESI/ESI_CHILD/GUNZIP as overlays.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResMode: u8 {
        const LEN       = 1 << 0;
        const CHUNKED   = 1 << 1;
        const EOF       = 1 << 2;
        const ESI       = 1 << 3;
        const ESI_CHILD = 1 << 4;
        const GUNZIP    = 1 << 5;
    }
}

/// Either the exclusively-owned object of an in-flight fetch or a shared
/// reference to a published cache object. Publishing consumes the owned form.
#[derive(Debug)]
pub enum ObjRef {
    Owned(Box<Object>),
    Shared(Arc<Object>),
}

impl ObjRef {
    pub fn get(&self) -> &Object {
        match self {
            ObjRef::Owned(o) => o,
            ObjRef::Shared(o) => o,
        }
    }

    /// Mutable access exists only before publication.
    pub fn get_mut(&mut self) -> Option<&mut Object> {
        match self {
            ObjRef::Owned(o) => Some(o),
            ObjRef::Shared(_) => None,
        }
    }

    pub fn into_shared(self) -> Arc<Object> {
        match self {
            ObjRef::Owned(o) => Arc::from(o),
            ObjRef::Shared(o) => o,
        }
    }
}

/// Fetch-time state bound to one busy ObjCore, exclusively owned by the
/// fetching session. Peers parked on the busy list only ever observe the
/// published object, never this.
#[derive(Debug)]
pub struct BusyObj {
    pub vbc: Option<BackendConn>,
    pub backend_idx: usize,
    pub bereq: HttpMsg,
    pub beresp: Option<HttpMsg>,
    pub is_gzip: bool,
    pub is_gunzip: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_esi: bool,
    pub do_stream: bool,
    pub exp: ExpSpec,
    pub vfp: VfpKind,
    pub body_status: BodyStatus,
    pub should_close: bool,
    pub vary: Option<Vec<u8>>,
}

impl BusyObj {
    pub fn new(bereq: HttpMsg, backend_idx: usize) -> Self {
        Self {
            vbc: None,
            backend_idx,
            bereq,
            beresp: None,
            is_gzip: false,
            is_gunzip: false,
            do_gzip: false,
            do_gunzip: false,
            do_esi: false,
            do_stream: false,
            exp: ExpSpec::default(),
            vfp: VfpKind::Identity,
            body_status: BodyStatus::None,
            should_close: false,
            vary: None,
        }
    }

    /// Encoding flags are pairwise exclusive and each do_* requires the
    /// matching source encoding. Checked on every entry into FetchBody.
    pub fn assert_encoding_invariants(&self) {
        assert!(!(self.is_gzip && self.is_gunzip), "is_gzip ^ is_gunzip");
        assert!(!(self.do_gzip && self.do_gunzip), "do_gzip ^ do_gunzip");
        assert!(!self.do_gunzip || self.is_gzip, "do_gunzip requires is_gzip");
        assert!(!self.do_gzip || self.is_gunzip, "do_gzip requires is_gunzip");
    }
}

/// The per-request context: every object/index/backend reference the request
/// holds, with the ownership transitions as methods. The worker itself only
/// carries the execution environment.
#[derive(Debug, Default)]
pub struct ReqCtx {
    pub obj: Option<ObjRef>,
    pub objcore: Option<Arc<ObjCore>>,
    pub busyobj: Option<BusyObj>,
    pub resp: Option<HttpMsg>,
    pub res_mode: ResMode,
    /// Body bytes written to the client but not yet charged to worker stats.
    pub acct_bodybytes: u64,
}

impl ReqCtx {
    /// Releases the object reference (and index handle) this request holds.
    pub fn deref_obj(&mut self) {
        self.obj = None;
        self.objcore = None;
    }

    pub fn has_busyobj(&self) -> bool {
        self.busyobj.is_some()
    }

    /// Done-time invariant: nothing survives the request.
    pub fn assert_clean(&self) {
        assert!(self.obj.is_none(), "object reference held at Done");
        assert!(self.objcore.is_none(), "objcore reference held at Done");
        assert!(self.busyobj.is_none(), "busyobj held at Done");
        assert_eq!(self.acct_bodybytes, 0, "accounting residue at Done");
    }
}

/// One client connection plus the state of its active request.
#[derive(Debug)]
pub struct Session {
    pub core: Arc<ProxyCore>,
    pub htc: HttpConn,
    pub peer: SocketAddr,

    pub step: Step,
    pub xid: u64,
    pub restarts: u32,
    pub esi_level: u32,
    /// Whether embedded-include body writes must use the parent's chunked
    /// framing.
    pub esi_wrap_chunked: bool,

    pub t_open: f64,
    pub t_req: f64,
    pub t_resp: f64,
    pub t_end: f64,

    pub req: HttpMsg,
    /// Pre-modification header snapshot, restored on restart.
    pub http0: Option<HttpMsg>,
    pub director: usize,

    pub wantbody: bool,
    pub sendbody: bool,
    pub hash_always_miss: bool,
    pub hash_ignore_busy: bool,
    pub disable_esi: bool,

    pub doclose: Option<&'static str>,
    pub digest: [u8; 32],
    pub handling: Handling,
    pub err_code: u16,
    pub err_reason: Option<String>,
    pub synth_body: Option<String>,

    pub ws: Workspace,
    pub ws_ses: usize,
    pub ws_req: usize,

    pub hash_objhead: Option<Arc<ObjHead>>,
    pub policy: Option<Arc<dyn Policy>>,

    pub req_body: Option<Bytes>,
    pub req_bodybytes: u64,

    pub ctx: ReqCtx,
}

impl Session {
    pub fn new(core: Arc<ProxyCore>, stream: TcpStream, peer: SocketAddr) -> Box<Self> {
        let buf = core.cfg.engine.client_buf_size;
        let ws = Workspace::new(core.cfg.engine.workspace_size);
        Box::new(Self {
            core,
            htc: HttpConn::new(stream, peer, buf),
            peer,
            step: Step::First,
            xid: 0,
            restarts: 0,
            esi_level: 0,
            esi_wrap_chunked: false,
            t_open: utils::now(),
            t_req: f64::NAN,
            t_resp: f64::NAN,
            t_end: f64::NAN,
            req: HttpMsg::default(),
            http0: None,
            director: 0,
            wantbody: false,
            sendbody: false,
            hash_always_miss: false,
            hash_ignore_busy: false,
            disable_esi: false,
            doclose: None,
            digest: [0u8; 32],
            handling: Handling::Undefined,
            err_code: 0,
            err_reason: None,
            synth_body: None,
            ws,
            ws_ses: 0,
            ws_req: 0,
            hash_objhead: None,
            policy: None,
            req_body: None,
            req_bodybytes: 0,
            ctx: ReqCtx::default(),
        })
    }

    /// Records the close decision. The first reason wins; later ones only
    /// matter when nothing was decided yet.
    pub fn set_close(&mut self, reason: &'static str) {
        if self.doclose.is_none() {
            self.doclose = Some(reason);
        }
    }

    /// Per-request scratch reset at Done.
    pub fn reset_scratch(&mut self) {
        self.xid = 0;
        self.restarts = 0;
        self.t_req = f64::NAN;
        self.t_resp = f64::NAN;
        self.req_body = None;
        self.req_bodybytes = 0;
        self.hash_always_miss = false;
        self.hash_ignore_busy = false;
        self.disable_esi = false;
        self.sendbody = false;
        self.handling = Handling::Undefined;
        self.err_code = 0;
        self.err_reason = None;
        self.synth_body = None;
        self.hash_objhead = None;
        self.http0 = None;
        self.ctx.resp = None;
        self.ctx.res_mode = ResMode::empty();
    }
}
