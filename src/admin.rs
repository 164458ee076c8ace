// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail};

use crate::utils;

/// Dispatches one admin command line. Supported:
///   `debug.xid [n]`      examine or set the request id counter
///   `debug.srandom [s]`  reseed the process PRNG (default seed 1)
pub fn run_command(line: &str) -> Result<String> {
    let mut parts = line.split_ascii_whitespace();
    let cmd = parts.next().context("empty command")?;
    let arg = parts.next();
    if parts.next().is_some() {
        bail!("too many arguments for {cmd}");
    }

    match cmd {
        "debug.xid" => match arg {
            Some(v) => {
                let n: u64 = v.parse().context("debug.xid: bad number")?;
                utils::set_xid(n);
                Ok(format!("XID is {n}"))
            },
            None => Ok(format!("XID is {}", utils::peek_xid())),
        },
        "debug.srandom" => {
            let seed: u64 = match arg {
                Some(v) => v.parse().context("debug.srandom: bad seed")?,
                None => 1,
            };
            utils::srandom(seed);
            Ok(format!("Random seeded with {seed}"))
        },
        other => bail!("unknown command {other:?}"),
    }
}
