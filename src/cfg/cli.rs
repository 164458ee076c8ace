// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Well-known config locations probed when the daemon is started without an
/// explicit path.
const DEFAULT_LOCATIONS: &[&str] = &["revcache.yaml", "/etc/revcache/revcache.yaml"];

/// Picks the config file for this daemon run: the first CLI argument if one
/// was given, otherwise the first default location that exists. The result
/// is canonicalized so startup logs name the real file.
pub fn config_path_from_args() -> Result<PathBuf> {
    if let Some(arg) = std::env::args().nth(1) {
        return canonical(Path::new(&arg));
    }
    for loc in DEFAULT_LOCATIONS {
        let candidate = Path::new(loc);
        if candidate.exists() {
            return canonical(candidate);
        }
    }
    bail!(
        "no config file given and none of the default locations exist: {:?}",
        DEFAULT_LOCATIONS
    )
}

/// Anchors a relative path at the working directory and resolves symlinks.
fn canonical(path: &Path) -> Result<PathBuf> {
    let anchored = if path.is_relative() {
        std::env::current_dir()
            .context("working directory is not accessible")?
            .join(path)
    } else {
        path.to_path_buf()
    };
    anchored
        .canonicalize()
        .with_context(|| format!("config file {} does not resolve", anchored.display()))
}
