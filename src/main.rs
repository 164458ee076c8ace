// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use revcache_rs::{
    cfg::{cli::config_path_from_args, config::Config, logger::init_logger},
    policy::BuiltinPolicy,
    proxy::{ProxyCore, bind_and_serve},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path_from_args()?;
    let cfg = Config::load_from_file(&path)
        .with_context(|| format!("failed to load config {path:?}"))?;

    let _log_guard = init_logger(&cfg.logger)?;
    info!("config loaded from {path:?}");

    let core = ProxyCore::new(cfg, Arc::new(BuiltinPolicy));
    let (addr, accept_handle) = bind_and_serve(Arc::clone(&core)).await?;
    info!("revcached accepting clients on {addr}");

    tokio::signal::ctrl_c().await.context("signal wait")?;
    info!("shutting down");
    core.cancel.cancel();
    let _ = accept_handle.await;

    Ok(())
}
