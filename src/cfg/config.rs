// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::logger::LogConfig;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Client-facing listener and backend targets.
    pub net: NetConfig,
    /// Cache sizing and object lifetime defaults.
    pub cache: CacheConfig,
    /// Client and backend I/O deadlines.
    pub timeouts: Timeouts,
    /// Request engine knobs (restarts, gzip, ESI, buffers).
    pub engine: EngineConfig,
    /// Worker pool sizing.
    pub threads: ThreadConfig,
    /// Logging sink and level.
    #[serde(default)]
    pub logger: LogConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetConfig {
    /// Address the client acceptor binds to.
    pub listen: String,
    /// Origin servers, tried in director order. The first entry is the
    /// default director target for every request.
    pub backends: Vec<BackendConfig>,
    /// Backend selection strategy across `backends`.
    #[serde(default)]
    pub director: DirectorKind,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BackendConfig {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectorKind {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget of the default storage pool.
    pub storage_size: u64,
    /// TTL applied when the response carries no caching headers.
    #[serde(with = "serde_secs_f64")]
    pub default_ttl: f64,
    #[serde(default, with = "serde_secs_f64")]
    pub default_grace: f64,
    #[serde(default, with = "serde_secs_f64")]
    pub default_keep: f64,
    /// Objects below this TTL go to transient storage and are never indexed
    /// for reuse beyond their short life.
    #[serde(with = "serde_secs_f64")]
    pub shortlived: f64,
    /// LRU touch suppression window.
    #[serde(with = "serde_secs_f64")]
    pub lru_timeout: f64,
    /// Reaper scan period.
    #[serde(default = "default_reap_interval", with = "serde_secs")]
    pub reap_interval: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Timeouts {
    /// How long Wait keeps polling for the rest of a request before parking
    /// the session on the waiter. Milliseconds; 0 parks immediately.
    pub session_linger_ms: u64,
    /// Idle keep-alive cutoff while parked on the waiter.
    #[serde(with = "serde_secs")]
    pub timeout_idle: Duration,
    #[serde(with = "serde_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub first_byte_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub between_bytes_timeout: Duration,
    /// Client write deadline during delivery.
    #[serde(with = "serde_secs")]
    pub send_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineConfig {
    /// Restart cap; exceeding it synthesizes a 503.
    pub max_restarts: u32,
    /// Master gzip switch. Off clears every do_gzip/do_gunzip decision.
    pub http_gzip_support: bool,
    /// Bounce buffer size for gunzip-on-deliver.
    pub gzip_stack_buffer: usize,
    /// Client read buffer; a request head that does not fit is an overflow.
    pub client_buf_size: usize,
    /// Largest request body accepted for pass/pipe forwarding.
    pub max_req_body: u64,
    /// Include nesting bound for ESI delivery.
    pub max_esi_depth: u32,
    /// Per-session workspace size.
    pub workspace_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ThreadConfig {
    /// Worker task count.
    pub pool_size: usize,
    /// Worker stats are folded into globals every this many requests.
    pub wthread_stats_rate: u64,
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(1)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.net.listen.is_empty(), "net.listen must not be empty");
        ensure!(
            !self.net.backends.is_empty(),
            "at least one backend is required"
        );
        for b in &self.net.backends {
            ensure!(!b.address.is_empty(), "backend address must not be empty");
        }

        ensure!(self.threads.pool_size >= 1, "pool_size must be >= 1");
        ensure!(
            self.threads.wthread_stats_rate >= 1,
            "wthread_stats_rate must be >= 1"
        );

        ensure!(
            self.engine.client_buf_size >= 1024,
            "client_buf_size must be >= 1024"
        );
        ensure!(
            self.engine.gzip_stack_buffer >= 4096,
            "gzip_stack_buffer must be >= 4096"
        );
        ensure!(
            self.engine.workspace_size >= 1024,
            "workspace_size must be >= 1024"
        );
        ensure!(self.engine.max_esi_depth >= 1, "max_esi_depth must be >= 1");

        ensure!(
            self.cache.shortlived >= 0.0 && self.cache.default_ttl >= 0.0,
            "cache lifetimes must not be negative"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            net: NetConfig {
                listen: "127.0.0.1:8080".into(),
                backends: vec![BackendConfig {
                    address: "127.0.0.1:9000".into(),
                    name: None,
                }],
                director: DirectorKind::RoundRobin,
            },
            cache: CacheConfig {
                storage_size: 256 << 20,
                default_ttl: 120.0,
                default_grace: 10.0,
                default_keep: 0.0,
                shortlived: 10.0,
                lru_timeout: 2.0,
                reap_interval: Duration::from_secs(1),
            },
            timeouts: Timeouts {
                session_linger_ms: 50,
                timeout_idle: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(4),
                first_byte_timeout: Duration::from_secs(60),
                between_bytes_timeout: Duration::from_secs(60),
                send_timeout: Duration::from_secs(60),
            },
            engine: EngineConfig {
                max_restarts: 4,
                http_gzip_support: true,
                gzip_stack_buffer: 32 << 10,
                client_buf_size: 8 << 10,
                max_req_body: 1 << 20,
                max_esi_depth: 5,
                workspace_size: 64 << 10,
            },
            threads: ThreadConfig {
                pool_size: 8,
                wthread_stats_rate: 10,
            },
            logger: LogConfig::default(),
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Same, for lifetimes kept as raw f64 seconds (NaN-free, may be fractional).
mod serde_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(*v)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        f64::deserialize(d)
    }
}
