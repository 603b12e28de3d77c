use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::route::{decode_literal, parse_byte_range, RouteOp};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerSection,
    pub session: SessionSection,
    pub upload: UploadSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_listen_parallel")]
    pub listen_parallel: usize,
    #[serde(default = "default_event_size")]
    pub event_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    #[serde(default = "default_task_pool_size")]
    pub task_pool_size: usize,
    #[serde(default = "default_task_pool_idle_timeout_secs")]
    pub task_pool_idle_timeout_secs: u64,
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_recycle_interval_secs")]
    pub recycle_interval_secs: u64,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    #[serde(default)]
    pub default_upstream: Option<String>,
    pub upstreams: Vec<UpstreamSection>,
    #[serde(default)]
    pub routes: Vec<RouteSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    pub name: String,
    pub kind: UpstreamKind,
    /// Key byte range `"start:end"` for consistent-hash upstreams.
    #[serde(default)]
    pub key_bytes: Option<String>,
    pub peers: Vec<PeerSection>,
    #[serde(default)]
    pub health_check: HealthCheckSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamKind {
    RoundRobin,
    ConsistentHash,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSection {
    pub addr: SocketAddr,
    #[serde(default = "default_peer_weight")]
    pub weight: u32,
    #[serde(default)]
    pub backup: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_success_times")]
    pub success_times: u32,
    #[serde(default = "default_failed_times")]
    pub failed_times: u32,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            success_times: default_success_times(),
            failed_times: default_failed_times(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSection {
    pub operator: RouteOp,
    pub key_bytes: String,
    pub value: String,
    pub upstream: String,
}

fn default_listen_parallel() -> usize {
    1
}

fn default_event_size() -> usize {
    1024
}

fn default_batch_size() -> usize {
    32
}

fn default_buf_size() -> usize {
    4096
}

fn default_task_pool_size() -> usize {
    1024
}

fn default_task_pool_idle_timeout_secs() -> u64 {
    10
}

fn default_max_send_retries() -> usize {
    3
}

fn default_recycle_interval_secs() -> u64 {
    30
}

fn default_session_idle_timeout_secs() -> u64 {
    300
}

fn default_peer_weight() -> u32 {
    1
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_heartbeat_timeout_secs() -> u64 {
    2
}

fn default_success_times() -> u32 {
    3
}

fn default_failed_times() -> u32 {
    3
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let cfg = Self::from_toml(&raw).with_context(|| "invalid config file")?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.server.listen_parallel == 0 {
            bail!("server.listen_parallel must be > 0");
        }
        if self.server.batch_size == 0 {
            bail!("server.batch_size must be > 0");
        }
        if self.server.buf_size == 0 {
            bail!("server.buf_size must be > 0");
        }
        if self.server.task_pool_size == 0 {
            bail!("server.task_pool_size must be > 0");
        }
        if self.server.max_send_retries == 0 {
            bail!("server.max_send_retries must be > 0");
        }
        if self.session.recycle_interval_secs == 0 {
            bail!("session.recycle_interval_secs must be > 0");
        }
        if self.session.idle_timeout_secs == 0 {
            bail!("session.idle_timeout_secs must be > 0");
        }

        if self.upload.upstreams.is_empty() {
            bail!("upload.upstreams must not be empty");
        }

        let mut names = HashSet::new();
        for upstream in &self.upload.upstreams {
            if !names.insert(upstream.name.as_str()) {
                bail!("duplicated upstream name {}", upstream.name);
            }
            upstream.validate()?;
        }

        for (id, route) in self.upload.routes.iter().enumerate() {
            let (start, end) = parse_byte_range(&route.key_bytes)
                .with_context(|| format!("route {id} has invalid key range"))?;
            let literal = decode_literal(&route.value)
                .with_context(|| format!("route {id} has invalid literal"))?;
            if literal.len() != end - start {
                bail!(
                    "route {id} literal is {} bytes but key range {:?} selects {}",
                    literal.len(),
                    route.key_bytes,
                    end - start
                );
            }
            if !names.contains(route.upstream.as_str()) {
                bail!("route {id} targets unknown upstream {}", route.upstream);
            }
        }

        if let Some(default) = &self.upload.default_upstream {
            if !names.contains(default.as_str()) {
                bail!("default upstream {default} is not defined");
            }
        }

        Ok(())
    }
}

impl UpstreamSection {
    fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            bail!("upstream {} has no peers", self.name);
        }

        let mut addrs = HashSet::new();
        let mut backups = 0usize;
        for peer in &self.peers {
            if !addrs.insert(peer.addr) {
                bail!("duplicated peer {} in upstream {}", peer.addr, self.name);
            }
            if peer.weight == 0 {
                bail!("peer {} in upstream {} has zero weight", peer.addr, self.name);
            }
            if peer.backup {
                backups += 1;
            }
        }
        if backups > 1 {
            bail!("upstream {} declares more than one backup peer", self.name);
        }

        match self.kind {
            UpstreamKind::ConsistentHash => {
                let Some(key_bytes) = &self.key_bytes else {
                    bail!(
                        "consistent-hash upstream {} requires key_bytes",
                        self.name
                    );
                };
                parse_byte_range(key_bytes)
                    .with_context(|| format!("upstream {} has invalid key_bytes", self.name))?;
            }
            UpstreamKind::RoundRobin => {}
        }

        if self.health_check.interval_secs == 0 {
            bail!("upstream {} health_check.interval_secs must be > 0", self.name);
        }
        if self.health_check.timeout_secs == 0 {
            bail!("upstream {} health_check.timeout_secs must be > 0", self.name);
        }
        if self.health_check.success_times == 0 || self.health_check.failed_times == 0 {
            bail!(
                "upstream {} health_check thresholds must be > 0",
                self.name
            );
        }

        Ok(())
    }
}
