use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::chash::ConsistentHash;
use crate::config::{UpstreamKind, UpstreamSection};
use crate::health::HealthChecker;
use crate::peer::{Peer, PeerState};
use crate::route::parse_byte_range;

/// A named backend pool with a peer-selection strategy.
///
/// `reset_peers` recomputes the healthy set and rebuilds the selection
/// structure; it runs only on a health-change notification, never per
/// packet.
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;
    fn select_peer(&self, payload: &[u8]) -> Option<Arc<Peer>>;
    fn reset_peers(&self);
    fn health_checker(&self) -> Arc<HealthChecker>;
}

pub fn build_upstream(config: &UpstreamSection) -> Result<Arc<dyn Upstream>> {
    match config.kind {
        UpstreamKind::RoundRobin => Ok(Arc::new(RrUpstream::new(config)?)),
        UpstreamKind::ConsistentHash => Ok(Arc::new(ChashUpstream::new(config)?)),
    }
}

/// Start the upstream's background tasks: the health checker and the
/// rebuild listener that folds each coalesced change notification into one
/// `reset_peers` call.
pub fn spawn_upstream_tasks(upstream: Arc<dyn Upstream>, cancel: &CancellationToken) {
    let (changed_tx, changed_rx) = flume::bounded::<()>(1);

    tokio::spawn(upstream.health_checker().run(changed_tx, cancel.child_token()));

    let cancel = cancel.child_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changed_rx.recv_async() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(upstream = upstream.name(), "peer liveness changed, rebuilding selection");
                    upstream.reset_peers();
                }
            }
        }
    });
}

/// Build the full peer set from config, rejecting duplicate addresses and
/// extracting the (at most one) backup peer. The backup participates in
/// normal selection while alive; the separate handle only matters once
/// every peer is dead.
fn init_upstream_peers(config: &UpstreamSection) -> Result<(Vec<Arc<Peer>>, Option<Arc<Peer>>)> {
    let mut peers = Vec::with_capacity(config.peers.len());
    let mut unique = HashSet::new();
    let mut backup = None;

    for (id, peer_config) in config.peers.iter().enumerate() {
        if !unique.insert(peer_config.addr) {
            bail!(
                "duplicated peer {} in upstream {}",
                peer_config.addr,
                config.name
            );
        }

        let peer = Arc::new(Peer::new(id, peer_config.addr, peer_config.weight));
        if peer_config.backup {
            if backup.is_some() {
                bail!("upstream {} declares more than one backup peer", config.name);
            }
            backup = Some(Arc::clone(&peer));
        }
        peers.push(peer);
    }

    Ok((peers, backup))
}

/// Healthy peers, or the promoted backup as sole entry when all are dead.
fn healthy_or_backup(
    name: &str,
    peers: &[Arc<Peer>],
    backup: Option<&Arc<Peer>>,
) -> Vec<Arc<Peer>> {
    let healthy = peers
        .iter()
        .filter(|peer| peer.is_alive())
        .cloned()
        .collect::<Vec<_>>();
    if !healthy.is_empty() {
        return healthy;
    }

    match backup {
        Some(backup) => {
            error!(upstream = name, backup = %backup.addr(), "all peers dead, promoting backup");
            backup.set_state(PeerState::Temporary);
            vec![Arc::clone(backup)]
        }
        None => {
            error!(upstream = name, "all peers dead and no backup configured, dropping traffic");
            Vec::new()
        }
    }
}

/// Weighted round-robin selection over a flattened list with each peer
/// repeated proportional to its weight.
pub struct RrUpstream {
    name: String,
    peers: Vec<Arc<Peer>>,
    backup: Option<Arc<Peer>>,
    health_checker: Arc<HealthChecker>,
    rr_list: RwLock<Vec<Arc<Peer>>>,
    cursor: AtomicU64,
}

impl RrUpstream {
    pub fn new(config: &UpstreamSection) -> Result<Self> {
        let (peers, backup) = init_upstream_peers(config)?;
        let health_checker = Arc::new(
            HealthChecker::new(&config.health_check, peers.clone())
                .with_context(|| format!("upstream {} health checker", config.name))?,
        );
        let rr_list = build_rr_list(&peers);

        Ok(Self {
            name: config.name.clone(),
            peers,
            backup,
            health_checker,
            rr_list: RwLock::new(rr_list),
            cursor: AtomicU64::new(0),
        })
    }
}

impl Upstream for RrUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_peer(&self, _payload: &[u8]) -> Option<Arc<Peer>> {
        let list = self.rr_list.read();
        if list.is_empty() {
            return None;
        }
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&list[(cursor % list.len() as u64) as usize]))
    }

    fn reset_peers(&self) {
        let selectable = healthy_or_backup(&self.name, &self.peers, self.backup.as_ref());
        *self.rr_list.write() = build_rr_list(&selectable);
    }

    fn health_checker(&self) -> Arc<HealthChecker> {
        Arc::clone(&self.health_checker)
    }
}

/// Flatten peers into a list of length sum(weight), interleaved the same
/// way the consistent-hash fill orders claims: sweep peers in fixed order,
/// each sweep admitting the peers whose weight still exceeds the sweep
/// index. Long-run frequency is proportional to weight.
fn build_rr_list(peers: &[Arc<Peer>]) -> Vec<Arc<Peer>> {
    let max_weight = peers.iter().map(|peer| peer.weight()).max().unwrap_or(0);
    let sum_weight: usize = peers.iter().map(|peer| peer.weight() as usize).sum();

    let mut list = Vec::with_capacity(sum_weight);
    for sweep in 0..max_weight {
        for peer in peers {
            if peer.weight() > sweep {
                list.push(Arc::clone(peer));
            }
        }
    }
    list
}

/// Consistent-hash selection keyed by a configured payload byte range.
pub struct ChashUpstream {
    name: String,
    peers: Vec<Arc<Peer>>,
    backup: Option<Arc<Peer>>,
    health_checker: Arc<HealthChecker>,
    chash: ConsistentHash,
    key_start: usize,
    key_end: usize,
}

impl ChashUpstream {
    pub fn new(config: &UpstreamSection) -> Result<Self> {
        let key_bytes = config
            .key_bytes
            .as_deref()
            .with_context(|| format!("upstream {} requires key_bytes", config.name))?;
        let (key_start, key_end) = parse_byte_range(key_bytes)
            .with_context(|| format!("upstream {} has invalid key_bytes", config.name))?;

        let (peers, backup) = init_upstream_peers(config)?;
        let health_checker = Arc::new(
            HealthChecker::new(&config.health_check, peers.clone())
                .with_context(|| format!("upstream {} health checker", config.name))?,
        );
        let chash = ConsistentHash::new(&peers)
            .with_context(|| format!("upstream {} lookup table", config.name))?;

        Ok(Self {
            name: config.name.clone(),
            peers,
            backup,
            health_checker,
            chash,
            key_start,
            key_end,
        })
    }
}

impl Upstream for ChashUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    /// Packets shorter than the key range select nothing.
    fn select_peer(&self, payload: &[u8]) -> Option<Arc<Peer>> {
        if payload.len() < self.key_end {
            return None;
        }
        self.chash.select_peer(&payload[self.key_start..self.key_end])
    }

    fn reset_peers(&self) {
        let selectable = healthy_or_backup(&self.name, &self.peers, self.backup.as_ref());
        if selectable.is_empty() {
            self.chash.clear();
            return;
        }
        if let Err(err) = self.chash.rebuild(&selectable) {
            error!(upstream = %self.name, error = %err, "lookup table rebuild failed");
        }
    }

    fn health_checker(&self) -> Arc<HealthChecker> {
        Arc::clone(&self.health_checker)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::{HealthCheckSection, PeerSection};

    fn upstream_config(kind: UpstreamKind, peers: Vec<PeerSection>) -> UpstreamSection {
        UpstreamSection {
            name: "pool".to_string(),
            kind,
            key_bytes: matches!(kind, UpstreamKind::ConsistentHash).then(|| "0:4".to_string()),
            peers,
            health_check: HealthCheckSection {
                interval_secs: 60,
                timeout_secs: 1,
                success_times: 2,
                failed_times: 2,
            },
        }
    }

    fn peer_section(addr: &str, weight: u32, backup: bool) -> PeerSection {
        PeerSection {
            addr: addr.parse().expect("addr"),
            weight,
            backup,
        }
    }

    #[tokio::test]
    async fn weighted_round_robin_frequency_approaches_weights() {
        let config = upstream_config(
            UpstreamKind::RoundRobin,
            vec![
                peer_section("127.0.0.1:9101", 3, false),
                peer_section("127.0.0.1:9102", 1, false),
            ],
        );
        let upstream = RrUpstream::new(&config).expect("upstream");

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..10_000 {
            let peer = upstream.select_peer(b"payload").expect("peer");
            *counts.entry(peer.id()).or_default() += 1;
        }

        let heavy = counts[&0] as f64;
        let light = counts[&1] as f64;
        let ratio = heavy / light;
        assert!(
            (2.9..3.1).contains(&ratio),
            "selection ratio {ratio:.3} should approach 3.0"
        );
    }

    #[tokio::test]
    async fn dead_peers_leave_rotation_after_reset() {
        let config = upstream_config(
            UpstreamKind::RoundRobin,
            vec![
                peer_section("127.0.0.1:9103", 1, false),
                peer_section("127.0.0.1:9104", 1, false),
            ],
        );
        let upstream = RrUpstream::new(&config).expect("upstream");

        upstream.peers[0].set_state(PeerState::Dead);
        upstream.reset_peers();

        for _ in 0..32 {
            let peer = upstream.select_peer(b"payload").expect("peer");
            assert_eq!(peer.id(), 1, "dead peer must not be selected");
        }
    }

    #[tokio::test]
    async fn backup_is_promoted_when_all_peers_die() {
        let config = upstream_config(
            UpstreamKind::RoundRobin,
            vec![
                peer_section("127.0.0.1:9105", 1, false),
                peer_section("127.0.0.1:9106", 1, true),
            ],
        );
        let upstream = RrUpstream::new(&config).expect("upstream");

        for peer in &upstream.peers {
            peer.set_state(PeerState::Dead);
        }
        upstream.reset_peers();

        let backup = upstream.backup.as_ref().expect("backup");
        assert_eq!(backup.state(), PeerState::Temporary);
        for _ in 0..8 {
            let peer = upstream.select_peer(b"payload").expect("peer");
            assert_eq!(peer.id(), backup.id());
        }
    }

    #[tokio::test]
    async fn no_backup_and_all_dead_selects_nothing() {
        let config = upstream_config(
            UpstreamKind::RoundRobin,
            vec![peer_section("127.0.0.1:9107", 1, false)],
        );
        let upstream = RrUpstream::new(&config).expect("upstream");

        upstream.peers[0].set_state(PeerState::Dead);
        upstream.reset_peers();
        assert!(upstream.select_peer(b"payload").is_none());
    }

    #[tokio::test]
    async fn chash_requires_key_range_to_be_covered() {
        let config = upstream_config(
            UpstreamKind::ConsistentHash,
            vec![
                peer_section("127.0.0.1:9108", 1, false),
                peer_section("127.0.0.1:9109", 1, false),
            ],
        );
        let upstream = ChashUpstream::new(&config).expect("upstream");

        assert!(upstream.select_peer(b"abc").is_none());
        assert!(upstream.select_peer(b"abcd").is_some());
    }

    #[tokio::test]
    async fn chash_selection_is_sticky_per_key() {
        let config = upstream_config(
            UpstreamKind::ConsistentHash,
            vec![
                peer_section("127.0.0.1:9110", 1, false),
                peer_section("127.0.0.1:9111", 1, false),
                peer_section("127.0.0.1:9112", 1, false),
            ],
        );
        let upstream = ChashUpstream::new(&config).expect("upstream");

        let first = upstream.select_peer(b"key1rest").expect("peer").id();
        for _ in 0..16 {
            assert_eq!(upstream.select_peer(b"key1rest").expect("peer").id(), first);
        }
    }

    #[tokio::test]
    async fn duplicate_peer_addresses_are_rejected() {
        let config = upstream_config(
            UpstreamKind::RoundRobin,
            vec![
                peer_section("127.0.0.1:9113", 1, false),
                peer_section("127.0.0.1:9113", 1, false),
            ],
        );
        assert!(RrUpstream::new(&config).is_err());
    }
}
