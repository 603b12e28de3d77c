use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthCheckSection;
use crate::peer::{Peer, PeerState};

const HEARTBEAT_PAYLOAD: &[u8] = b"check";

struct Counters {
    succeeded: Vec<u32>,
    failed: Vec<u32>,
}

/// Periodic heartbeat state machine flipping peer liveness.
///
/// Each peer gets a dedicated connected check socket created at upstream
/// construction. A live peer goes dead only after `failed_times` consecutive
/// failures, and a dead one recovers only after `success_times` consecutive
/// successes; each counter resets on
/// the opposite outcome. At most one change notification is emitted per
/// tick, so the owning upstream rebuilds once per flip batch.
pub struct HealthChecker {
    peers: Vec<Arc<Peer>>,
    check_socks: Vec<Arc<UdpSocket>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    success_times: u32,
    failed_times: u32,
    counters: Mutex<Counters>,
}

impl HealthChecker {
    /// Socket creation failures here are startup failures and propagate to
    /// the caller before the server begins serving.
    pub fn new(config: &HealthCheckSection, peers: Vec<Arc<Peer>>) -> Result<Self> {
        let mut check_socks = Vec::with_capacity(peers.len());
        for peer in &peers {
            check_socks.push(Arc::new(connect_check_socket(peer.addr()).with_context(
                || format!("failed creating health-check socket for {}", peer.addr()),
            )?));
        }

        let counters = Counters {
            succeeded: vec![0; peers.len()],
            failed: vec![0; peers.len()],
        };

        Ok(Self {
            peers,
            check_socks,
            heartbeat_interval: Duration::from_secs(config.interval_secs),
            heartbeat_timeout: Duration::from_secs(config.timeout_secs),
            success_times: config.success_times,
            failed_times: config.failed_times,
            counters: Mutex::new(counters),
        })
    }

    /// Tick loop: immediate first check, then every `heartbeat_interval`.
    /// Peers are probed concurrently; a coalesced notification is sent when
    /// any liveness flipped this tick.
    pub async fn run(self: Arc<Self>, changed_tx: flume::Sender<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut probes = JoinSet::new();
                    for (peer, sock) in self.peers.iter().zip(self.check_socks.iter()) {
                        let checker = Arc::clone(&self);
                        let peer = Arc::clone(peer);
                        let sock = Arc::clone(sock);
                        probes.spawn(async move { checker.check_one_peer(&peer, &sock).await });
                    }

                    let mut changed = false;
                    while let Some(result) = probes.join_next().await {
                        if let Ok(flipped) = result {
                            changed |= flipped;
                        }
                    }

                    if changed {
                        let _ = changed_tx.try_send(());
                    }
                }
            }
        }
    }

    async fn check_one_peer(&self, peer: &Arc<Peer>, sock: &UdpSocket) -> bool {
        if let Err(err) = sock.send(HEARTBEAT_PAYLOAD).await {
            debug!(peer = %peer.addr(), error = %err, "heartbeat send failed");
            return self.handle_failed_check(peer);
        }

        // Give an unreachable peer time to bounce an ICMP error back, then
        // classify via the descriptor's pending-error state: on a connected
        // socket a queued port-unreachable surfaces as an error from the
        // next receive, while silence reads as WouldBlock.
        tokio::time::sleep(self.heartbeat_timeout).await;
        let mut scratch = [0u8; 32];
        match sock.try_recv(&mut scratch) {
            Ok(_) => self.handle_success_check(peer),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                self.handle_success_check(peer)
            }
            Err(err) => {
                debug!(peer = %peer.addr(), error = %err, "heartbeat reported pending error");
                self.handle_failed_check(peer)
            }
        }
    }

    fn handle_failed_check(&self, peer: &Arc<Peer>) -> bool {
        let mut counters = self.counters.lock();
        counters.failed[peer.id()] += 1;
        counters.succeeded[peer.id()] = 0;
        if peer.is_alive() && counters.failed[peer.id()] >= self.failed_times {
            peer.set_state(PeerState::Dead);
            warn!(peer = %peer.addr(), "peer marked dead after consecutive heartbeat failures");
            return true;
        }
        false
    }

    fn handle_success_check(&self, peer: &Arc<Peer>) -> bool {
        let mut counters = self.counters.lock();
        counters.succeeded[peer.id()] += 1;
        counters.failed[peer.id()] = 0;
        if !peer.is_alive() && counters.succeeded[peer.id()] >= self.success_times {
            peer.set_state(PeerState::Alive);
            warn!(peer = %peer.addr(), "peer recovered after consecutive heartbeat successes");
            return true;
        }
        false
    }
}

fn connect_check_socket(peer_addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if peer_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("failed creating socket")?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;
    socket
        .connect(&peer_addr.into())
        .context("failed connecting check socket")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed converting into tokio socket")
}
