use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SessionSection;
use crate::peer::Peer;
use crate::selector::Selector;
use crate::upstream::Upstream;

/// Cached routing decision for one flow. The upstream choice is stable for
/// the session's lifetime; the peer is re-selected when it dies.
#[derive(Default)]
pub struct StickyRoute {
    pub upstream: Option<Arc<dyn Upstream>>,
    pub peer: Option<Arc<Peer>>,
}

/// Per-client affinity record: the client address, a dedicated outbound
/// descriptor for upstream traffic, the wakeup channel its download worker
/// blocks on, and the last-active timestamp the reaper inspects.
pub struct Session {
    key: SocketAddr,
    socket: std::net::UdpSocket,
    notify_tx: flume::Sender<()>,
    notify_rx: flume::Receiver<()>,
    cancel: CancellationToken,
    last_active_secs: AtomicU64,
    sticky: Mutex<StickyRoute>,
}

impl Session {
    fn new(key: SocketAddr, cancel: CancellationToken, now_secs: u64) -> Result<Self> {
        let socket = outbound_socket(key).context("failed creating session socket")?;
        let (notify_tx, notify_rx) = flume::bounded(1);

        Ok(Self {
            key,
            socket,
            notify_tx,
            notify_rx,
            cancel,
            last_active_secs: AtomicU64::new(now_secs),
            sticky: Mutex::new(StickyRoute::default()),
        })
    }

    pub fn key(&self) -> SocketAddr {
        self.key
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Capacity-1 wakeup sender for the selector's read handler. A full
    /// channel means a wakeup is already pending and the next drain will
    /// consume everything, so dropped sends are harmless.
    pub fn notify_sender(&self) -> flume::Sender<()> {
        self.notify_tx.clone()
    }

    pub fn notify_receiver(&self) -> flume::Receiver<()> {
        self.notify_rx.clone()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn touch(&self, now_secs: u64) {
        self.last_active_secs.store(now_secs, Ordering::Relaxed);
    }

    pub fn last_active_secs(&self) -> u64 {
        self.last_active_secs.load(Ordering::Relaxed)
    }

    pub fn sticky(&self) -> &Mutex<StickyRoute> {
        &self.sticky
    }

    pub fn clear_sticky_peer(&self) {
        self.sticky.lock().peer = None;
    }
}

fn outbound_socket(client_addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let (domain, bind_addr) = if client_addr.is_ipv4() {
        (
            Domain::IPV4,
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0)),
        )
    } else {
        (
            Domain::IPV6,
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
        )
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("failed creating socket")?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;
    socket
        .bind(&bind_addr.into())
        .context("failed binding session socket")?;

    Ok(socket.into())
}

/// Session table with atomic insert-if-absent and a fixed-interval idle
/// reaper, the sole path that tears a session down.
pub struct SessionManager {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    epoch: Instant,
    recycle_interval: Duration,
    idle_timeout_secs: u64,
    parent_cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(config: &SessionSection, parent_cancel: CancellationToken) -> Self {
        Self {
            sessions: DashMap::new(),
            epoch: Instant::now(),
            recycle_interval: Duration::from_secs(config.recycle_interval_secs),
            idle_timeout_secs: config.idle_timeout_secs,
            parent_cancel,
        }
    }

    pub fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Return the existing session for `key` (refreshing last-active) or
    /// install a new one. The install is a single insert-if-absent under the
    /// shard lock, so concurrent packets for a new address yield exactly one
    /// session and one descriptor.
    pub fn get_or_create(&self, key: SocketAddr) -> Result<(Arc<Session>, bool)> {
        let now = self.now_secs();
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => {
                let session = Arc::clone(entry.get());
                session.touch(now);
                Ok((session, false))
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(
                    key,
                    self.parent_cancel.child_token(),
                    now,
                )?);
                entry.insert(Arc::clone(&session));
                Ok((session, true))
            }
        }
    }

    pub fn get(&self, key: SocketAddr) -> Option<Arc<Session>> {
        let session = self.sessions.get(&key).map(|entry| Arc::clone(entry.value()))?;
        session.touch(self.now_secs());
        Some(session)
    }

    /// Remove and tear down one session outside the reaper, used when
    /// registration of a fresh session fails.
    pub fn discard(&self, key: SocketAddr, selector: &Selector) {
        if let Some((_, session)) = self.sessions.remove(&key) {
            teardown(&session, selector);
        }
    }

    /// Sweep the table once: any session idle longer than the timeout is
    /// removed from the table first, then unregistered and cancelled. The
    /// descriptor itself closes when the download worker drops the last
    /// `Arc`, so nothing can race a closed fd.
    pub fn reap_expired(&self, selector: &Selector, now_secs: u64) -> usize {
        let expired = self
            .sessions
            .iter()
            .filter(|entry| {
                now_secs.saturating_sub(entry.value().last_active_secs()) > self.idle_timeout_secs
            })
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        let mut reaped = 0usize;
        for key in expired {
            if let Some((_, session)) = self.sessions.remove(&key) {
                debug!(session = %key, "reaping idle session");
                teardown(&session, selector);
                reaped += 1;
            }
        }
        reaped
    }

    pub async fn run_reaper(
        self: Arc<Self>,
        selector: Arc<Selector>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.recycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_expired(&selector, self.now_secs());
                }
            }
        }
    }
}

fn teardown(session: &Arc<Session>, selector: &Selector) {
    if let Err(err) = selector.unregister(session.fd()) {
        // Tolerate the concurrent-teardown race: the fd may already be gone.
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(session = %session.key(), error = %err, "session unregister failed");
        }
    }
    session.cancel();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::task_pool::TaskPool;

    fn manager(idle_timeout_secs: u64) -> Arc<SessionManager> {
        let config = SessionSection {
            recycle_interval_secs: 1,
            idle_timeout_secs,
        };
        Arc::new(SessionManager::new(&config, CancellationToken::new()))
    }

    fn selector() -> Arc<Selector> {
        let pool = Arc::new(TaskPool::new(4, Duration::from_secs(1)));
        Arc::new(Selector::new(64, pool).expect("selector"))
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_exactly_one_session() {
        let manager = manager(60);
        let key: SocketAddr = "10.1.2.3:5555".parse().expect("addr");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                let (_, created) = manager.get_or_create(key).expect("session");
                created
            }));
        }

        let mut created_count = 0usize;
        for task in tasks {
            if task.await.expect("join") {
                created_count += 1;
            }
        }
        assert_eq!(created_count, 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn sessions_share_one_descriptor_per_address() {
        let manager = manager(60);
        let key: SocketAddr = "10.1.2.4:5555".parse().expect("addr");

        let (first, created) = manager.get_or_create(key).expect("session");
        assert!(created);
        let (second, created) = manager.get_or_create(key).expect("session");
        assert!(!created);
        assert_eq!(first.fd(), second.fd());
    }

    #[tokio::test]
    async fn reaper_removes_only_expired_sessions() {
        let manager = manager(5);
        let selector = selector();
        let key: SocketAddr = "10.1.2.5:5555".parse().expect("addr");

        let (session, _) = manager.get_or_create(key).expect("session");
        let base = session.last_active_secs();

        assert_eq!(manager.reap_expired(&selector, base + 5), 0);
        assert_eq!(manager.len(), 1);

        assert_eq!(manager.reap_expired(&selector, base + 6), 1);
        assert!(manager.is_empty());
        assert!(session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn traffic_refreshes_the_idle_clock() {
        let manager = manager(5);
        let selector = selector();
        let key: SocketAddr = "10.1.2.6:5555".parse().expect("addr");

        let (session, _) = manager.get_or_create(key).expect("session");
        session.touch(100);

        assert_eq!(manager.reap_expired(&selector, 105), 0);
        session.touch(105);
        assert_eq!(manager.reap_expired(&selector, 106), 0);
        assert_eq!(manager.reap_expired(&selector, 111), 1);
    }

    #[tokio::test]
    async fn get_misses_unknown_addresses() {
        let manager = manager(60);
        assert!(manager
            .get("10.9.9.9:1".parse().expect("addr"))
            .is_none());
    }
}
