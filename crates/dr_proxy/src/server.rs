use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dr_netio::{recv_batch, MsgBufPool, RecvBatchState};
use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::manager::UpstreamManager;
use crate::peer::{Peer, PeerState};
use crate::selector::{FdHandlers, Handler, Interest, Selector};
use crate::session::{Session, SessionManager};
use crate::task_pool::TaskPool;

/// Shared handles every worker needs.
struct ServerState {
    selector: Arc<Selector>,
    upstream_mgr: Arc<UpstreamManager>,
    session_mgr: Arc<SessionManager>,
    buf_pool: Arc<MsgBufPool>,
    max_send_retries: usize,
}

/// Wire the whole data plane and serve until `shutdown` fires or a poller
/// hits an unrecoverable selector error.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<()> {
    let task_pool = Arc::new(TaskPool::new(
        config.server.task_pool_size,
        Duration::from_secs(config.server.task_pool_idle_timeout_secs),
    ));
    let selector = Arc::new(
        Selector::new(config.server.event_size, task_pool)
            .context("failed creating selector")?,
    );

    let upstream_mgr =
        Arc::new(UpstreamManager::new(&config.upload).context("failed building upstreams")?);
    upstream_mgr.spawn_tasks(&shutdown);

    let session_mgr = Arc::new(SessionManager::new(&config.session, shutdown.clone()));
    tokio::spawn(
        Arc::clone(&session_mgr).run_reaper(Arc::clone(&selector), shutdown.child_token()),
    );

    let buf_pool = Arc::new(MsgBufPool::new(
        config.server.batch_size,
        config.server.buf_size,
    ));

    let state = Arc::new(ServerState {
        selector: Arc::clone(&selector),
        upstream_mgr,
        session_mgr,
        buf_pool,
        max_send_retries: config.server.max_send_retries,
    });

    let (fatal_tx, fatal_rx) = flume::bounded::<io::Error>(1);
    let mut pollers = Vec::with_capacity(config.server.listen_parallel);
    let mut listeners = Vec::with_capacity(config.server.listen_parallel);

    for worker_id in 0..config.server.listen_parallel {
        let listener = Arc::new(
            bind_listener_socket(config.server.listen_addr).with_context(|| {
                format!(
                    "failed binding listener {worker_id} on {}",
                    config.server.listen_addr
                )
            })?,
        );

        let (wakeup_tx, wakeup_rx) = flume::bounded::<()>(1);
        let handler: Handler = Arc::new(move || {
            let _ = wakeup_tx.try_send(());
        });
        selector
            .register(
                listener.as_raw_fd(),
                Interest::Read,
                FdHandlers::read_only(handler),
            )
            .context("failed registering listener with selector")?;

        tokio::spawn(run_upload_worker(
            worker_id,
            Arc::clone(&listener),
            wakeup_rx,
            Arc::clone(&state),
            shutdown.child_token(),
        ));

        let poller_selector = Arc::clone(&selector);
        let poller_cancel = shutdown.clone();
        let poller_fatal = fatal_tx.clone();
        pollers.push(
            std::thread::Builder::new()
                .name(format!("dr-poller-{worker_id}"))
                .spawn(move || {
                    if let Err(err) = poller_selector.poll(&poller_cancel) {
                        let _ = poller_fatal.try_send(err);
                    }
                })
                .context("failed spawning poller thread")?,
        );

        listeners.push(listener);
    }

    info!(
        listen_addr = %config.server.listen_addr,
        parallel = config.server.listen_parallel,
        batch_size = config.server.batch_size,
        "dr_proxy serving"
    );

    let fatal = tokio::select! {
        _ = shutdown.cancelled() => None,
        err = fatal_rx.recv_async() => err.ok(),
    };

    shutdown.cancel();
    selector.wake();
    for poller in pollers {
        let _ = poller.join();
    }

    match fatal {
        Some(err) => Err(err).context("selector poller failed"),
        None => Ok(()),
    }
}

fn bind_listener_socket(listen_addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let domain = if listen_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("failed creating UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed setting SO_REUSEADDR")?;

    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .context("failed setting SO_REUSEPORT")?;

    socket
        .bind(&listen_addr.into())
        .with_context(|| format!("failed binding UDP socket to {listen_addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;

    Ok(socket.into())
}

/// Client-to-upstream path: woken by the selector when the listener turns
/// readable, then drains it in batches until backpressure.
async fn run_upload_worker(
    worker_id: usize,
    listener: Arc<std::net::UdpSocket>,
    wakeup_rx: flume::Receiver<()>,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    let mut bufs = state.buf_pool.get();
    let mut recv_state = RecvBatchState::new(bufs.len());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            wakeup = wakeup_rx.recv_async() => {
                if wakeup.is_err() {
                    break;
                }

                loop {
                    match recv_batch(listener.as_raw_fd(), &mut bufs, &mut recv_state) {
                        Ok(0) => break,
                        Ok(received) => {
                            for msg in bufs.iter().take(received) {
                                process_upload_packet(
                                    &state,
                                    &listener,
                                    msg.payload(),
                                    msg.addr(),
                                );
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            error!(worker_id, error = %err, "listener batch receive failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    state.buf_pool.put(bufs);
}

fn process_upload_packet(
    state: &Arc<ServerState>,
    listener: &Arc<std::net::UdpSocket>,
    payload: &[u8],
    client_addr: SocketAddr,
) {
    let (session, created) = match state.session_mgr.get_or_create(client_addr) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(client = %client_addr, error = %err, "session create failed, dropping packet");
            return;
        }
    };

    if created {
        let notify = session.notify_sender();
        let handler: Handler = Arc::new(move || {
            let _ = notify.try_send(());
        });
        if let Err(err) =
            state
                .selector
                .register(session.fd(), Interest::Read, FdHandlers::read_only(handler))
        {
            error!(client = %client_addr, error = %err, "session register failed, dropping packet");
            state.session_mgr.discard(client_addr, &state.selector);
            return;
        }

        tokio::spawn(run_download_worker(
            Arc::clone(&session),
            Arc::clone(listener),
            Arc::clone(&state.buf_pool),
        ));
    }

    let Some(peer) = resolve_peer(state, &session, payload) else {
        debug!(client = %client_addr, "no upstream peer for packet, dropping");
        return;
    };

    send_with_retry(state, &session, peer, payload);
}

/// Sticky resolution: reuse the cached peer while it is not dead; otherwise
/// route (once per flow) and select a fresh peer from the upstream.
fn resolve_peer(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    payload: &[u8],
) -> Option<Arc<Peer>> {
    let mut sticky = session.sticky().lock();

    if let Some(peer) = &sticky.peer {
        if peer.is_available() {
            return Some(Arc::clone(peer));
        }
        sticky.peer = None;
    }

    let upstream = match &sticky.upstream {
        Some(upstream) => Arc::clone(upstream),
        None => {
            let upstream = state.upstream_mgr.route_upstream(payload)?;
            sticky.upstream = Some(Arc::clone(&upstream));
            upstream
        }
    };

    let peer = upstream.select_peer(payload)?;
    sticky.peer = Some(Arc::clone(&peer));
    Some(peer)
}

/// Bounded retry: backpressure drops the packet without touching liveness;
/// a hard send error marks the peer dead, un-sticks it, and retries with a
/// fresh selection so failover and health state update together.
fn send_with_retry(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    mut peer: Arc<Peer>,
    payload: &[u8],
) {
    for _attempt in 0..state.max_send_retries {
        match peer.send(session.fd(), payload) {
            Ok(_) => return,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(peer = %peer.addr(), "send backpressure, dropping packet");
                return;
            }
            Err(err) => {
                warn!(peer = %peer.addr(), error = %err, "hard send error, marking peer dead");
                peer.set_state(PeerState::Dead);
                session.clear_sticky_peer();

                match resolve_peer(state, session, payload) {
                    Some(next) => peer = next,
                    None => {
                        error!(client = %session.key(), "no peer left after send failure, dropping packet");
                        return;
                    }
                }
            }
        }
    }

    error!(
        client = %session.key(),
        retries = state.max_send_retries,
        "send retries exhausted, dropping packet"
    );
}

/// Upstream-to-client path: one long-lived worker per session, woken by the
/// selector, draining reply batches and forwarding each datagram verbatim
/// to the client over the listener descriptor. Backpressure ends the drain;
/// the loop exits when the session is reaped.
async fn run_download_worker(
    session: Arc<Session>,
    listener: Arc<std::net::UdpSocket>,
    buf_pool: Arc<MsgBufPool>,
) {
    let mut bufs = buf_pool.get();
    let mut recv_state = RecvBatchState::new(bufs.len());
    let notify = session.notify_receiver();

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            wakeup = notify.recv_async() => {
                if wakeup.is_err() {
                    break;
                }

                'drain: loop {
                    match recv_batch(session.fd(), &mut bufs, &mut recv_state) {
                        Ok(0) => break 'drain,
                        Ok(received) => {
                            for msg in bufs.iter().take(received) {
                                match dr_netio::send_to(
                                    listener.as_raw_fd(),
                                    msg.payload(),
                                    session.key(),
                                ) {
                                    Ok(_) => {}
                                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                                        debug!(
                                            session = %session.key(),
                                            "client send backpressure, ending drain"
                                        );
                                        break 'drain;
                                    }
                                    Err(err) => {
                                        error!(
                                            session = %session.key(),
                                            error = %err,
                                            "forward to client failed"
                                        );
                                    }
                                }
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break 'drain,
                        Err(err) => {
                            error!(session = %session.key(), error = %err, "session batch receive failed");
                            break 'drain;
                        }
                    }
                }
            }
        }
    }

    buf_pool.put(bufs);
}
