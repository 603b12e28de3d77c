use std::io;
use std::net::SocketAddr;

use dr_netio::SocketFd;
use parking_lot::RwLock;

/// Liveness of one backend endpoint. `Temporary` marks a promoted backup
/// serving while every regular peer is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Temporary,
    Dead,
}

/// One backend endpoint within an upstream. Created once at upstream
/// construction and never destroyed at runtime; only the liveness state
/// mutates, written by the health checker and read on every send.
#[derive(Debug)]
pub struct Peer {
    id: usize,
    addr: SocketAddr,
    weight: u32,
    state: RwLock<PeerState>,
}

impl Peer {
    pub fn new(id: usize, addr: SocketAddr, weight: u32) -> Self {
        Self {
            id,
            addr,
            weight: weight.max(1),
            state: RwLock::new(PeerState::Alive),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write() = state;
    }

    pub fn is_alive(&self) -> bool {
        self.state() == PeerState::Alive
    }

    /// A peer is selectable for an existing flow unless it is known dead.
    pub fn is_available(&self) -> bool {
        self.state() != PeerState::Dead
    }

    /// Send one datagram to this peer over the session's descriptor.
    /// Backpressure errors pass through unmodified and are not liveness
    /// signals.
    pub fn send(&self, fd: SocketFd, payload: &[u8]) -> io::Result<usize> {
        dr_netio::send_to(fd, payload, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_visible() {
        let peer = Peer::new(0, "127.0.0.1:9000".parse().expect("addr"), 2);
        assert!(peer.is_alive());
        assert!(peer.is_available());

        peer.set_state(PeerState::Dead);
        assert!(!peer.is_alive());
        assert!(!peer.is_available());

        peer.set_state(PeerState::Temporary);
        assert!(!peer.is_alive());
        assert!(peer.is_available());
    }

    #[test]
    fn weight_is_at_least_one() {
        let peer = Peer::new(0, "127.0.0.1:9000".parse().expect("addr"), 0);
        assert_eq!(peer.weight(), 1);
    }
}
