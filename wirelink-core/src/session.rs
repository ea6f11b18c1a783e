//! Active peer slot. Exactly one peer at a time; setting a new one replaces the old.

use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSession {
    target: Option<IpAddr>,
    connected: bool,
}

impl PeerSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// We sent a HANDSHAKE to `addr`. The link is confirmed once the peer's reply arrives.
    pub fn on_handshake_sent(&mut self, addr: IpAddr) {
        self.target = Some(addr);
        self.connected = false;
    }

    /// A HANDSHAKE arrived from `addr`: it becomes the active peer.
    pub fn on_handshake_received(&mut self, addr: IpAddr) {
        self.target = Some(addr);
        self.connected = true;
    }

    /// The peer we handshook with answered.
    pub fn on_link_confirmed(&mut self, addr: IpAddr) -> bool {
        if self.target == Some(addr) {
            self.connected = true;
        }
        self.connected
    }

    pub fn target(&self) -> Option<IpAddr> {
        self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn reset(&mut self) {
        self.target = None;
        self.connected = false;
    }
}
