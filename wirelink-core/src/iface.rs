//! Bind address selection: wired first, then USB tethering, never Wi-Fi.

use std::net::{IpAddr, Ipv4Addr};

/// One address found on a local interface. The host enumerates these; selection is pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub addr: IpAddr,
}

impl Candidate {
    pub fn new(name: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Wired,
    Tether,
    /// Wi-Fi, Wi-Fi Direct or cellular radio. Never selected.
    Radio,
    Other,
}

/// Classify an interface by its name.
pub fn classify(name: &str) -> LinkKind {
    let n = name.to_ascii_lowercase();
    const RADIO: [&str; 4] = ["wlan", "wifi", "p2p", "radio"];
    const TETHER: [&str; 3] = ["rndis", "usb", "rnnet"];
    if RADIO.iter().any(|m| n.contains(m)) || n.starts_with("wl") {
        return LinkKind::Radio;
    }
    if TETHER.iter().any(|m| n.contains(m)) {
        return LinkKind::Tether;
    }
    if n.starts_with("eth") || n.starts_with("en") {
        return LinkKind::Wired;
    }
    LinkKind::Other
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IfaceError {
    #[error("no usable interface (wired or USB tethering with an IPv4 address)")]
    NoUsableInterface,
}

/// Pick the local IPv4 address to bind: the first non-loopback IPv4 address on a wired
/// interface, else on a tethering interface. There is no Wi-Fi fallback.
pub fn select_bind_address(candidates: &[Candidate]) -> Result<Ipv4Addr, IfaceError> {
    let first_of = |kind: LinkKind| {
        candidates.iter().find_map(|c| match c.addr {
            IpAddr::V4(v4) if !v4.is_loopback() && classify(&c.name) == kind => Some(v4),
            _ => None,
        })
    };
    first_of(LinkKind::Wired)
        .or_else(|| first_of(LinkKind::Tether))
        .ok_or(IfaceError::NoUsableInterface)
}
