//! Events surfaced to the console (the owning application).

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use tokio::sync::mpsc;
use wirelink_core::integrity::to_hex;
use wirelink_core::CallState;

pub type EventSender = mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AppEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    PeerDiscovered(IpAddr),
    PeerConnected(IpAddr),
    MessageReceived {
        from: IpAddr,
        text: String,
    },
    FileReceived {
        from: IpAddr,
        path: PathBuf,
        size: u64,
        sha256: [u8; 32],
    },
    FileFailed {
        name: String,
        reason: String,
    },
    FileSent {
        name: String,
        size: u64,
    },
    CallStateChanged {
        state: CallState,
        reason: Option<String>,
    },
    StreamStarted {
        from: IpAddr,
        track: &'static str,
    },
    TransportUnavailable(String),
}

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

impl fmt::Display for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerDiscovered(ip) => write!(f, "discovered peer {}", ip),
            Self::PeerConnected(ip) => write!(f, "connected to {}", ip),
            Self::MessageReceived { from, text } => write!(f, "[{}] {}", from, text),
            Self::FileReceived {
                from,
                path,
                size,
                sha256,
            } => write!(
                f,
                "received {} ({} bytes, sha256 {}) from {}",
                path.display(),
                size,
                to_hex(sha256),
                from
            ),
            Self::FileFailed { name, reason } => write!(f, "transfer of {} failed: {}", name, reason),
            Self::FileSent { name, size } => write!(f, "sent {} ({} bytes)", name, size),
            Self::CallStateChanged { state, reason } => match reason {
                Some(r) => write!(f, "call {:?} ({})", state, r),
                None => write!(f, "call {:?}", state),
            },
            Self::StreamStarted { from, track } => write!(f, "{} stream from {}", track, from),
            Self::TransportUnavailable(reason) => write!(f, "transport unavailable: {}", reason),
        }
    }
}
