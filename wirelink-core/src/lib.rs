//! Wirelink protocol reference implementation.
//! Host-driven: no sockets or threads here; the host feeds events and performs the
//! returned actions.

pub mod audio;
pub mod call;
pub mod chunk;
pub mod iface;
pub mod integrity;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod wire;

pub use audio::{AudioBackend, AudioConfig, AudioDevices, Gain, JitterBuffer};
pub use call::{CallAction, CallError, CallEvent, CallSession, CallState, Role};
pub use chunk::{FileReceiver, OutgoingTransfer, TransferConfig, TransferError};
pub use iface::{select_bind_address, Candidate, IfaceError};
pub use protocol::{MessageType, DEFAULT_PORT, HEADER_ACK_SEQ, MAX_DATAGRAM};
pub use session::PeerSession;
pub use wire::{decode_datagram, encode_datagram, FileHeader, Message, WireError};
