//! Wirelink wire protocol: message type tags and well-known constants.

/// Fixed UDP port shared by every message type.
pub const DEFAULT_PORT: u16 = 12345;

/// Largest UDP payload over IPv4; receive buffers are sized to this.
pub const MAX_DATAGRAM: usize = 65_507;

/// Sequence number reserved for the FILE_HEADER acknowledgement. Real chunks start at 1.
pub const HEADER_ACK_SEQ: u32 = 0;

/// First byte of every datagram. Unknown bytes are kept as `Unclassified` so the
/// multiplexer can still route them to its default channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    FileHeader,
    FileChunk,
    FileEnd,
    FileAck,
    Discovery,
    Handshake,
    CallRequest,
    CallAccept,
    CallReject,
    CallEnd,
    CallAudio,
    StreamVideoConfig,
    StreamVideoData,
    StreamAudioConfig,
    StreamAudioData,
    StreamVideoConfigAck,
    StreamAudioConfigAck,
    Unclassified(u8),
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0x01 => Self::Text,
            0x02 => Self::FileHeader,
            0x03 => Self::FileChunk,
            0x04 => Self::FileEnd,
            0x05 => Self::FileAck,
            0x0A => Self::Discovery,
            0x0B => Self::Handshake,
            0x10 => Self::CallRequest,
            0x11 => Self::CallAccept,
            0x12 => Self::CallReject,
            0x13 => Self::CallEnd,
            0x14 => Self::CallAudio,
            0x20 => Self::StreamVideoConfig,
            0x21 => Self::StreamVideoData,
            0x22 => Self::StreamAudioConfig,
            0x23 => Self::StreamAudioData,
            0x28 => Self::StreamVideoConfigAck,
            0x29 => Self::StreamAudioConfigAck,
            other => Self::Unclassified(other),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Text => 0x01,
            Self::FileHeader => 0x02,
            Self::FileChunk => 0x03,
            Self::FileEnd => 0x04,
            Self::FileAck => 0x05,
            Self::Discovery => 0x0A,
            Self::Handshake => 0x0B,
            Self::CallRequest => 0x10,
            Self::CallAccept => 0x11,
            Self::CallReject => 0x12,
            Self::CallEnd => 0x13,
            Self::CallAudio => 0x14,
            Self::StreamVideoConfig => 0x20,
            Self::StreamVideoData => 0x21,
            Self::StreamAudioConfig => 0x22,
            Self::StreamAudioData => 0x23,
            Self::StreamVideoConfigAck => 0x28,
            Self::StreamAudioConfigAck => 0x29,
            Self::Unclassified(tag) => tag,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unclassified(tag) => write!(f, "UNCLASSIFIED(0x{:02X})", tag),
            other => write!(f, "{:?}(0x{:02X})", other, other.tag()),
        }
    }
}
