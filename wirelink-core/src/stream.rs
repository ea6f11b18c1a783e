//! Live broadcast framing: codec config first (retried until acknowledged), then data.
//! Payloads are opaque codec bytes.

use crate::protocol::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

impl Track {
    pub fn config_type(self) -> MessageType {
        match self {
            Self::Video => MessageType::StreamVideoConfig,
            Self::Audio => MessageType::StreamAudioConfig,
        }
    }

    pub fn data_type(self) -> MessageType {
        match self {
            Self::Video => MessageType::StreamVideoData,
            Self::Audio => MessageType::StreamAudioData,
        }
    }

    pub fn ack_type(self) -> MessageType {
        match self {
            Self::Video => MessageType::StreamVideoConfigAck,
            Self::Audio => MessageType::StreamAudioConfigAck,
        }
    }
}

/// Classified stream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFrame {
    Config(Track),
    Data(Track),
    ConfigAck(Track),
}

impl StreamFrame {
    pub fn from_type(kind: MessageType) -> Option<Self> {
        Some(match kind {
            MessageType::StreamVideoConfig => Self::Config(Track::Video),
            MessageType::StreamAudioConfig => Self::Config(Track::Audio),
            MessageType::StreamVideoData => Self::Data(Track::Video),
            MessageType::StreamAudioData => Self::Data(Track::Audio),
            MessageType::StreamVideoConfigAck => Self::ConfigAck(Track::Video),
            MessageType::StreamAudioConfigAck => Self::ConfigAck(Track::Audio),
            _ => return None,
        })
    }
}

/// Sender bookkeeping for one track: the last config and whether the peer acknowledged it.
#[derive(Debug, Default)]
pub struct TrackSender {
    config: Option<Vec<u8>>,
    acked: bool,
    dropped_before_ack: u64,
}

impl TrackSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new codec config resets acknowledgement.
    pub fn set_config(&mut self, config: Vec<u8>) {
        self.config = Some(config);
        self.acked = false;
    }

    /// The config to (re)send while unacknowledged.
    pub fn pending_config(&self) -> Option<&[u8]> {
        if self.acked {
            None
        } else {
            self.config.as_deref()
        }
    }

    pub fn on_ack(&mut self) {
        if self.config.is_some() {
            self.acked = true;
        }
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// Whether a data packet may go out now. Data before the ack is dropped and counted.
    pub fn admit_data(&mut self) -> bool {
        if !self.acked {
            self.dropped_before_ack += 1;
        }
        self.acked
    }

    pub fn dropped_before_ack(&self) -> u64 {
        self.dropped_before_ack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverAction {
    /// Send the config ack, then (re)configure the decoder if `changed`.
    AckConfig { changed: bool },
    /// Hand the packet to the decoder.
    Decode,
    /// Data before any config; discard.
    Discard,
}

/// Receiver bookkeeping for one track.
#[derive(Debug, Default)]
pub struct TrackReceiver {
    config: Option<Vec<u8>>,
}

impl TrackReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_config(&mut self, config: &[u8]) -> ReceiverAction {
        let changed = self.config.as_deref() != Some(config);
        if changed {
            self.config = Some(config.to_vec());
        }
        ReceiverAction::AckConfig { changed }
    }

    pub fn on_data(&self) -> ReceiverAction {
        if self.config.is_some() {
            ReceiverAction::Decode
        } else {
            ReceiverAction::Discard
        }
    }

    pub fn config(&self) -> Option<&[u8]> {
        self.config.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_classify_into_frames() {
        for track in [Track::Video, Track::Audio] {
            assert_eq!(
                StreamFrame::from_type(track.config_type()),
                Some(StreamFrame::Config(track))
            );
            assert_eq!(
                StreamFrame::from_type(track.data_type()),
                Some(StreamFrame::Data(track))
            );
            assert_eq!(
                StreamFrame::from_type(track.ack_type()),
                Some(StreamFrame::ConfigAck(track))
            );
        }
        assert_eq!(StreamFrame::from_type(MessageType::Text), None);
    }

    #[test]
    fn sender_gates_data_on_config_ack() {
        let mut s = TrackSender::new();
        s.on_ack();
        assert!(!s.is_acked(), "ack without config is meaningless");
        s.set_config(vec![1, 2, 3]);
        assert_eq!(s.pending_config(), Some(&[1u8, 2, 3][..]));
        assert!(!s.admit_data());
        s.on_ack();
        assert_eq!(s.pending_config(), None);
        assert!(s.admit_data());
        assert_eq!(s.dropped_before_ack(), 1);
        s.set_config(vec![9]);
        assert!(!s.is_acked());
    }

    #[test]
    fn receiver_discards_data_until_config() {
        let mut r = TrackReceiver::new();
        assert_eq!(r.on_data(), ReceiverAction::Discard);
        assert_eq!(r.on_config(b"sps"), ReceiverAction::AckConfig { changed: true });
        assert_eq!(r.on_config(b"sps"), ReceiverAction::AckConfig { changed: false });
        assert_eq!(r.on_data(), ReceiverAction::Decode);
        assert_eq!(r.on_config(b"sps2"), ReceiverAction::AckConfig { changed: true });
        assert_eq!(r.config(), Some(&b"sps2"[..]));
    }
}
