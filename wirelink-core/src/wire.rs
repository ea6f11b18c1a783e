//! Framing: one datagram = 1 type byte + type-specific payload. Integers are big-endian.

use std::net::IpAddr;

use crate::protocol::{MessageType, HEADER_ACK_SEQ};

const SEQ_SIZE: usize = 4;
const HEADER_FIXED_SIZE: usize = 8 + 4 + 4;

/// One inbound or outbound unit: type tag, payload and the remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Vec<u8>,
    pub peer: IpAddr,
}

/// Prepend the type byte to `payload`.
pub fn encode_datagram(kind: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(kind.tag());
    out.extend_from_slice(payload);
    out
}

/// Split a received datagram into a message. Empty datagrams carry no type and are rejected.
pub fn decode_datagram(bytes: &[u8], peer: IpAddr) -> Result<Message, WireError> {
    let (&tag, payload) = bytes.split_first().ok_or(WireError::Empty)?;
    Ok(Message {
        kind: MessageType::from_tag(tag),
        payload: payload.to_vec(),
        peer,
    })
}

/// Decoding failure. Every variant means "drop the packet and continue".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("payload too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("file name is not valid UTF-8")]
    BadName,
    #[error("chunk sequence 0 is reserved for the header ack")]
    ReservedSeq,
    #[error("header declares {chunks} chunks for {size} bytes")]
    Inconsistent { size: u64, chunks: u32 },
}

/// FILE_HEADER payload: `total_size:u64 | total_chunks:u32 | name_len:u32 | name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub total_size: u64,
    pub total_chunks: u32,
    pub file_name: String,
}

impl FileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.file_name.as_bytes();
        let mut out = Vec::with_capacity(HEADER_FIXED_SIZE + name.len());
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&self.total_chunks.to_be_bytes());
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_FIXED_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_FIXED_SIZE,
                got: bytes.len(),
            });
        }
        let total_size = read_u64(&bytes[0..8]);
        let total_chunks = read_u32(&bytes[8..12]);
        let name_len = read_u32(&bytes[12..16]) as usize;
        let need = HEADER_FIXED_SIZE.saturating_add(name_len);
        if bytes.len() < need {
            return Err(WireError::Truncated {
                need,
                got: bytes.len(),
            });
        }
        if (total_chunks == 0) != (total_size == 0) {
            return Err(WireError::Inconsistent {
                size: total_size,
                chunks: total_chunks,
            });
        }
        let file_name = std::str::from_utf8(&bytes[HEADER_FIXED_SIZE..need])
            .map_err(|_| WireError::BadName)?
            .to_string();
        Ok(Self {
            total_size,
            total_chunks,
            file_name,
        })
    }
}

/// FILE_CHUNK payload: `seq:u32 | data`.
pub fn encode_chunk(seq: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEQ_SIZE + data.len());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Returns the sequence number and the data slice. Sequence 0 is not a chunk.
pub fn decode_chunk(bytes: &[u8]) -> Result<(u32, &[u8]), WireError> {
    if bytes.len() < SEQ_SIZE {
        return Err(WireError::Truncated {
            need: SEQ_SIZE,
            got: bytes.len(),
        });
    }
    let seq = read_u32(&bytes[..SEQ_SIZE]);
    if seq == HEADER_ACK_SEQ {
        return Err(WireError::ReservedSeq);
    }
    Ok((seq, &bytes[SEQ_SIZE..]))
}

/// FILE_ACK payload: `seq:u32`.
pub fn encode_ack(seq: u32) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

pub fn decode_ack(bytes: &[u8]) -> Result<u32, WireError> {
    if bytes.len() < SEQ_SIZE {
        return Err(WireError::Truncated {
            need: SEQ_SIZE,
            got: bytes.len(),
        });
    }
    Ok(read_u32(&bytes[..SEQ_SIZE]))
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 42, 129))
    }

    #[test]
    fn datagram_strips_type_byte() {
        let frame = encode_datagram(MessageType::Text, b"hi");
        assert_eq!(frame, vec![0x01, b'h', b'i']);
        let msg = decode_datagram(&frame, peer()).unwrap();
        assert_eq!(msg.kind, MessageType::Text);
        assert_eq!(msg.payload, b"hi");
        assert_eq!(msg.peer, peer());
    }

    #[test]
    fn empty_datagram_rejected() {
        assert_eq!(decode_datagram(&[], peer()), Err(WireError::Empty));
    }

    #[test]
    fn type_only_datagram_has_empty_payload() {
        let msg = decode_datagram(&[0x0A], peer()).unwrap();
        assert_eq!(msg.kind, MessageType::Discovery);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn header_layout_is_big_endian() {
        let h = FileHeader {
            total_size: 100_000,
            total_chunks: 4,
            file_name: "a.bin".into(),
        };
        let bytes = h.encode();
        assert_eq!(&bytes[0..8], &100_000u64.to_be_bytes());
        assert_eq!(&bytes[8..12], &[0, 0, 0, 4]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 5]);
        assert_eq!(&bytes[16..], b"a.bin");
        assert_eq!(FileHeader::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn header_name_longer_than_payload_is_dropped() {
        let mut bytes = FileHeader {
            total_size: 10,
            total_chunks: 1,
            file_name: "abc".into(),
        }
        .encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            FileHeader::decode(&bytes[..7]),
            Err(WireError::Truncated { need: 16, got: 7 })
        ));
    }

    #[test]
    fn header_with_huge_name_len_does_not_overflow() {
        let mut bytes = vec![0u8; 16];
        bytes[12..16].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(FileHeader::decode(&bytes).is_err());
    }

    #[test]
    fn header_rejects_chunks_without_bytes() {
        let bytes = FileHeader {
            total_size: 0,
            total_chunks: 3,
            file_name: "x".into(),
        }
        .encode();
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(WireError::Inconsistent { .. })
        ));
    }

    #[test]
    fn chunk_framing() {
        let bytes = encode_chunk(7, b"data");
        assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
        let (seq, data) = decode_chunk(&bytes).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(data, b"data");
    }

    #[test]
    fn short_or_reserved_chunks_are_malformed() {
        assert!(matches!(
            decode_chunk(&[0, 0, 1]),
            Err(WireError::Truncated { .. })
        ));
        assert_eq!(decode_chunk(&encode_chunk(0, b"x")), Err(WireError::ReservedSeq));
    }

    #[test]
    fn ack_zero_is_header_ack() {
        assert_eq!(decode_ack(&encode_ack(HEADER_ACK_SEQ)).unwrap(), 0);
        assert_eq!(decode_ack(&encode_ack(42)).unwrap(), 42);
        assert!(decode_ack(&[1, 2]).is_err());
    }
}
