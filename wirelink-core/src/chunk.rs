//! Reliable file transfer over datagrams: chunking, sliding window, ACK bookkeeping,
//! retransmission scheduling, and receive-side reordering.
//!
//! Both sides are plain state machines. The host owns the socket, the clocks and the
//! threads; it feeds events in and sends whatever the state machines hand back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::protocol::HEADER_ACK_SEQ;
use crate::wire::FileHeader;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
/// Default number of unacknowledged chunks allowed in flight.
pub const DEFAULT_WINDOW: usize = 16;

/// Sender tuning. All durations in milliseconds so the table maps directly to config files.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_window")]
    pub window: usize,
    /// Retransmission timeout for an unacknowledged chunk.
    #[serde(default = "default_rto_ms")]
    pub rto_ms: u64,
    /// Interval between FILE_HEADER retries while waiting for ACK 0.
    #[serde(default = "default_header_retry_ms")]
    pub header_retry_ms: u64,
    /// How often the resend task scans the window.
    #[serde(default = "default_resend_scan_ms")]
    pub resend_scan_ms: u64,
    /// FILE_END is sent this many times.
    #[serde(default = "default_end_repeats")]
    pub end_repeats: u32,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_window() -> usize {
    DEFAULT_WINDOW
}
fn default_rto_ms() -> u64 {
    1000
}
fn default_header_retry_ms() -> u64 {
    500
}
fn default_resend_scan_ms() -> u64 {
    100
}
fn default_end_repeats() -> u32 {
    3
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            window: default_window(),
            rto_ms: default_rto_ms(),
            header_retry_ms: default_header_retry_ms(),
            resend_scan_ms: default_resend_scan_ms(),
            end_repeats: default_end_repeats(),
        }
    }
}

impl TransferConfig {
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }
    pub fn header_retry(&self) -> Duration {
        Duration::from_millis(self.header_retry_ms)
    }
    pub fn resend_scan(&self) -> Duration {
        Duration::from_millis(self.resend_scan_ms)
    }
}

/// Split `data` into chunks of at most `chunk_size` bytes. A zero size falls back to the default.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    data.chunks(size).map(<[u8]>::to_vec).collect()
}

/// Reduce a peer-supplied file name to a plain final component.
pub fn safe_file_name(name: &str) -> String {
    let last = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if last.is_empty() || last == "." || last == ".." {
        "received.bin".to_string()
    } else {
        last.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    HeaderAcked,
    ChunkAcked,
    /// Already acknowledged; nothing changes.
    Duplicate,
    /// Sequence outside 1..=total_chunks.
    Unknown,
}

/// Sender side of one transfer. Sequence numbers run 1..=total_chunks.
#[derive(Debug)]
pub struct OutgoingTransfer {
    file_name: String,
    total_size: u64,
    /// Index `seq - 1` holds chunk `seq`.
    chunks: Vec<Vec<u8>>,
    /// Send time of every chunk that is in flight (sent, not yet acked).
    sent_at: HashMap<u32, Instant>,
    acked: HashSet<u32>,
    header_acked: bool,
    /// Next never-sent sequence number.
    cursor: u32,
}

impl OutgoingTransfer {
    pub fn new(file_name: impl Into<String>, data: &[u8], chunk_size: usize) -> Self {
        Self::from_chunks(file_name, split_into_chunks(data, chunk_size))
    }

    pub fn from_chunks(file_name: impl Into<String>, chunks: Vec<Vec<u8>>) -> Self {
        let total_size = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            file_name: file_name.into(),
            total_size,
            chunks,
            sent_at: HashMap::new(),
            acked: HashSet::new(),
            header_acked: false,
            cursor: 1,
        }
    }

    pub fn header(&self) -> FileHeader {
        FileHeader {
            total_size: self.total_size,
            total_chunks: self.total_chunks(),
            file_name: self.file_name.clone(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk(&self, seq: u32) -> Option<&[u8]> {
        let idx = seq.checked_sub(1)? as usize;
        self.chunks.get(idx).map(Vec::as_slice)
    }

    pub fn header_acked(&self) -> bool {
        self.header_acked
    }

    /// Apply an incoming FILE_ACK. Re-delivered ACKs are no-ops.
    pub fn on_ack(&mut self, seq: u32) -> AckOutcome {
        if seq == HEADER_ACK_SEQ {
            if self.header_acked {
                return AckOutcome::Duplicate;
            }
            self.header_acked = true;
            return AckOutcome::HeaderAcked;
        }
        if seq > self.total_chunks() {
            return AckOutcome::Unknown;
        }
        if !self.acked.insert(seq) {
            return AckOutcome::Duplicate;
        }
        self.sent_at.remove(&seq);
        AckOutcome::ChunkAcked
    }

    pub fn is_acked(&self, seq: u32) -> bool {
        self.acked.contains(&seq)
    }

    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    /// Chunks sent but not acknowledged.
    pub fn outstanding(&self) -> usize {
        self.sent_at.len()
    }

    /// Whether the main send loop still has never-sent chunks.
    pub fn has_unsent(&self) -> bool {
        self.cursor <= self.total_chunks()
    }

    /// Next chunk to put on the wire if the window allows. Chunks already acked are skipped.
    /// Records the send time; returns `None` when the window is full or all chunks were sent.
    pub fn next_to_send(&mut self, now: Instant, window: usize) -> Option<(u32, Vec<u8>)> {
        if self.outstanding() >= window.max(1) {
            return None;
        }
        while self.cursor <= self.total_chunks() {
            let seq = self.cursor;
            self.cursor += 1;
            if self.acked.contains(&seq) {
                continue;
            }
            self.sent_at.insert(seq, now);
            let data = self.chunk(seq)?.to_vec();
            return Some((seq, data));
        }
        None
    }

    /// Unacked chunks whose last send is older than `rto`. Their timestamps are refreshed,
    /// so the caller must retransmit every returned chunk.
    pub fn due_for_resend(&mut self, now: Instant, rto: Duration) -> Vec<(u32, Vec<u8>)> {
        let mut due: Vec<u32> = self
            .sent_at
            .iter()
            .filter(|(_, &t)| now.saturating_duration_since(t) >= rto)
            .map(|(&seq, _)| seq)
            .collect();
        due.sort_unstable();
        let mut out = Vec::with_capacity(due.len());
        for seq in due {
            self.sent_at.insert(seq, now);
            if let Some(data) = self.chunk(seq) {
                out.push((seq, data.to_vec()));
            }
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.header_acked && self.acked.len() == self.chunks.len()
    }
}

/// Receive-side failure. The partial output must be discarded.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer incomplete: {buffered} chunk(s) still waiting for sequence {next_expected}")]
    Incomplete { next_expected: u32, buffered: usize },
    #[error("size mismatch: header declared {declared} bytes, received {written}")]
    SizeMismatch { declared: u64, written: u64 },
    #[error("output write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk written plus `drained` buffered successors.
    Appended { drained: usize },
    /// Ahead of the next expected sequence; parked in the reorder buffer.
    Buffered,
    /// Already written or already buffered.
    Duplicate,
    /// Sequence beyond the declared chunk count.
    OutOfRange,
}

/// Receiver side of one transfer, writing in-order data to an append-only sink.
#[derive(Debug)]
pub struct IncomingTransfer<S> {
    header: FileHeader,
    next_expected: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    written: u64,
    sink: S,
}

impl<S: Write> IncomingTransfer<S> {
    pub fn new(header: FileHeader, sink: S) -> Self {
        Self {
            header,
            next_expected: 1,
            reorder: BTreeMap::new(),
            written: 0,
            sink,
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn on_chunk(&mut self, seq: u32, data: &[u8]) -> Result<ChunkOutcome, TransferError> {
        if seq > self.header.total_chunks {
            return Ok(ChunkOutcome::OutOfRange);
        }
        if seq < self.next_expected || self.reorder.contains_key(&seq) {
            return Ok(ChunkOutcome::Duplicate);
        }
        if seq > self.next_expected {
            self.reorder.insert(seq, data.to_vec());
            return Ok(ChunkOutcome::Buffered);
        }
        self.append(data)?;
        let mut drained = 0;
        while let Some(next) = self.reorder.remove(&self.next_expected) {
            self.append(&next)?;
            drained += 1;
        }
        Ok(ChunkOutcome::Appended { drained })
    }

    fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.sink.write_all(data)?;
        self.written += data.len() as u64;
        self.next_expected += 1;
        Ok(())
    }

    /// Close the transfer on FILE_END. The sink is handed back either way so the host can
    /// keep or discard it.
    pub fn finish(mut self) -> Finished<S> {
        let result = if !self.reorder.is_empty() {
            Err(TransferError::Incomplete {
                next_expected: self.next_expected,
                buffered: self.reorder.len(),
            })
        } else if self.written != self.header.total_size {
            Err(TransferError::SizeMismatch {
                declared: self.header.total_size,
                written: self.written,
            })
        } else {
            self.sink.flush().map(|_| self.written).map_err(Into::into)
        };
        Finished {
            header: self.header,
            sink: self.sink,
            result,
        }
    }
}

#[derive(Debug)]
pub struct Finished<S> {
    pub header: FileHeader,
    pub sink: S,
    pub result: Result<u64, TransferError>,
}

/// Receiver for one peer: at most one transfer at a time.
#[derive(Debug)]
pub struct FileReceiver<S> {
    active: Option<IncomingTransfer<S>>,
}

impl<S> Default for FileReceiver<S> {
    fn default() -> Self {
        Self { active: None }
    }
}

/// What the host must do after a FILE_CHUNK: always send `ack`, then act on `outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReply {
    pub ack: u32,
    /// `None` when no transfer is in progress.
    pub outcome: Option<ChunkOutcome>,
}

impl<S: Write> FileReceiver<S> {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&IncomingTransfer<S>> {
        self.active.as_ref()
    }

    /// Start a transfer. Returns the abandoned one, if any; the host acks with sequence 0.
    pub fn on_header(&mut self, header: FileHeader, sink: S) -> Option<IncomingTransfer<S>> {
        self.active.replace(IncomingTransfer::new(header, sink))
    }

    /// Every chunk is acked, duplicates included, so a lost ACK never stalls the sender.
    pub fn on_chunk(&mut self, seq: u32, data: &[u8]) -> Result<ChunkReply, TransferError> {
        let outcome = match self.active.as_mut() {
            Some(t) => Some(t.on_chunk(seq, data)?),
            None => None,
        };
        Ok(ChunkReply { ack: seq, outcome })
    }

    /// `None` when END arrives with nothing in progress.
    pub fn on_end(&mut self) -> Option<Finished<S>> {
        self.active.take().map(IncomingTransfer::finish)
    }

    /// Drop the in-progress transfer (write failure or shutdown).
    pub fn abort(&mut self) -> Option<IncomingTransfer<S>> {
        self.active.take()
    }
}

impl<S> IncomingTransfer<S> {
    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_chunk, encode_chunk};
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn hundred_thousand_bytes_make_four_chunks() {
        let chunks = split_into_chunks(&sample(100_000), 32_768);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![32_768, 32_768, 32_768, 1_696]);
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(&sample(DEFAULT_CHUNK_SIZE * 2), 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn peer_file_names_are_flattened() {
        assert_eq!(safe_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("C:\\tmp\\a.txt"), "a.txt");
        assert_eq!(safe_file_name(".."), "received.bin");
        assert_eq!(safe_file_name("dir/"), "received.bin");
        assert_eq!(safe_file_name(""), "received.bin");
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let t = OutgoingTransfer::new("empty", &[], 1024);
        assert_eq!(t.total_chunks(), 0);
        assert_eq!(t.header().total_size, 0);
    }

    #[test]
    fn window_limits_outstanding_chunks() {
        let now = Instant::now();
        let mut t = OutgoingTransfer::new("f", &sample(10_000), 100);
        let mut sent = Vec::new();
        while let Some((seq, _)) = t.next_to_send(now, 16) {
            sent.push(seq);
        }
        assert_eq!(sent, (1..=16).collect::<Vec<u32>>());
        assert_eq!(t.outstanding(), 16);
        assert_eq!(t.on_ack(3), AckOutcome::ChunkAcked);
        assert_eq!(t.next_to_send(now, 16).map(|(s, _)| s), Some(17));
        assert!(t.next_to_send(now, 16).is_none());
    }

    #[test]
    fn acked_chunks_are_never_sent_from_cursor() {
        let now = Instant::now();
        let mut t = OutgoingTransfer::new("f", &sample(500), 100);
        assert_eq!(t.on_ack(2), AckOutcome::ChunkAcked);
        let seqs: Vec<u32> = std::iter::from_fn(|| t.next_to_send(now, 16).map(|(s, _)| s)).collect();
        assert_eq!(seqs, vec![1, 3, 4, 5]);
    }

    #[test]
    fn ack_handling_is_idempotent() {
        let mut t = OutgoingTransfer::new("f", &sample(300), 100);
        assert_eq!(t.on_ack(0), AckOutcome::HeaderAcked);
        assert_eq!(t.on_ack(0), AckOutcome::Duplicate);
        assert_eq!(t.on_ack(1), AckOutcome::ChunkAcked);
        assert_eq!(t.on_ack(1), AckOutcome::Duplicate);
        assert_eq!(t.on_ack(9), AckOutcome::Unknown);
        assert_eq!(t.acked_count(), 1);
    }

    #[test]
    fn resend_only_after_rto_and_refreshes_timestamp() {
        let t0 = Instant::now();
        let rto = Duration::from_secs(1);
        let mut t = OutgoingTransfer::new("f", &sample(300), 100);
        t.next_to_send(t0, 16);
        t.next_to_send(t0, 16);
        t.on_ack(1);
        assert!(t.due_for_resend(t0 + Duration::from_millis(500), rto).is_empty());
        let due = t.due_for_resend(t0 + rto, rto);
        assert_eq!(due.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![2]);
        assert!(t.due_for_resend(t0 + rto, rto).is_empty());
        assert_eq!(t.due_for_resend(t0 + rto * 2, rto).len(), 1);
    }

    #[test]
    fn complete_requires_header_ack_and_all_chunks() {
        let mut t = OutgoingTransfer::new("f", &sample(200), 100);
        t.on_ack(1);
        t.on_ack(2);
        assert!(!t.is_complete());
        t.on_ack(0);
        assert!(t.is_complete());
    }

    fn header_for(data: &[u8], chunks: &[Vec<u8>]) -> FileHeader {
        FileHeader {
            total_size: data.len() as u64,
            total_chunks: chunks.len() as u32,
            file_name: "f".into(),
        }
    }

    #[test]
    fn in_order_chunks_append_directly() {
        let data = sample(250);
        let chunks = split_into_chunks(&data, 100);
        let mut rx = IncomingTransfer::new(header_for(&data, &chunks), Vec::new());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(
                rx.on_chunk(i as u32 + 1, c).unwrap(),
                ChunkOutcome::Appended { drained: 0 }
            );
        }
        let done = rx.finish();
        assert_eq!(done.result.unwrap(), 250);
        assert_eq!(done.sink, data);
    }

    #[test]
    fn early_chunk_is_buffered_then_drained() {
        let data = sample(300);
        let chunks = split_into_chunks(&data, 100);
        let mut rx = IncomingTransfer::new(header_for(&data, &chunks), Vec::new());
        assert_eq!(rx.on_chunk(3, &chunks[2]).unwrap(), ChunkOutcome::Buffered);
        assert_eq!(rx.on_chunk(2, &chunks[1]).unwrap(), ChunkOutcome::Buffered);
        assert_eq!(rx.on_chunk(3, &chunks[2]).unwrap(), ChunkOutcome::Duplicate);
        assert_eq!(
            rx.on_chunk(1, &chunks[0]).unwrap(),
            ChunkOutcome::Appended { drained: 2 }
        );
        assert_eq!(rx.next_expected(), 4);
        assert_eq!(rx.on_chunk(1, &chunks[0]).unwrap(), ChunkOutcome::Duplicate);
        assert_eq!(rx.finish().sink, data);
    }

    #[test]
    fn out_of_range_chunk_is_ignored() {
        let data = sample(100);
        let chunks = split_into_chunks(&data, 100);
        let mut rx = IncomingTransfer::new(header_for(&data, &chunks), Vec::new());
        assert_eq!(rx.on_chunk(2, b"zz").unwrap(), ChunkOutcome::OutOfRange);
        assert_eq!(rx.buffered(), 0);
    }

    #[test]
    fn end_with_gap_is_incomplete() {
        let data = sample(300);
        let chunks = split_into_chunks(&data, 100);
        let mut rx = IncomingTransfer::new(header_for(&data, &chunks), Vec::new());
        rx.on_chunk(1, &chunks[0]).unwrap();
        rx.on_chunk(3, &chunks[2]).unwrap();
        let done = rx.finish();
        assert!(matches!(
            done.result,
            Err(TransferError::Incomplete {
                next_expected: 2,
                buffered: 1
            })
        ));
    }

    #[test]
    fn end_with_short_output_is_size_mismatch() {
        let data = sample(300);
        let chunks = split_into_chunks(&data, 100);
        let mut rx = IncomingTransfer::new(header_for(&data, &chunks), Vec::new());
        rx.on_chunk(1, &chunks[0]).unwrap();
        let done = rx.finish();
        assert!(matches!(
            done.result,
            Err(TransferError::SizeMismatch {
                declared: 300,
                written: 100
            })
        ));
    }

    #[test]
    fn receiver_acks_even_without_transfer() {
        let mut rx: FileReceiver<Vec<u8>> = FileReceiver::new();
        let reply = rx.on_chunk(5, b"x").unwrap();
        assert_eq!(reply, ChunkReply { ack: 5, outcome: None });
        assert!(rx.on_end().is_none());
    }

    #[test]
    fn duplicate_header_abandons_previous_transfer() {
        let data = sample(200);
        let chunks = split_into_chunks(&data, 100);
        let mut rx: FileReceiver<Vec<u8>> = FileReceiver::new();
        assert!(rx.on_header(header_for(&data, &chunks), Vec::new()).is_none());
        rx.on_chunk(1, &chunks[0]).unwrap();
        let old = rx.on_header(header_for(&data, &chunks), Vec::new());
        assert_eq!(old.map(|t| t.written()), Some(100));
        assert_eq!(rx.active().map(|t| t.next_expected()), Some(1));
    }

    #[test]
    fn empty_file_completes_immediately() {
        let mut rx: FileReceiver<Vec<u8>> = FileReceiver::new();
        rx.on_header(header_for(&[], &[]), Vec::new());
        let done = rx.on_end().unwrap();
        assert_eq!(done.result.unwrap(), 0);
    }

    /// Drive a sender and a receiver through a lossy, reordering, duplicating link.
    fn simulate(data: &[u8], chunk_size: usize, seed: u64, drop_ack_every: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let rto = Duration::from_millis(1000);
        let mut now = Instant::now();
        let mut tx = OutgoingTransfer::new("f", data, chunk_size);
        let mut rx: FileReceiver<Vec<u8>> = FileReceiver::new();
        rx.on_header(tx.header(), Vec::new());
        assert_eq!(tx.on_ack(0), AckOutcome::HeaderAcked);

        let mut acks_seen = 0usize;
        let mut rounds = 0;
        while !tx.is_complete() {
            rounds += 1;
            assert!(rounds < 10_000, "transfer did not converge");
            let mut in_flight = Vec::new();
            while let Some((seq, chunk)) = tx.next_to_send(now, 4) {
                in_flight.push(encode_chunk(seq, &chunk));
            }
            for (seq, chunk) in tx.due_for_resend(now, rto) {
                in_flight.push(encode_chunk(seq, &chunk));
            }
            if rng.gen_bool(0.3) {
                if let Some(dup) = in_flight.first().cloned() {
                    in_flight.push(dup);
                }
            }
            in_flight.shuffle(&mut rng);
            for packet in in_flight {
                let (seq, payload) = decode_chunk(&packet).unwrap();
                let reply = rx.on_chunk(seq, payload).unwrap();
                acks_seen += 1;
                if drop_ack_every > 0 && acks_seen % drop_ack_every == 0 {
                    continue;
                }
                tx.on_ack(reply.ack);
            }
            now += Duration::from_millis(250);
        }
        let done = rx.on_end().unwrap();
        assert_eq!(done.result.unwrap(), data.len() as u64);
        done.sink
    }

    #[test]
    fn any_arrival_order_reconstructs_the_source() {
        let data = sample(100_000);
        for seed in 0..8 {
            assert_eq!(simulate(&data, 4096, seed, 0), data);
        }
    }

    #[test]
    fn dropped_acks_are_recovered_by_retransmission() {
        let data = sample(40_000);
        for seed in 0..4 {
            assert_eq!(simulate(&data, 1000, seed, 3), data);
        }
    }

    #[test]
    fn dropped_ack_triggers_resend_within_one_rto() {
        let t0 = Instant::now();
        let rto = Duration::from_millis(1000);
        let data = sample(200);
        let mut tx = OutgoingTransfer::new("f", &data, 100);
        let mut rx: FileReceiver<Vec<u8>> = FileReceiver::new();
        rx.on_header(tx.header(), Vec::new());
        tx.on_ack(0);
        let (s1, c1) = tx.next_to_send(t0, 16).unwrap();
        let (s2, c2) = tx.next_to_send(t0, 16).unwrap();
        rx.on_chunk(s1, &c1).unwrap();
        // ACK for s1 is lost.
        let r2 = rx.on_chunk(s2, &c2).unwrap();
        tx.on_ack(r2.ack);
        let resent = tx.due_for_resend(t0 + rto, rto);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].0, s1);
        let reply = rx.on_chunk(resent[0].0, &resent[0].1).unwrap();
        assert_eq!(reply.outcome, Some(ChunkOutcome::Duplicate));
        tx.on_ack(reply.ack);
        assert!(tx.is_complete());
        assert_eq!(rx.on_end().unwrap().sink, data);
    }
}
