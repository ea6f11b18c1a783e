//! File transfer over the multiplexer: windowed sender with a resend task, and a
//! single-transfer receiver writing `<name>.part` files into the download directory.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tokio::task::JoinHandle;
use wirelink_core::chunk::{safe_file_name, ChunkOutcome, Finished};
use wirelink_core::integrity::{hash_reader, to_hex};
use wirelink_core::wire::{decode_ack, decode_chunk, encode_ack, encode_chunk};
use wirelink_core::{
    FileHeader, FileReceiver, Message, MessageType, OutgoingTransfer, TransferConfig,
    HEADER_ACK_SEQ,
};

use crate::events::{AppEvent, EventSender};
use crate::transport::{Inbox, Transport};

/// Pause when the window is full before checking again.
const WINDOW_POLL: Duration = Duration::from_millis(5);
const END_SPACING: Duration = Duration::from_millis(20);

pub async fn sender_inbox(transport: &Transport) -> Inbox {
    transport.subscribe(&[MessageType::FileAck]).await
}

pub async fn receiver_inbox(transport: &Transport) -> Inbox {
    transport
        .subscribe(&[
            MessageType::FileHeader,
            MessageType::FileChunk,
            MessageType::FileEnd,
        ])
        .await
}

struct ActiveSend {
    id: u64,
    transfer: OutgoingTransfer,
}

/// Outgoing side. One transfer at a time; ACKs arrive on a separate task and are
/// applied under the same lock the send and resend loops use.
pub struct FileSender {
    transport: Arc<Transport>,
    config: TransferConfig,
    events: EventSender,
    active: Mutex<Option<ActiveSend>>,
    next_id: AtomicU64,
}

enum Step {
    Send(u32, Vec<u8>),
    Wait,
    Done,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl FileSender {
    pub fn new(transport: Arc<Transport>, config: TransferConfig, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            events,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Drop the in-progress transfer. Its loops notice on their next step.
    pub fn cancel(&self) -> bool {
        match self.active.lock() {
            Ok(mut slot) => slot.take().is_some(),
            Err(_) => false,
        }
    }

    /// Apply FILE_ACKs until the transport closes.
    pub async fn run_acks(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(msg) = inbox.recv().await {
            let seq = match decode_ack(&msg.payload) {
                Ok(seq) => seq,
                Err(e) => {
                    tracing::debug!(from = %msg.peer, error = %e, "dropping malformed ack");
                    continue;
                }
            };
            let outcome = match self.active.lock() {
                Ok(mut slot) => slot.as_mut().map(|a| a.transfer.on_ack(seq)),
                Err(_) => None,
            };
            match outcome {
                Some(o) => tracing::trace!(seq, ?o, "ack"),
                None => tracing::debug!(seq, "ack with no transfer in progress"),
            }
        }
    }

    /// Send `path` to `peer` and wait until every chunk is acknowledged.
    pub async fn send_file(self: &Arc<Self>, peer: IpAddr, path: &Path) -> anyhow::Result<u64> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".to_string());
        let transfer = OutgoingTransfer::new(name.clone(), &data, self.config.chunk_size);
        drop(data);
        let id = self.install(transfer)?;
        let result = self.drive(id, peer).await;
        self.release(id);
        match &result {
            Ok(size) => {
                tracing::info!(%peer, file = %name, size, "file sent");
                let _ = self.events.send(AppEvent::FileSent {
                    name,
                    size: *size,
                });
            }
            Err(e) => {
                tracing::warn!(%peer, file = %name, error = %e, "file send failed");
                let _ = self.events.send(AppEvent::FileFailed {
                    name,
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn install(&self, transfer: OutgoingTransfer) -> anyhow::Result<u64> {
        let mut slot = self.active.lock().map_err(|_| anyhow!("sender state poisoned"))?;
        if slot.is_some() {
            return Err(anyhow!("a transfer is already in progress"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(ActiveSend { id, transfer });
        Ok(id)
    }

    fn release(&self, id: u64) {
        if let Ok(mut slot) = self.active.lock() {
            if slot.as_ref().map(|a| a.id) == Some(id) {
                *slot = None;
            }
        }
    }

    /// Run `f` on transfer `id`; fails once it was cancelled or the transport closed.
    fn with<T>(&self, id: u64, f: impl FnOnce(&mut OutgoingTransfer) -> T) -> anyhow::Result<T> {
        if self.transport.is_closed() {
            return Err(anyhow!("transport closed"));
        }
        let mut slot = self.active.lock().map_err(|_| anyhow!("sender state poisoned"))?;
        match slot.as_mut() {
            Some(a) if a.id == id => Ok(f(&mut a.transfer)),
            _ => Err(anyhow!("transfer cancelled")),
        }
    }

    async fn drive(self: &Arc<Self>, id: u64, peer: IpAddr) -> anyhow::Result<u64> {
        let (header, total_size, total_chunks) =
            self.with(id, |t| (t.header().encode(), t.total_size(), t.total_chunks()))?;
        tracing::info!(%peer, total_size, total_chunks, "sending file header");

        while !self.with(id, |t| t.header_acked())? {
            self.transport
                .send(peer, MessageType::FileHeader, header.clone());
            tokio::time::sleep(self.config.header_retry()).await;
        }
        tracing::debug!(%peer, "header acknowledged");

        let _resend = AbortOnDrop(tokio::spawn(self.clone().resend_loop(id, peer)));

        let window = self.config.window;
        let mut next_report = 10u64;
        loop {
            let (step, acked) = self.with(id, |t| {
                let step = if t.is_complete() {
                    Step::Done
                } else {
                    match t.next_to_send(Instant::now(), window) {
                        Some((seq, data)) => Step::Send(seq, data),
                        None => Step::Wait,
                    }
                };
                (step, t.acked_count() as u64)
            })?;
            if total_chunks > 0 {
                let pct = acked * 100 / u64::from(total_chunks);
                if pct >= next_report {
                    tracing::info!(%peer, progress = pct, acked, total_chunks, "transfer progress");
                    next_report = (pct / 10 + 1) * 10;
                }
            }
            match step {
                Step::Send(seq, data) => {
                    self.transport
                        .send(peer, MessageType::FileChunk, encode_chunk(seq, &data));
                }
                Step::Wait => tokio::time::sleep(WINDOW_POLL).await,
                Step::Done => break,
            }
        }

        for _ in 0..self.config.end_repeats.max(1) {
            self.transport.send(peer, MessageType::FileEnd, Vec::new());
            tokio::time::sleep(END_SPACING).await;
        }
        Ok(total_size)
    }

    async fn resend_loop(self: Arc<Self>, id: u64, peer: IpAddr) {
        let rto = self.config.rto();
        let mut tick = tokio::time::interval(self.config.resend_scan());
        loop {
            tick.tick().await;
            let due = match self.with(id, |t| t.due_for_resend(Instant::now(), rto)) {
                Ok(due) => due,
                Err(_) => break,
            };
            for (seq, data) in due {
                tracing::debug!(%peer, seq, "retransmitting chunk");
                self.transport
                    .send(peer, MessageType::FileChunk, encode_chunk(seq, &data));
            }
        }
    }
}

/// Output sink for one incoming transfer: a buffered `.part` file renamed on success.
#[derive(Debug)]
pub struct PartFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl PartFile {
    pub fn create(dir: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.part", name));
        let out = BufWriter::new(File::create(&path)?);
        Ok(Self { path, out })
    }

    /// Flush and rename to a free name next to the part file.
    pub fn commit(self, name: &str) -> io::Result<PathBuf> {
        let Self { path, out } = self;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let target = unique_path(dir, name);
        std::fs::rename(&path, &target)?;
        Ok(target)
    }

    pub fn discard(self) {
        let Self { path, out } = self;
        drop(out);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove partial file");
        }
    }
}

impl Write for PartFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// `name`, or `stem (n).ext` for the first n that does not exist yet.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    (1u32..)
        .map(|n| dir.join(format!("{} ({}){}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Incoming side: owns the receiver state; ACKs are sent synchronously with each chunk.
pub struct FileReceiveTask {
    transport: Arc<Transport>,
    download_dir: PathBuf,
    events: EventSender,
    receiver: FileReceiver<PartFile>,
    from: Option<IpAddr>,
    name: String,
}

impl FileReceiveTask {
    pub fn new(transport: Arc<Transport>, download_dir: PathBuf, events: EventSender) -> Self {
        Self {
            transport,
            download_dir,
            events,
            receiver: FileReceiver::new(),
            from: None,
            name: String::new(),
        }
    }

    /// Consume file messages until the transport closes. Disk writes, the rename and
    /// the digest run on the blocking pool, one message at a time.
    pub async fn run(self, mut inbox: Inbox) {
        let mut task = self;
        while let Some(msg) = inbox.recv().await {
            task = match tokio::task::spawn_blocking(move || {
                task.handle(msg);
                task
            })
            .await
            {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "file receive worker failed");
                    return;
                }
            };
        }
        let _ = tokio::task::spawn_blocking(move || task.abandon()).await;
    }

    fn handle(&mut self, msg: Message) {
        match msg.kind {
            MessageType::FileHeader => self.on_header(msg.peer, &msg.payload),
            MessageType::FileChunk => self.on_chunk(msg.peer, &msg.payload),
            MessageType::FileEnd => self.on_end(msg.peer),
            other => tracing::debug!(kind = %other, "unexpected message on file inbox"),
        }
    }

    /// Drop the transfer in progress, if any, and delete its part file.
    fn abandon(&mut self) -> bool {
        match self.receiver.abort() {
            Some(t) => {
                t.into_sink().discard();
                true
            }
            None => false,
        }
    }

    fn ack(&self, peer: IpAddr, seq: u32) {
        self.transport
            .send(peer, MessageType::FileAck, encode_ack(seq));
    }

    fn on_header(&mut self, from: IpAddr, payload: &[u8]) {
        let header = match FileHeader::decode(payload) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(%from, error = %e, "dropping malformed file header");
                return;
            }
        };
        if let Some(t) = self.receiver.active() {
            let retry = self.from == Some(from)
                && *t.header() == header
                && t.next_expected() == 1
                && t.buffered() == 0;
            if retry {
                tracing::debug!(%from, file = %header.file_name, "header retry, re-acking");
                self.ack(from, HEADER_ACK_SEQ);
                return;
            }
            tracing::warn!(
                file = %t.header().file_name,
                written = t.written(),
                "new header mid-transfer, abandoning previous transfer"
            );
        }
        // The old part file may share the new one's path; remove it first.
        self.abandon();
        self.from = None;
        let name = safe_file_name(&header.file_name);
        let sink = match PartFile::create(&self.download_dir, &name) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(dir = %self.download_dir.display(), error = %e, "cannot open output file");
                let _ = self.events.send(AppEvent::FileFailed {
                    name,
                    reason: e.to_string(),
                });
                return;
            }
        };
        tracing::info!(
            %from,
            file = %name,
            size = header.total_size,
            chunks = header.total_chunks,
            "incoming file"
        );
        if let Some(old) = self.receiver.on_header(header, sink) {
            old.into_sink().discard();
        }
        self.from = Some(from);
        self.name = name;
        self.ack(from, HEADER_ACK_SEQ);
    }

    fn on_chunk(&mut self, from: IpAddr, payload: &[u8]) {
        let (seq, data) = match decode_chunk(payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping malformed chunk");
                return;
            }
        };
        match self.receiver.on_chunk(seq, data) {
            Ok(reply) => {
                self.ack(from, reply.ack);
                match reply.outcome {
                    None => tracing::debug!(%from, seq, "chunk with no transfer in progress"),
                    Some(ChunkOutcome::OutOfRange) => {
                        tracing::debug!(%from, seq, "chunk beyond declared count")
                    }
                    Some(outcome) => tracing::trace!(seq, ?outcome, "chunk"),
                }
            }
            Err(e) => {
                tracing::error!(file = %self.name, error = %e, "write failed, aborting transfer");
                self.abandon();
                let _ = self.events.send(AppEvent::FileFailed {
                    name: std::mem::take(&mut self.name),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_end(&mut self, from: IpAddr) {
        let Some(finished) = self.receiver.on_end() else {
            tracing::debug!(%from, "end with no transfer in progress");
            return;
        };
        let name = std::mem::take(&mut self.name);
        let from = self.from.take().unwrap_or(from);
        match self.complete(finished, &name) {
            Ok((path, size, sha256)) => {
                tracing::info!(
                    %from,
                    path = %path.display(),
                    size,
                    sha256 = %to_hex(&sha256),
                    "file received"
                );
                let _ = self.events.send(AppEvent::FileReceived {
                    from,
                    path,
                    size,
                    sha256,
                });
            }
            Err(reason) => {
                tracing::warn!(%from, file = %name, %reason, "file transfer failed");
                let _ = self.events.send(AppEvent::FileFailed { name, reason });
            }
        }
    }

    fn complete(
        &self,
        finished: Finished<PartFile>,
        name: &str,
    ) -> Result<(PathBuf, u64, [u8; 32]), String> {
        let Finished { sink, result, .. } = finished;
        let size = match result {
            Ok(size) => size,
            Err(e) => {
                sink.discard();
                return Err(e.to_string());
            }
        };
        let path = sink.commit(name).map_err(|e| e.to_string())?;
        let sha256 = File::open(&path)
            .and_then(hash_reader)
            .map_err(|e| e.to_string())?;
        Ok((path, size, sha256))
    }
}
