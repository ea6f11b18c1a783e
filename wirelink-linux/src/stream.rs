//! Live broadcast: codec config retried until acknowledged, then data packets.
//! Codecs sit behind [`MediaEncoder`]/[`MediaDecoder`]; the daemon ships a raw PCM
//! encoder for file broadcasts and a passthrough decoder that dumps each track to disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncRead, AsyncReadExt};
use wirelink_core::audio::fragment;
use wirelink_core::stream::{ReceiverAction, StreamFrame, Track, TrackReceiver, TrackSender};
use wirelink_core::{AudioConfig, Message, MessageType};

use crate::events::{AppEvent, EventSender};
use crate::transport::{Inbox, Transport};

const CONFIG_RETRY: Duration = Duration::from_millis(500);
const CONFIG_ATTEMPTS: u32 = 20;

/// Feed raw input, drain compressed packets.
pub trait MediaEncoder: Send {
    fn track(&self) -> Track;
    /// Codec configuration sent before any data.
    fn config(&self) -> Vec<u8>;
    fn feed(&mut self, raw: &[u8]) -> io::Result<()>;
    fn drain(&mut self) -> Vec<Vec<u8>>;
    /// Playback time covered by `raw_len` input bytes; broadcasts are paced by it.
    fn duration_of(&self, _raw_len: usize) -> Duration {
        Duration::ZERO
    }
}

/// Mirror of [`MediaEncoder`]: configure, feed packets, drain raw output.
pub trait MediaDecoder: Send {
    fn configure(&mut self, config: &[u8]) -> io::Result<()>;
    fn feed(&mut self, packet: &[u8]) -> io::Result<()>;
    fn drain(&mut self) -> Vec<Vec<u8>>;
}

/// Uncompressed S16_LE audio, cut into MTU-sized packets.
pub struct RawPcmEncoder {
    sample_rate: u32,
    channels: u16,
    mtu: usize,
    pending: Vec<Vec<u8>>,
}

impl RawPcmEncoder {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            mtu: config.mtu,
            pending: Vec::new(),
        }
    }
}

impl MediaEncoder for RawPcmEncoder {
    fn track(&self) -> Track {
        Track::Audio
    }

    fn config(&self) -> Vec<u8> {
        format!("pcm_s16le rate={} channels={}", self.sample_rate, self.channels).into_bytes()
    }

    fn feed(&mut self, raw: &[u8]) -> io::Result<()> {
        self.pending
            .extend(fragment(raw, self.mtu).map(<[u8]>::to_vec));
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending)
    }

    fn duration_of(&self, raw_len: usize) -> Duration {
        let bytes_per_sec = u64::from(self.sample_rate) * u64::from(self.channels.max(1)) * 2;
        if bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(raw_len as u64 * 1_000_000 / bytes_per_sec)
    }
}

/// Hands packets through untouched.
#[derive(Default)]
pub struct PassthroughDecoder {
    out: Vec<Vec<u8>>,
}

impl MediaDecoder for PassthroughDecoder {
    fn configure(&mut self, _config: &[u8]) -> io::Result<()> {
        self.out.clear();
        Ok(())
    }

    fn feed(&mut self, packet: &[u8]) -> io::Result<()> {
        self.out.push(packet.to_vec());
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.out)
    }
}

fn track_name(track: Track) -> &'static str {
    match track {
        Track::Video => "video",
        Track::Audio => "audio",
    }
}

pub async fn receiver_inbox(transport: &Transport) -> Inbox {
    transport
        .subscribe(&[
            MessageType::StreamVideoConfig,
            MessageType::StreamVideoData,
            MessageType::StreamAudioConfig,
            MessageType::StreamAudioData,
        ])
        .await
}

pub async fn broadcaster_inbox(transport: &Transport) -> Inbox {
    transport
        .subscribe(&[
            MessageType::StreamVideoConfigAck,
            MessageType::StreamAudioConfigAck,
        ])
        .await
}

pub type DecoderFactory = Box<dyn Fn(Track) -> Box<dyn MediaDecoder> + Send>;

struct TrackSink {
    state: TrackReceiver,
    decoder: Box<dyn MediaDecoder>,
    out: Option<File>,
}

/// Receiving side: acks every config, decodes data, writes decoder output to
/// `stream-<peer>-<track>.raw` in the download directory.
pub struct StreamReceiver {
    transport: Arc<Transport>,
    dir: PathBuf,
    events: EventSender,
    factory: DecoderFactory,
    tracks: HashMap<Track, TrackSink>,
}

impl StreamReceiver {
    pub fn new(transport: Arc<Transport>, dir: PathBuf, events: EventSender) -> Self {
        Self::with_decoders(
            transport,
            dir,
            events,
            Box::new(|_| Box::new(PassthroughDecoder::default())),
        )
    }

    pub fn with_decoders(
        transport: Arc<Transport>,
        dir: PathBuf,
        events: EventSender,
        factory: DecoderFactory,
    ) -> Self {
        Self {
            transport,
            dir,
            events,
            factory,
            tracks: HashMap::new(),
        }
    }

    pub fn output_path(dir: &Path, peer: IpAddr, track: Track) -> PathBuf {
        dir.join(format!("stream-{}-{}.raw", peer, track_name(track)))
    }

    /// Each packet is decoded and written on the blocking pool.
    pub async fn run(self, mut inbox: Inbox) {
        let mut receiver = self;
        while let Some(msg) = inbox.recv().await {
            receiver = match tokio::task::spawn_blocking(move || {
                receiver.handle(&msg);
                receiver
            })
            .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "stream receiver worker failed");
                    return;
                }
            };
        }
    }

    fn handle(&mut self, msg: &Message) {
        let result = match StreamFrame::from_type(msg.kind) {
            Some(StreamFrame::Config(track)) => self.on_config(msg.peer, track, &msg.payload),
            Some(StreamFrame::Data(track)) => self.on_data(track, &msg.payload),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(from = %msg.peer, kind = %msg.kind, error = %e, "stream packet dropped");
        }
    }

    fn sink(&mut self, track: Track) -> &mut TrackSink {
        let factory = &self.factory;
        self.tracks.entry(track).or_insert_with(|| TrackSink {
            state: TrackReceiver::new(),
            decoder: factory(track),
            out: None,
        })
    }

    fn on_config(&mut self, from: IpAddr, track: Track, config: &[u8]) -> io::Result<()> {
        let ReceiverAction::AckConfig { changed } = self.sink(track).state.on_config(config) else {
            return Ok(());
        };
        self.transport.send(from, track.ack_type(), Vec::new());
        if !changed {
            return Ok(());
        }
        let path = Self::output_path(&self.dir, from, track);
        std::fs::create_dir_all(&self.dir)?;
        let file = File::create(&path)?;
        let sink = self.sink(track);
        sink.decoder.configure(config)?;
        sink.out = Some(file);
        tracing::info!(%from, track = track_name(track), path = %path.display(), "stream configured");
        let _ = self.events.send(AppEvent::StreamStarted {
            from,
            track: track_name(track),
        });
        Ok(())
    }

    fn on_data(&mut self, track: Track, packet: &[u8]) -> io::Result<()> {
        let sink = self.sink(track);
        match sink.state.on_data() {
            ReceiverAction::Decode => {
                sink.decoder.feed(packet)?;
                let decoded = sink.decoder.drain();
                if let Some(out) = sink.out.as_mut() {
                    for chunk in decoded {
                        out.write_all(&chunk)?;
                    }
                }
            }
            _ => tracing::trace!(track = track_name(track), "data before config, discarded"),
        }
        Ok(())
    }
}

/// Sending side. Tracks are independent; each waits for its own config ack.
pub struct Broadcaster {
    transport: Arc<Transport>,
    tracks: Mutex<HashMap<Track, TrackSender>>,
}

impl Broadcaster {
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            tracks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run_acks(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(msg) = inbox.recv().await {
            if let Some(StreamFrame::ConfigAck(track)) = StreamFrame::from_type(msg.kind) {
                if let Ok(mut tracks) = self.tracks.lock() {
                    if let Some(t) = tracks.get_mut(&track) {
                        t.on_ack();
                    }
                }
                tracing::debug!(from = %msg.peer, track = track_name(track), "stream config acknowledged");
            }
        }
    }

    fn with_track<T>(&self, track: Track, f: impl FnOnce(&mut TrackSender) -> T) -> anyhow::Result<T> {
        let mut tracks = self.tracks.lock().map_err(|_| anyhow!("broadcast state poisoned"))?;
        Ok(f(tracks.entry(track).or_default()))
    }

    /// Send `config` for `track` until acknowledged.
    pub async fn announce(&self, peer: IpAddr, track: Track, config: Vec<u8>) -> anyhow::Result<()> {
        self.with_track(track, |t| t.set_config(config))?;
        for attempt in 1..=CONFIG_ATTEMPTS {
            if self.transport.is_closed() {
                return Err(anyhow!("transport closed"));
            }
            let pending = self.with_track(track, |t| t.pending_config().map(<[u8]>::to_vec))?;
            let Some(config) = pending else {
                return Ok(());
            };
            tracing::debug!(%peer, track = track_name(track), attempt, "sending stream config");
            self.transport.send(peer, track.config_type(), config);
            tokio::time::sleep(CONFIG_RETRY).await;
        }
        if self.with_track(track, |t| t.is_acked())? {
            return Ok(());
        }
        Err(anyhow!("peer did not acknowledge the {} config", track_name(track)))
    }

    /// Announce, then stream everything `source` yields through `encoder`.
    pub async fn broadcast<R>(
        &self,
        peer: IpAddr,
        mut encoder: Box<dyn MediaEncoder>,
        mut source: R,
        block: usize,
    ) -> anyhow::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let track = encoder.track();
        self.announce(peer, track, encoder.config()).await?;
        let mut buf = vec![0u8; block.max(1)];
        let mut sent = 0u64;
        loop {
            let n = source.read(&mut buf).await.context("reading broadcast source")?;
            if n == 0 {
                break;
            }
            encoder.feed(&buf[..n])?;
            for packet in encoder.drain() {
                if self.with_track(track, |t| t.admit_data())? {
                    sent += packet.len() as u64;
                    self.transport.send(peer, track.data_type(), packet);
                }
            }
            let pace = encoder.duration_of(n);
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
        let dropped = self.with_track(track, |t| t.dropped_before_ack())?;
        tracing::info!(%peer, track = track_name(track), bytes = sent, dropped, "broadcast finished");
        Ok(sent)
    }
}
