//! Call audio: capture and playback threads around a blocking device pair, plus the
//! process-backed device used by the daemon (arecord/aplay by default).

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use wirelink_core::audio::{apply_gain, fragment, AudioInput, AudioOutput, DeviceRelease};
use wirelink_core::{AudioBackend, AudioConfig, AudioDevices, Gain, JitterBuffer, MessageType, Role};

use crate::transport::Transport;

const POP_WAIT: Duration = Duration::from_millis(20);

/// Jitter buffer shared by the network consumer (producer) and the playback thread.
struct PlaybackQueue {
    frames: Mutex<JitterBuffer>,
    ready: Condvar,
}

impl PlaybackQueue {
    fn new(config: &AudioConfig) -> Self {
        Self {
            frames: Mutex::new(JitterBuffer::new(
                config.jitter_min_frames,
                config.jitter_max_frames,
            )),
            ready: Condvar::new(),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        if let Ok(mut q) = self.frames.lock() {
            q.push(frame);
            self.ready.notify_one();
        }
    }

    fn pop_timeout(&self, wait: Duration) -> Option<Vec<u8>> {
        let mut q = self.frames.lock().ok()?;
        if let Some(f) = q.pop() {
            return Some(f);
        }
        let (mut q, _) = self.ready.wait_timeout(q, wait).ok()?;
        q.pop()
    }

    fn clear(&self) {
        if let Ok(mut q) = self.frames.lock() {
            let dropped = q.dropped();
            if dropped > 0 {
                tracing::debug!(dropped, "playback frames dropped on overflow");
            }
            q.clear();
        }
        self.ready.notify_all();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.frames.lock().map(|q| q.len()).unwrap_or(0)
    }
}

struct Workers {
    capture: JoinHandle<()>,
    playback: JoinHandle<()>,
    release: Box<dyn DeviceRelease>,
}

/// Duplex audio for one call at a time. `start` and `stop` are idempotent.
pub struct AudioPipeline {
    config: AudioConfig,
    backend: Arc<dyn AudioBackend>,
    gain: Arc<Gain>,
    running: Arc<AtomicBool>,
    queue: Arc<PlaybackQueue>,
    workers: Mutex<Option<Workers>>,
}

impl AudioPipeline {
    pub fn new(config: AudioConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let gain = Arc::new(Gain::new(config.gain));
        let queue = Arc::new(PlaybackQueue::new(&config));
        Self {
            config,
            backend,
            gain,
            running: Arc::new(AtomicBool::new(false)),
            queue,
            workers: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    /// Takes effect on the next played frame.
    pub fn set_gain(&self, value: f32) -> f32 {
        let v = self.gain.set(value);
        tracing::info!(gain = v, "playback gain set");
        v
    }

    /// Open the devices and start both loops, streaming capture to `peer`.
    pub fn start(&self, transport: Arc<Transport>, peer: IpAddr, role: Role) -> io::Result<()> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audio state poisoned"))?;
        if workers.is_some() {
            return Ok(());
        }
        let AudioDevices {
            input,
            output,
            release,
        } = self.backend.open(&self.config)?;
        self.queue.clear();
        self.running.store(true, Ordering::Release);

        let capture = {
            let running = self.running.clone();
            let block = self.config.capture_block.max(2);
            let mtu = self.config.mtu;
            std::thread::Builder::new()
                .name("wirelink-capture".into())
                .spawn(move || capture_loop(input, running, transport, peer, block, mtu))
        };
        let capture = match capture {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                release.release();
                return Err(e);
            }
        };
        let playback = {
            let running = self.running.clone();
            let queue = self.queue.clone();
            let gain = self.gain.clone();
            std::thread::Builder::new()
                .name("wirelink-playback".into())
                .spawn(move || playback_loop(output, running, queue, gain))
        };
        let playback = match playback {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                release.release();
                let _ = capture.join();
                return Err(e);
            }
        };
        tracing::info!(%peer, ?role, rate = self.config.sample_rate, channels = self.config.channels, "audio started");
        *workers = Some(Workers {
            capture,
            playback,
            release,
        });
        Ok(())
    }

    /// Queue a received CALL_AUDIO fragment. Ignored while stopped.
    pub fn push(&self, frame: Vec<u8>) {
        if self.is_running() {
            self.queue.push(frame);
        }
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop both loops, release the devices and drop queued audio. Blocks for at most
    /// twice the join timeout.
    pub fn stop(&self) {
        let workers = match self.workers.lock() {
            Ok(mut w) => w.take(),
            Err(_) => None,
        };
        self.running.store(false, Ordering::Release);
        let Some(w) = workers else {
            return;
        };
        w.release.release();
        self.queue.clear();
        let timeout = Duration::from_millis(self.config.join_timeout_ms);
        join_with_timeout(w.capture, "capture", timeout);
        join_with_timeout(w.playback, "playback", timeout);
        tracing::info!("audio stopped");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, name: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(thread = name, "audio thread did not stop in time, detaching");
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        tracing::error!(thread = name, "audio thread panicked");
    }
}

fn capture_loop(
    mut input: Box<dyn AudioInput>,
    running: Arc<AtomicBool>,
    transport: Arc<Transport>,
    peer: IpAddr,
    block: usize,
    mtu: usize,
) {
    let mut buf = vec![0u8; block];
    while running.load(Ordering::Acquire) {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                for piece in fragment(&buf[..n], mtu) {
                    transport.send(peer, MessageType::CallAudio, piece.to_vec());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    tracing::warn!(error = %e, "capture read failed");
                }
                break;
            }
        }
    }
    tracing::debug!("capture loop exited");
}

fn playback_loop(
    mut output: Box<dyn AudioOutput>,
    running: Arc<AtomicBool>,
    queue: Arc<PlaybackQueue>,
    gain: Arc<Gain>,
) {
    while running.load(Ordering::Acquire) {
        let Some(mut frame) = queue.pop_timeout(POP_WAIT) else {
            continue;
        };
        apply_gain(&mut frame, gain.get());
        if let Err(e) = output.write(&frame) {
            if running.load(Ordering::Acquire) {
                tracing::warn!(error = %e, "playback write failed");
            }
            break;
        }
    }
    tracing::debug!("playback loop exited");
}

/// Devices backed by child processes: capture reads the recorder's stdout, playback
/// writes the player's stdin. Killing the children unblocks both.
pub struct ProcessBackend;

fn command_line(template: &str, config: &AudioConfig) -> io::Result<Command> {
    let line = template
        .replace("{rate}", &config.sample_rate.to_string())
        .replace("{channels}", &config.channels.to_string());
    let mut parts = line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty audio command"))?;
    let mut cmd = Command::new(program);
    cmd.args(parts);
    Ok(cmd)
}

struct ChildInput(ChildStdout);

impl AudioInput for ChildInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

struct ChildOutput(ChildStdin);

impl AudioOutput for ChildOutput {
    fn write(&mut self, pcm: &[u8]) -> io::Result<()> {
        self.0.write_all(pcm)
    }
}

struct KillChildren(Mutex<Vec<Child>>);

impl DeviceRelease for KillChildren {
    fn release(&self) {
        let Ok(mut children) = self.0.lock() else {
            return;
        };
        for mut child in children.drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl AudioBackend for ProcessBackend {
    fn open(&self, config: &AudioConfig) -> io::Result<AudioDevices> {
        let mut recorder = command_line(&config.capture_command, config)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let player = command_line(&config.playback_command, config).and_then(|mut c| {
            c.stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
        });
        let mut player = match player {
            Ok(p) => p,
            Err(e) => {
                let _ = recorder.kill();
                let _ = recorder.wait();
                return Err(e);
            }
        };
        let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "audio process pipe missing");
        let stdout = recorder.stdout.take().ok_or_else(missing)?;
        let stdin = player.stdin.take().ok_or_else(missing)?;
        Ok(AudioDevices {
            input: Box::new(ChildInput(stdout)),
            output: Box::new(ChildOutput(stdin)),
            release: Box::new(KillChildren(Mutex::new(vec![recorder, player]))),
        })
    }
}
