//! Line-oriented command console on stdin.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use wirelink_core::AudioConfig;

use crate::call::CallController;
use crate::discovery::{self, SharedSession};
use crate::files::FileSender;
use crate::stream::{Broadcaster, RawPcmEncoder};
use crate::transport::Transport;

pub const HELP: &str = "\
commands:
  discover            broadcast a discovery beacon
  connect <ip>        handshake with a peer and make it the active peer
  disconnect          forget the active peer and cancel any outgoing file
  text <message>      send a text message
  send <path>         send a file
  broadcast <path>    stream a raw S16_LE audio file to the peer
  call | accept | reject | hangup
  gain <factor>       playback gain for calls
  status              show peer and call state
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Discover,
    Connect(IpAddr),
    Disconnect,
    Text(String),
    Send(PathBuf),
    Broadcast(PathBuf),
    Call,
    Accept,
    Reject,
    Hangup,
    Gain(f32),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
    #[error("invalid argument for `{cmd}`: {arg}")]
    BadArgument { cmd: &'static str, arg: String },
}

/// `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let arg = |cmd: &'static str| {
        if rest.is_empty() {
            Err(ParseError::MissingArgument(cmd))
        } else {
            Ok(rest)
        }
    };
    let cmd = match word.to_ascii_lowercase().as_str() {
        "discover" => Command::Discover,
        "connect" => {
            let a = arg("connect")?;
            Command::Connect(a.parse().map_err(|_| ParseError::BadArgument {
                cmd: "connect",
                arg: a.to_string(),
            })?)
        }
        "disconnect" => Command::Disconnect,
        "text" | "msg" => Command::Text(arg("text")?.to_string()),
        "send" => Command::Send(PathBuf::from(arg("send")?)),
        "broadcast" => Command::Broadcast(PathBuf::from(arg("broadcast")?)),
        "call" => Command::Call,
        "accept" => Command::Accept,
        "reject" => Command::Reject,
        "hangup" | "end" => Command::Hangup,
        "gain" => {
            let a = arg("gain")?;
            match a.parse::<f32>() {
                Ok(g) if g.is_finite() && g >= 0.0 => Command::Gain(g),
                _ => {
                    return Err(ParseError::BadArgument {
                        cmd: "gain",
                        arg: a.to_string(),
                    })
                }
            }
        }
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

/// Handles to every subsystem a command can reach.
pub struct Console {
    pub transport: Arc<Transport>,
    pub session: SharedSession,
    pub files: Arc<FileSender>,
    pub calls: Arc<CallController>,
    pub broadcaster: Arc<Broadcaster>,
    pub audio: AudioConfig,
}

impl Console {
    /// Read commands until `quit` or end of input.
    pub async fn run(self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{}", HELP);
        loop {
            let line = match lines.next_line().await {
                Ok(Some(l)) => l,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
            };
            match parse(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break,
                Ok(Some(cmd)) => self.execute(cmd).await,
                Err(e) => println!("{}", e),
            }
        }
    }

    async fn execute(&self, cmd: Command) {
        match cmd {
            Command::Discover => discovery::send_discovery(&self.transport),
            Command::Connect(ip) => {
                discovery::send_handshake(&self.transport, &self.session, ip).await
            }
            Command::Disconnect => {
                self.session.lock().await.reset();
                if self.files.cancel() {
                    println!("outgoing transfer cancelled");
                }
                println!("peer cleared");
            }
            Command::Text(text) => {
                if let Err(e) = discovery::send_text(&self.transport, &self.session, &text).await {
                    println!("{}", e);
                }
            }
            Command::Send(path) => match self.peer().await {
                Some(peer) => {
                    let files = self.files.clone();
                    tokio::spawn(async move {
                        // Outcome is reported through FileSent / FileFailed events.
                        let _ = files.send_file(peer, &path).await;
                    });
                }
                None => println!("no peer selected; use `connect <ip>` first"),
            },
            Command::Broadcast(path) => match self.peer().await {
                Some(peer) => {
                    let caster = self.broadcaster.clone();
                    let audio = self.audio.clone();
                    tokio::spawn(async move {
                        let result: anyhow::Result<u64> = async {
                            let file = tokio::fs::File::open(&path).await?;
                            let encoder = Box::new(RawPcmEncoder::new(&audio));
                            caster
                                .broadcast(peer, encoder, file, audio.capture_block)
                                .await
                        }
                        .await;
                        if let Err(e) = result {
                            tracing::warn!(path = %path.display(), error = %e, "broadcast failed");
                        }
                    });
                }
                None => println!("no peer selected; use `connect <ip>` first"),
            },
            Command::Call => self.report(self.calls.dial().await),
            Command::Accept => self.report(self.calls.accept().await),
            Command::Reject => self.report(self.calls.reject().await),
            Command::Hangup => self.report(self.calls.hangup().await),
            Command::Gain(g) => println!("gain {}", self.calls.set_gain(g)),
            Command::Status => {
                let (target, connected) = {
                    let s = self.session.lock().await;
                    (s.target(), s.is_connected())
                };
                match target {
                    Some(ip) => println!("peer {} ({})", ip, if connected { "connected" } else { "pending" }),
                    None => println!("no peer"),
                }
                println!(
                    "local {}  call {:?}  gain {}  file transfer {}",
                    self.transport.local_addr(),
                    self.calls.state(),
                    self.calls.gain(),
                    if self.files.is_busy() { "active" } else { "idle" }
                );
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
    }

    async fn peer(&self) -> Option<IpAddr> {
        self.session.lock().await.target()
    }

    fn report<T>(&self, result: Result<T, wirelink_core::CallError>) {
        if let Err(e) = result {
            println!("{}", e);
        }
    }
}
