//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;
use wirelink_core::{AudioConfig, TransferConfig, DEFAULT_PORT};

/// Daemon configuration. File: ~/.config/wirelink/config.toml or /etc/wirelink/config.toml.
/// Env overrides: WIRELINK_PORT, WIRELINK_BIND, WIRELINK_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port shared by all message types (default 12345).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit bind address. When unset the interface selector picks one.
    #[serde(default)]
    pub bind: Option<Ipv4Addr>,
    /// Where received files and stream dumps land.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Periodic DISCOVERY broadcast until a peer is connected. 0 disables.
    #[serde(default)]
    pub beacon_interval_secs: u64,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join("Downloads/wirelink"))
        .unwrap_or_else(|| PathBuf::from("wirelink-downloads"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            download_dir: default_download_dir(),
            beacon_interval_secs: 0,
            transfer: TransferConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("WIRELINK_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(ip) = var("WIRELINK_BIND").and_then(|s| s.parse::<Ipv4Addr>().ok()) {
        c.bind = Some(ip);
    }
    if let Some(dir) = var("WIRELINK_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
        c.download_dir = PathBuf::from(dir);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wirelink/config.toml"));
    }
    out.push(PathBuf::from("/etc/wirelink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => {
                    tracing::info!(path = %p.display(), "loaded config");
                    return Some(c);
                }
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config, using defaults"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.port, 12345);
        assert_eq!(c.transfer.chunk_size, 32 * 1024);
        assert_eq!(c.transfer.window, 16);
        assert_eq!(c.audio.mtu, 1400);
        assert!(c.bind.is_none());
    }

    #[test]
    fn nested_tables_override() {
        let c: Config = toml::from_str(
            r#"
            port = 40000
            bind = "192.168.42.10"
            [transfer]
            window = 8
            rto_ms = 250
            [audio]
            gain = 1.5
            jitter_min_frames = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 40000);
        assert_eq!(c.bind, Some(Ipv4Addr::new(192, 168, 42, 10)));
        assert_eq!(c.transfer.window, 8);
        assert_eq!(c.transfer.rto_ms, 250);
        assert_eq!(c.transfer.chunk_size, 32 * 1024);
        assert_eq!(c.audio.gain, 1.5);
        assert_eq!(c.audio.jitter_min_frames, 0);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("colour = 3").is_err());
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "WIRELINK_PORT" => Some("not a port".into()),
            "WIRELINK_BIND" => Some("10.0.0.2".into()),
            "WIRELINK_DOWNLOAD_DIR" => Some("/tmp/wl".into()),
            _ => None,
        });
        assert_eq!(c.port, 12345);
        assert_eq!(c.bind, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(c.download_dir, PathBuf::from("/tmp/wl"));
    }
}
