use std::path::Path;
use std::time::Duration;

use ntrip_client::CasterConfig;
use serde::{Deserialize, Serialize};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [caster]
//                    host = "caster.example.com"
//
//   env var:         RTK_CASTER__HOST=caster.example.com
//                    (double underscore = nesting)
//
//   (single underscore stays within field names: RTK_CASTER__READ_TIMEOUT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub caster: CasterFileConfig,
    #[serde(default)]
    pub local: LocalFileConfig,
    #[serde(default)]
    pub serial: SerialFileConfig,
    #[serde(default)]
    pub tunnel: TunnelFileConfig,
    #[serde(default)]
    pub decoder: DecoderFileConfig,
}

/// Upstream NTRIP caster (lives under `[caster]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CasterFileConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_caster_port")]
    pub port: u16,
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_header_kb")]
    pub max_header_kb: usize,
}

impl Default for CasterFileConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_caster_port(),
            mountpoint: String::new(),
            username: String::new(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_header_kb: default_max_header_kb(),
        }
    }
}

/// Local listener for downstream clients (`[local]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalFileConfig {
    #[serde(default = "default_local_host")]
    pub host: String,
    #[serde(default = "default_local_port")]
    pub port: u16,
    /// When true, the newest client replaces the previous one instead of
    /// joining it.
    #[serde(default)]
    pub single_slot: bool,
}

impl Default for LocalFileConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
            single_slot: false,
        }
    }
}

/// Directly attached receiver (`[serial]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialFileConfig {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_receiver_baud")]
    pub baud: u32,
}

impl Default for SerialFileConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_receiver_baud(),
        }
    }
}

/// SERIAL_CONTROL passthrough link (`[tunnel]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelFileConfig {
    /// Telemetry link: a serial device path, or `tcp:host:port`.
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default = "default_link_baud")]
    pub link_baud: u32,
    /// SERIAL_CONTROL device id (3 = second GPS port).
    #[serde(default = "default_tunnel_device")]
    pub device: u8,
    #[serde(default = "default_receiver_baud")]
    pub device_baud: u32,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_chunk_pacing_ms")]
    pub chunk_pacing_ms: u64,
}

impl Default for TunnelFileConfig {
    fn default() -> Self {
        Self {
            link: None,
            link_baud: default_link_baud(),
            device: default_tunnel_device(),
            device_baud: default_receiver_baud(),
            exclusive: default_exclusive(),
            poll_interval_ms: default_poll_interval_ms(),
            chunk_pacing_ms: default_chunk_pacing_ms(),
        }
    }
}

/// Frame decoder tunables (`[decoder]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecoderFileConfig {
    #[serde(default = "default_garbage_cap")]
    pub garbage_cap: usize,
    #[serde(default = "default_validate_crc")]
    pub validate_crc: bool,
}

impl Default for DecoderFileConfig {
    fn default() -> Self {
        Self {
            garbage_cap: default_garbage_cap(),
            validate_crc: default_validate_crc(),
        }
    }
}

fn default_caster_port() -> u16 {
    2101
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    30
}
fn default_max_header_kb() -> usize {
    64
}
fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port() -> u16 {
    2101
}
fn default_receiver_baud() -> u32 {
    115_200
}
fn default_link_baud() -> u32 {
    57_600
}
fn default_tunnel_device() -> u8 {
    3
}
fn default_exclusive() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_chunk_pacing_ms() -> u64 {
    10
}
fn default_garbage_cap() -> usize {
    1024
}
fn default_validate_crc() -> bool {
    true
}

impl FileConfig {
    /// Resolved upstream caster parameters.
    pub fn caster_config(&self) -> CasterConfig {
        let mut cfg = CasterConfig::new(
            &self.caster.host,
            self.caster.port,
            &self.caster.mountpoint,
            &self.caster.username,
            &self.caster.password,
        );
        cfg.connect_timeout = Duration::from_secs(self.caster.connect_timeout_secs);
        cfg.read_timeout = Duration::from_secs(self.caster.read_timeout_secs);
        cfg.max_header = self.caster.max_header_kb * 1024;
        cfg
    }

    /// Resolved tunnel parameters.
    pub fn tunnel_config(&self) -> mav_tunnel::TunnelConfig {
        mav_tunnel::TunnelConfig {
            device: self.tunnel.device,
            device_baud: self.tunnel.device_baud,
            exclusive: self.tunnel.exclusive,
            poll_interval: Duration::from_millis(self.tunnel.poll_interval_ms),
            chunk_pacing: Duration::from_millis(self.tunnel.chunk_pacing_ms),
            ..mav_tunnel::TunnelConfig::default()
        }
    }

    /// A decoder configured per the `[decoder]` section.
    pub fn decoder(&self) -> rtcm_decoder::FrameDecoder {
        let policy = if self.decoder.validate_crc {
            rtcm_decoder::DecoderPolicy::ValidateCrc
        } else {
            rtcm_decoder::DecoderPolicy::TrustLength
        };
        rtcm_decoder::FrameDecoder::with_policy(policy)
            .with_garbage_cap(self.decoder.garbage_cap)
    }
}

/// Build a figment that layers: defaults → config.toml → RTK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RTK_CASTER__HOST=caster.example.com`  →  `caster.host`
///   `RTK_LOCAL__SINGLE_SLOT=true`          →  `local.single_slot`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("RTK_").split("__"))
}
