//! Configuration management for the FXS bridge
//!
//! Everything in here is read once at startup. The line section is handed to
//! the device verbatim; echo cancellation and jitter buffer behaviour are
//! owned by the DSP, not by this crate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocols::codec::Codec;
use crate::{Error, Result};

/// Upper bound on the number of FXS ports a single device exposes.
pub const MAX_PORTS: usize = 32;

pub const DEFAULT_INTERDIGIT_MS: u64 = 2000;
pub const DEFAULT_MAX_EXTENSION_LENGTH: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub interfaces: InterfacesConfig,
    pub dialing: DialingConfig,
    pub line: LineConfig,
    pub media: MediaConfig,
    pub dialplan: DialplanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfacesConfig {
    pub channels: usize,
    /// Device node prefix of the hardware line driver. The simulated device
    /// has no node and only reports it in logs.
    pub base_path: String,
    pub per_channel_context: bool,
    pub context_prefix: String,
    pub default_context: String,
}

impl InterfacesConfig {
    /// Dialplan context used for calls dialed from `port` (0-based).
    pub fn port_context(&self, port: usize) -> String {
        if self.per_channel_context {
            format!("{}{}", self.context_prefix, port + 1)
        } else {
            self.default_context.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialingConfig {
    pub interdigit_ms: u64,
    pub max_extension_length: usize,
    pub terminator: char,
}

impl DialingConfig {
    /// Inter-digit timeout, falling back to the default for a zero value.
    pub fn interdigit_timeout(&self) -> Duration {
        if self.interdigit_ms == 0 {
            tracing::warn!(
                "Invalid interdigit timeout 0, using default of {} ms",
                DEFAULT_INTERDIGIT_MS
            );
            Duration::from_millis(DEFAULT_INTERDIGIT_MS)
        } else {
            Duration::from_millis(self.interdigit_ms)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    pub rx_gain: i32,
    pub tx_gain: i32,
    pub echo_canceller: EchoCancellerConfig,
    pub jitter_buffer: JitterBufferConfig,
    pub caller_id: CallerIdStandard,
    pub vad: VadMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoCancellerConfig {
    pub mode: EchoCancellerMode,
    pub nlp: bool,
    pub nfe_window: u16,
    pub fixed_window: u16,
    pub wide_fixed_window: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoCancellerMode {
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "nlec")]
    NearEnd,
    #[serde(rename = "wlec")]
    NearFarEnd,
    #[serde(rename = "nees")]
    NearEndWithSuppressor,
    #[serde(rename = "nfees")]
    NearFarEndWithSuppressor,
    #[serde(rename = "es")]
    SuppressorOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterBufferConfig {
    pub kind: JitterBufferType,
    pub packet_adaptation: PacketAdaptation,
    pub local_adaptation: LocalAdaptation,
    pub scaling: u16,
    pub initial_size: u16,
    pub min_size: u16,
    pub max_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JitterBufferType {
    #[serde(rename = "fixed")]
    Fixed,
    #[serde(rename = "adaptive")]
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketAdaptation {
    #[serde(rename = "voice")]
    Voice,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "datanorep")]
    DataNoRepetition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalAdaptation {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "on")]
    On,
    #[serde(rename = "off")]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallerIdStandard {
    #[serde(rename = "telcordia")]
    Telcordia,
    #[serde(rename = "etsifsk")]
    EtsiFsk,
    #[serde(rename = "etsidtmf")]
    EtsiDtmf,
    #[serde(rename = "sin")]
    Sin,
    #[serde(rename = "ntt")]
    Ntt,
    #[serde(rename = "kpndtmf")]
    KpnDtmf,
    #[serde(rename = "kpndtmffsk")]
    KpnDtmfFsk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadMode {
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "on")]
    On,
    #[serde(rename = "g711")]
    G711,
    #[serde(rename = "cng")]
    ComfortNoiseOnly,
    #[serde(rename = "sc")]
    SilenceCompressionOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Codec configured on a port when the engine does not negotiate one.
    pub codec: Codec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanConfig {
    pub rules: Vec<DialplanRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanRule {
    pub context: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "json")]
    Json,
}

impl BridgeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    /// Defaults overlaid with `FXS_<SECTION>__<KEY>` environment variables.
    pub fn load_from_env() -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default_config())?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::Environment::with_prefix("FXS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interfaces.channels == 0 || self.interfaces.channels > MAX_PORTS {
            return Err(Error::parse(format!(
                "Invalid value for channels: {} (expected 1..={})",
                self.interfaces.channels, MAX_PORTS
            )));
        }

        if self.dialing.max_extension_length < 2 {
            return Err(Error::parse("max_extension_length must be at least 2"));
        }

        if self.dialing.terminator.is_ascii_digit() {
            return Err(Error::parse("Dial terminator cannot be a digit"));
        }

        let jb = &self.line.jitter_buffer;
        if jb.min_size > jb.initial_size || jb.initial_size > jb.max_size {
            return Err(Error::parse(
                "Jitter buffer sizes must satisfy min <= initial <= max",
            ));
        }

        crate::utils::logger::parse_log_level(&self.logging.level)?;

        for rule in &self.dialplan.rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                Error::parse(format!("Invalid dialplan pattern '{}': {}", rule.pattern, e))
            })?;
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            interfaces: InterfacesConfig {
                channels: 2,
                base_path: "/dev/vmmc".to_string(),
                per_channel_context: false,
                context_prefix: "lantiq".to_string(),
                default_context: "default".to_string(),
            },
            dialing: DialingConfig {
                interdigit_ms: DEFAULT_INTERDIGIT_MS,
                max_extension_length: DEFAULT_MAX_EXTENSION_LENGTH,
                terminator: '#',
            },
            line: LineConfig {
                rx_gain: 0,
                tx_gain: 0,
                echo_canceller: EchoCancellerConfig {
                    mode: EchoCancellerMode::Off,
                    nlp: false,
                    nfe_window: 0,
                    fixed_window: 0,
                    wide_fixed_window: 0,
                },
                jitter_buffer: JitterBufferConfig {
                    kind: JitterBufferType::Adaptive,
                    packet_adaptation: PacketAdaptation::Voice,
                    local_adaptation: LocalAdaptation::Default,
                    scaling: 0x10,
                    initial_size: 0x2d0,
                    min_size: 0x50,
                    max_size: 0x5a0,
                },
                caller_id: CallerIdStandard::Telcordia,
                vad: VadMode::Off,
            },
            media: MediaConfig { codec: Codec::Alaw },
            dialplan: DialplanConfig {
                rules: vec![DialplanRule {
                    context: "default".to_string(),
                    pattern: "^[1-9][0-9]{2,3}$".to_string(),
                }],
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                format: LogFormat::Full,
            },
        }
    }
}
