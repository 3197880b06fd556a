use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

pub const SIGNALING_ENV: &str = "MEETING_SIGNALING_ENDPOINT";
pub const PRESENCE_ENV: &str = "MEETING_PRESENCE_ENDPOINT";
pub const BOT_API_ENV: &str = "MEETING_BOT_API";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoints: EndpointsConfig,
    pub webrtc: WebRtcConfig,
    pub media: MediaConfig,
    pub recording: RecordingConfig,
    pub bots: BotsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// WebSocket relay carrying offer/answer/candidate envelopes.
    pub signaling: String,
    /// STOMP-over-WebSocket broker carrying presence.
    pub presence: String,
    pub bot_api: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            signaling: "ws://127.0.0.1:8080/signal".to_string(),
            presence: "ws://127.0.0.1:8080/ws".to_string(),
            bot_api: "http://127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStrategy {
    /// One shared outbound offer per session, bound to the first answerer.
    Broadcast,
    /// One targeted offer per discovered peer; lower id offers.
    PerPeer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    pub offer_strategy: OfferStrategy,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            offer_strategy: OfferStrategy::Broadcast,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video: true,
            width: 1280,
            height: 720,
            sample_rate: 48_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub mime_type: String,
    pub timeslice_ms: u64,
    pub leave_flush_timeout_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mime_type: "audio/pcm".to_string(),
            timeslice_ms: 1000,
            leave_flush_timeout_ms: 3000,
        }
    }
}

impl RecordingConfig {
    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms.max(1))
    }

    pub fn leave_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_flush_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotsConfig {
    pub request_timeout_secs: u64,
}

impl Default for BotsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 200,
        }
    }
}

impl Config {
    /// Reads `path` if it exists, otherwise starts from defaults; endpoint
    /// environment variables win over both.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            let config = Self::parse(&content)?;
            info!("Loaded config from {:?}", path);
            config
        } else {
            info!("Config file {:?} not found, using defaults", path);
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(SIGNALING_ENV) {
            self.endpoints.signaling = value;
        }
        if let Some(value) = lookup(PRESENCE_ENV) {
            self.endpoints.presence = value;
        }
        if let Some(value) = lookup(BOT_API_ENV) {
            self.endpoints.bot_api = value;
        }
    }
}
