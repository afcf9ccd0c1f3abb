use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// STUN (or pre-provisioned TURN) server handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing_mode: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            facing_mode: FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScreenConstraints {
    pub show_cursor: bool,
    pub capture_audio: bool,
}

impl Default for ScreenConstraints {
    fn default() -> Self {
        Self {
            show_cursor: true,
            capture_audio: false,
        }
    }
}

/// Capture constraints. `None` for audio or video disables that kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
    pub screen: ScreenConstraints,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: Some(AudioConstraints::default()),
            screen: ScreenConstraints::default(),
        }
    }
}

/// Linear backoff used when a capture device reports itself busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based). Saturates
    /// instead of overflowing.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub constraints: MediaConstraints,
    pub device_retry: RetryPolicy,
    /// How long negotiation waits once for local media before giving up.
    pub media_ready_grace: Duration,
    /// Soft deadline after which a still-unconnected link is logged as timed out.
    pub connect_watchdog: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_URLS.iter().map(|url| IceServer::stun(*url)).collect(),
            ice_candidate_pool_size: 10,
            constraints: MediaConstraints::default(),
            device_retry: RetryPolicy::default(),
            media_ready_grace: Duration::from_millis(500),
            connect_watchdog: Duration::from_secs(30),
        }
    }
}

impl CallConfig {
    /// Load configuration from `HUDDLE_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = env::var("HUDDLE_STUN_URLS") {
            let urls: Vec<IceServer> = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
            if !urls.is_empty() {
                config.ice_servers = urls;
            }
        }
        if env_flag("HUDDLE_LOCALHOST_ONLY") {
            config.ice_servers.clear();
        }
        if let Some(size) = env_parse("HUDDLE_ICE_POOL_SIZE") {
            config.ice_candidate_pool_size = size;
        }
        if let Some(secs) = env_parse::<u64>("HUDDLE_CONNECT_WATCHDOG_SECS") {
            config.connect_watchdog = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse::<u32>("HUDDLE_DEVICE_RETRY_ATTEMPTS") {
            config.device_retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = env_parse::<u64>("HUDDLE_DEVICE_RETRY_STEP_MS") {
            config.device_retry.step = Duration::from_millis(ms);
        }
        config
    }

    pub fn builder() -> CallConfigBuilder {
        CallConfigBuilder::new()
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct CallConfigBuilder {
    ice_servers: Vec<IceServer>,
    localhost_only: bool,
    ice_candidate_pool_size: Option<u8>,
    constraints: Option<MediaConstraints>,
    device_retry: Option<RetryPolicy>,
    media_ready_grace: Option<Duration>,
    connect_watchdog: Option<Duration>,
}

impl CallConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: String::new(),
            credential: String::new(),
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    /// No ICE servers at all; host candidates only.
    pub fn localhost_only(mut self) -> Self {
        self.localhost_only = true;
        self
    }

    pub fn ice_candidate_pool_size(mut self, size: u8) -> Self {
        self.ice_candidate_pool_size = Some(size);
        self
    }

    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn device_retry(mut self, policy: RetryPolicy) -> Self {
        self.device_retry = Some(policy);
        self
    }

    pub fn media_ready_grace(mut self, grace: Duration) -> Self {
        self.media_ready_grace = Some(grace);
        self
    }

    pub fn connect_watchdog(mut self, watchdog: Duration) -> Self {
        self.connect_watchdog = Some(watchdog);
        self
    }

    pub fn build(self) -> Result<CallConfig, String> {
        let mut config = CallConfig::default();
        if self.localhost_only {
            config.ice_servers.clear();
        } else if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if let Some(size) = self.ice_candidate_pool_size {
            config.ice_candidate_pool_size = size;
        }
        if let Some(constraints) = self.constraints {
            if constraints.audio.is_none() && constraints.video.is_none() {
                return Err("constraints must request audio, video, or both".into());
            }
            config.constraints = constraints;
        }
        if let Some(policy) = self.device_retry {
            if policy.max_attempts == 0 {
                return Err("device retry needs at least one attempt".into());
            }
            config.device_retry = policy;
        }
        if let Some(grace) = self.media_ready_grace {
            config.media_ready_grace = grace;
        }
        if let Some(watchdog) = self.connect_watchdog {
            config.connect_watchdog = watchdog;
        }
        Ok(config)
    }
}
