//! Proxy client configuration.

use crate::error::{ProxyError, ProxyResult};
use std::time::Duration;
use url::Url;

/// Default proxy server the client talks to when nothing is configured.
pub const DEFAULT_PROXY_URL: &str = "ws://127.0.0.1:8888";

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default limit on the websocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the listening loop does with a frame it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    /// Treat the stream as desynchronized: drop the socket and reconnect.
    #[default]
    Reconnect,
    /// Log the frame and keep reading.
    Drop,
}

/// Reconnect backoff settings.
///
/// The n-th consecutive attempt waits `min(base_delay * 2^(n-1), max_delay)`.
/// With `max_delay == base_delay` (the default) every attempt waits the same
/// fixed interval. Attempts are never capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_DELAY,
            max_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay between every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay.max(self.base_delay))
    }
}

/// Proxy client configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., ws://127.0.0.1:8888).
    pub url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Handling of undecodable inbound frames.
    pub decode_error_policy: DecodeErrorPolicy,
    /// Upper bound on one websocket handshake (TCP, TLS and upgrade).
    pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_PROXY_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            decode_error_policy: DecodeErrorPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Create a config for the given proxy URL with default settings.
    pub fn new(url: impl Into<String>) -> ProxyResult<Self> {
        let config = Self {
            url: url.into(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a config from the environment.
    ///
    /// Reads `PROXY_SERVER_URL`, `PROXY_RECONNECT_DELAY_SECS`,
    /// `PROXY_RECONNECT_MAX_DELAY_SECS` and `PROXY_CONNECT_TIMEOUT_SECS`;
    /// anything unset keeps its default.
    pub fn from_env() -> ProxyResult<Self> {
        let url = std::env::var("PROXY_SERVER_URL").unwrap_or_else(|_| DEFAULT_PROXY_URL.to_string());

        let base_secs = env_secs("PROXY_RECONNECT_DELAY_SECS")?;
        let max_secs = env_secs("PROXY_RECONNECT_MAX_DELAY_SECS")?;
        let timeout_secs = env_secs("PROXY_CONNECT_TIMEOUT_SECS")?;

        let base_delay = base_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);
        let max_delay = max_secs.map(Duration::from_secs).unwrap_or(base_delay);

        let config = Self {
            url,
            reconnect: ReconnectConfig {
                base_delay,
                max_delay,
            },
            decode_error_policy: DecodeErrorPolicy::default(),
            connect_timeout: timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the decode error policy.
    pub fn with_decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }

    /// Set the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check that the URL parses and uses a websocket scheme.
    ///
    /// `wss` connects over rustls with the webpki root certificates.
    pub fn validate(&self) -> ProxyResult<()> {
        let parsed = Url::parse(&self.url)?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ProxyError::Config(format!(
                    "unsupported URL scheme '{}', expected ws or wss",
                    other
                )))
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(ProxyError::Config("connect timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

fn env_secs(name: &str) -> ProxyResult<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProxyError::Config(format!("{} must be a whole number of seconds", name))),
        Err(_) => Ok(None),
    }
}
