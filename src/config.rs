//! Crosstalk configuration
//!
//! All delivery tunables live here. Defaults match the values the web
//! client was tuned against; every field can be overridden through a
//! `CROSSTALK_*` environment variable.

use std::time::Duration;

/// Delivery tunables shared by the hub and every connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum inbound frame size in bytes. Oversized frames are
    /// connection-fatal.
    pub max_frame_size: usize,
    /// Outbound queue depth per connection, in frames. A full queue gets
    /// the connection evicted, never blocked on.
    pub outbound_queue_depth: usize,
    /// Deadline for a single write to the wire.
    pub write_deadline: Duration,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// How long the peer may stay silent (no pong, no data) before the
    /// connection is presumed dead.
    pub silence_window: Duration,
    /// Maximum chat message content length in bytes. Longer messages are
    /// rejected, not truncated.
    pub max_content_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 4096,
            outbound_queue_depth: 256,
            write_deadline: Duration::from_secs(10),
            // 9/10 of the silence window, so a healthy peer always sees a
            // ping before the window elapses.
            ping_interval: Duration::from_secs(54),
            silence_window: Duration::from_secs(60),
            max_content_len: 4000,
        }
    }
}

impl Config {
    /// Build a config from `CROSSTALK_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("CROSSTALK_MAX_FRAME_SIZE")? {
            config.max_frame_size = v;
        }
        if let Some(v) = env_parse::<usize>("CROSSTALK_QUEUE_DEPTH")? {
            config.outbound_queue_depth = v;
        }
        if let Some(v) = env_parse::<u64>("CROSSTALK_WRITE_DEADLINE_MS")? {
            config.write_deadline = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("CROSSTALK_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("CROSSTALK_SILENCE_WINDOW_SECS")? {
            config.silence_window = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("CROSSTALK_MAX_CONTENT_LEN")? {
            config.max_content_len = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "CROSSTALK_QUEUE_DEPTH",
                "must be at least 1",
            ));
        }
        if self.ping_interval >= self.silence_window {
            return Err(ConfigError::Invalid(
                "CROSSTALK_PING_INTERVAL_SECS",
                "must be shorter than the silence window",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, "failed to parse")),
        Err(_) => Ok(None),
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.outbound_queue_depth, 256);
        assert_eq!(config.max_content_len, 4000);
        assert!(config.ping_interval < config.silence_window);
    }

    #[test]
    fn test_ping_must_beat_silence_window() {
        let config = Config {
            ping_interval: Duration::from_secs(60),
            silence_window: Duration::from_secs(60),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = Config {
            outbound_queue_depth: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
