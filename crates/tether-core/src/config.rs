//! Lifecycle timeout windows.
//!
//! Every asynchronous lifecycle step gets a timer armed when the step
//! begins and cancelled by its completion report. The windows here are the
//! deserialized knobs; scheduling lives in the broker crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout windows for the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Window for a dispatched load to attach.
    #[serde(default = "default_load_timeout")]
    #[serde(with = "humantime_serde")]
    pub load: Duration,

    /// Window for a dispatched connect to report done.
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect: Duration,

    /// Window for a dispatched command to report done.
    #[serde(default = "default_command_timeout")]
    #[serde(with = "humantime_serde")]
    pub command: Duration,

    /// Window for an attached target to report itself inactive.
    #[serde(default = "default_inactive_timeout")]
    #[serde(with = "humantime_serde")]
    pub inactive: Duration,

    /// Window for a foreground move to complete.
    #[serde(default = "default_foreground_timeout")]
    #[serde(with = "humantime_serde")]
    pub foreground: Duration,

    /// Window for a background move to complete.
    #[serde(default = "default_background_timeout")]
    #[serde(with = "humantime_serde")]
    pub background: Duration,

    /// Window for a dispatched terminate to report done.
    #[serde(default = "default_terminate_timeout")]
    #[serde(with = "humantime_serde")]
    pub terminate: Duration,

    /// Window a queued start request may wait for an in-flight load before
    /// the queue is dropped with a diagnostic.
    #[serde(default = "default_queued_start_timeout")]
    #[serde(with = "humantime_serde")]
    pub queued_start: Duration,

    /// Deadline for the synchronous prepare-terminate query; on expiry the
    /// caller proceeds with the default answer.
    #[serde(default = "default_prepare_terminate_timeout")]
    #[serde(with = "humantime_serde")]
    pub prepare_terminate: Duration,
}

const fn default_load_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_inactive_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_foreground_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_background_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_terminate_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_queued_start_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_prepare_terminate_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            load: default_load_timeout(),
            connect: default_connect_timeout(),
            command: default_command_timeout(),
            inactive: default_inactive_timeout(),
            foreground: default_foreground_timeout(),
            background: default_background_timeout(),
            terminate: default_terminate_timeout(),
            queued_start: default_queued_start_timeout(),
            prepare_terminate: default_prepare_terminate_timeout(),
        }
    }
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.load, Duration::from_secs(10));
        assert_eq!(config.connect, Duration::from_secs(3));
        assert!(config.queued_start > config.load);
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: TimeoutConfig =
            serde_json::from_str(r#"{"load": "30s", "connect": "500ms"}"#).unwrap();
        assert_eq!(config.load, Duration::from_secs(30));
        assert_eq!(config.connect, Duration::from_millis(500));
        // Unset fields fall back to defaults.
        assert_eq!(config.terminate, Duration::from_secs(5));
    }
}
