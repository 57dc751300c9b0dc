/// Server configuration, read from the environment with defaults
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Shared handshake token. Empty accepts any non-empty client token.
    pub auth_token: String,

    pub ping_interval_secs: u64,
    pub cleanup_interval_secs: u64,

    /// A connection with no successful ping send for this long is dead.
    pub dead_connection_secs: u64,

    /// A participant idle this long is considered to have left.
    pub idle_participant_secs: u64,

    pub ai_timeout_secs: u64,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            auth_token: String::new(),
            ping_interval_secs: 30,
            cleanup_interval_secs: 300,
            dead_connection_secs: 90,
            idle_participant_secs: 1_800,
            ai_timeout_secs: 5,
            event_capacity: 1_024,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("COLLAB_BIND_ADDR", &defaults.bind_addr),
            auth_token: env_string("COLLAB_AUTH_TOKEN", &defaults.auth_token),
            ping_interval_secs: env_u64("COLLAB_PING_INTERVAL_SECS", defaults.ping_interval_secs),
            cleanup_interval_secs: env_u64(
                "COLLAB_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval_secs,
            ),
            dead_connection_secs: env_u64(
                "COLLAB_DEAD_CONNECTION_SECS",
                defaults.dead_connection_secs,
            ),
            idle_participant_secs: env_u64(
                "COLLAB_IDLE_PARTICIPANT_SECS",
                defaults.idle_participant_secs,
            ),
            ai_timeout_secs: env_u64("COLLAB_AI_TIMEOUT_SECS", defaults.ai_timeout_secs),
            event_capacity: env_u64("COLLAB_EVENT_CAPACITY", defaults.event_capacity as u64)
                as usize,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn dead_connection_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dead_connection_secs as i64)
    }

    pub fn idle_participant_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_participant_secs as i64)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.idle_participant_after(), chrono::Duration::minutes(30));
        assert!(config.auth_token.is_empty());
    }
}
