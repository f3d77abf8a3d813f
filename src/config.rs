//! Server configuration loaded from the environment

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// QUIC listen address
    pub bind_addr: SocketAddr,
    /// HTTP address for /health and /info
    pub http_addr: SocketAddr,
    /// Store connection string (surfaced by /health)
    pub store_url: String,
    /// Signing key material for the token verifier seam
    pub token_key: String,
    /// Allowed client origins for the HTTP surface; empty means any
    pub allowed_origins: Vec<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// QUIC idle timeout
    pub idle_timeout: Duration,
    /// Heartbeat ping interval
    pub heartbeat_interval: Duration,
    /// Grace past the interval before a silent session is rejected
    pub heartbeat_timeout: Duration,
    /// Delay between last-session loss and search cancellation
    pub disconnect_grace: Duration,
    /// How long a disconnected user's room set is remembered
    pub room_retention: Duration,
    /// Window in which a reconnect recovers the previous session
    pub recovery_window: Duration,
    /// Stats snapshot freshness
    pub stats_cache_ttl: Duration,
    /// Stats broadcast debounce
    pub stats_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4433".parse().unwrap(),
            http_addr: ([0, 0, 0, 0], 8080).into(),
            store_url: "memory://local".to_string(),
            token_key: String::new(),
            allowed_origins: Vec::new(),
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(20),
            disconnect_grace: Duration::from_secs(10),
            room_retention: Duration::from_secs(120),
            recovery_window: Duration::from_secs(120),
            stats_cache_ttl: Duration::from_secs(5),
            stats_debounce: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TANDEM_BIND_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.bind_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid TANDEM_BIND_ADDR, using default");
            }
        }

        if let Ok(addr) = std::env::var("TANDEM_HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid TANDEM_HTTP_ADDR, using default");
            }
        }

        if let Ok(url) = std::env::var("TANDEM_STORE_URL") {
            if !url.is_empty() {
                config.store_url = url;
            }
        }

        if let Ok(key) = std::env::var("TANDEM_TOKEN_KEY") {
            config.token_key = key;
        }

        if let Ok(origins) = std::env::var("TANDEM_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("TANDEM_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_connections = n;
            }
        }

        config.idle_timeout = env_secs("TANDEM_IDLE_TIMEOUT_SECS", config.idle_timeout);
        config.heartbeat_interval =
            env_secs("TANDEM_HEARTBEAT_INTERVAL_SECS", config.heartbeat_interval);
        config.heartbeat_timeout = env_secs("TANDEM_HEARTBEAT_TIMEOUT_SECS", config.heartbeat_timeout);
        config.disconnect_grace = env_secs("TANDEM_DISCONNECT_GRACE_SECS", config.disconnect_grace);
        config.room_retention = env_secs("TANDEM_ROOM_RETENTION_SECS", config.room_retention);
        config.recovery_window = env_secs("TANDEM_RECOVERY_WINDOW_SECS", config.recovery_window);
        config.stats_cache_ttl = env_secs("TANDEM_STATS_CACHE_TTL_SECS", config.stats_cache_ttl);
        config.stats_debounce = env_secs("TANDEM_STATS_DEBOUNCE_SECS", config.stats_debounce);

        config
    }
}

fn env_secs(key: &str, fallback: Duration) -> Duration {
    match std::env::var(key) {
        Ok(val) => match val.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!(key, value = %val, "Invalid duration, using default");
                fallback
            }
        },
        Err(_) => fallback,
    }
}
