// Realtime server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The timing and capacity knobs are forwarded to the service
// as `ServiceSettings`.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEV_JWT_SECRET: &str = "tandem_local_development_jwt_secret_must_be_32_chars";

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_ROOM_REAP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_ROOM_INACTIVITY_SECS: u64 = 60 * 60;
pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 300;
pub const DEFAULT_OFFLINE_MAX_EVENTS: usize = 1_000;
pub const DEFAULT_OFFLINE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 262_144;

/// Timing and capacity settings consumed by `RealtimeService`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// How often the heartbeat monitor sweeps connections.
    pub heartbeat_interval: Duration,
    /// Maximum ping age before a connection is considered dead.
    pub connection_timeout: Duration,
    /// How often the room reaper runs.
    pub room_reap_interval: Duration,
    /// Rooms idle for longer than this are reaped even with members.
    pub room_inactivity: Duration,
    /// TTL applied to every presence record write.
    pub presence_ttl: Duration,
    /// Capacity of each workspace's offline event log.
    pub offline_max_events: usize,
    /// TTL of each workspace's offline event log.
    pub offline_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            room_reap_interval: Duration::from_secs(DEFAULT_ROOM_REAP_INTERVAL_SECS),
            room_inactivity: Duration::from_secs(DEFAULT_ROOM_INACTIVITY_SECS),
            presence_ttl: Duration::from_secs(DEFAULT_PRESENCE_TTL_SECS),
            offline_max_events: DEFAULT_OFFLINE_MAX_EVENTS,
            offline_ttl: Duration::from_secs(DEFAULT_OFFLINE_TTL_SECS),
        }
    }
}

/// Core realtime server configuration.
///
/// Constructed via [`RealtimeConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the REST layer that issues tokens.
    pub jwt_secret: String,
    /// Expected `iss` claim, validated only when set.
    pub jwt_issuer: Option<String>,
    /// Expected `aud` claim, validated only when set.
    pub jwt_audience: Option<String>,
    /// Redis connection string for the shared cache.
    pub redis_url: Option<String>,
    /// Largest accepted WebSocket frame.
    pub max_frame_bytes: usize,
    /// Log filter directive (e.g. `info`, `tandem_realtime=debug`).
    pub log_filter: String,
    /// Emit JSON log lines instead of the human format.
    pub json_logs: bool,
    pub service: ServiceSettings,
}

impl RealtimeConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_REALTIME_HOST` | `0.0.0.0` |
    /// | `TANDEM_REALTIME_PORT` | `8081` |
    /// | `TANDEM_REALTIME_JWT_SECRET` | dev-only placeholder |
    /// | `TANDEM_REALTIME_JWT_ISSUER` | *(none)* |
    /// | `TANDEM_REALTIME_JWT_AUDIENCE` | *(none)* |
    /// | `TANDEM_REALTIME_REDIS_URL` | *(none, in-process cache)* |
    /// | `TANDEM_REALTIME_MAX_FRAME_BYTES` | `262144` |
    /// | `TANDEM_REALTIME_HEARTBEAT_INTERVAL_MS` | `5000` |
    /// | `TANDEM_REALTIME_CONNECTION_TIMEOUT_MS` | `60000` |
    /// | `TANDEM_REALTIME_ROOM_REAP_INTERVAL_SECS` | `600` |
    /// | `TANDEM_REALTIME_ROOM_INACTIVITY_SECS` | `3600` |
    /// | `TANDEM_REALTIME_PRESENCE_TTL_SECS` | `300` |
    /// | `TANDEM_REALTIME_OFFLINE_MAX_EVENTS` | `1000` |
    /// | `TANDEM_REALTIME_OFFLINE_TTL_SECS` | `604800` |
    /// | `TANDEM_REALTIME_LOG_FILTER` | `info` |
    /// | `TANDEM_REALTIME_LOG_FORMAT` | `text` (`json` for structured output) |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_REALTIME_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "TANDEM_REALTIME_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("TANDEM_REALTIME_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let jwt_issuer = non_empty(env("TANDEM_REALTIME_JWT_ISSUER").ok());
        let jwt_audience = non_empty(env("TANDEM_REALTIME_JWT_AUDIENCE").ok());
        let redis_url = non_empty(env("TANDEM_REALTIME_REDIS_URL").ok());

        let max_frame_bytes =
            parse_or(&env, "TANDEM_REALTIME_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES);
        let log_filter = env("TANDEM_REALTIME_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let json_logs = env("TANDEM_REALTIME_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let service = ServiceSettings {
            heartbeat_interval: Duration::from_millis(parse_or(
                &env,
                "TANDEM_REALTIME_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            connection_timeout: Duration::from_millis(parse_or(
                &env,
                "TANDEM_REALTIME_CONNECTION_TIMEOUT_MS",
                DEFAULT_CONNECTION_TIMEOUT_MS,
            )),
            room_reap_interval: Duration::from_secs(parse_or(
                &env,
                "TANDEM_REALTIME_ROOM_REAP_INTERVAL_SECS",
                DEFAULT_ROOM_REAP_INTERVAL_SECS,
            )),
            room_inactivity: Duration::from_secs(parse_or(
                &env,
                "TANDEM_REALTIME_ROOM_INACTIVITY_SECS",
                DEFAULT_ROOM_INACTIVITY_SECS,
            )),
            presence_ttl: Duration::from_secs(parse_or(
                &env,
                "TANDEM_REALTIME_PRESENCE_TTL_SECS",
                DEFAULT_PRESENCE_TTL_SECS,
            )),
            offline_max_events: parse_or(
                &env,
                "TANDEM_REALTIME_OFFLINE_MAX_EVENTS",
                DEFAULT_OFFLINE_MAX_EVENTS,
            ),
            offline_ttl: Duration::from_secs(parse_or(
                &env,
                "TANDEM_REALTIME_OFFLINE_TTL_SECS",
                DEFAULT_OFFLINE_TTL_SECS,
            )),
        };

        Self {
            listen_addr,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            redis_url,
            max_frame_bytes,
            log_filter,
            json_logs,
            service,
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        self.service
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialOrd + Default,
{
    env(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RealtimeConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8081);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.jwt_issuer.is_none());
        assert!(cfg.jwt_audience.is_none());
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.max_frame_bytes, 262_144);
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.json_logs);
        assert_eq!(cfg.service, ServiceSettings::default());
    }

    #[test]
    fn service_defaults_match_documented_values() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(settings.connection_timeout, Duration::from_secs(60));
        assert_eq!(settings.room_reap_interval, Duration::from_secs(600));
        assert_eq!(settings.room_inactivity, Duration::from_secs(3600));
        assert_eq!(settings.presence_ttl, Duration::from_secs(300));
        assert_eq!(settings.offline_max_events, 1000);
        assert_eq!(settings.offline_ttl, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("TANDEM_REALTIME_HOST", "127.0.0.1");
        m.insert("TANDEM_REALTIME_PORT", "3000");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_settings() {
        let mut m = HashMap::new();
        m.insert("TANDEM_REALTIME_JWT_SECRET", "production_secret_at_least_32_chars!!");
        m.insert("TANDEM_REALTIME_JWT_ISSUER", "tandem-api");
        m.insert("TANDEM_REALTIME_JWT_AUDIENCE", "");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
        assert_eq!(cfg.jwt_issuer.as_deref(), Some("tandem-api"));
        assert!(cfg.jwt_audience.is_none());
    }

    #[test]
    fn timing_overrides() {
        let mut m = HashMap::new();
        m.insert("TANDEM_REALTIME_HEARTBEAT_INTERVAL_MS", "1000");
        m.insert("TANDEM_REALTIME_CONNECTION_TIMEOUT_MS", "15000");
        m.insert("TANDEM_REALTIME_ROOM_INACTIVITY_SECS", "120");
        m.insert("TANDEM_REALTIME_OFFLINE_MAX_EVENTS", "50");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.service.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(cfg.service.connection_timeout, Duration::from_secs(15));
        assert_eq!(cfg.service.room_inactivity, Duration::from_secs(120));
        assert_eq!(cfg.service.offline_max_events, 50);
    }

    #[test]
    fn invalid_or_zero_numbers_use_defaults() {
        let mut m = HashMap::new();
        m.insert("TANDEM_REALTIME_PORT", "not_a_number");
        m.insert("TANDEM_REALTIME_HEARTBEAT_INTERVAL_MS", "0");
        m.insert("TANDEM_REALTIME_OFFLINE_MAX_EVENTS", "-5");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8081);
        assert_eq!(cfg.service.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.service.offline_max_events, 1000);
    }

    #[test]
    fn redis_url_and_log_format() {
        let mut m = HashMap::new();
        m.insert("TANDEM_REALTIME_REDIS_URL", "redis://cache:6379");
        m.insert("TANDEM_REALTIME_LOG_FORMAT", "JSON");
        m.insert("TANDEM_REALTIME_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert!(cfg.json_logs);
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
