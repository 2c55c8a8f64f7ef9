use dotenv::dotenv;
use std::env;

/// Process-wide environment configuration. Loaded once at start-up and
/// handed to every route/task via `web::Data`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub broker_ws_url: String,
    pub broker_bearer_token: String,
    pub app_mode: String,
    pub jwt_secret: String,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok(); // loads `.env` file automatically

        let server_port = env::var("SERVER_PORT")
            .map_err(|_| "SERVER_PORT missing from env")?
            .parse::<u16>()
            .map_err(|_| "SERVER_PORT must be a valid u16")?;

        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL missing")?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let broker_ws_url = env::var("BROKER_WS_URL").map_err(|_| "BROKER_WS_URL missing")?;
        let broker_bearer_token =
            env::var("BROKER_BEARER_TOKEN").map_err(|_| "BROKER_BEARER_TOKEN missing")?;
        let app_mode = env::var("APP_MODE")
            .unwrap_or_else(|_| "live".into())
            .to_lowercase();
        let jwt_secret = env::var("SESSION_JWT_SECRET").unwrap_or_default();

        Ok(Self {
            server_port,
            database_url,
            redis_url,
            broker_ws_url,
            broker_bearer_token,
            app_mode,
            jwt_secret,
        })
    }

    pub fn is_demo(&self) -> bool {
        self.app_mode == "demo"
    }
}

/// The tunables enumerated in the wire spec's configuration surface.
/// Every field is overridable via environment for ops tuning without a
/// redeploy, and falls back to its documented default otherwise.
#[derive(Debug, Clone, Copy)]
pub struct FeedConfig {
    pub live_window_half_width: u32,
    pub flush_interval_ms: u64,
    pub health_interval_ms: u64,
    pub atm_hysteresis_ms: i64,
    pub atm_rebuild_settle_ms: u64,
    pub reset_deadline_ms: u64,
    pub outbound_queue_cap: usize,
    pub analytics_worker_count: usize,
    pub analytics_min_interval_ms: i64,
    pub analytics_soft_deadline_ms: u64,
    pub idle_session_timeout_s: u64,
    pub heartbeat_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    pub broker_reconnect_base_ms: u64,
    pub broker_reconnect_cap_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            live_window_half_width: 8,
            flush_interval_ms: 200,
            health_interval_ms: 1000,
            atm_hysteresis_ms: 250,
            atm_rebuild_settle_ms: 500,
            reset_deadline_ms: 5000,
            outbound_queue_cap: 64,
            analytics_worker_count: default_worker_count(),
            analytics_min_interval_ms: 1000,
            analytics_soft_deadline_ms: 50,
            idle_session_timeout_s: 1200,
            heartbeat_interval_s: 20,
            heartbeat_timeout_s: 30,
            broker_reconnect_base_ms: 500,
            broker_reconnect_cap_ms: 30_000,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1).min(4))
        .unwrap_or(2)
}

impl FeedConfig {
    /// Build from environment, falling back field-by-field to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            live_window_half_width: env_or("FEED_LIVE_WINDOW_HALF_WIDTH", d.live_window_half_width),
            flush_interval_ms: env_or("FEED_FLUSH_INTERVAL_MS", d.flush_interval_ms),
            health_interval_ms: env_or("FEED_HEALTH_INTERVAL_MS", d.health_interval_ms),
            atm_hysteresis_ms: env_or("FEED_ATM_HYSTERESIS_MS", d.atm_hysteresis_ms),
            atm_rebuild_settle_ms: env_or("FEED_ATM_REBUILD_SETTLE_MS", d.atm_rebuild_settle_ms),
            reset_deadline_ms: env_or("FEED_RESET_DEADLINE_MS", d.reset_deadline_ms),
            outbound_queue_cap: env_or("FEED_OUTBOUND_QUEUE_CAP", d.outbound_queue_cap),
            analytics_worker_count: env_or("FEED_ANALYTICS_WORKER_COUNT", d.analytics_worker_count),
            analytics_min_interval_ms: env_or(
                "FEED_ANALYTICS_MIN_INTERVAL_MS",
                d.analytics_min_interval_ms,
            ),
            analytics_soft_deadline_ms: env_or(
                "FEED_ANALYTICS_SOFT_DEADLINE_MS",
                d.analytics_soft_deadline_ms,
            ),
            idle_session_timeout_s: env_or("FEED_IDLE_SESSION_TIMEOUT_S", d.idle_session_timeout_s),
            heartbeat_interval_s: env_or("FEED_HEARTBEAT_INTERVAL_S", d.heartbeat_interval_s),
            heartbeat_timeout_s: env_or("FEED_HEARTBEAT_TIMEOUT_S", d.heartbeat_timeout_s),
            broker_reconnect_base_ms: env_or(
                "FEED_BROKER_RECONNECT_BASE_MS",
                d.broker_reconnect_base_ms,
            ),
            broker_reconnect_cap_ms: env_or(
                "FEED_BROKER_RECONNECT_CAP_MS",
                d.broker_reconnect_cap_ms,
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_config_surface() {
        let c = FeedConfig::default();
        assert_eq!(c.live_window_half_width, 8);
        assert_eq!(c.flush_interval_ms, 200);
        assert_eq!(c.health_interval_ms, 1000);
        assert_eq!(c.atm_hysteresis_ms, 250);
        assert_eq!(c.reset_deadline_ms, 5000);
        assert_eq!(c.outbound_queue_cap, 64);
        assert_eq!(c.analytics_min_interval_ms, 1000);
        assert_eq!(c.idle_session_timeout_s, 1200);
        assert_eq!(c.heartbeat_interval_s, 20);
        assert_eq!(c.heartbeat_timeout_s, 30);
        assert_eq!(c.broker_reconnect_base_ms, 500);
        assert_eq!(c.broker_reconnect_cap_ms, 30_000);
    }

    #[test]
    fn worker_count_is_bounded_between_one_and_four() {
        let n = default_worker_count();
        assert!((1..=4).contains(&n));
    }

    #[test]
    fn env_or_falls_back_on_missing_or_unparsable() {
        assert_eq!(env_or::<u64>("FEED_CONFIG_TEST_MISSING_VAR", 42), 42);
    }
}
