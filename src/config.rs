use std::env;

/// Registry-wide configuration. All values read from environment variables with
/// sensible defaults, then threaded into Rocket managed state.
///
/// Environment variables:
/// - `TRUSTED_MODE` — Evaluate sender policies on plaintext payloads (default: true)
/// - `SELF_HOSTED` — Permit callback URLs on private/link-local hosts (default: false)
/// - `MAX_PAYLOAD_SIZE` — Max message payload in bytes (default: 32768)
/// - `MAX_RETRIES` — Delivery retry budget per message/recipient (default: 5)
/// - `CALLBACK_TIMEOUT_SECS` — Outbound callback timeout (default: 30)
/// - `PING_TIMEOUT_SECS` — Agent ping timeout (default: 5)
/// - `RETRY_SWEEP_INTERVAL_MS` — Retry processor wake interval (default: 1000)
/// - `RATE_LIMIT_MESSAGES` — Token-bucket refill per user per minute (default: 100)
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub trusted_mode: bool,
    pub self_hosted: bool,
    pub max_payload_bytes: usize,
    pub max_retries: i64,
    pub callback_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub retry_sweep_interval_ms: u64,
    pub rate_limit_per_minute: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            trusted_mode: true,
            self_hosted: false,
            max_payload_bytes: 32 * 1024,
            max_retries: 5,
            callback_timeout_secs: 30,
            ping_timeout_secs: 5,
            retry_sweep_interval_ms: 1000,
            rate_limit_per_minute: 100,
        }
    }
}

impl RegistryConfig {
    /// Create a RegistryConfig from environment variables, with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("TRUSTED_MODE") {
            config.trusted_mode = val != "0" && val.to_lowercase() != "false";
        }
        if let Ok(val) = env::var("SELF_HOSTED") {
            config.self_hosted = val == "1" || val.to_lowercase() == "true";
        }
        if let Ok(val) = env::var("MAX_PAYLOAD_SIZE")
            && let Ok(n) = val.parse::<usize>()
        {
            config.max_payload_bytes = n;
        }
        if let Ok(val) = env::var("MAX_RETRIES")
            && let Ok(n) = val.parse::<i64>()
        {
            config.max_retries = n;
        }
        if let Ok(val) = env::var("CALLBACK_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.callback_timeout_secs = n;
        }
        if let Ok(val) = env::var("PING_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.ping_timeout_secs = n;
        }
        if let Ok(val) = env::var("RETRY_SWEEP_INTERVAL_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.retry_sweep_interval_ms = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_MESSAGES")
            && let Ok(n) = val.parse::<usize>()
        {
            config.rate_limit_per_minute = n;
        }

        config
    }
}
