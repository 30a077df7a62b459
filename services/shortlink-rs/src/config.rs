use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

/// Short-code generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGenStrategy {
    Random,
    Snowflake,
}

impl IdGenStrategy {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "snowflake" => Self::Snowflake,
            _ => Self::Random,
        }
    }
}

/// All configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub log_level: String,

    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,

    pub base_url: String,
    pub short_code_len: usize,
    pub idgen_strategy: IdGenStrategy,
    pub idgen_max_retries: i32,
    pub idgen_node_id: u16,
    pub expiry_sweep_interval: Duration,

    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub trust_proxy: bool,
    pub trusted_proxies: Vec<IpAddr>,
    pub api_key_header: Option<String>,

    pub max_url_length: usize,
    pub allow_private_ips: bool,
    pub blocked_hosts: HashSet<String>,

    pub database_url: String,
    pub redis_url: Option<String>,

    pub click_flush_interval: Duration,
    pub click_batch_size: usize,
    pub click_channel_buffer: usize,
}

fn env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("Missing env var: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(v.trim()).ok())
        .unwrap_or(default)
}

/// Splits a comma-separated value, trimming and dropping empties.
pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_proxies(raw: &str) -> Vec<IpAddr> {
    parse_csv(raw)
        .into_iter()
        .filter_map(|s| match s.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(value = %s, "ignoring unparseable trusted proxy");
                None
            }
        })
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let api_key_header = std::env::var("RATE_LIMIT_API_KEY_HEADER")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Ok(Self {
            app_env: env_or("APP_ENV", "development"),
            log_level: env_or("APP_LOG_LEVEL", "info"),

            host: env_or("SERVER_HOST", "0.0.0.0"),
            port: env_parse("SERVER_PORT", 8080),
            read_timeout: env_duration("SERVER_READ_TIMEOUT", Duration::from_secs(10)),
            write_timeout: env_duration("SERVER_WRITE_TIMEOUT", Duration::from_secs(20)),
            shutdown_timeout: env_duration("SERVER_SHUTDOWN_TIMEOUT", Duration::from_secs(30)),

            base_url: env_or("URL_BASE_URL", "http://localhost:8080"),
            short_code_len: env_parse("URL_SHORT_CODE_LEN", 7),
            idgen_strategy: IdGenStrategy::parse(&env_or("URL_IDGEN_STRATEGY", "random")),
            idgen_max_retries: env_parse("URL_IDGEN_MAX_RETRIES", 3),
            idgen_node_id: env_parse("URL_IDGEN_NODE_ID", 0),
            expiry_sweep_interval: env_duration("URL_EXPIRY_SWEEP_INTERVAL", Duration::from_secs(600)),

            rate_limit_enabled: env_parse("RATE_LIMIT_ENABLED", true),
            rate_limit_requests: env_parse("RATE_LIMIT_REQUESTS", 100),
            rate_limit_window: env_duration("RATE_LIMIT_WINDOW", Duration::from_secs(60)),
            trust_proxy: env_parse("RATE_LIMIT_TRUST_PROXY", false),
            trusted_proxies: parse_proxies(&env_or("RATE_LIMIT_TRUSTED_PROXIES", "")),
            api_key_header,

            max_url_length: env_parse("SECURITY_MAX_URL_LENGTH", 2048),
            allow_private_ips: env_parse("SECURITY_ALLOW_PRIVATE_IPS", false),
            blocked_hosts: parse_csv(&env_or("SECURITY_BLOCKED_HOSTS", ""))
                .into_iter()
                .collect(),

            database_url: env("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),

            click_flush_interval: env_duration("CLICK_FLUSH_INTERVAL", Duration::from_secs(10)),
            click_batch_size: env_parse("CLICK_BATCH_SIZE", 100),
            click_channel_buffer: env_parse("CLICK_CHANNEL_BUFFER", 10_000),
        })
    }
}
