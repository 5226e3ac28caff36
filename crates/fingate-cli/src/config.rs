use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use fingate_store::DbConfig;
use tracing::warn;

pub const DEFAULT_DATABASE: &str = "money_stuff";
pub const DEFAULT_PORT: u16 = 5432;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?} is invalid: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

pub fn from_env() -> Result<DbConfig, ConfigError> {
    load(|key| std::env::var(key).ok())
}

pub fn load<F>(lookup: F) -> Result<DbConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(host) = get("DB_HOST") {
        if !is_loopback(&host) {
            warn!(host = %host, "DB_HOST is not a loopback address; ignoring it and using 127.0.0.1");
        }
    }

    let user = get("DB_USER").unwrap_or_default();
    if user.is_empty() {
        warn!("DB_USER not set in environment. Set it in your .env file.");
    }

    let mut config = DbConfig::new(get("DB_NAME").unwrap_or_else(|| DEFAULT_DATABASE.to_string()), user)
        .with_port(parse(&get, "DB_PORT", "expected a port number")?.unwrap_or(DEFAULT_PORT))
        // Password whitespace is significant.
        .with_password(lookup("DB_PASSWORD").unwrap_or_default());

    if let Some(secs) = parse::<u64, _>(&get, "FINGATE_QUERY_TIMEOUT_SECS", "expected whole seconds")? {
        config = config.with_query_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = parse::<u64, _>(&get, "FINGATE_CONNECT_TIMEOUT_SECS", "expected whole seconds")? {
        config = config.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(rows) = parse(&get, "FINGATE_MAX_ROWS", "expected a row count")? {
        config = config.with_max_rows(rows);
    }
    if let Some(size) = parse(&get, "FINGATE_POOL_SIZE", "expected a pool size")? {
        config = config.with_pool_size(size);
    }
    if let Some(raw) = get("FINGATE_ENFORCE_SCHEMA") {
        config = config.with_enforce_schema(parse_bool(&raw).ok_or(ConfigError {
            var: "FINGATE_ENFORCE_SCHEMA",
            value: raw,
            reason: "expected true or false",
        })?);
    }
    Ok(config)
}

fn parse<T, G>(get: &G, var: &'static str, reason: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError { var, value, reason }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
