use std::fmt;
use std::time::Duration;

use crate::ExecutionLimits;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

pub const FINANCE_SCHEMA: &str = "budget_app";

const MAX_POOL_SIZE: u32 = 16;

// No host field: connections always target LOOPBACK_HOST.
#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub query_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_rows: usize,
    pub pool_size: u32,
    pub enforce_schema: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            port: 5432,
            database: "money_stuff".to_string(),
            user: String::new(),
            password: String::new(),
            query_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_rows: 1000,
            pool_size: 5,
            enforce_schema: true,
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &LOOPBACK_HOST)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("query_timeout", &self.query_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_rows", &self.max_rows)
            .field("pool_size", &self.pool_size)
            .field("enforce_schema", &self.enforce_schema)
            .finish()
    }
}

impl DbConfig {
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_enforce_schema(mut self, enforce: bool) -> Self {
        self.enforce_schema = enforce;
        self
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: self.query_timeout.max(Duration::from_millis(1)),
            max_rows: self.max_rows.max(1),
        }
    }

    pub(crate) fn effective_pool_size(&self) -> u32 {
        self.pool_size.clamp(1, MAX_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let config = DbConfig::new("money_stuff", "alice").with_password("hunter2");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("127.0.0.1"));
    }

    #[test]
    fn limits_never_zero() {
        let config = DbConfig::default()
            .with_max_rows(0)
            .with_query_timeout(Duration::ZERO);
        let limits = config.limits();
        assert_eq!(limits.max_rows, 1);
        assert!(limits.timeout > Duration::ZERO);
    }

    #[test]
    fn pool_size_is_bounded() {
        assert_eq!(DbConfig::default().with_pool_size(0).effective_pool_size(), 1);
        assert_eq!(DbConfig::default().with_pool_size(500).effective_pool_size(), 16);
        assert_eq!(DbConfig::default().effective_pool_size(), 5);
    }
}
