use std::error::Error as _;
use std::io;
use std::net::IpAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use fingate_types::{
    DbStatus, ErrorKind, GatewayError, GatewayResult, QueryResult, TableStats, Unavailability,
    UNAVAILABLE_HINT,
};
use ::postgres::config::Host;
use ::postgres::error::SqlState;
use ::postgres::types::ToSql;
use ::postgres::{CancelToken, Client, Config, NoTls};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{debug, info, warn};

use crate::catalog::ParamType;
use crate::config::{DbConfig, FINANCE_SCHEMA, LOOPBACK_HOST};
use crate::shape::shape_rows;
use crate::{Backend, BoundValue, ExecutionLimits, Statement};

type PgManager = PostgresConnectionManager<NoTls>;

// Extra time the server gets to honour statement_timeout before the client
// sends its own cancel request.
pub(crate) const CANCEL_GRACE: Duration = Duration::from_millis(500);

const VERSION_SQL: &str = "SELECT current_setting('server_version') AS server_version";

const STATS_SQL: &str = "SELECT \
    (SELECT COUNT(*) FROM budget_app.transactions) AS total_transactions, \
    (SELECT COUNT(*) FROM budget_app.persons) AS total_persons, \
    (SELECT COUNT(*) FROM budget_app.spending_categories) AS total_categories";

pub struct PostgresBackend {
    config: DbConfig,
    pg_config: Config,
    pool: Mutex<Option<Pool<PgManager>>>,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("config", &self.config)
            .finish()
    }
}

impl PostgresBackend {
    pub fn new(config: DbConfig) -> GatewayResult<Self> {
        let pg_config = connect_config(&config);
        ensure_loopback(&pg_config)?;
        Ok(Self {
            config,
            pg_config,
            pool: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    fn pool(&self) -> GatewayResult<Pool<PgManager>> {
        if let Some(pool) = self.lock_pool()?.as_ref() {
            return Ok(pool.clone());
        }

        // Connect without holding the lock. A direct probe keeps the driver's
        // error, which the pool would flatten to text.
        let probe = self.pg_config.connect(NoTls).map_err(|err| {
            let mapped = classify_connect_error(&err, &self.config);
            warn!(error = %err, diagnosis = ?mapped.diagnosis, "database connection failed");
            mapped
        })?;
        drop(probe);

        let manager = PostgresConnectionManager::new(self.pg_config.clone(), NoTls);
        let built = Pool::builder()
            .max_size(self.config.effective_pool_size())
            .min_idle(Some(0))
            .connection_timeout(self.config.connect_timeout.max(Duration::from_millis(1)))
            .test_on_check_out(true)
            .build_unchecked(manager);

        let mut guard = self.lock_pool()?;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        info!(
            database = %self.config.database,
            port = self.config.port,
            pool_size = self.config.effective_pool_size(),
            "connected to database"
        );
        *guard = Some(built.clone());
        Ok(built)
    }

    fn lock_pool(&self) -> GatewayResult<MutexGuard<'_, Option<Pool<PgManager>>>> {
        self.pool
            .lock()
            .map_err(|_| GatewayError::execution("connection pool lock poisoned"))
    }

    fn acquire(&self) -> GatewayResult<PooledConnection<PgManager>> {
        let pool = self.pool()?;
        match pool.get() {
            Ok(conn) => Ok(conn),
            Err(err) => {
                warn!(error = %err, "connection checkout failed");
                match self.pg_config.connect(NoTls) {
                    Ok(_) => Err(GatewayError::unavailable(
                        Unavailability::Other,
                        "Timed out waiting for a free database connection",
                    )
                    .with_hint("Too many queries are running at once; try again shortly.")),
                    Err(probe_err) => {
                        self.reset();
                        Err(classify_connect_error(&probe_err, &self.config))
                    }
                }
            }
        }
    }

    fn reset(&self) {
        if let Ok(mut guard) = self.pool.lock() {
            if guard.take().is_some() {
                info!("database connection pool closed");
            }
        }
    }
}

impl Backend for PostgresBackend {
    fn fetch(&self, statement: Statement<'_>, limits: &ExecutionLimits) -> GatewayResult<QueryResult> {
        let mut conn = self.acquire()?;
        let started = Instant::now();
        let watchdog = Watchdog::arm(conn.cancel_token(), limits.timeout + CANCEL_GRACE);
        let outcome = run_read_only(&mut conn, statement, limits);
        let cancelled = watchdog.disarm();

        match outcome {
            Ok(result) => {
                debug!(
                    rows = result.row_count(),
                    truncated = result.truncated(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "query finished"
                );
                Ok(result)
            }
            Err(err) if cancelled && err.kind != ErrorKind::Timeout => {
                warn!(error = %err, "query cancelled by watchdog");
                Err(GatewayError::timeout(limits.timeout))
            }
            Err(err) => {
                if err.kind == ErrorKind::ConnectionUnavailable {
                    self.reset();
                }
                Err(err)
            }
        }
    }

    fn status(&self) -> DbStatus {
        let mut status = DbStatus {
            reachable: false,
            latency_ms: None,
            server_version: None,
            database: self.config.database.clone(),
            host: LOOPBACK_HOST.to_string(),
            schema: FINANCE_SCHEMA.to_string(),
            stats: None,
            stats_error: None,
            error: None,
            hint: None,
        };

        let mut conn = match self.acquire() {
            Ok(conn) => conn,
            Err(err) => {
                status.error = Some(err.message);
                status.hint = Some(UNAVAILABLE_HINT.to_string());
                return status;
            }
        };

        let limits = self.config.limits();
        let watchdog = Watchdog::arm(conn.cancel_token(), limits.timeout + CANCEL_GRACE);
        let started = Instant::now();
        let version = run_read_only(&mut conn, Statement::new(VERSION_SQL, &[]), &limits);
        match version {
            Ok(result) => {
                status.reachable = true;
                status.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                status.server_version = result
                    .rows()
                    .first()
                    .and_then(|row| row.first())
                    .and_then(|value| value.as_str())
                    .map(str::to_string);
            }
            Err(err) => {
                let cancelled = watchdog.disarm();
                let err = if cancelled { GatewayError::timeout(limits.timeout) } else { err };
                if err.kind == ErrorKind::ConnectionUnavailable {
                    self.reset();
                }
                status.error = Some(err.message);
                status.hint = Some(UNAVAILABLE_HINT.to_string());
                return status;
            }
        }

        let stats = run_read_only(&mut conn, Statement::new(STATS_SQL, &[]), &limits)
            .and_then(table_stats);
        let cancelled = watchdog.disarm();
        match stats {
            Ok(stats) => status.stats = Some(stats),
            Err(err) => {
                let err = if cancelled && err.kind != ErrorKind::Timeout {
                    GatewayError::timeout(limits.timeout)
                } else {
                    err
                };
                debug!(error = %err, "table statistics unavailable");
                status.stats_error = Some(err.message);
            }
        }
        status
    }
}

fn table_stats(result: QueryResult) -> GatewayResult<TableStats> {
    let count = |index: usize| {
        result
            .rows()
            .first()
            .and_then(|row| row.get(index))
            .and_then(|value| value.as_i64())
            .ok_or_else(|| GatewayError::execution("table statistics had an unexpected shape"))
    };
    Ok(TableStats {
        total_transactions: count(0)?,
        total_persons: count(1)?,
        total_categories: count(2)?,
    })
}

fn run_read_only(
    client: &mut Client,
    statement: Statement<'_>,
    limits: &ExecutionLimits,
) -> GatewayResult<QueryResult> {
    let map = |err| map_pg_err(err, limits.timeout);
    let mut tx = client.build_transaction().read_only(true).start().map_err(map)?;
    tx.batch_execute(&format!(
        "SET LOCAL statement_timeout = {}; SET LOCAL search_path TO {}",
        limits.timeout.as_millis().max(1),
        FINANCE_SCHEMA
    ))
    .map_err(map)?;

    let prepared = tx.prepare(statement.sql).map_err(map)?;
    let params = PgParams::bind(statement.params);
    let portal = tx.bind(&prepared, &params.refs()).map_err(map)?;
    let fetch = i32::try_from(limits.max_rows.saturating_add(1)).unwrap_or(i32::MAX);
    let mut rows = tx.query_portal(&portal, fetch).map_err(map)?;

    let truncated = rows.len() > limits.max_rows;
    rows.truncate(limits.max_rows);
    let result = shape_rows(prepared.columns(), &rows, truncated)?;

    if let Err(err) = tx.rollback() {
        debug!(error = %err, "read-only transaction rollback failed");
    }
    Ok(result)
}

struct PgParams {
    values: Vec<Box<dyn ToSql + Sync>>,
}

impl PgParams {
    fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn add<T: ToSql + Sync + 'static>(&mut self, value: T) {
        self.values.push(Box::new(value));
    }

    fn bind(values: &[BoundValue]) -> Self {
        let mut params = Self::new();
        for value in values {
            match value {
                BoundValue::Null(ParamType::Date) => params.add(None::<NaiveDate>),
                BoundValue::Null(ParamType::Integer) => params.add(None::<i64>),
                BoundValue::Null(ParamType::Float) => params.add(None::<f64>),
                BoundValue::Null(ParamType::Text) => params.add(None::<String>),
                BoundValue::Date(v) => params.add(*v),
                BoundValue::Integer(v) => params.add(*v),
                BoundValue::Float(v) => params.add(*v),
                BoundValue::Text(v) => params.add(v.clone()),
            }
        }
        params
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|value| &**value as &(dyn ToSql + Sync))
            .collect()
    }
}

struct Watchdog {
    done: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl Watchdog {
    fn arm(token: CancelToken, after: Duration) -> Self {
        let (done, finished) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("fingate-cancel".to_string())
            .spawn(move || match finished.recv_timeout(after) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(after_ms = after.as_millis() as u64, "query deadline passed, cancelling");
                    if let Err(err) = token.cancel_query(NoTls) {
                        warn!(error = %err, "cancel request failed");
                    }
                    true
                }
                _ => false,
            });
        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "could not start query watchdog");
                None
            }
        };
        Self {
            done: Some(done),
            handle,
        }
    }

    fn disarm(mut self) -> bool {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(false)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

fn connect_config(config: &DbConfig) -> Config {
    let mut pg = Config::new();
    pg.host(LOOPBACK_HOST)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .password(&config.password)
        .connect_timeout(config.connect_timeout)
        .application_name("fingate");
    pg
}

fn ensure_loopback(config: &Config) -> GatewayResult<()> {
    for host in config.get_hosts() {
        let loopback = match host {
            Host::Tcp(name) => {
                name == "localhost" || name.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
            }
            #[cfg(unix)]
            Host::Unix(_) => true,
        };
        if !loopback {
            return Err(GatewayError::unavailable(
                Unavailability::Other,
                "Refusing to connect to a non-loopback database host",
            ));
        }
    }
    Ok(())
}

fn classify_connect_error(err: &::postgres::Error, config: &DbConfig) -> GatewayError {
    if let Some(code) = err.code() {
        if *code == SqlState::INVALID_PASSWORD
            || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        {
            return GatewayError::unavailable(
                Unavailability::CredentialsRejected,
                "Invalid database credentials. Check DB_USER and DB_PASSWORD.",
            );
        }
        if *code == SqlState::INVALID_CATALOG_NAME {
            return GatewayError::unavailable(
                Unavailability::DatabaseMissing,
                format!(
                    "Database '{}' does not exist. Please create it first with: createdb {}",
                    config.database, config.database
                ),
            );
        }
    }

    let io_failure = err
        .source()
        .map(|source| source.downcast_ref::<io::Error>().is_some())
        .unwrap_or(false);
    if io_failure || err.is_closed() {
        return GatewayError::unavailable(
            Unavailability::Unreachable,
            format!(
                "Cannot connect to PostgreSQL at {}:{}. Is the database server running? \
                 If you're away from home, the database may not be accessible - this is expected behavior.",
                LOOPBACK_HOST, config.port
            ),
        );
    }

    GatewayError::unavailable(
        Unavailability::Other,
        format!("Database connection failed: {}", err),
    )
}

fn map_pg_err(err: ::postgres::Error, timeout: Duration) -> GatewayError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        return GatewayError::timeout(timeout);
    }
    if err.is_closed() {
        return GatewayError::unavailable(
            Unavailability::Unreachable,
            "The database connection was lost",
        );
    }
    match err.as_db_error() {
        Some(db) => GatewayError::execution(format!("Query failed: {}", db.message())),
        None => GatewayError::execution(format!("Query failed: {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> DbConfig {
        // Nothing listens on port 1 of the loopback interface.
        DbConfig::new("money_stuff", "nobody")
            .with_port(1)
            .with_connect_timeout(Duration::from_secs(2))
    }

    #[test]
    fn connect_config_targets_loopback() {
        let config = connect_config(&DbConfig::new("money_stuff", "alice").with_port(6543));
        assert!(ensure_loopback(&config).is_ok());
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_dbname(), Some("money_stuff"));
    }

    #[test]
    fn refuses_remote_hosts() {
        let mut config = Config::new();
        config.host("db.example.com");
        let err = ensure_loopback(&config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionUnavailable);

        let mut config = Config::new();
        config.host("10.0.0.5");
        assert!(ensure_loopback(&config).is_err());

        let mut config = Config::new();
        config.host("::1");
        assert!(ensure_loopback(&config).is_ok());
    }

    #[test]
    fn unreachable_store_reports_unavailable() {
        let backend = PostgresBackend::new(unreachable_config()).unwrap();
        let err = backend
            .fetch(Statement::new("SELECT 1", &[]), &ExecutionLimits::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionUnavailable);
        assert_eq!(err.diagnosis, Some(Unavailability::Unreachable));
        assert!(err.message.contains("127.0.0.1:1"));
        assert_eq!(err.hint.as_deref(), Some(UNAVAILABLE_HINT));
    }

    #[test]
    fn unreachable_status_does_not_fail() {
        let backend = PostgresBackend::new(unreachable_config()).unwrap();
        let started = Instant::now();
        let status = backend.status();
        assert!(!status.reachable);
        assert!(status.latency_ms.is_none());
        assert!(status.error.is_some());
        assert_eq!(status.host, "127.0.0.1");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn first_connections_are_attempted_concurrently() {
        // Accepts, stalls the handshake, then hangs up.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(500));
                    drop(stream);
                });
            }
        });

        let backend = PostgresBackend::new(
            DbConfig::new("money_stuff", "nobody")
                .with_port(port)
                .with_connect_timeout(Duration::from_secs(5)),
        )
        .unwrap();
        let started = Instant::now();
        let errors: Vec<GatewayError> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        backend
                            .fetch(Statement::new("SELECT 1", &[]), &ExecutionLimits::default())
                            .unwrap_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(errors.len(), 4);
        for err in &errors {
            assert_eq!(err.kind, ErrorKind::ConnectionUnavailable);
        }
        // Four attempts made one after another would take at least two seconds.
        assert!(started.elapsed() < Duration::from_millis(1500), "{:?}", started.elapsed());
    }

    #[test]
    fn binds_typed_nulls() {
        let params = PgParams::bind(&[
            BoundValue::Null(ParamType::Date),
            BoundValue::Integer(4),
            BoundValue::Text("Amazon".to_string()),
        ]);
        assert_eq!(params.refs().len(), 3);
    }
}
