// Live database connection used by the provisioner
//
// The installer runs before the application has a working database, so the connection is built
// from the submitted parameters, torn down whenever they change and asked which database it is
// actually attached to.
//
// LiveConnection trait: lets the provisioner tests drive connectivity failures deterministically
// without a real server.

use crate::models::requests::DatabaseParams;
use crate::utils::logging::mask_sensitive;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{MySql, Pool, Postgres};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

// =============================================================================
// LiveConnection trait
// =============================================================================

/// Error returned by connection attempts.
/// Keeps user-friendly messages separate from internal details.
#[derive(Debug, Clone)]
pub struct ConnectError {
    /// User-friendly message (safe to show in UI)
    pub user_message: String,
    /// Internal details for logging and verbose mode
    pub internal_details: String,
    pub timed_out: bool,
}

impl ConnectError {
    fn unreachable(internal_details: impl Into<String>) -> Self {
        Self {
            user_message: "Unable to connect. Verify host, credentials, and network access."
                .to_string(),
            internal_details: internal_details.into(),
            timed_out: false,
        }
    }

    fn timeout(internal_details: impl Into<String>) -> Self {
        Self {
            user_message: "Connection timed out. Check network connectivity and firewall."
                .to_string(),
            internal_details: internal_details.into(),
            timed_out: true,
        }
    }
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ConnectError {}

/// Handle on the application's live database connection.
/// Production code uses SqlxLiveConnection; tests use stubs.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    /// Point the handle at new parameters, discarding any pooled connection.
    async fn reconfigure(&self, params: &DatabaseParams) -> Result<(), ConnectError>;

    /// Name of the database the (re)opened connection is attached to.
    async fn current_database(&self) -> Result<String, ConnectError>;
}

// =============================================================================
// sqlx implementation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseDriver {
    MySql,
    Postgres,
}

impl DatabaseDriver {
    /// Map the application's connection name onto a driver we can probe.
    pub fn from_connection(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(DatabaseDriver::MySql),
            "pgsql" | "postgres" | "postgresql" => Some(DatabaseDriver::Postgres),
            _ => None,
        }
    }
}

/// Database connection enum supporting both MySQL-family servers and PostgreSQL
#[derive(Clone)]
pub enum DatabaseConnection {
    MySql(Pool<MySql>),
    Postgres(Pool<Postgres>),
}

impl DatabaseConnection {
    pub async fn open(params: &DatabaseParams, acquire_timeout: Duration) -> Result<Self> {
        let driver = DatabaseDriver::from_connection(&params.connection)
            .ok_or_else(|| anyhow!("Unsupported database connection '{}'", params.connection))?;
        let port: u16 = params
            .port
            .trim()
            .parse()
            .with_context(|| format!("Invalid database port '{}'", params.port))?;

        match driver {
            DatabaseDriver::Postgres => {
                let opts = PgConnectOptions::new()
                    .host(&params.host)
                    .port(port)
                    .username(&params.username)
                    .password(&params.password)
                    .database(&params.database);
                let pool = PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(opts)
                    .await?;
                Ok(DatabaseConnection::Postgres(pool))
            }
            DatabaseDriver::MySql => {
                let opts = MySqlConnectOptions::new()
                    .host(&params.host)
                    .port(port)
                    .username(&params.username)
                    .password(&params.password)
                    .database(&params.database);
                let pool = MySqlPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(opts)
                    .await?;
                Ok(DatabaseConnection::MySql(pool))
            }
        }
    }

    pub async fn current_database(&self) -> Result<String> {
        match self {
            DatabaseConnection::Postgres(pool) => {
                let name: String = sqlx::query_scalar("SELECT current_database()::text")
                    .fetch_one(pool)
                    .await?;
                Ok(name)
            }
            DatabaseConnection::MySql(pool) => {
                let name: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
                    .fetch_one(pool)
                    .await?;
                Ok(name.unwrap_or_default())
            }
        }
    }

    pub async fn close(&self) {
        match self {
            DatabaseConnection::Postgres(pool) => pool.close().await,
            DatabaseConnection::MySql(pool) => pool.close().await,
        }
    }
}

fn is_transient(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("network")
        || msg.contains("i/o")
        || msg.contains("reset")
        || msg.contains("refused")
}

/// Run `attempt` with exponential backoff, retrying only transient failures.
pub async fn retry_transient<T, F, Fut>(retries: usize, attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(100)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(retries.saturating_sub(1))
        .map(jitter);

    RetryIf::spawn(retry_strategy, attempt, is_transient).await
}

struct LiveState {
    params: Option<DatabaseParams>,
    conn: Option<DatabaseConnection>,
}

/// Production live connection backed by a single-connection sqlx pool.
pub struct SqlxLiveConnection {
    state: Mutex<LiveState>,
    connect_timeout: Duration,
    retries: usize,
}

impl SqlxLiveConnection {
    pub fn new(connect_timeout: Duration, retries: usize) -> Self {
        Self {
            state: Mutex::new(LiveState {
                params: None,
                conn: None,
            }),
            connect_timeout,
            retries: retries.max(1),
        }
    }

    async fn connect(&self, params: &DatabaseParams) -> Result<DatabaseConnection, ConnectError> {
        let connect_timeout = self.connect_timeout;
        let attempt = || async move {
            let timed = timeout(connect_timeout, DatabaseConnection::open(params, connect_timeout))
                .await;
            timed.map_err(|_| anyhow!("Connection attempt timed out"))?
        };

        retry_transient(self.retries, attempt).await.map_err(|e| {
            let details = mask_sensitive_params(&format!("{:#}", e), params);
            warn!(
                "[PHASE: provisioning] [STEP: connectivity] Connection failed (host={}, port={}, database={}): {}",
                params.host, params.port, params.database, details
            );
            if details.to_ascii_lowercase().contains("timed out") {
                ConnectError::timeout(details)
            } else {
                ConnectError::unreachable(details)
            }
        })
    }
}

fn mask_sensitive_params(message: &str, params: &DatabaseParams) -> String {
    if params.password.is_empty() {
        return message.to_string();
    }
    message.replace(&params.password, &mask_sensitive(&params.password))
}

#[async_trait]
impl LiveConnection for SqlxLiveConnection {
    async fn reconfigure(&self, params: &DatabaseParams) -> Result<(), ConnectError> {
        let mut state = self.state.lock().await;
        if let Some(old) = state.conn.take() {
            debug!("[PHASE: provisioning] [STEP: connectivity] Purging previous connection pool");
            old.close().await;
        }
        state.params = Some(params.clone());
        info!(
            "[PHASE: provisioning] [STEP: connectivity] Live connection reconfigured (connection={}, host={}, port={}, database={}, username={})",
            params.connection, params.host, params.port, params.database, params.username
        );
        Ok(())
    }

    async fn current_database(&self) -> Result<String, ConnectError> {
        let mut state = self.state.lock().await;
        let params = state.params.clone().ok_or_else(|| {
            ConnectError::unreachable("current_database called before reconfigure")
        })?;

        let conn = match state.conn.clone() {
            Some(c) => c,
            None => {
                let c = self.connect(&params).await?;
                state.conn = Some(c.clone());
                c
            }
        };

        match timeout(self.connect_timeout, conn.current_database()).await {
            Ok(Ok(name)) => Ok(name),
            Ok(Err(e)) => Err(ConnectError::unreachable(mask_sensitive_params(
                &format!("{:#}", e),
                &params,
            ))),
            Err(_) => Err(ConnectError::timeout("current database query timed out")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn params(connection: &str, port: &str) -> DatabaseParams {
        DatabaseParams {
            connection: connection.to_string(),
            host: "127.0.0.1".to_string(),
            port: port.to_string(),
            database: "shop".to_string(),
            username: "root".to_string(),
            password: "PASSWORD_SHOULD_BE_REDACTED".to_string(),
        }
    }

    #[test]
    fn driver_names_follow_application_spelling() {
        assert_eq!(DatabaseDriver::from_connection("mysql"), Some(DatabaseDriver::MySql));
        assert_eq!(DatabaseDriver::from_connection("MariaDB"), Some(DatabaseDriver::MySql));
        assert_eq!(DatabaseDriver::from_connection("pgsql"), Some(DatabaseDriver::Postgres));
        assert_eq!(DatabaseDriver::from_connection("sqlsrv"), None);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_transient(5, move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow!("connection refused"))
                } else {
                    Ok("shop")
                }
            }
        })
        .await;

        assert_eq!(result.expect("eventually ok"), "shop");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_is_bounded_and_skips_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();
        let result: Result<()> = retry_transient(3, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("connection refused"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() < Duration::from_secs(3));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry_transient(3, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("Access denied for user 'root'"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "auth failures are not retried");
    }

    #[tokio::test]
    async fn current_database_before_reconfigure_is_an_error() {
        let live = SqlxLiveConnection::new(Duration::from_millis(200), 1);
        let err = live.current_database().await.unwrap_err();
        assert!(err.user_message.contains("Unable to connect"));
    }

    #[tokio::test]
    async fn unsupported_connection_fails_without_leaking_password() {
        let live = SqlxLiveConnection::new(Duration::from_millis(500), 1);
        live.reconfigure(&params("sqlsrv", "1433"))
            .await
            .expect("reconfigure");
        let err = live.current_database().await.unwrap_err();
        assert!(err.internal_details.contains("Unsupported"), "{}", err.internal_details);
        assert!(!err.user_message.contains("PASSWORD_SHOULD_BE_REDACTED"));
        assert!(!err.internal_details.contains("PASSWORD_SHOULD_BE_REDACTED"));
    }

    #[tokio::test]
    async fn invalid_port_is_reported() {
        let live = SqlxLiveConnection::new(Duration::from_millis(500), 1);
        live.reconfigure(&params("mysql", "33o6")).await.expect("reconfigure");
        let err = live.current_database().await.unwrap_err();
        assert!(err.internal_details.contains("Invalid database port"));
    }

    #[test]
    fn connect_error_display_is_user_friendly() {
        let err = ConnectError::unreachable("tcp connect failed: errno=111");
        let displayed = format!("{}", err);
        assert!(displayed.contains("Unable to connect"));
        assert!(!displayed.contains("errno"));
    }

    #[test]
    fn connect_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectError>();
    }
}
