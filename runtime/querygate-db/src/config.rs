use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::async_pool::RetryPolicy;

/// Pool sizing, retry and eviction settings shared by every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_idle: usize,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// How long `acquire` waits for a free slot before giving up.
    pub acquire_wait: Duration,
    pub max_idle: Option<Duration>,
    pub health_check_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            min_idle: 0,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            acquire_wait: Duration::from_secs(30),
            max_idle: Some(Duration::from_secs(300)),
            health_check_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Where connections go. Credentials never appear in `Debug` output.
#[derive(Clone, PartialEq)]
pub enum Target {
    Postgres {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: Option<String>,
        ssl_mode: SslMode,
        /// Accept any server certificate. For lab systems with self-signed
        /// certificates only.
        ignore_unauthorized: bool,
        ssl_root_cert: Option<PathBuf>,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres {
                host,
                port,
                database,
                user,
                password,
                ssl_mode,
                ignore_unauthorized,
                ssl_root_cert,
            } => f
                .debug_struct("Postgres")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("user", user)
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .field("ssl_mode", ssl_mode)
                .field("ignore_unauthorized", ignore_unauthorized)
                .field("ssl_root_cert", ssl_root_cert)
                .finish(),
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
        }
    }
}

impl Target {
    /// Log-safe description of the target.
    pub fn describe(&self) -> String {
        match self {
            Self::Postgres {
                host,
                port,
                database,
                user,
                ..
            } => format!("postgres://{user}@{host}:{port}/{database}"),
            Self::Sqlite { path } => format!("sqlite:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub target: Target,
    pub pool: PoolConfig,
}

impl ConnectionConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            pool: PoolConfig::default(),
        }
    }
}
