//! Connection pooling and bounded query execution for querygate.

pub mod async_pool;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod outcome;
pub mod pool;

#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub mod postgres;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;

pub use async_pool::{AsyncPool, AsyncPooled, CancelToken, RetryPolicy};
pub use backend::{BackendError, Connector, DbConnection, Row, RowLimitSyntax, RowSet};
pub use config::{ConnectionConfig, PoolConfig, SslMode, Target};
pub use error::{
    ConnectionError, ExecutionErrorKind, GatewayError, MAX_ERROR_MESSAGE_CHARS, TimeoutScope,
    truncate_message,
};
pub use executor::{ExecutorLimits, QueryExecutor, ResultCeiling};
pub use gateway::{Gateway, QueryRequest, QueryRunner};
pub use outcome::QueryOutcome;
pub use pool::{ConnectionPool, PooledConnection};
