//! Backend-agnostic connection pool with idle eviction, health checks and
//! prewarm.

use std::sync::Arc;

use crate::async_pool::{AsyncPool, AsyncPooled, CancelToken};
use crate::backend::{Connector, DbConnection};
use crate::config::PoolConfig;
use crate::error::ConnectionError;

pub type PooledConnection = AsyncPooled<Box<dyn DbConnection>>;

/// Borrows the driver connection behind a pool guard.
pub fn db(conn: &PooledConnection) -> &dyn DbConnection {
    conn.as_ref().as_ref()
}

pub struct ConnectionPool {
    config: Arc<PoolConfig>,
    pool: Arc<AsyncPool<Box<dyn DbConnection>>>,
    target: String,
}

impl ConnectionPool {
    /// Builds the pool and opens `min_idle` connections up front.
    pub async fn new(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Result<Self, ConnectionError> {
        let pool = Self::lazy(connector, config);
        pool.prewarm().await?;
        Ok(pool)
    }

    /// Builds the pool without opening anything.
    pub fn lazy(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let config = Arc::new(config);
        let target = connector.describe();
        let connect_timeout = config.connect_timeout;
        let pool = AsyncPool::new(config.max_size, config.retry, move || {
            let connector = Arc::clone(&connector);
            async move {
                match tokio::time::timeout(connect_timeout, connector.connect()).await {
                    Ok(result) => result.map_err(|err| err.message),
                    Err(_) => Err(format!(
                        "connect timed out after {} ms",
                        connect_timeout.as_millis()
                    )),
                }
            }
        });
        Self {
            config,
            pool,
            target,
        }
    }

    async fn prewarm(&self) -> Result<(), ConnectionError> {
        let count = self.config.min_idle.min(self.config.max_size);
        if count == 0 {
            return Ok(());
        }
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            held.push(
                self.pool
                    .acquire(Some(self.config.acquire_wait), None)
                    .await?,
            );
        }
        drop(held);
        tracing::info!(backend = %self.target, connections = count, "connection pool prewarmed");
        Ok(())
    }

    /// Checks out a connection, discarding stale or unhealthy idle ones.
    pub async fn acquire(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<PooledConnection, ConnectionError> {
        loop {
            let mut conn = self
                .pool
                .acquire(Some(self.config.acquire_wait), cancel)
                .await?;
            if let Some(max_idle) = self.config.max_idle {
                if conn.idle_for() > max_idle {
                    tracing::debug!(backend = %self.target, "evicting idle connection");
                    conn.discard();
                    continue;
                }
            }
            if let Some(interval) = self.config.health_check_interval {
                if conn.idle_for() > interval {
                    match db(&conn).ping().await {
                        Ok(()) => conn.touch(),
                        Err(err) => {
                            tracing::warn!(backend = %self.target, error = %err, "health check failed");
                            conn.discard();
                            continue;
                        }
                    }
                }
            }
            return Ok(conn);
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub fn idle_count(&self) -> usize {
        self.pool.idle_count()
    }
}
