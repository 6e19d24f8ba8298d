//! Process configuration, read once from `QUERYGATE_*` environment variables.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use querygate_db::postgres::PostgresConnector;
use querygate_db::sqlite::SqliteConnector;
use querygate_db::{
    BackendError, ConnectionConfig, ConnectionError, ConnectionPool, Connector, ExecutorLimits,
    Gateway, PoolConfig, QueryExecutor, RetryPolicy, SslMode, Target,
};
use querygate_policy::{CommentMode, PolicyError, ValidationPolicy};

use crate::orchestrator::OrchestratorConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required for the {backend} backend")]
    Missing {
        var: &'static str,
        backend: &'static str,
    },
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid namespace policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("cannot configure backend: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub connection: ConnectionConfig,
    pub limits: ExecutorLimits,
    pub scheduler: SchedulerConfig,
    pub max_iterations: usize,
    pub user_namespaces: Vec<String>,
    pub comments: CommentMode,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let backend = env.get("QUERYGATE_BACKEND");
        let target = match backend.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("postgres") => postgres_target(&env)?,
            Some("sqlite") => Target::Sqlite {
                path: PathBuf::from(env.require("QUERYGATE_SQLITE_PATH", "sqlite")?),
            },
            Some(_) => {
                return Err(ConfigError::Invalid {
                    var: "QUERYGATE_BACKEND",
                    value: backend.unwrap_or_default(),
                    reason: "expected `postgres` or `sqlite`".into(),
                });
            }
        };

        let retry = RetryPolicy::new(
            env.parse("QUERYGATE_CONNECT_RETRIES", 3)?,
            positive(&env, "QUERYGATE_RETRY_BACKOFF_BASE", 2.0)?,
        );
        let pool = PoolConfig {
            max_size: at_least_one(&env, "QUERYGATE_POOL_SIZE", 5)?,
            min_idle: env.parse("QUERYGATE_POOL_MIN_IDLE", 0)?,
            retry,
            ..PoolConfig::default()
        };

        let max_rows = at_least_one(&env, "QUERYGATE_MAX_RESULT_ROWS", 500)?;
        let default_rows = at_least_one(&env, "QUERYGATE_DEFAULT_RESULT_ROWS", 100)?.min(max_rows);
        let limits = ExecutorLimits {
            default_rows,
            max_rows,
            max_bytes: at_least_one(&env, "QUERYGATE_MAX_RESULT_BYTES", 500_000)?,
            audit: env.flag("QUERYGATE_AUDIT_LOG", true)?,
        };

        let scheduler = SchedulerConfig {
            max_workers: at_least_one(&env, "QUERYGATE_MAX_WORKERS", 4)?,
            per_task_timeout: seconds(&env, "QUERYGATE_TASK_TIMEOUT", 60.0)?,
            overall_timeout: seconds(&env, "QUERYGATE_BATCH_TIMEOUT", 120.0)?,
            ..SchedulerConfig::default()
        };

        let user_namespaces = env
            .get("QUERYGATE_ALLOWED_USER_SCHEMAS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let comments = if env.flag("QUERYGATE_STRICT_COMMENTS", true)? {
            CommentMode::Strict
        } else {
            CommentMode::Permissive
        };

        Ok(Self {
            connection: ConnectionConfig { target, pool },
            limits,
            scheduler,
            max_iterations: at_least_one(&env, "QUERYGATE_MAX_ITERATIONS", 8)?,
            user_namespaces,
            comments,
        })
    }

    /// The validation policy, with the configured user namespaces registered.
    pub fn policy(&self) -> Result<ValidationPolicy, ConfigError> {
        let mut policy = ValidationPolicy::strict().with_comment_mode(self.comments);
        if !self.user_namespaces.is_empty() {
            policy.register_user_namespaces(&self.user_namespaces)?;
        }
        Ok(policy)
    }

    pub fn connector(&self) -> Result<Arc<dyn Connector>, ConfigError> {
        let target = &self.connection.target;
        Ok(match target {
            Target::Postgres { .. } => Arc::new(PostgresConnector::new(
                target,
                self.connection.pool.connect_timeout,
            )?),
            Target::Sqlite { path } => Arc::new(SqliteConnector::new(path.clone())),
        })
    }

    /// Builds the pool (prewarming `min_idle` connections) and the gateway.
    pub async fn build_gateway(&self) -> Result<Gateway, ConfigError> {
        let policy = Arc::new(self.policy()?);
        let pool = ConnectionPool::new(self.connector()?, self.connection.pool.clone()).await?;
        Ok(Gateway::new(pool, policy, QueryExecutor::new(self.limits)))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_iterations: self.max_iterations,
            scheduler: self.scheduler.clone(),
        }
    }
}

fn postgres_target<F>(env: &Env<F>) -> Result<Target, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let user = env.require("QUERYGATE_USER", "postgres")?;
    let ssl_mode = match env.get("QUERYGATE_SSL_MODE").map(|mode| mode.to_ascii_lowercase()) {
        None => SslMode::default(),
        Some(mode) => match mode.as_str() {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            _ => {
                return Err(ConfigError::Invalid {
                    var: "QUERYGATE_SSL_MODE",
                    value: mode,
                    reason: "expected `disable`, `prefer` or `require`".into(),
                });
            }
        },
    };
    Ok(Target::Postgres {
        host: env.require("QUERYGATE_HOST", "postgres")?,
        port: env.parse("QUERYGATE_PORT", 5432)?,
        database: env.get("QUERYGATE_DATABASE").unwrap_or_else(|| user.clone()),
        user,
        password: env.get("QUERYGATE_PASSWORD"),
        ssl_mode,
        ignore_unauthorized: env.flag("QUERYGATE_IGNORE_UNAUTHORIZED", false)?,
        ssl_root_cert: env.get("QUERYGATE_SSL_ROOT_CERT").map(PathBuf::from),
    })
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn require(&self, var: &'static str, backend: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing { var, backend })
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
                var,
                reason: err.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.get(var) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected a boolean (1/0, true/false)".into(),
            }),
        }
    }
}

fn at_least_one<F>(env: &Env<F>, var: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = env.parse(var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn positive<F>(env: &Env<F>, var: &'static str, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: f64 = env.parse(var, default)?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be a positive number".into(),
        });
    }
    Ok(value)
}

fn seconds<F>(env: &Env<F>, var: &'static str, default: f64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    positive(env, var, default).map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn postgres_defaults() {
        let config = config(&[
            ("QUERYGATE_HOST", "ibmi.example.com"),
            ("QUERYGATE_USER", "QUSER"),
            ("QUERYGATE_PASSWORD", "secret"),
        ])
        .unwrap();
        let Target::Postgres {
            port,
            database,
            ssl_mode,
            ignore_unauthorized,
            ..
        } = &config.connection.target
        else {
            panic!("expected postgres");
        };
        assert_eq!(*port, 5432);
        assert_eq!(database, "QUSER");
        assert_eq!(*ssl_mode, SslMode::Prefer);
        assert!(!ignore_unauthorized);
        assert_eq!(config.connection.pool.max_size, 5);
        assert_eq!(config.connection.pool.retry, RetryPolicy::new(3, 2.0));
        assert_eq!(config.limits, ExecutorLimits::default());
        assert_eq!(config.scheduler.max_workers, 4);
        assert_eq!(config.scheduler.per_task_timeout, Duration::from_secs(60));
        assert_eq!(config.scheduler.overall_timeout, Duration::from_secs(120));
        assert_eq!(config.max_iterations, 8);
        assert_eq!(config.comments, CommentMode::Strict);
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn sqlite_backend_and_overrides() {
        let config = config(&[
            ("QUERYGATE_BACKEND", "SQLite"),
            ("QUERYGATE_SQLITE_PATH", "/var/lib/querygate/catalog.db"),
            ("QUERYGATE_POOL_SIZE", "2"),
            ("QUERYGATE_MAX_RESULT_ROWS", "50"),
            ("QUERYGATE_DEFAULT_RESULT_ROWS", "100"),
            ("QUERYGATE_TASK_TIMEOUT", "2.5"),
            ("QUERYGATE_STRICT_COMMENTS", "0"),
            ("QUERYGATE_AUDIT_LOG", "off"),
            ("QUERYGATE_ALLOWED_USER_SCHEMAS", " mylib, PRODDATA ,,"),
        ])
        .unwrap();
        assert_eq!(
            config.connection.target,
            Target::Sqlite {
                path: "/var/lib/querygate/catalog.db".into()
            }
        );
        assert_eq!(config.connection.pool.max_size, 2);
        assert_eq!(config.limits.max_rows, 50);
        assert_eq!(config.limits.default_rows, 50);
        assert!(!config.limits.audit);
        assert_eq!(config.scheduler.per_task_timeout, Duration::from_millis(2500));
        assert_eq!(config.comments, CommentMode::Permissive);
        assert_eq!(config.user_namespaces, ["mylib", "PRODDATA"]);
        let policy = config.policy().unwrap();
        assert!(policy.allows_namespace("MYLIB"));
        assert_eq!(policy.comment_mode(), CommentMode::Permissive);
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        assert!(matches!(
            config(&[("QUERYGATE_HOST", "h")]),
            Err(ConfigError::Missing {
                var: "QUERYGATE_USER",
                ..
            })
        ));
        assert!(matches!(
            config(&[("QUERYGATE_BACKEND", "sqlite")]),
            Err(ConfigError::Missing {
                var: "QUERYGATE_SQLITE_PATH",
                ..
            })
        ));
        assert!(matches!(
            config(&[("QUERYGATE_BACKEND", "db2")]),
            Err(ConfigError::Invalid {
                var: "QUERYGATE_BACKEND",
                ..
            })
        ));
        let err = config(&[
            ("QUERYGATE_HOST", "h"),
            ("QUERYGATE_USER", "u"),
            ("QUERYGATE_POOL_SIZE", "many"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("QUERYGATE_POOL_SIZE"));
        assert!(matches!(
            config(&[
                ("QUERYGATE_HOST", "h"),
                ("QUERYGATE_USER", "u"),
                ("QUERYGATE_MAX_WORKERS", "0"),
            ]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config(&[
                ("QUERYGATE_HOST", "h"),
                ("QUERYGATE_USER", "u"),
                ("QUERYGATE_SSL_MODE", "verify-full"),
            ]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn bad_user_namespaces_fail_policy_construction() {
        let config = config(&[
            ("QUERYGATE_BACKEND", "sqlite"),
            ("QUERYGATE_SQLITE_PATH", "x.db"),
            ("QUERYGATE_ALLOWED_USER_SCHEMAS", "GOOD,BAD;DROP"),
        ])
        .unwrap();
        assert!(matches!(config.policy(), Err(ConfigError::Policy(_))));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config(&[
            ("QUERYGATE_HOST", "h"),
            ("QUERYGATE_USER", "u"),
            ("QUERYGATE_PORT", "  "),
        ])
        .unwrap();
        assert!(matches!(
            config.connection.target,
            Target::Postgres { port: 5432, .. }
        ));
    }
}
