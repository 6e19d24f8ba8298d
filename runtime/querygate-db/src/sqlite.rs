//! Read-only SQLite backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::{Number, Value};

use crate::backend::{BackendError, Connector, DbConnection, Row, RowLimitSyntax, RowSet};
use crate::error::ExecutionErrorKind;

const BUSY_TIMEOUT_MS: u64 = 100;

pub struct SqliteConn {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteConn {
    /// Opens `path` read-only with `query_only` set, so even a statement that
    /// slipped past validation cannot write.
    pub fn open_read_only(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "query_only", 1)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }
}

#[async_trait]
impl DbConnection for SqliteConn {
    async fn fetch(
        &self,
        sql: &str,
        params: &[Value],
        max_rows: usize,
    ) -> Result<RowSet, BackendError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.iter().map(json_to_sql).collect::<Vec<_>>();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            query_rows(&conn, &sql, params, max_rows).map_err(map_error)
        })
        .await
        .map_err(|err| BackendError::new(ExecutionErrorKind::Unknown, err.to_string()))?
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .query_row("SELECT 1", [], |_| Ok(()))
                .map_err(map_error)
        })
        .await
        .map_err(|err| BackendError::new(ExecutionErrorKind::Unknown, err.to_string()))?
    }

    async fn cancel_query(&self) -> Result<(), BackendError> {
        self.interrupt.interrupt();
        Ok(())
    }

    fn row_limit_syntax(&self) -> RowLimitSyntax {
        RowLimitSyntax::Limit
    }
}

fn query_rows(
    conn: &Connection,
    sql: &str,
    params: Vec<SqlValue>,
    max_rows: usize,
) -> Result<RowSet, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut out = Vec::new();
    while out.len() < max_rows {
        let Some(row) = rows.next()? else {
            break;
        };
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), sql_to_json(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(RowSet { columns, rows: out })
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(num) => match num.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => num.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(base64::engine::general_purpose::STANDARD.encode(blob)),
    }
}

fn map_error(err: rusqlite::Error) -> BackendError {
    let kind = match err.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            ExecutionErrorKind::Timeout
        }
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure) => {
            ExecutionErrorKind::ConnectionLost
        }
        Some(_) => ExecutionErrorKind::RemoteRejected,
        None => match err {
            rusqlite::Error::InvalidParameterCount(..) | rusqlite::Error::InvalidColumnName(_) => {
                ExecutionErrorKind::RemoteRejected
            }
            _ => ExecutionErrorKind::Unknown,
        },
    };
    BackendError::new(kind, err.to_string())
}

/// Opens read-only connections to one database file.
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, BackendError> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || SqliteConn::open_read_only(&path))
            .await
            .map_err(|err| BackendError::new(ExecutionErrorKind::Unknown, err.to_string()))?
            .map_err(map_error)?;
        Ok(Box::new(conn))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}
