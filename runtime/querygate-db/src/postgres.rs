//! PostgreSQL backend over tokio-postgres, with optional rustls TLS.

use std::error::Error as StdError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::BytesMut;
use futures_util::{TryStreamExt, pin_mut};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde_json::{Number, Value};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, Error as PgError, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::backend::{BackendError, Connector, DbConnection, Row, RowLimitSyntax, RowSet};
use crate::config::{SslMode, Target};
use crate::error::ExecutionErrorKind;

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

pub struct PgConn {
    client: Client,
    cancel_token: tokio_postgres::CancelToken,
    tls: PgTls,
}

#[async_trait]
impl DbConnection for PgConn {
    async fn fetch(
        &self,
        sql: &str,
        params: &[Value],
        max_rows: usize,
    ) -> Result<RowSet, BackendError> {
        let stmt = self.client.prepare(sql).await.map_err(map_error)?;
        let columns = stmt
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect::<Vec<_>>();
        let bound = params.iter().map(JsonParam).collect::<Vec<_>>();
        let stream = self
            .client
            .query_raw(&stmt, bound.iter().map(|param| param as &(dyn ToSql + Sync)))
            .await
            .map_err(map_error)?;
        pin_mut!(stream);
        let mut rows = Vec::new();
        while rows.len() < max_rows {
            let Some(row) = stream.try_next().await.map_err(map_error)? else {
                break;
            };
            let mut record = Row::new();
            for (idx, column) in stmt.columns().iter().enumerate() {
                record.insert(column.name().to_string(), decode_cell(&row, idx, column.type_()));
            }
            rows.push(record);
        }
        Ok(RowSet { columns, rows })
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn cancel_query(&self) -> Result<(), BackendError> {
        let result = match &self.tls {
            PgTls::None => self.cancel_token.cancel_query(NoTls).await,
            PgTls::Rustls(tls) => self.cancel_token.cancel_query(tls.clone()).await,
        };
        result.map_err(map_error)
    }

    fn row_limit_syntax(&self) -> RowLimitSyntax {
        RowLimitSyntax::FetchFirst
    }
}

/// Binds a JSON scalar to whatever type the server inferred for the slot.
#[derive(Debug)]
struct JsonParam<'a>(&'a Value);

impl ToSql for JsonParam<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(flag) if *ty == Type::BOOL => flag.to_sql(ty, out),
            Value::Number(num) => number_to_sql(num, ty, out),
            Value::String(text) if is_text(ty) => text.as_str().to_sql(ty, out),
            other if *ty == Type::JSON || *ty == Type::JSONB => other.to_sql(ty, out),
            other => match other {
                Value::String(text) => text.as_str().to_sql(ty, out),
                _ => other.to_string().as_str().to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn number_to_sql(
    num: &Number,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
    let int = || {
        num.as_i64()
            .ok_or_else(|| format!("{num} is not an integer"))
    };
    match *ty {
        Type::INT2 => i16::try_from(int()?)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(int()?)?.to_sql(ty, out),
        Type::INT8 => int()?.to_sql(ty, out),
        Type::OID => u32::try_from(int()?)?.to_sql(ty, out),
        Type::FLOAT4 => (num.as_f64().unwrap_or_default() as f32).to_sql(ty, out),
        Type::FLOAT8 => num.as_f64().unwrap_or_default().to_sql(ty, out),
        Type::JSON | Type::JSONB => Value::Number(num.clone()).to_sql(ty, out),
        _ => num.to_string().as_str().to_sql(ty, out),
    }
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn decode_cell(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx)
            .and_then(|v| Number::from_f64(f64::from(v)))
            .map(Value::Number),
        Type::FLOAT8 => get::<f64>(row, idx)
            .and_then(Number::from_f64)
            .map(Value::Number),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx).map(|v| Value::String(v.to_string())),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(|v| Value::String(v.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(|v| Value::String(v.to_string())),
        Type::BYTEA => get::<Vec<u8>>(row, idx)
            .map(|v| Value::String(base64::engine::general_purpose::STANDARD.encode(v))),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(text) => text.map(Value::String),
            Err(_) => Some(Value::String(format!("<{}>", ty.name()))),
        },
    };
    value.unwrap_or(Value::Null)
}

fn map_error(err: PgError) -> BackendError {
    let kind = if err.is_closed() {
        ExecutionErrorKind::ConnectionLost
    } else if let Some(code) = err.code() {
        if *code == SqlState::QUERY_CANCELED {
            ExecutionErrorKind::Timeout
        } else if code.code().starts_with("08") || code.code().starts_with("57P") {
            ExecutionErrorKind::ConnectionLost
        } else {
            ExecutionErrorKind::RemoteRejected
        }
    } else {
        ExecutionErrorKind::Unknown
    };
    let message = err
        .as_db_error()
        .map_or_else(|| err.to_string(), |db| db.message().to_string());
    BackendError::new(kind, message)
}

/// Opens connections to one PostgreSQL server. The TLS connector is built
/// once and shared by every connection.
pub struct PostgresConnector {
    config: Config,
    tls: PgTls,
    describe: String,
}

impl PostgresConnector {
    pub fn new(target: &Target, connect_timeout: Duration) -> Result<Self, BackendError> {
        let Target::Postgres {
            host,
            port,
            database,
            user,
            password,
            ssl_mode,
            ignore_unauthorized,
            ssl_root_cert,
        } = target
        else {
            return Err(BackendError::new(
                ExecutionErrorKind::Unknown,
                "postgres connector needs a postgres target",
            ));
        };
        let mut config = Config::new();
        config
            .host(host)
            .port(*port)
            .dbname(database)
            .user(user)
            .application_name("querygate")
            .connect_timeout(connect_timeout);
        if let Some(password) = password {
            config.password(password);
        }
        let tls = match ssl_mode {
            SslMode::Disable => {
                config.ssl_mode(tokio_postgres::config::SslMode::Disable);
                PgTls::None
            }
            mode => {
                config.ssl_mode(match mode {
                    SslMode::Require => tokio_postgres::config::SslMode::Require,
                    _ => tokio_postgres::config::SslMode::Prefer,
                });
                let tls = build_tls_connector(*ignore_unauthorized, ssl_root_cert.as_deref())
                    .map_err(|message| BackendError::new(ExecutionErrorKind::Unknown, message))?;
                PgTls::Rustls(tls)
            }
        };
        Ok(Self {
            config,
            tls,
            describe: target.describe(),
        })
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, BackendError> {
        let client = match &self.tls {
            PgTls::None => {
                let (client, connection) = self.config.connect(NoTls).await.map_err(map_error)?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::warn!(error = %err, "postgres connection closed with error");
                    }
                });
                client
            }
            PgTls::Rustls(tls) => {
                let (client, connection) =
                    self.config.connect(tls.clone()).await.map_err(map_error)?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::warn!(error = %err, "postgres connection closed with error");
                    }
                });
                client
            }
        };
        let cancel_token = client.cancel_token();
        Ok(Box::new(PgConn {
            client,
            cancel_token,
            tls: self.tls.clone(),
        }))
    }

    fn describe(&self) -> String {
        self.describe.clone()
    }
}

fn build_tls_connector(
    ignore_unauthorized: bool,
    ssl_root_cert: Option<&Path>,
) -> Result<MakeRustlsConnect, String> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| err.to_string())?;

    if ignore_unauthorized {
        tracing::warn!("TLS certificate verification disabled for database connections");
        let tls_config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        return Ok(MakeRustlsConnect::new(tls_config));
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!(error = %err, "skipping unreadable native certificate source");
    }
    roots.add_parsable_certificates(native.certs);
    if let Some(path) = ssl_root_cert {
        let certs = CertificateDer::pem_file_iter(path)
            .map_err(|err| format!("failed to read {}: {err}", path.display()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("failed to parse {}: {err}", path.display()))?;
        for cert in certs {
            roots.add(cert).map_err(|err| err.to_string())?;
        }
    }
    if roots.is_empty() {
        return Err("no root certificates available for TLS".to_string());
    }
    let tls_config = builder
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

/// Certificate verifier for the trust override: any chain is accepted, but
/// handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
