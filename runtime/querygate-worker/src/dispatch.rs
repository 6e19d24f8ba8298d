//! Turns decoded envelopes into gateway calls and envelopes back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use querygate_db::{CancelToken, ConnectionError, Gateway, GatewayError, QueryRequest, QueryRunner};

use crate::scheduler::{Batch, SchedulerConfig};
use crate::task::TaskSpec;
use crate::wire::{
    BatchPayload, CancelPayload, CancelRegistry, DecodedRequest, RequestEnvelope,
    ResponseEnvelope, Status, WireError, encode_payload,
};

/// How long a timed-out request gets to observe its cancel token before the
/// response is sent anyway.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Failure {
    status: Status,
    message: String,
}

impl Failure {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<WireError> for Failure {
    fn from(err: WireError) -> Self {
        let status = match err {
            WireError::Encode(_) => Status::InternalError,
            _ => Status::InvalidInput,
        };
        Self::new(status, err.to_string())
    }
}

impl From<GatewayError> for Failure {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::Validation(_) => Status::InvalidInput,
            GatewayError::Connection(ConnectionError::Exhausted { .. }) => Status::Busy,
            GatewayError::Connection(ConnectionError::Cancelled) | GatewayError::Cancelled => {
                Status::Cancelled
            }
            GatewayError::Timeout { .. } => Status::Timeout,
            GatewayError::Connection(ConnectionError::Connect { .. })
            | GatewayError::Execution { .. }
            | GatewayError::Panicked(_) => Status::InternalError,
        };
        Self::new(status, err.to_string())
    }
}

pub struct Dispatcher {
    gateway: Arc<Gateway>,
    scheduler: SchedulerConfig,
    cancels: CancelRegistry,
}

impl Dispatcher {
    pub fn new(gateway: Arc<Gateway>, scheduler: SchedulerConfig) -> Self {
        Self {
            gateway,
            scheduler,
            cancels: CancelRegistry::new(),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Handles `__cancel__` inline; it must not queue behind the request it
    /// is cancelling.
    pub fn cancel(&self, envelope: &RequestEnvelope) -> ResponseEnvelope {
        match envelope.decode_payload::<CancelPayload>() {
            Ok(payload) => {
                let signalled = self.cancels.cancel(payload.request_id);
                tracing::debug!(target_request = payload.request_id, signalled, "cancel received");
                ResponseEnvelope {
                    payload: None,
                    ..ResponseEnvelope::ok(envelope.request_id, "__cancel__", "raw", Vec::new())
                }
            }
            Err(err) => ResponseEnvelope::failure(
                envelope.request_id,
                Some("__cancel__"),
                Status::InvalidInput,
                err.to_string(),
            ),
        }
    }

    pub async fn handle(&self, request: DecodedRequest, queue_depth: usize) -> ResponseEnvelope {
        let envelope = request.envelope;
        let request_id = envelope.request_id;
        let exec_start = Instant::now();
        let pool = self.gateway.pool();
        let mut metrics = BTreeMap::new();
        metrics.insert("queue_ms".to_string(), millis(exec_start.duration_since(request.queued_at)));
        metrics.insert("queue_depth".to_string(), queue_depth as u64);
        metrics.insert("pool_in_flight".to_string(), pool.in_flight() as u64);
        metrics.insert("pool_idle".to_string(), pool.idle_count() as u64);
        metrics.insert("requests_in_flight".to_string(), self.cancels.in_flight() as u64);
        metrics.insert(
            "payload_bytes".to_string(),
            envelope.payload.as_ref().map_or(0, |payload| payload.len()) as u64,
        );

        let token = self.cancels.register(request_id);
        let result = if token.is_cancelled() {
            Err(Failure::new(Status::Cancelled, "request cancelled"))
        } else {
            self.execute_with_deadline(&envelope, &token).await
        };
        self.cancels.finish(request_id);
        metrics.insert("exec_ms".to_string(), millis(exec_start.elapsed()));

        let response = match result {
            Ok((codec, payload)) => ResponseEnvelope::ok(request_id, &envelope.entry, codec, payload),
            Err(failure) => ResponseEnvelope::failure(
                request_id,
                Some(&envelope.entry),
                failure.status,
                failure.message,
            ),
        };
        tracing::debug!(
            request_id,
            entry = %envelope.entry,
            status = ?response.status,
            exec_ms = metrics.get("exec_ms").copied().unwrap_or_default(),
            "request finished"
        );
        response.with_metrics(metrics)
    }

    async fn execute_with_deadline(
        &self,
        envelope: &RequestEnvelope,
        token: &CancelToken,
    ) -> Result<(&'static str, Vec<u8>), Failure> {
        if envelope.timeout_ms == 0 {
            return self.execute(envelope, token).await;
        }
        let limit = Duration::from_millis(envelope.timeout_ms);
        let execution = self.execute(envelope, token);
        tokio::pin!(execution);
        tokio::select! {
            result = &mut execution => result,
            () = tokio::time::sleep(limit) => {
                token.cancel();
                // Let the gateway cancel server-side and drop the connection;
                // a batch also needs its own cancel grace to wind down.
                let grace = TIMEOUT_GRACE + self.scheduler.cancel_grace;
                if tokio::time::timeout(grace, &mut execution).await.is_err() {
                    tracing::warn!(
                        request_id = envelope.request_id,
                        "request still running after cancel grace"
                    );
                }
                Err(Failure::new(
                    Status::Timeout,
                    format!("request timed out after {} ms", envelope.timeout_ms),
                ))
            }
        }
    }

    async fn execute(
        &self,
        envelope: &RequestEnvelope,
        token: &CancelToken,
    ) -> Result<(&'static str, Vec<u8>), Failure> {
        let codec = || codec_name(&envelope.codec);
        match envelope.entry.as_str() {
            "__ping__" => Ok(("raw", Vec::new())),
            "query" => {
                let codec = codec()?;
                let request: QueryRequest = envelope.decode_payload()?;
                let outcome = self.gateway.run(&request, token).await?;
                Ok((codec, encode_payload(&outcome, codec)?))
            }
            "batch" => {
                let codec = codec()?;
                let payload: BatchPayload = envelope.decode_payload()?;
                let config = self.batch_config(&payload);
                let runner: Arc<dyn QueryRunner> = self.gateway.clone();
                let tasks = payload
                    .queries
                    .into_iter()
                    .map(|item| {
                        let label = item.label.unwrap_or_else(|| item.name.clone());
                        TaskSpec::query(item.name, label, Arc::clone(&runner), item.request)
                            .covering(item.entities)
                    })
                    .collect();
                // The batch watches the request token itself, so a cancel or
                // timeout still runs each task's cancel path before returning.
                let report = Batch::prepare(tasks, config)
                    .map_err(|err| Failure::new(Status::InvalidInput, err.to_string()))?
                    .with_cancel(token.clone())
                    .run()
                    .await;
                if token.is_cancelled() {
                    return Err(Failure::new(Status::Cancelled, "request cancelled"));
                }
                Ok((codec, encode_payload(&report, codec)?))
            }
            "policy" => {
                let codec = codec()?;
                Ok((codec, encode_payload(&self.gateway.policy_summary(), codec)?))
            }
            other => Err(Failure::new(
                Status::InvalidInput,
                format!("unknown entry '{other}'"),
            )),
        }
    }

    fn batch_config(&self, payload: &BatchPayload) -> SchedulerConfig {
        let mut config = self.scheduler.clone();
        if let Some(workers) = payload.max_workers {
            config.max_workers = workers.clamp(1, self.scheduler.max_workers.max(1));
        }
        if let Some(ms) = payload.per_task_timeout_ms {
            config.per_task_timeout = Duration::from_millis(ms).min(self.scheduler.per_task_timeout);
        }
        if let Some(ms) = payload.overall_timeout_ms {
            config.overall_timeout = Duration::from_millis(ms).min(self.scheduler.overall_timeout);
        }
        config
    }
}

fn codec_name(codec: &str) -> Result<&'static str, Failure> {
    match codec {
        "json" => Ok("json"),
        "msgpack" => Ok("msgpack"),
        other => Err(WireError::Codec(other.to_string()).into()),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
