//! Length-prefixed stdio framing and the request/response envelopes.
//!
//! Every frame is a little-endian `u32` length followed by that many bytes of
//! MessagePack or JSON. Responses go back in the codec the request came in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read, Write};
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use querygate_db::{CancelToken, QueryRequest};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const MAX_EARLY_CANCELS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid request: {0}")]
    Decode(String),
    #[error("invalid payload base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported payload codec {0:?}")]
    Codec(String),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("missing payload")]
    MissingPayload,
    #[error("cannot encode response: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub entry: String,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub payload: Option<ByteBuf>,
    #[serde(default)]
    pub payload_b64: Option<String>,
}

fn default_codec() -> String {
    "json".to_string()
}

impl RequestEnvelope {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, WireError> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone().into_vec());
        }
        if let Some(encoded) = &self.payload_b64 {
            return Ok(BASE64.decode(encoded)?);
        }
        Ok(Vec::new())
    }

    pub fn decode_payload<T>(&self) -> Result<T, WireError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let bytes = self.payload_bytes()?;
        if bytes.is_empty() {
            return Err(WireError::MissingPayload);
        }
        match self.codec.as_str() {
            "msgpack" => rmp_serde::from_slice(&bytes).map_err(|err| WireError::Payload(err.to_string())),
            "json" => serde_json::from_slice(&bytes).map_err(|err| WireError::Payload(err.to_string())),
            other => Err(WireError::Codec(other.to_string())),
        }
    }
}

pub fn encode_payload<T: Serialize>(payload: &T, codec: &str) -> Result<Vec<u8>, WireError> {
    match codec {
        "msgpack" => rmp_serde::to_vec_named(payload).map_err(|err| WireError::Encode(err.to_string())),
        "json" => serde_json::to_vec(payload).map_err(|err| WireError::Encode(err.to_string())),
        other => Err(WireError::Codec(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    InvalidInput,
    Busy,
    Cancelled,
    Timeout,
    InternalError,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: Status,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

#[derive(Serialize)]
struct ResponseEnvelopeJson<'a> {
    request_id: u64,
    status: Status,
    codec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<&'a BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<&'a str>,
}

impl ResponseEnvelope {
    pub fn ok(request_id: u64, entry: &str, codec: &str, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            codec: codec.to_string(),
            payload: Some(ByteBuf::from(payload)),
            metrics: None,
            error: None,
            entry: Some(entry.to_string()),
        }
    }

    pub fn failure(request_id: u64, entry: Option<&str>, status: Status, error: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            codec: "raw".to_string(),
            payload: None,
            metrics: None,
            error: Some(error.into()),
            entry: entry.map(str::to_string),
        }
    }

    pub fn with_metrics(mut self, metrics: BTreeMap<String, u64>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub struct DecodedRequest {
    pub envelope: RequestEnvelope,
    pub wire: WireCodec,
    pub queued_at: Instant,
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit"),
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Tries MessagePack first, then JSON; the request's codec decides the
/// response's.
pub fn decode_request(bytes: &[u8]) -> Result<DecodedRequest, WireError> {
    if let Ok(envelope) = rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        return Ok(DecodedRequest {
            envelope,
            wire: WireCodec::Msgpack,
            queued_at: Instant::now(),
        });
    }
    let envelope = serde_json::from_slice::<RequestEnvelope>(bytes)
        .map_err(|err| WireError::Decode(err.to_string()))?;
    Ok(DecodedRequest {
        envelope,
        wire: WireCodec::Json,
        queued_at: Instant::now(),
    })
}

pub fn encode_response(response: &ResponseEnvelope, wire: WireCodec) -> Result<Vec<u8>, WireError> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::to_vec_named(response).map_err(|err| WireError::Encode(err.to_string()))
        }
        WireCodec::Json => {
            let json = ResponseEnvelopeJson {
                request_id: response.request_id,
                status: response.status,
                codec: &response.codec,
                payload_b64: response
                    .payload
                    .as_ref()
                    .map(|payload| BASE64.encode(payload.as_ref())),
                metrics: response.metrics.as_ref(),
                error: response.error.as_deref(),
                entry: response.entry.as_deref(),
            };
            serde_json::to_vec(&json).map_err(|err| WireError::Encode(err.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CancelPayload {
    pub request_id: u64,
}

/// One query inside a `batch` request.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(flatten)]
    pub request: QueryRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPayload {
    pub queries: Vec<BatchItem>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub per_task_timeout_ms: Option<u64>,
    #[serde(default)]
    pub overall_timeout_ms: Option<u64>,
}

#[derive(Default)]
struct Cancels {
    active: HashMap<u64, CancelToken>,
    early: HashSet<u64>,
}

/// Cancel tokens for in-flight requests. A cancel that arrives before its
/// request is remembered and applied on registration.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<Cancels>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: u64) -> CancelToken {
        let token = CancelToken::new();
        let mut inner = self.inner.lock();
        if inner.early.remove(&request_id) {
            token.cancel();
        }
        inner.active.insert(request_id, token.clone());
        token
    }

    /// Returns true when a running request was signalled.
    pub fn cancel(&self, request_id: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.active.get(&request_id) {
            token.cancel();
            return true;
        }
        if inner.early.len() < MAX_EARLY_CANCELS {
            inner.early.insert(request_id);
        }
        false
    }

    pub fn finish(&self, request_id: u64) {
        self.inner.lock().active.remove(&request_id);
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip_and_stop_at_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();
        assert_eq!(&buf[..4], &5u32.to_le_bytes());
        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut reader).unwrap().unwrap(), b"");
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_refused() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let err = read_frame(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn json_requests_carry_base64_payloads() {
        let payload = serde_json::to_vec(&json!({"sql": "SELECT 1 FROM SYSIBM.SYSDUMMY1"})).unwrap();
        let frame = serde_json::to_vec(&json!({
            "request_id": 7,
            "entry": "query",
            "timeout_ms": 500,
            "codec": "json",
            "payload_b64": BASE64.encode(&payload),
        }))
        .unwrap();
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.wire, WireCodec::Json);
        assert_eq!(decoded.envelope.timeout_ms, 500);
        let request: QueryRequest = decoded.envelope.decode_payload().unwrap();
        assert_eq!(request.sql, "SELECT 1 FROM SYSIBM.SYSDUMMY1");
    }

    #[test]
    fn msgpack_requests_are_detected() {
        #[derive(Serialize)]
        struct Outgoing<'a> {
            request_id: u64,
            entry: &'a str,
            codec: &'a str,
            payload: ByteBuf,
        }
        let payload = rmp_serde::to_vec_named(&json!({"request_id": 3})).unwrap();
        let frame = rmp_serde::to_vec_named(&Outgoing {
            request_id: 9,
            entry: "__cancel__",
            codec: "msgpack",
            payload: ByteBuf::from(payload),
        })
        .unwrap();
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.wire, WireCodec::Msgpack);
        let cancel: CancelPayload = decoded.envelope.decode_payload().unwrap();
        assert_eq!(cancel.request_id, 3);
    }

    #[test]
    fn garbage_is_invalid_input() {
        assert!(matches!(decode_request(b"\x00not a request"), Err(WireError::Decode(_))));
    }

    #[test]
    fn json_responses_use_payload_b64() {
        let response = ResponseEnvelope::ok(1, "query", "json", b"{}".to_vec())
            .with_metrics(BTreeMap::from([("exec_ms".to_string(), 4)]));
        let encoded = encode_response(&response, WireCodec::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["status"], "Ok");
        assert_eq!(value["payload_b64"], BASE64.encode(b"{}"));
        assert_eq!(value["metrics"]["exec_ms"], 4);
        assert!(value.get("error").is_none());

        let failure = ResponseEnvelope::failure(2, None, Status::Busy, "worker queue full");
        let value: serde_json::Value =
            serde_json::from_slice(&encode_response(&failure, WireCodec::Json).unwrap()).unwrap();
        assert_eq!(value["status"], "Busy");
        assert_eq!(value["codec"], "raw");
    }

    #[test]
    fn batch_items_flatten_the_request() {
        let payload: BatchPayload = serde_json::from_value(json!({
            "queries": [
                {"name": "jobs", "entities": ["job"], "sql": "SELECT * FROM QSYS2.ACTIVE_JOB_INFO", "max_rows": 10},
                {"name": "users", "sql": "SELECT * FROM QSYS2.USER_INFO"}
            ],
            "max_workers": 2
        }))
        .unwrap();
        assert_eq!(payload.queries.len(), 2);
        assert_eq!(payload.queries[0].request.max_rows, Some(10));
        assert_eq!(payload.queries[1].label, None);
        assert_eq!(payload.max_workers, Some(2));
    }

    #[test]
    fn early_cancels_apply_on_registration() {
        let registry = CancelRegistry::new();
        assert!(!registry.cancel(5));
        let token = registry.register(5);
        assert!(token.is_cancelled());

        let live = registry.register(6);
        assert!(!live.is_cancelled());
        assert!(registry.cancel(6));
        assert!(live.is_cancelled());
        registry.finish(6);
        registry.finish(5);
        assert_eq!(registry.in_flight(), 0);
    }
}
