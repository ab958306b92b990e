// rpc.rs - Wire envelope codec
//
// Every message on the wire is a JSON object with exactly two fields:
// "req" or "res" holding a 4-element array [request_id, method, params,
// timestamp], and "sig" holding an array of hex-encoded 65-byte signatures.
//
// The signable bytes of a message are the canonical JSON of the 4-element
// array alone, never of the envelope. Canonical means compact output with
// object keys in lexicographic order, which is exactly what serde_json
// produces for a Value.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AppError;

/// Whether the envelope carried a "req" or a "res" array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn key(self) -> &'static str {
        match self {
            Direction::Request => "req",
            Direction::Response => "res",
        }
    }
}

/// The signable 4-element payload of an RPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcPayload {
    pub req_id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub timestamp: u64,
}

impl RpcPayload {
    pub fn new(req_id: u64, method: &str, params: Vec<Value>, timestamp: u64) -> Self {
        Self {
            req_id,
            method: method.to_string(),
            params,
            timestamp,
        }
    }

    /// Canonical JSON bytes of the payload array. This is what gets signed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        json!([self.req_id, self.method, self.params, self.timestamp])
            .to_string()
            .into_bytes()
    }
}

/// A full parsed message: payload plus its signatures.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    pub direction: Direction,
    pub payload: RpcPayload,
    pub signatures: Vec<String>,
}

/// Parse failure carrying the best-effort request id for the error reply.
#[derive(Debug)]
pub struct MalformedEnvelope {
    pub req_id: u64,
    pub reason: String,
}

impl RpcMessage {
    /// Parse a wire frame. On failure the caller still gets a request id to
    /// echo (0 when none could be extracted).
    pub fn parse(text: &str) -> Result<Self, MalformedEnvelope> {
        let value: Value = serde_json::from_str(text).map_err(|e| MalformedEnvelope {
            req_id: 0,
            reason: format!("invalid json: {}", e),
        })?;

        let obj = value.as_object().ok_or_else(|| MalformedEnvelope {
            req_id: 0,
            reason: "envelope must be an object".into(),
        })?;

        let (direction, body) = match (obj.get("req"), obj.get("res")) {
            (Some(body), None) => (Direction::Request, body),
            (None, Some(body)) => (Direction::Response, body),
            (Some(_), Some(_)) => {
                return Err(MalformedEnvelope {
                    req_id: 0,
                    reason: "envelope carries both req and res".into(),
                })
            }
            (None, None) => {
                return Err(MalformedEnvelope {
                    req_id: 0,
                    reason: "envelope missing req/res".into(),
                })
            }
        };

        // From here on a request id may be recoverable from the array head.
        let req_id = best_effort_id(body);
        let malformed = |reason: String| MalformedEnvelope { req_id, reason };

        let array = body
            .as_array()
            .ok_or_else(|| malformed("payload must be an array".into()))?;
        if array.len() != 4 {
            return Err(malformed(format!(
                "payload must have 4 elements, got {}",
                array.len()
            )));
        }

        let req_id = array[0]
            .as_u64()
            .ok_or_else(|| malformed("request id must be an unsigned integer".into()))?;
        let method = array[1]
            .as_str()
            .ok_or_else(|| malformed("method must be a string".into()))?
            .to_string();
        let params = array[2]
            .as_array()
            .ok_or_else(|| malformed("params must be an array".into()))?
            .clone();
        let timestamp = array[3]
            .as_u64()
            .ok_or_else(|| malformed("timestamp must be an unsigned integer".into()))?;

        let signatures = match obj.get("sig") {
            Some(Value::Array(sigs)) => sigs
                .iter()
                .map(|s| {
                    s.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| malformed("signatures must be strings".into()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(malformed("sig must be an array".into())),
            None => return Err(malformed("envelope missing sig".into())),
        };

        Ok(RpcMessage {
            direction,
            payload: RpcPayload {
                req_id,
                method,
                params,
                timestamp,
            },
            signatures,
        })
    }

    /// Serialize to the wire frame.
    pub fn to_wire(&self) -> String {
        let body = json!([
            self.payload.req_id,
            self.payload.method,
            self.payload.params,
            self.payload.timestamp,
        ]);
        let mut envelope = serde_json::Map::new();
        envelope.insert(self.direction.key().to_string(), body);
        envelope.insert("sig".to_string(), json!(self.signatures));
        Value::Object(envelope).to_string()
    }
}

/// Pull a request id out of a possibly-broken payload value.
fn best_effort_id(body: &Value) -> u64 {
    body.as_array()
        .and_then(|a| a.first())
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Current Unix time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Deserialize the first params element into a typed struct.
pub fn first_param<T: DeserializeOwned>(params: &[Value]) -> Result<T, AppError> {
    let first = params
        .first()
        .ok_or(AppError::MissingParameter("params"))?;
    serde_json::from_value(first.clone())
        .map_err(|e| AppError::Malformed(format!("invalid params: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_are_deterministic() {
        let params = vec![json!({"b": 1, "a": "x"})];
        let a = RpcPayload::new(7, "create_app_session", params.clone(), 1700000000);
        let b = RpcPayload::new(7, "create_app_session", params, 1700000000);
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());

        // Object keys come out sorted regardless of insertion order
        let text = String::from_utf8(a.canonical_bytes()).unwrap();
        assert_eq!(
            text,
            r#"[7,"create_app_session",[{"a":"x","b":1}],1700000000]"#
        );
    }

    #[test]
    fn envelope_roundtrip() {
        let frame = r#"{"req":[1,"ping",[],1700000000],"sig":["0xabc"]}"#;
        let msg = RpcMessage::parse(frame).expect("parse failed");

        assert_eq!(msg.direction, Direction::Request);
        assert_eq!(msg.payload.req_id, 1);
        assert_eq!(msg.payload.method, "ping");
        assert!(msg.payload.params.is_empty());
        assert_eq!(msg.signatures, vec!["0xabc".to_string()]);
        assert_eq!(msg.to_wire(), frame);
    }

    #[test]
    fn malformed_envelopes_keep_best_effort_id() {
        // Wrong arity but a readable id in slot 0
        let err = RpcMessage::parse(r#"{"req":[42,"ping",[]],"sig":[]}"#).unwrap_err();
        assert_eq!(err.req_id, 42);

        // No id recoverable at all
        let err = RpcMessage::parse(r#"{"sig":[]}"#).unwrap_err();
        assert_eq!(err.req_id, 0);

        // Missing sig array
        let err = RpcMessage::parse(r#"{"req":[3,"ping",[],1]}"#).unwrap_err();
        assert_eq!(err.req_id, 3);
    }

    #[test]
    fn rejects_non_array_params() {
        let err = RpcMessage::parse(r#"{"req":[1,"ping",{},1700000000],"sig":[]}"#).unwrap_err();
        assert_eq!(err.req_id, 1);
        assert!(err.reason.contains("params"));
    }

    #[test]
    fn first_param_errors() {
        #[derive(serde::Deserialize)]
        struct P {
            #[allow(dead_code)]
            address: String,
        }

        let missing = first_param::<P>(&[]);
        assert!(matches!(missing, Err(AppError::MissingParameter(_))));

        let invalid = first_param::<P>(&[json!({"other": 1})]);
        assert!(matches!(invalid, Err(AppError::Malformed(_))));
    }
}
