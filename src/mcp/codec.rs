//! Frame encoding and decoding
//!
//! [`ProtocolCodec`] turns outbound calls into JSON-RPC text frames and parses
//! inbound frames into [`McpMessage`]s. It owns the per-connection id counter
//! and remembers the protocol version negotiated during the handshake.
//!
//! Decoding is pure: the codec never routes messages. That is the job of
//! [`super::dispatch::Dispatcher`].

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use super::error::{McpClientError, McpResult};
use super::protocol::{
    McpMessage, McpNotification, McpRequest, McpResponse, RpcError, JSONRPC_VERSION,
};

/// First id handed out after construction or [`ProtocolCodec::reset`]
pub const FIRST_REQUEST_ID: u64 = 1;

/// Per-connection JSON-RPC codec
#[derive(Debug)]
pub struct ProtocolCodec {
    next_id: AtomicU64,
    negotiated_version: RwLock<Option<String>>,
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_REQUEST_ID),
            negotiated_version: RwLock::new(None),
        }
    }

    /// Reserve the next correlation id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Id the next call to [`Self::next_id`] will return
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Restart ids and forget the negotiated version (used on reconnect)
    pub fn reset(&self) {
        self.next_id.store(FIRST_REQUEST_ID, Ordering::SeqCst);
        *self
            .negotiated_version
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_negotiated_version(&self, version: impl Into<String>) {
        *self
            .negotiated_version
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.into());
    }

    pub fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Encode a request, assigning it a fresh id
    ///
    /// # Returns
    ///
    /// The text frame and the id it carries
    pub fn encode_request(&self, method: &str, params: Option<Value>) -> McpResult<(String, u64)> {
        let id = self.next_id();
        let request = McpRequest::new(id, method, params);
        let frame = serde_json::to_string(&request).map_err(|e| {
            McpClientError::MalformedMessage(format!("failed to encode {method} request: {e}"))
        })?;
        Ok((frame, id))
    }

    /// Encode a notification (no id is consumed)
    pub fn encode_notification(&self, method: &str, params: Option<Value>) -> McpResult<String> {
        let notification = McpNotification::new(method, params);
        serde_json::to_string(&notification).map_err(|e| {
            McpClientError::MalformedMessage(format!("failed to encode {method} notification: {e}"))
        })
    }

    /// Decode a single text frame
    pub fn decode(&self, frame: &str) -> McpResult<McpMessage> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| McpClientError::MalformedMessage(format!("invalid JSON: {e}")))?;
        self.decode_value(value)
    }

    /// Decode one already-parsed JSON-RPC object
    pub fn decode_value(&self, value: Value) -> McpResult<McpMessage> {
        let Value::Object(mut obj) = value else {
            return Err(McpClientError::MalformedMessage(
                "message is not a JSON object".to_string(),
            ));
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(Value::String(v)) => {
                return Err(McpClientError::ProtocolVersionMismatch {
                    expected: JSONRPC_VERSION.to_string(),
                    actual: v.clone(),
                })
            }
            Some(_) => {
                return Err(McpClientError::MalformedMessage(
                    "jsonrpc field is not a string".to_string(),
                ))
            }
            None => {
                return Err(McpClientError::MalformedMessage(
                    "missing jsonrpc field".to_string(),
                ))
            }
        }

        self.check_declared_version(&obj)?;

        let params = obj.remove("params");
        let id = obj.remove("id");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(McpClientError::MalformedMessage(
                    "method is not a string".to_string(),
                ));
            };
            return match id {
                None | Some(Value::Null) => Ok(McpMessage::Notification(McpNotification::new(
                    method, params,
                ))),
                Some(id) => Ok(McpMessage::Request(McpRequest::new(
                    parse_id(&id)?,
                    method,
                    params,
                ))),
            };
        }

        let id = match id {
            Some(id) => parse_id(&id)?,
            None => {
                return Err(McpClientError::MalformedMessage(
                    "message has neither method nor id".to_string(),
                ))
            }
        };

        // A present `"result": null` still counts as a result
        let result = obj.remove("result");
        let error = obj.remove("error");
        match (result, error) {
            (Some(result), None) => Ok(McpMessage::Response(McpResponse::ok(id, result))),
            (None, Some(error)) => {
                let error: RpcError = serde_json::from_value(error).map_err(|e| {
                    McpClientError::MalformedMessage(format!("invalid error object: {e}"))
                })?;
                Ok(McpMessage::Response(McpResponse::err(id, error)))
            }
            (Some(_), Some(_)) => Err(McpClientError::MalformedMessage(format!(
                "response {id} carries both result and error"
            ))),
            (None, None) => Err(McpClientError::MalformedMessage(format!(
                "response {id} carries neither result nor error"
            ))),
        }
    }

    /// Reject messages declaring a protocol version other than the negotiated one
    fn check_declared_version(&self, obj: &Map<String, Value>) -> McpResult<()> {
        let Some(expected) = self.negotiated_version() else {
            return Ok(());
        };
        let declared = ["result", "params"]
            .iter()
            .filter_map(|field| obj.get(*field))
            .filter_map(|body| body.get("protocolVersion"))
            .find_map(Value::as_str);

        match declared {
            Some(actual) if actual != expected => Err(McpClientError::ProtocolVersionMismatch {
                expected,
                actual: actual.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn parse_id(id: &Value) -> McpResult<u64> {
    id.as_u64().ok_or_else(|| {
        McpClientError::MalformedMessage(format!("unsupported request id {id}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let codec = ProtocolCodec::new();
        let (_, first) = codec.encode_request("ping", None).unwrap();
        let (_, second) = codec.encode_request("ping", None).unwrap();
        let (_, third) = codec.encode_request("tools/list", None).unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 3);
        assert_eq!(codec.peek_next_id(), 4);
    }

    #[test]
    fn test_notifications_do_not_consume_ids() {
        let codec = ProtocolCodec::new();
        let frame = codec
            .encode_notification("notifications/initialized", None)
            .unwrap();

        assert!(!frame.contains("\"id\""));
        assert_eq!(codec.peek_next_id(), 1);
    }

    #[test]
    fn test_reset_restarts_ids_and_forgets_version() {
        let codec = ProtocolCodec::new();
        codec.encode_request("ping", None).unwrap();
        codec.set_negotiated_version("2025-03-26");

        codec.reset();

        assert_eq!(codec.next_id(), 1);
        assert!(codec.negotiated_version().is_none());
    }

    #[test]
    fn test_decode_request_round_trip() {
        let codec = ProtocolCodec::new();
        let params = json!({"name": "search", "arguments": {"query": {"terms": ["a", "b"], "limit": 3}}});
        let (frame, id) = codec.encode_request("tools/call", Some(params.clone())).unwrap();

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(
            decoded,
            McpMessage::Request(McpRequest::new(id, "tools/call", Some(params)))
        );
    }

    #[test]
    fn test_decode_response_variants() {
        let codec = ProtocolCodec::new();

        let ok = codec
            .decode(r#"{"jsonrpc":"2.0","id":4,"result":{"tools":[]}}"#)
            .unwrap();
        assert_eq!(ok, McpMessage::Response(McpResponse::ok(4, json!({"tools": []}))));

        let null_result = codec
            .decode(r#"{"jsonrpc":"2.0","id":5,"result":null}"#)
            .unwrap();
        assert_eq!(null_result, McpMessage::Response(McpResponse::ok(5, Value::Null)));

        let err = codec
            .decode(r#"{"jsonrpc":"2.0","id":6,"error":{"code":-32601,"message":"nope"}}"#)
            .unwrap();
        match err {
            McpMessage::Response(resp) => assert_eq!(resp.error.unwrap().code, -32601),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let codec = ProtocolCodec::new();
        let msg = codec
            .decode(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
            .unwrap();

        assert!(msg.id().is_none());
        assert!(matches!(msg, McpMessage::Notification(n) if n.method == "notifications/tools/list_changed"));
    }

    #[test]
    fn test_decode_malformed() {
        let codec = ProtocolCodec::new();
        let cases = [
            "not json",
            "[1, 2]",
            r#"{"id":1,"result":{}}"#,
            r#"{"jsonrpc":"2.0"}"#,
            r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#,
            r#"{"jsonrpc":"2.0","id":1,"error":"boom"}"#,
        ];

        for case in cases {
            let err = codec.decode(case).unwrap_err();
            assert!(
                matches!(err, McpClientError::MalformedMessage(_)),
                "expected malformed for {case}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_decode_wrong_jsonrpc_version() {
        let codec = ProtocolCodec::new();
        let err = codec
            .decode(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#)
            .unwrap_err();

        assert_eq!(
            err,
            McpClientError::ProtocolVersionMismatch {
                expected: "2.0".to_string(),
                actual: "1.0".to_string(),
            }
        );
    }

    #[test]
    fn test_declared_version_checked_after_negotiation() {
        let codec = ProtocolCodec::new();
        let frame = r#"{"jsonrpc":"2.0","id":9,"result":{"protocolVersion":"2024-11-05"}}"#;

        // Before negotiation anything goes
        assert!(codec.decode(frame).is_ok());

        codec.set_negotiated_version("2025-06-18");
        let err = codec.decode(frame).unwrap_err();
        assert!(matches!(err, McpClientError::ProtocolVersionMismatch { .. }));

        let matching = r#"{"jsonrpc":"2.0","id":9,"result":{"protocolVersion":"2025-06-18"}}"#;
        assert!(codec.decode(matching).is_ok());
    }
}
