//! Property-Based Tests for the MCP core
//!
//! This module contains property-based tests using proptest to verify invariants
//! hold for random inputs across the MCP client implementation.
//!
//! # Test Strategies
//!
//! - **Codec**: request round-trips with nested params, strictly increasing ids,
//!   decoding arbitrary input never panics
//! - **Retry Logic**: Exponential backoff properties - delays stay within bounds
//! - **Tool Bridge**: required-field validation agrees with the generated input
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib mcp::proptests
//! ```

use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

use crate::mcp::bridge::validate_arguments;
use crate::mcp::codec::ProtocolCodec;
use crate::mcp::error::McpClientError;
use crate::mcp::protocol::{McpMessage, RpcError, Tool};
use crate::mcp::retry::RetryConfig;
use std::time::Duration;

// Helper: Generate arbitrary scalar JSON values
fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ]
}

// Helper: Generate nested mappings and sequences
fn arb_json_value() -> impl Strategy<Value = Value> {
    arb_scalar().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..4).prop_map(Value::Array),
            btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>())),
        ]
    })
}

fn arb_params() -> impl Strategy<Value = Option<Value>> {
    prop::option::of(
        btree_map("[a-z_]{1,8}", arb_json_value(), 0..5)
            .prop_map(|m| Value::Object(m.into_iter().collect())),
    )
}

// ============================================================================
// Property 1: Codec
// ============================================================================

proptest! {
    /// Encoding then decoding a request preserves method and params
    #[test]
    fn prop_request_roundtrip(method in "[a-z]+(/[a-z_]+)?", params in arb_params()) {
        let codec = ProtocolCodec::new();
        let (frame, id) = codec.encode_request(&method, params.clone()).unwrap();

        match codec.decode(&frame).unwrap() {
            McpMessage::Request(request) => {
                prop_assert_eq!(request.id, id);
                prop_assert_eq!(request.method, method);
                prop_assert_eq!(request.params, params);
            }
            other => prop_assert!(false, "decoded as {:?}", other),
        }
    }

    /// Ids handed out by one codec are strictly increasing
    #[test]
    fn prop_ids_strictly_increasing(count in 1usize..200) {
        let codec = ProtocolCodec::new();
        let ids: Vec<u64> = (0..count)
            .map(|_| codec.encode_request("ping", None).unwrap().1)
            .collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));

        codec.reset();
        prop_assert_eq!(codec.encode_request("ping", None).unwrap().1, ids[0]);
    }

    /// Arbitrary input either decodes or fails with a decoding error
    #[test]
    fn prop_decode_never_panics(frame in ".*") {
        let codec = ProtocolCodec::new();
        if let Err(e) = codec.decode(&frame) {
            let is_decode_error = matches!(
                e,
                McpClientError::MalformedMessage(_) | McpClientError::ProtocolVersionMismatch { .. }
            );
            prop_assert!(is_decode_error);
        }
    }

    /// Error responses decode with code, message and data intact
    #[test]
    fn prop_error_response_decodes(
        id in 1u64..10_000,
        code in -32768i32..32000,
        message in "[a-zA-Z ]+",
        data in prop::option::of(arb_json_value())
    ) {
        let mut error = json!({"code": code, "message": message});
        if let Some(data) = &data {
            error["data"] = data.clone();
        }
        let frame = json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string();

        match ProtocolCodec::new().decode(&frame).unwrap() {
            McpMessage::Response(response) => {
                prop_assert_eq!(response.id, id);
                let err: RpcError = response.into_result().unwrap_err();
                prop_assert_eq!(err.code, code);
                prop_assert_eq!(err.message, message);
                // An explicit `"data": null` reads back as absent
                prop_assert_eq!(err.data, data.filter(|d| !d.is_null()));
            }
            other => prop_assert!(false, "decoded as {:?}", other),
        }
    }
}

// ============================================================================
// Property 2: Retry Logic Properties
// ============================================================================

proptest! {
    /// Test that retry delays are bounded by max_delay
    #[test]
    fn prop_retry_delays_bounded_by_max(
        base_delay_ms in 10u64..1000,
        max_delay_ms in 1000u64..60000,
        attempt in 0usize..100usize
    ) {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(base_delay_ms))
            .max_delay(Duration::from_millis(max_delay_ms));

        let delay = config.calculate_delay(attempt);
        prop_assert!(delay <= Duration::from_millis(max_delay_ms));
    }

    /// Without jitter, delays never shrink as attempts grow
    #[test]
    fn prop_retry_delays_monotonic_without_jitter(
        base_delay_ms in 1u64..1000,
        attempt in 1usize..40usize
    ) {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(base_delay_ms))
            .max_delay(Duration::from_secs(60))
            .jitter(0.0);

        prop_assert!(config.calculate_delay(attempt) >= config.calculate_delay(attempt - 1));
    }
}

// ============================================================================
// Property 3: Tool Bridge Validation
// ============================================================================

proptest! {
    /// Arguments containing every required string field pass validation
    #[test]
    fn prop_required_fields_present_passes(
        fields in btree_map("[a-z]{1,6}", "[a-z]*", 1..5)
    ) {
        let properties: Map<String, Value> = fields
            .keys()
            .map(|k| (k.clone(), json!({"type": "string"})))
            .collect();
        let required: Vec<&String> = fields.keys().collect();
        let schema = json!({
            "type": "object",
            "properties": properties,
            "required": required
        });
        let args: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        prop_assert!(validate_arguments(&schema, &Value::Object(args.clone())).is_ok());

        // Dropping any one field is reported
        let (dropped, _) = fields.iter().next().unwrap();
        let mut partial = args;
        partial.remove(dropped);
        let problems = validate_arguments(&schema, &Value::Object(partial)).unwrap_err();
        prop_assert_eq!(problems.len(), 1);
        prop_assert!(problems[0].contains(dropped.as_str()));
    }

    /// Tool definitions survive serialization with their schema
    #[test]
    fn prop_tool_schema_preserved(
        name in "[a-z_]+",
        schema in arb_json_value()
    ) {
        let tool = Tool {
            name: name.clone(),
            description: Some("Test tool".to_string()),
            input_schema: schema.clone(),
            output_schema: None,
        };

        let serialized = serde_json::to_string(&tool).unwrap();
        let deserialized: Tool = serde_json::from_str(&serialized).unwrap();

        prop_assert_eq!(tool, deserialized);
    }
}
