//! MCP Integration Tests
//!
//! This module contains integration tests that run against real MCP servers.
//! These tests verify that the client works correctly with actual MCP implementations.
//!
//! # Requirements
//!
//! These tests require:
//! - Node.js and npm (for @modelcontextprotocol/server-filesystem)
//! - `bash` and `jq` for the scripted servers
//!
//! # Running the Tests
//!
//! By default, integration tests are ignored to avoid slowing down regular test runs.
//! Run them with:
//!
//! ```bash
//! cargo test --lib -- --ignored
//! ```

use crate::mcp::{McpClient, McpClientError, RetryConfig, ServerDescriptor};
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;
use tokio::time::{timeout, Duration};

/// Helper to create a timeout for integration tests
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn script_server(name: &str, body: &str) -> (NamedTempFile, ServerDescriptor) {
    let mut file = NamedTempFile::new().expect("Failed to create script");
    file.write_all(body.as_bytes())
        .expect("Failed to write script");
    file.flush().expect("Failed to flush script");
    let descriptor = ServerDescriptor::stdio(
        name,
        "bash",
        [file.path().to_string_lossy().to_string()],
    )
    .with_retry(RetryConfig::new().max_attempts(1));
    (file, descriptor)
}

/// Test against the filesystem MCP server
///
/// This test verifies that our client can work with the official
/// @modelcontextprotocol/server-filesystem server.
#[tokio::test]
#[ignore = "integration test - requires npm and Node.js"]
async fn test_integration_filesystem_server() {
    let test_dir = tempfile::tempdir().expect("Failed to create test directory");
    std::fs::write(test_dir.path().join("hello.txt"), "hello").expect("Failed to write file");
    let root = test_dir.path().to_string_lossy().to_string();

    let client = McpClient::new(ServerDescriptor::stdio(
        "filesystem",
        "npx",
        ["-y", "@modelcontextprotocol/server-filesystem", root.as_str()],
    ));

    let info = timeout(TEST_TIMEOUT, client.connect())
        .await
        .expect("Initialize timeout")
        .expect("Failed to initialize");
    assert!(crate::mcp::protocol::is_supported_version(&info.protocol_version));

    let tools = timeout(TEST_TIMEOUT, client.list_tools())
        .await
        .expect("List tools timeout")
        .expect("Failed to list tools");
    let tool_names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert!(tool_names.contains(&"read_file"), "Missing read_file tool");
    assert!(tool_names.contains(&"list_directory"), "Missing list_directory tool");

    let result = timeout(
        TEST_TIMEOUT,
        client.call_tool("list_directory", json!({ "path": root })),
    )
    .await
    .expect("Tool call timeout")
    .expect("Failed to call list_directory");
    assert!(result.to_string().contains("hello.txt"));

    client.disconnect().await;
}

/// Full lifecycle against a jq-driven echo server
#[cfg(unix)]
#[tokio::test]
#[ignore = "integration test - requires bash and jq"]
async fn test_integration_echo_server() {
    let (_script, descriptor) = script_server(
        "echo",
        r#"
while IFS= read -r line; do
    id=$(echo "$line" | jq -r '.id // empty')
    method=$(echo "$line" | jq -r '.method // "unknown"')
    [ -z "$id" ] && continue

    case "$method" in
        "initialize")
            echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{\"tools\":{}},\"serverInfo\":{\"name\":\"echo-server\",\"version\":\"1.0.0\"}}}"
            ;;
        "tools/list")
            echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"echo\",\"description\":\"Echo back the input\",\"inputSchema\":{\"type\":\"object\"}}]}}"
            ;;
        "tools/call")
            echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"echoed\":$(echo "$line" | jq -c '.params.arguments // {}')}}"
            ;;
        *)
            echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32601,\"message\":\"Method not found: $method\"}}"
            ;;
    esac
done
"#,
    );

    let client = McpClient::new(descriptor);
    timeout(TEST_TIMEOUT, client.connect())
        .await
        .expect("Initialize timeout")
        .expect("Failed to initialize");

    let tools = client.list_tools().await.expect("Failed to list tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    // Concurrent calls over one pipe, correlated by id
    let (a, b) = tokio::join!(
        client.call_tool("echo", json!({"message": "a"})),
        client.call_tool("echo", json!({"message": "b"})),
    );
    assert_eq!(a.unwrap(), json!({"echoed": {"message": "a"}}));
    assert_eq!(b.unwrap(), json!({"echoed": {"message": "b"}}));

    assert_eq!(
        client.call_tool("missing", json!({})).await.unwrap_err(),
        McpClientError::ToolNotFound("missing".into())
    );

    client.disconnect().await;
}

/// A server that only ever writes garbage never completes the handshake
#[cfg(unix)]
#[tokio::test]
#[ignore = "integration test - requires bash"]
async fn test_integration_malformed_server() {
    let (_script, descriptor) = script_server(
        "malformed",
        r#"
while IFS= read -r line; do
    echo '{"jsonrpc":"2.0","id":1,"result":{"test":'
done
"#,
    );

    let client = McpClient::new(descriptor.with_connect_timeout(Duration::from_secs(2)));
    let err = timeout(TEST_TIMEOUT, client.connect())
        .await
        .expect("connect hung")
        .unwrap_err();
    assert!(matches!(err, McpClientError::ServerUnavailable { .. }), "got {err:?}");
}

/// The server exits after the handshake; the next call reconnects
#[cfg(unix)]
#[tokio::test]
#[ignore = "integration test - requires bash and jq"]
async fn test_integration_server_restart() {
    let (_script, descriptor) = script_server(
        "restart",
        r#"
while IFS= read -r line; do
    id=$(echo "$line" | jq -r '.id // empty')
    [ -z "$id" ] && continue
    echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"serverInfo\":{\"name\":\"restart\",\"version\":\"1.0\"}}}"
    sleep 0.2
    exit 0
done
"#,
    );

    let client = McpClient::new(descriptor);
    let mut events = client.subscribe();
    client.connect().await.expect("Failed to initialize");

    // Wait for the child to exit and the fault to land
    let lost = timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(crate::mcp::ServerEvent::ConnectionLost { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(lost.is_ok(), "fault was never reported");

    // initialize is answered by the fresh process, ping is not
    let result = timeout(TEST_TIMEOUT, client.ping()).await.expect("ping hung");
    assert!(result.is_err());
    client.disconnect().await;
}
