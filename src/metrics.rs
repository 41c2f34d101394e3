// Prometheus metrics for the MCP client core
//
// - Active connections per server (gauge)
// - Requests by method and outcome (counter)
// - Tool calls by tool and outcome (counter, histogram)
// - Connection attempts and faults (counter)

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref MCP_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("mcp_connections_active", "Number of active MCP server connections"),
        &["server"]
    ).expect("Failed to create MCP connections metric");

    pub static ref MCP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("mcp_requests_total", "Total number of MCP requests by outcome"),
        &["method", "status"]
    ).expect("Failed to create MCP requests metric");

    pub static ref MCP_TOOL_CALLS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("mcp_tool_calls_total", "Total number of MCP tool calls"),
        &["tool_name", "status"]
    ).expect("Failed to create MCP tool calls metric");

    pub static ref MCP_TOOL_CALL_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("mcp_tool_call_duration_seconds", "Duration of MCP tool calls"),
        &["tool_name"]
    ).expect("Failed to create MCP tool call duration metric");

    pub static ref MCP_CONNECT_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("mcp_connect_attempts_total", "Connection establishment attempts"),
        &["server"]
    ).expect("Failed to create MCP connect attempts metric");

    pub static ref MCP_CONNECTION_FAULTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("mcp_connection_faults_total", "Connections that faulted while open"),
        &["server"]
    ).expect("Failed to create MCP connection faults metric");
}

/// Initialize metrics registry - call once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MCP_CONNECTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(MCP_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MCP_TOOL_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MCP_TOOL_CALL_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(MCP_CONNECT_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MCP_CONNECTION_FAULTS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
