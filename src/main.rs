// toolwire - Main Entry Point
//
// Command-line front end for the MCP client core:
// - Lists configured servers
// - Lists and calls tools
// - Reads resources and renders prompts
// - Probes server health
//
// All MCP work happens in `mcp_command`; this file parses and renders.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use toolwire::config::Config;
use toolwire::logging::init_logging;
use toolwire::mcp::DefaultConnectionFactory;
use toolwire::mcp_command::{self, CallOutcome, ProbeReport, ServerSummary, ToolSummary};
use toolwire::metrics;
use tracing::debug;

/// toolwire: call MCP server tools from the command line
#[derive(Parser, Debug)]
#[command(name = "toolwire")]
#[command(author = "Toolwire Contributors")]
#[command(version)]
#[command(about = "MCP client for HTTP, WebSocket and stdio tool servers", long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/toolwire/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    metrics: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured servers
    Servers,
    /// List a server's tools
    Tools {
        /// Server name (default: default_server)
        server: Option<String>,
    },
    /// Call a tool
    Call {
        server: String,
        tool: String,

        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// List a server's resources
    Resources { server: Option<String> },
    /// Read one resource
    Read { server: String, uri: String },
    /// List a server's prompts
    Prompts { server: Option<String> },
    /// Render a prompt
    Prompt {
        server: String,
        name: String,

        /// Prompt argument as key=value (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Measure round-trip latency
    Ping { server: Option<String> },
    /// Connect and exercise every read-only operation
    Probe { server: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            Config::load_from_path(path)?
        }
        None => Config::load()?,
    };

    init_logging(&config.logging, args.verbose)?;
    debug!("toolwire v{} starting", env!("CARGO_PKG_VERSION"));

    if args.metrics {
        metrics::init().context("Failed to register metrics")?;
    }

    let result = run(args.command, &config, args.json).await;

    if args.metrics {
        print!("{}", metrics::gather_metrics()?);
    }
    result
}

async fn run(command: Commands, config: &Config, json: bool) -> Result<()> {
    match command {
        Commands::Servers => {
            let servers = mcp_command::list_servers(config)?;
            emit(json, &servers, render_servers)
        }
        Commands::Tools { server } => {
            let client = mcp_command::open_client(config, server.as_deref()).await?;
            let tools = mcp_command::list_tools(&client).await;
            client.disconnect().await;
            emit(json, &tools?, render_tools)
        }
        Commands::Call { server, tool, args } => {
            let arguments = mcp_command::parse_arguments(args.as_deref())?;
            let client = mcp_command::open_client(config, Some(&server)).await?;
            let outcome = mcp_command::call_tool(&client, &tool, arguments).await;
            client.disconnect().await;

            emit(json, &outcome, render_call)?;
            if !outcome.success {
                anyhow::bail!("Tool '{}' failed", tool);
            }
            Ok(())
        }
        Commands::Resources { server } => {
            let client = mcp_command::open_client(config, server.as_deref()).await?;
            let resources = mcp_command::list_resources(&client).await;
            client.disconnect().await;
            emit(json, &resources?, |resources| {
                for resource in resources {
                    println!(
                        "{}  {}{}",
                        resource.uri,
                        resource.name,
                        resource
                            .mime_type
                            .as_deref()
                            .map(|m| format!(" ({})", m))
                            .unwrap_or_default()
                    );
                }
            })
        }
        Commands::Read { server, uri } => {
            let client = mcp_command::open_client(config, Some(&server)).await?;
            let contents = mcp_command::read_resource(&client, &uri).await;
            client.disconnect().await;
            emit(json, &contents?, |read| {
                for content in &read.contents {
                    match content.get("text").and_then(|t| t.as_str()) {
                        Some(text) => println!("{}", text),
                        None => println!("{}", content),
                    }
                }
            })
        }
        Commands::Prompts { server } => {
            let client = mcp_command::open_client(config, server.as_deref()).await?;
            let prompts = mcp_command::list_prompts(&client).await;
            client.disconnect().await;
            emit(json, &prompts?, |prompts| {
                for prompt in prompts {
                    let args: Vec<_> = prompt
                        .arguments
                        .iter()
                        .map(|a| if a.required { a.name.clone() } else { format!("[{}]", a.name) })
                        .collect();
                    println!(
                        "{}({}){}",
                        prompt.name,
                        args.join(", "),
                        describe(prompt.description.as_deref())
                    );
                }
            })
        }
        Commands::Prompt { server, name, args } => {
            let arguments = mcp_command::parse_prompt_arguments(&args)?;
            let client = mcp_command::open_client(config, Some(&server)).await?;
            let rendered = mcp_command::get_prompt(&client, &name, arguments).await;
            client.disconnect().await;
            emit(json, &rendered?, |rendered| {
                for message in &rendered.messages {
                    let role = message["role"].as_str().unwrap_or("?");
                    let text = message["content"]["text"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| message["content"].to_string());
                    println!("[{}] {}", role, text);
                }
            })
        }
        Commands::Ping { server } => {
            let client = mcp_command::open_client(config, server.as_deref()).await?;
            let latency = mcp_command::ping(&client).await;
            client.disconnect().await;
            let latency_ms = latency?.as_secs_f64() * 1000.0;
            emit(json, &serde_json::json!({ "latency_ms": latency_ms }), |_| {
                println!("pong in {:.2}ms", latency_ms)
            })
        }
        Commands::Probe { server } => {
            let descriptor = config.resolve_server(server.as_deref())?;
            let report =
                mcp_command::probe(descriptor, Arc::new(DefaultConnectionFactory)).await;
            emit(json, &report, render_probe)?;
            if !report.success {
                anyhow::bail!("Probe of '{}' failed", report.server);
            }
            Ok(())
        }
    }
}

/// Print `value` as JSON or through the human renderer
fn emit<T: Serialize + ?Sized>(json: bool, value: &T, render: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("Failed to serialize output")?
        );
    } else {
        render(value);
    }
    Ok(())
}

fn describe(description: Option<&str>) -> String {
    description.map(|d| format!(" - {}", d)).unwrap_or_default()
}

fn render_servers(servers: &Vec<ServerSummary>) {
    if servers.is_empty() {
        println!("No servers configured. Add [mcp_servers.<name>] to {}", Config::config_path().display());
        return;
    }
    for server in servers {
        println!(
            "{}{} [{}] {}{}",
            server.name,
            if server.is_default { " (default)" } else { "" },
            server.transport,
            server.target,
            describe(server.description.as_deref())
        );
    }
}

fn render_tools(tools: &Vec<ToolSummary>) {
    println!("{} tools:", tools.len());
    for tool in tools {
        println!(
            "  {}({}){}",
            tool.name,
            tool.required.join(", "),
            describe(tool.description.as_deref())
        );
    }
}

fn render_call(outcome: &CallOutcome) {
    if outcome.success {
        match outcome.content.get("content").and_then(|c| c.as_array()) {
            Some(blocks) => {
                for block in blocks {
                    match block.get("text").and_then(|t| t.as_str()) {
                        Some(text) => println!("{}", text),
                        None => println!("{}", block),
                    }
                }
            }
            None => println!("{}", outcome.content),
        }
    } else {
        eprintln!(
            "❌ {} ({}): {}",
            outcome.tool,
            outcome.error_kind.unwrap_or("error"),
            outcome.content.as_str().unwrap_or_default()
        );
    }
    debug!(duration_ms = outcome.duration_ms, "Tool call finished");
}

fn render_probe(report: &ProbeReport) {
    println!("Server: {}", report.server);
    if let (Some(name), Some(version)) = (&report.server_name, &report.server_version) {
        println!("  Implementation: {} v{}", name, version);
    }
    if let Some(protocol) = &report.protocol_version {
        println!("  Protocol: {}", protocol);
    }
    if let Some(ping) = report.ping_ms {
        println!("  Ping: {}ms", ping);
    }
    println!("  Tools ({}): {}", report.tool_names.len(), report.tool_names.join(", "));
    if let Some(count) = report.resource_count {
        println!("  Resources: {}", count);
    }
    if let Some(count) = report.prompt_count {
        println!("  Prompts: {}", count);
    }
    match &report.error {
        Some(error) => println!("❌ {}", error),
        None => println!("✅ OK"),
    }
}
