// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ExecutionContext, ExecutionEvent, LogLevel, NodeSpec, Value, ValueMap, Workflow};
use flowruntime::{execution_levels, Dag, FlowRuntime, NodeRegistry, RunStatus, RuntimeConfig};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Nodes allowed to execute at once
        #[arg(long, default_value_t = 10)]
        max_concurrent: usize,

        /// Whole-run deadline
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

fn load_workflow(file: &PathBuf) -> Result<Workflow> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    Ok(Workflow::from_json(&raw)?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            file,
            input,
            max_concurrent,
            timeout_secs,
            verbose,
        } => {
            init_tracing(verbose);
            let config = RuntimeConfig {
                max_concurrent,
                timeout: Duration::from_secs(timeout_secs),
                ..Default::default()
            };
            run_workflow(file, input, config).await
        }
        Commands::Validate { file } => validate_workflow(file),
        Commands::Nodes => {
            list_nodes();
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(output),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_inputs(input: Option<String>) -> Result<ValueMap> {
    let Some(raw) = input else {
        return Ok(ValueMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&raw).context("parsing --input")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        _ => bail!("Input must be a JSON object"),
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>, config: RuntimeConfig) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;
    let inputs = parse_inputs(input)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.edges.len());
    println!();

    let runtime = FlowRuntime::with_registry(registry(), config);

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { total_nodes, .. } => {
                    println!("▶️  Workflow started ({} nodes)", total_nodes);
                }
                ExecutionEvent::NodeStarted { node_id, node_type, .. } => {
                    println!("  ⚡ Starting node: {} ({})", node_id, node_type);
                }
                ExecutionEvent::NodeCompleted {
                    node_id,
                    duration_ms,
                    progress,
                    ..
                } => {
                    println!("  ✅ Node {} completed in {}ms [{}%]", node_id, duration_ms, progress);
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node_id, error);
                }
                ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
                    println!("  ⏭️  Node {} skipped: {}", node_id, reason);
                }
                ExecutionEvent::Log {
                    node_id,
                    level,
                    message,
                    ..
                } => match level {
                    LogLevel::Warn | LogLevel::Error => println!("     ⚠️  [{}] {}", node_id, message),
                    _ => println!("     ℹ️  [{}] {}", node_id, message),
                },
                ExecutionEvent::RunCompleted { duration_ms, .. } => {
                    println!("✨ Workflow completed successfully in {}ms", duration_ms);
                }
                ExecutionEvent::RunFailed {
                    error_kind,
                    error,
                    duration_ms,
                    ..
                } => {
                    println!("💥 Workflow failed after {}ms: [{}] {}", duration_ms, error_kind, error);
                }
                ExecutionEvent::RunCancelled { duration_ms, .. } => {
                    println!("🛑 Workflow cancelled after {}ms", duration_ms);
                }
            }
        }
    });

    let ctx = Arc::new(ExecutionContext::new(workflow.id.clone()).with_trigger("manual", inputs.clone()));
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = runtime.execute(&workflow, inputs, ctx).await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Status: {:?}", result.status);
    println!("   Duration: {}ms", result.duration_ms);
    if !result.token_usage.is_empty() {
        println!("   Tokens: {}", result.token_usage.total_tokens);
    }

    if !result.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        println!("{}", serde_json::to_string_pretty(&result.outputs)?);
    }

    match result.status {
        RunStatus::Completed => Ok(()),
        status => match result.error {
            Some(error) => bail!("run {:?}: [{}] {}", status, error.kind(), error),
            None => bail!("run {:?}", status),
        },
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let dag = Dag::build(&workflow)?;
    let levels = execution_levels(&dag)?;

    let registry = registry();
    let unknown: Vec<&str> = workflow
        .nodes
        .iter()
        .filter(|n| !registry.contains(&n.node_type))
        .map(|n| n.node_type.as_str())
        .collect();
    if !unknown.is_empty() {
        bail!("Unknown node types: {}", unknown.join(", "));
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.edges.len());
    println!("   Levels:");
    for (i, level) in levels.iter().enumerate() {
        println!("     {}: {}", i, level.join(", "));
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        match registry.get_metadata(&node_type) {
            Some(metadata) => {
                println!("  • {} ({})", node_type, metadata.category);
                println!("    {}", metadata.description);
            }
            None => println!("  • {}", node_type),
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example HTTP Workflow").with_id("example-http");

    workflow.add_node(NodeSpec::new("start", "start").with_label("Start"));
    workflow.add_node(
        NodeSpec::new("fetch", "http")
            .with_label("Fetch Data")
            .with_config_json(json!({
                "method": "GET",
                "url": "{{url}}",
                "failOnError": true,
                "timeout": 10_000
            })),
    );
    workflow.add_node(
        NodeSpec::new("show", "output")
            .with_label("Show Response")
            .with_config_json(json!({"value": "{{fetch.body}}", "title": "Response"})),
    );
    workflow.add_node(NodeSpec::new("end", "end").with_label("End"));

    workflow.connect("start", "fetch");
    workflow.connect("fetch", "show");
    workflow.connect("show", "end");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}
