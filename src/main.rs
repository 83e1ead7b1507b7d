//! `toolbridge` command line: ask a question with tools, or list the tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use toolbridge::agent_core::{Conversation, ConversationDriver, DriverEvent};
use toolbridge::backend::{BackendSpec, ContainerRuntime, DockerRuntime};
use toolbridge::config::{load_agent_config, AgentConfig};
use toolbridge::inference::OllamaClient;
use toolbridge::toolset::ToolSet;

const DEFAULT_CONFIG_FILE: &str = "toolbridge.yaml";

/// Longest tool result echoed with `--show-tools`.
const RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Parser)]
#[command(name = "toolbridge", version, about = "Local LLM agent with MCP tool backends")]
struct Cli {
    /// Configuration file. Defaults to ./toolbridge.yaml when present.
    #[arg(short, long, env = "TOOLBRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// More log output; repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the model a question, letting it call tools.
    Query {
        /// The question.
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Print the model's thinking to stderr.
        #[arg(long)]
        show_thinking: bool,

        /// Print tool calls and results to stderr.
        #[arg(long)]
        show_tools: bool,
    },
    /// List the tools the configured backends offer.
    Tools {
        /// Include every parameter.
        #[arg(long)]
        detailed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    toolbridge::init_tracing(cli.verbose, cli.log_file.as_deref())
        .context("failed to initialize logging")?;

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Query {
            question,
            show_thinking,
            show_tools,
        } => query(&config, &question.join(" "), show_thinking, show_tools).await,
        Command::Tools { detailed } => list_tools(&config, detailed).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => load_agent_config(path)
            .with_context(|| format!("loading {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            load_agent_config(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("loading {DEFAULT_CONFIG_FILE}"))
        }
        None => {
            tracing::info!("no configuration file, running without tools");
            Ok(AgentConfig::default())
        }
    }
}

/// Start every configured backend and discover its tools.
async fn build_toolset(config: &AgentConfig) -> Result<ToolSet> {
    let mut specs: Vec<BackendSpec> = config
        .local_program_specs()
        .into_iter()
        .map(BackendSpec::Local)
        .collect();

    let containers = config.container_specs();
    if !containers.is_empty() {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::connect().context("connecting to the container engine")?);
        specs.extend(containers.into_iter().map(|spec| BackendSpec::Container {
            spec,
            runtime: Arc::clone(&runtime),
        }));
    }

    let toolset = ToolSet::build(specs, config.discovery_policy)
        .await
        .context("starting tool backends")?;
    if !toolset.startup_errors().is_empty() {
        eprintln!(
            "warning: some tool backends are unavailable: {}",
            toolset.startup_errors()
        );
    }
    Ok(toolset)
}

async fn query(
    config: &AgentConfig,
    question: &str,
    show_thinking: bool,
    show_tools: bool,
) -> Result<()> {
    let system_prompt = config.system_prompt()?;
    let model = Arc::new(OllamaClient::new(&config.ollama_url)?);
    let toolset = Arc::new(build_toolset(config).await?);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_events(events_rx, show_thinking, show_tools));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling");
                cancel.cancel();
            }
        })
    };

    let mut conversation = Conversation::start(&system_prompt, toolset.instructions(), question);
    let mut driver = ConversationDriver::new(model, Arc::clone(&toolset), &config.model)
        .with_max_turns(config.max_turns)
        .with_events(events_tx);
    let outcome = driver.run(&mut conversation, &cancel).await;
    let usage = driver.usage();

    // Dropping the driver closes the event channel.
    drop(driver);
    let _ = renderer.await;
    interrupt.abort();

    if let Err(e) = toolset.shutdown().await {
        tracing::warn!(error = %e, "tool shutdown reported errors");
    }

    eprintln!(
        "tokens: {} prompt, {} response",
        usage.prompt, usage.response
    );
    outcome.map(|_| ()).context("conversation failed")
}

async fn render_events(
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
    show_thinking: bool,
    show_tools: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            DriverEvent::ContentLine(line) => println!("{line}"),
            DriverEvent::ThinkingLine(line) if show_thinking => eprintln!("  … {line}"),
            DriverEvent::ToolCall(call) if show_tools => {
                eprintln!("→ {} {} [{}]", call.name(), call.function.arguments, call.id);
            }
            DriverEvent::ToolResults(results) if show_tools => {
                for result in results {
                    let id = result.tool_call_id.as_deref().unwrap_or("");
                    eprintln!("← [{id}] {}", preview(&result.content));
                }
            }
            _ => {}
        }
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    match flat.char_indices().nth(RESULT_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat,
    }
}

async fn list_tools(config: &AgentConfig, detailed: bool) -> Result<()> {
    let toolset = build_toolset(config).await?;

    for instruction in toolset.instructions() {
        println!("Instruction: {}", instruction.content);
        println!("=== End instruction ===");
    }

    for definition in toolset.definitions() {
        println!("{}: {}", definition.name(), definition.function.description);
        if !detailed {
            continue;
        }
        let parameters = &definition.function.parameters;
        for (name, property) in &parameters.properties {
            let required = if parameters.required.iter().any(|r| r == name) {
                " (required)"
            } else {
                ""
            };
            let description = property.description.as_deref().unwrap_or_default();
            println!("  - {name}: {description}{required}");
        }
    }

    toolset
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("shutting down tools: {e}"))
}
