use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dialflow_core::config::EngineConfig;
use dialflow_core::event::EventBus;
use dialflow_core::flow::FlowDefinition;
use dialflow_core::types::{ExtractionInput, TenantId, ThreadId};
use dialflow_engine::{
    BatchEdit, ConversationService, FeedbackGate, MutationRequest, MutationResponse,
    MutationService,
};
use dialflow_graph::{export_json, merge, Compiler, FlowLayer};
use dialflow_store::Stores;

#[derive(Parser)]
#[command(name = "dialflow", version, about = "Versioned conversation flow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dialflow.toml")]
    config: PathBuf,

    /// Tenant that owns the flows
    #[arg(short, long, default_value = "default", env = "DIALFLOW_TENANT")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a flow definition and report errors and warnings
    Check {
        /// Flow definition (JSON)
        flow: PathBuf,
        /// Print the compiled graph export
        #[arg(long)]
        export: bool,
    },
    /// Merge layer files and print the effective flow
    Merge {
        /// Layer files (JSON), any tier order
        #[arg(required = true)]
        layers: Vec<PathBuf>,
    },
    /// Apply a batch of edits to a flow and publish the next version
    Apply {
        /// Flow definition (JSON), published first if the store lacks it
        flow: PathBuf,
        /// Batch edits (JSON array)
        edits: PathBuf,
        /// Change description recorded on the new version
        #[arg(short, long)]
        description: Option<String>,
        /// Drafted user messages to reconcile against the result
        #[arg(long = "say")]
        messages: Vec<String>,
    },
    /// Replay extractor turns (JSON lines) through a flow
    Replay {
        /// Flow definition (JSON)
        flow: PathBuf,
        /// One extraction input per line; `-` reads stdin
        turns: PathBuf,
        /// Context values (JSON object) readable as `ctx.<name>`
        #[arg(long)]
        context: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.filter.as_str())),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if !cli.config.exists() {
        debug!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let tenant = TenantId::new(cli.tenant);
    match cli.command {
        Commands::Check { flow, export } => check(&flow, export),
        Commands::Merge { layers } => merge_layers(&layers),
        Commands::Apply {
            flow,
            edits,
            description,
            messages,
        } => apply(&config, &tenant, &flow, &edits, description, &messages),
        Commands::Replay {
            flow,
            turns,
            context,
        } => replay(&config, &tenant, &flow, &turns, context.as_deref()).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn check(path: &Path, export: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let graph = Compiler::new()
        .compile_json(&raw)
        .with_context(|| format!("{} does not compile", path.display()))?;

    for warning in graph.warnings() {
        warn!(flow = %graph.id(), "{}", warning);
    }
    if export {
        println!("{}", export_json(&graph)?);
    } else {
        println!(
            "{} v{}: ok ({} scope(s), {} warning(s))",
            graph.id(),
            graph.version(),
            graph.scope_ids().len(),
            graph.warnings().len()
        );
    }
    Ok(())
}

fn merge_layers(paths: &[PathBuf]) -> anyhow::Result<()> {
    let layers = paths
        .iter()
        .map(|p| read_json::<FlowLayer>(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let outcome = merge(&layers)?;

    for conflict in &outcome.conflicts {
        warn!(
            element = %conflict.element,
            field = %conflict.field,
            winner = %conflict.layer_b,
            "Merge conflict"
        );
    }
    info!(
        flow = %outcome.definition.id,
        layers = layers.len(),
        conflicts = outcome.conflicts.len(),
        "Layers merged"
    );
    println!("{}", serde_json::to_string_pretty(&outcome.definition)?);
    Ok(())
}

fn apply(
    config: &EngineConfig,
    tenant: &TenantId,
    flow_path: &Path,
    edits_path: &Path,
    description: Option<String>,
    messages: &[String],
) -> anyhow::Result<()> {
    let definition: FlowDefinition = read_json(flow_path)?;
    let edits: Vec<BatchEdit> = read_json(edits_path)?;

    let stores = dialflow_store::open(&config.store)?;
    let service = MutationService::new(stores.flows.clone(), Arc::new(EventBus::default()));
    let current = match stores.flows.latest(tenant, &definition.id)? {
        Some(current) => current,
        None => service.create(tenant, definition, std::env::var("USER").ok())?,
    };

    let request = MutationRequest {
        tenant: tenant.clone(),
        flow: current.id.clone(),
        base_version: current.version,
        edits,
        description,
        author: std::env::var("USER").ok(),
    };
    let result = service.apply(&request);

    println!(
        "{}",
        serde_json::to_string_pretty(&MutationResponse::from_result(&result))?
    );
    if !messages.is_empty() {
        for message in FeedbackGate::new()?.reconcile_mutation(messages, &result) {
            println!("{}", message);
        }
    }
    if let Ok(published) = &result {
        debug!(flow = %published.id, version = %published.version, "Edited flow published");
    }
    Ok(())
}

async fn replay(
    config: &EngineConfig,
    tenant: &TenantId,
    flow_path: &Path,
    turns_path: &Path,
    context_path: Option<&Path>,
) -> anyhow::Result<()> {
    let definition: FlowDefinition = read_json(flow_path)?;
    let context: BTreeMap<String, Value> = match context_path {
        Some(path) => read_json(path)?,
        None => BTreeMap::new(),
    };

    let stores = Stores::memory();
    let bus = Arc::new(EventBus::default());
    let flow = MutationService::new(stores.flows.clone(), bus.clone())
        .create(tenant, definition, None)?
        .id;
    let service = ConversationService::new(config, stores.flows, stores.conversations, bus);
    let thread = ThreadId::new("replay");

    let outcome = service.start(tenant, &flow, &thread, context).await?;
    println!("{}", serde_json::to_string(&outcome)?);

    let reader: Box<dyn BufRead> = if turns_path == Path::new("-") {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = std::fs::File::open(turns_path)
            .with_context(|| format!("Failed to open {}", turns_path.display()))?;
        Box::new(BufReader::new(file))
    };

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let input: ExtractionInput = serde_json::from_str(&line)
            .with_context(|| format!("Line {}: invalid extraction input", index + 1))?;
        let outcome = service.submit_turn(tenant, &thread, input).await?;
        println!("{}", serde_json::to_string(&outcome)?);
    }

    let Some(snapshot) = service.snapshot(tenant, &thread)? else {
        bail!("replayed conversation disappeared");
    };
    info!(
        flow = %flow,
        turns = snapshot.state.turn,
        node_id = %snapshot.state.current_node_id,
        status = ?snapshot.state.status,
        "Replay finished"
    );
    Ok(())
}
