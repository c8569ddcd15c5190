//! Command-line interface for oprelay.
//!
//! Provides commands for running record trees, inspecting serialized
//! reference registries and showing the resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::adapters::{
    FatalHook, LinePrompter, PromptProvider, ReportSink, ScriptedPrompter,
};
use crate::config::RelayConfig;
use crate::core::{classify, IdShape, ReferenceRegistry, RunContext, SerializedTree};
use crate::domain::{Mode, Payload, RelayError, State};
use crate::records::TreeSpec;

/// oprelay - ordered operation trees, interactive or as a library
#[derive(Parser, Debug)]
#[command(name = "oprelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a record tree described in YAML
    Run {
        /// Tree description file
        tree: PathBuf,

        /// Prompt for missing values (overrides the configured mode)
        #[arg(short, long)]
        interactive: bool,

        /// Prompt answers file (YAML or JSON mapping of prompt name to answer)
        #[arg(short, long)]
        answers: Option<PathBuf>,

        /// Write the root payload here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the serialized reference registry here
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Seed the registry from a serialized tree before running
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// List the ids in a serialized reference registry
    Refs {
        /// Serialized registry file
        file: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self, config: RelayConfig) -> Result<()> {
        match self.command {
            Commands::Run {
                tree,
                interactive,
                answers,
                output,
                registry,
                seed,
            } => {
                let options = RunOptions {
                    interactive,
                    answers,
                    output,
                    registry,
                    seed,
                };
                run_tree(&config, &tree, options).await
            }
            Commands::Refs { file } => list_refs(&file),
            Commands::Config => show_config(&config),
        }
    }
}

struct RunOptions {
    interactive: bool,
    answers: Option<PathBuf>,
    output: Option<PathBuf>,
    registry: Option<PathBuf>,
    seed: Option<PathBuf>,
}

/// Writes the root payload as pretty JSON
pub struct JsonSink {
    output: Option<PathBuf>,
}

impl JsonSink {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl ReportSink for JsonSink {
    async fn submit(&self, payload: &Payload) -> Result<()> {
        let json = serde_json::to_string_pretty(payload).context("Failed to serialize payload")?;
        match &self.output {
            Some(path) => tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write payload: {}", path.display())),
            None => {
                println!("{}", json);
                Ok(())
            }
        }
    }
}

/// Interactive runs stop the process on the first unrecoverable error
struct ExitOnFatal;

impl FatalHook for ExitOnFatal {
    fn on_fatal(&self, err: &RelayError) {
        eprintln!("\n[Run aborted: {}]", err);
        std::process::exit(1);
    }
}

async fn run_tree(config: &RelayConfig, tree_path: &Path, options: RunOptions) -> Result<()> {
    let text = std::fs::read_to_string(tree_path)
        .with_context(|| format!("Failed to read tree file: {}", tree_path.display()))?;
    let spec = TreeSpec::from_yaml(&text)?;

    let mode = if options.interactive {
        Mode::Interactive
    } else {
        config.mode
    };

    let prompter: Arc<dyn PromptProvider> = match (&options.answers, mode) {
        (Some(path), _) => Arc::new(ScriptedPrompter::from_map(load_answers(path)?)),
        (None, Mode::Interactive) => Arc::new(LinePrompter::new()),
        (None, Mode::Library) => Arc::new(ScriptedPrompter::new()),
    };

    let mut builder = RunContext::from_config(config)
        .mode(mode)
        .prompter(prompter)
        .sink(Arc::new(JsonSink::new(options.output.clone())));
    if mode.is_interactive() {
        builder = builder.fatal_hook(Arc::new(ExitOnFatal));
    }
    let ctx = builder.build();

    if let Some(seed) = &options.seed {
        let tree = read_serialized(seed)?;
        ctx.registry().parse(&tree)?;
        info!(entries = tree.records.len(), "Seeded reference registry");
    }

    let root = spec.launch(&ctx)?;
    let root_id = root.id();
    let outcome = root.done().await;

    if let Some(path) = &options.registry {
        let serialized = serde_json::to_string_pretty(&ctx.registry().serialize())
            .context("Failed to serialize registry")?;
        std::fs::write(path, serialized)
            .with_context(|| format!("Failed to write registry: {}", path.display()))?;
    }

    match outcome {
        Ok(_) => {
            eprintln!("\n[Run {} completed successfully]", root_id);
            Ok(())
        }
        Err(err) => {
            eprintln!("\n[Run {} failed: {}]", root_id, err);
            std::process::exit(1);
        }
    }
}

/// Load prompt answers from YAML (a superset of JSON)
fn load_answers(path: &Path) -> Result<State> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read answers file: {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse answers file: {}", path.display()))
}

fn read_serialized(path: &Path) -> Result<SerializedTree> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse registry: {}", path.display()))
}

/// List the ids of a serialized registry with their bucket and status
fn list_refs(path: &Path) -> Result<()> {
    let tree = read_serialized(path)?;

    // Parsing into a scratch registry rejects duplicate ids
    let registry = ReferenceRegistry::new();
    registry.parse(&tree)?;

    if tree.records.is_empty() {
        println!("No references found.");
        return Ok(());
    }

    println!("{:<32} {:<24} STATUS", "ID", "BUCKET");
    println!("{}", "-".repeat(66));
    for record in &tree.records {
        let bucket = match classify(&record.reference_id) {
            IdShape::Generated { prefix, counter } => format!("{} #{}", prefix, counter),
            IdShape::Custom => "custom".to_string(),
        };
        let status = if record.payload.is_some() {
            "resolved"
        } else {
            "pending"
        };
        println!("{:<32} {:<24} {}", record.reference_id, bucket, status);
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(config: &RelayConfig) -> Result<()> {
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!(
        "{}",
        serde_yaml::to_string(config).context("Failed to render configuration")?
    );
    Ok(())
}
