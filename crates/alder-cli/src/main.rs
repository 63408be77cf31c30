use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use alder_core::metamodel::{JsonMetamodelParser, METAMODEL_SUFFIX};
use alder_core::model::json::JsonModelParser;
use alder_core::repository::LocalDirectoryAdapter;
use alder_core::sync::IDENTIFIER_PROPERTY;
use alder_core::{Config, MemoryGraph, ModelIndexer, SyncOutcome, SyncReport};

#[derive(Parser)]
#[command(name = "alder")]
#[command(about = "Incremental model repository indexer", long_about = None)]
struct Cli {
    /// Config file to use instead of ./alder.toml or the user config
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default alder.toml into the current directory
    Init {
        /// Overwrite an existing alder.toml
        #[arg(long)]
        force: bool,
    },
    /// Run one synchronisation cycle and report what changed
    Sync {
        /// Derived attribute to declare, as metamodel#Type.attr=language:expression
        #[arg(long = "derive", value_name = "SPEC")]
        derive: Vec<String>,

        /// Print the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Synchronise continuously until interrupted
    Watch {
        /// Derived attribute to declare, as metamodel#Type.attr=language:expression
        #[arg(long = "derive", value_name = "SPEC")]
        derive: Vec<String>,
    },
    /// Synchronise once and show what the index holds
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Synchronise once and list the instances of a type
    Query {
        /// Type to list, as metamodel#Type
        #[arg(long = "type", value_name = "TYPE")]
        type_ref: String,

        /// Also print this attribute (plain or derived) per instance
        #[arg(long, value_name = "NAME")]
        attribute: Option<String>,

        /// Derived attribute to declare, as metamodel#Type.attr=language:expression
        #[arg(long = "derive", value_name = "SPEC")]
        derive: Vec<String>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => init(force),
        Commands::Sync { ref derive, json } => sync(&cli, derive, json).await,
        Commands::Watch { ref derive } => watch(&cli, derive).await,
        Commands::Status { json } => status(&cli, json).await,
        Commands::Query {
            ref type_ref,
            ref attribute,
            ref derive,
            json,
        } => query(&cli, type_ref, attribute.as_deref(), derive, json).await,
    }
}

fn init(force: bool) -> Result<()> {
    let path = Path::new("alder.toml");
    if path.exists() && !force {
        return Err(eyre!(
            "alder.toml already exists; pass --force to overwrite"
        ));
    }
    std::fs::write(path, Config::default_config_string())?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn sync(cli: &Cli, derive: &[String], json: bool) -> Result<()> {
    let indexer = build_indexer(cli, derive, !json).await?;
    let report = run_cycle(&indexer, !json).await?;
    print_report(&report, json)
}

async fn watch(cli: &Cli, derive: &[String]) -> Result<()> {
    let indexer = build_indexer(cli, derive, true).await?;
    let report = run_cycle(&indexer, true).await?;
    print_report(&report, false)?;

    let poller = indexer.start_polling();
    println!("Watching for changes; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    indexer.shutdown().await;
    poller.await?;
    println!("Stopped");
    Ok(())
}

async fn status(cli: &Cli, json: bool) -> Result<()> {
    let indexer = build_indexer(cli, &[], !json).await?;
    run_cycle(&indexer, !json).await?;

    let stats = indexer.stats()?;
    let metrics = indexer.metrics();
    if json {
        let combined = serde_json::json!({ "stats": stats, "metrics": metrics });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(());
    }
    println!("Indexer {} ({})", indexer.id(), indexer.state());
    println!(
        "  {} metamodel(s), {} repositorie(s), {} file(s), {} element(s)",
        stats.metamodels, stats.repositories, stats.files, stats.elements
    );
    for uri in indexer.metamodel_uris() {
        println!("  metamodel {uri}");
    }
    println!(
        "  last cycle: {} ms, {} cycle(s) total",
        metrics.last_duration_ms, metrics.cycles
    );
    Ok(())
}

async fn query(
    cli: &Cli,
    type_ref: &str,
    attribute: Option<&str>,
    derive: &[String],
    json: bool,
) -> Result<()> {
    let (metamodel, type_name) = type_ref
        .split_once('#')
        .ok_or_else(|| eyre!("invalid type {type_ref:?}, expected metamodel#Type"))?;

    let indexer = build_indexer(cli, derive, !json).await?;
    run_cycle(&indexer, !json).await?;

    let instances = indexer.instances_of(metamodel, type_name)?;
    let mut rows = Vec::new();
    for element in instances {
        let identifier = match indexer.attribute_of(element, IDENTIFIER_PROPERTY)? {
            Some(value) => value.display(),
            None => String::new(),
        };
        let value = match attribute {
            Some(name) => match indexer.attribute_of(element, name)? {
                Some(value) => Some(value),
                None => indexer.derived_of(element, name)?,
            },
            None => None,
        };
        rows.push((element, identifier, value));
    }

    if json {
        let rows: Vec<serde_json::Value> = rows
            .iter()
            .map(|(element, identifier, value)| {
                serde_json::json!({
                    "element": element,
                    "identifier": identifier,
                    "value": value,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{} instance(s) of {type_ref}", rows.len());
    for (element, identifier, value) in rows {
        match value {
            Some(value) => println!("  #{element} {identifier} = {}", value.display()),
            None => println!("  #{element} {identifier}"),
        }
    }
    Ok(())
}

/// Wires up a memory-backed indexer over the configured repository: JSON
/// parsers, every metamodel file found under the repository location, and
/// any derived attributes requested on the command line.
async fn build_indexer(cli: &Cli, derive: &[String], progress: bool) -> Result<Arc<ModelIndexer>> {
    let config = load_config(cli.config.as_deref())?;
    let location = PathBuf::from(&config.repository.location);
    if config.repository.kind != "local" {
        return Err(eyre!(
            "unsupported repository kind {:?}",
            config.repository.kind
        ));
    }

    let backend = Arc::new(MemoryGraph::new());
    let indexer = Arc::new(ModelIndexer::new(backend, config.clone())?);
    indexer.add_model_parser(Arc::new(JsonModelParser::new()));
    indexer.add_metamodel_parser(Arc::new(JsonMetamodelParser::new()));

    let adapter = LocalDirectoryAdapter::new(&location)?
        .with_extensions(config.repository.extensions.clone());
    indexer.add_repository(Arc::new(adapter));

    let registered = register_metamodels(&indexer, &location).await?;
    if progress && registered > 0 {
        println!("Registered {registered} metamodel(s)");
    }
    for spec in derive {
        apply_derive(&indexer, spec, progress).await?;
    }
    Ok(indexer)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Ok(match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    })
}

/// Registers every `*.metamodel.json` under `location`. Files whose
/// dependencies appear later are retried until a pass makes no progress.
async fn register_metamodels(indexer: &ModelIndexer, location: &Path) -> Result<usize> {
    let mut remaining: Vec<PathBuf> = Vec::new();
    for entry in ignore::Walk::new(location) {
        let entry = entry?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && entry.file_name().to_string_lossy().ends_with(METAMODEL_SUFFIX) {
            remaining.push(entry.into_path());
        }
    }
    remaining.sort();

    let mut registered = 0;
    while !remaining.is_empty() {
        let mut failed = Vec::new();
        let mut progressed = false;
        for path in remaining {
            match indexer.register_metamodel(&path).await {
                Ok(true) => {
                    progressed = true;
                    registered += 1;
                }
                Ok(false) => {}
                Err(err) => failed.push((path, err)),
            }
        }
        if !progressed {
            if let Some((path, err)) = failed.into_iter().next() {
                return Err(eyre!("failed to register {}: {err}", path.display()));
            }
            break;
        }
        remaining = failed.into_iter().map(|(path, _)| path).collect();
    }
    Ok(registered)
}

/// Parses `metamodel#Type.attr=language:expression` and declares it.
async fn apply_derive(indexer: &ModelIndexer, spec: &str, progress: bool) -> Result<()> {
    let invalid =
        || eyre!("invalid derive spec {spec:?}, expected metamodel#Type.attr=language:expression");
    let (target, rule) = spec.split_once('=').ok_or_else(invalid)?;
    let (type_part, attribute) = target.rsplit_once('.').ok_or_else(invalid)?;
    let (metamodel, type_name) = type_part.split_once('#').ok_or_else(invalid)?;
    let (language, expression) = rule.split_once(':').ok_or_else(invalid)?;

    let seeded = indexer
        .add_derived_attribute(metamodel, type_name, attribute, language, expression, false)
        .await?;
    if progress {
        println!("Declared {type_part}.{attribute} ({seeded} instance(s) seeded)");
    }
    Ok(())
}

async fn run_cycle(indexer: &ModelIndexer, progress: bool) -> Result<SyncReport> {
    let spinner = progress.then(|| create_spinner("Synchronising..."));
    let outcome = indexer.sync_now().await;
    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }
    match outcome? {
        SyncOutcome::Completed(report) => Ok(report),
        SyncOutcome::Coalesced => Err(eyre!("a synchronisation cycle is already running")),
    }
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "Synchronised {} file(s), skipped {}, failed {} in {} ms",
        report.files_synchronised,
        report.files_skipped,
        report.files_failed.len(),
        report.duration.as_millis()
    );
    println!(
        "  elements +{} ~{} -{}, references resolved {}, derived seeded {} recomputed {}",
        report.elements_added,
        report.elements_updated,
        report.elements_removed,
        report.references_resolved,
        report.derived_seeded,
        report.derived_recomputed
    );
    for failure in &report.files_failed {
        println!("  failed {}: {}", failure.path, failure.reason);
    }
    if report.cancelled {
        println!("  cycle was interrupted before completing");
    }
    Ok(())
}

/// Create a simple spinner for long-running operations
fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
