//! `mmv-agent` command-line front end.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mmv_agent::constants::{AGENT_FULL_NAME, AGENT_NAME, AGENT_VERSION, DEFAULT_WATCH_INTERVAL_MS};
use mmv_agent::logging::init_logging;
use mmv_agent::{Agent, AgentConfig, MetricEntry, MmvResult, ReloadReason, ScanReport};

// ============================================================================
// SECTION 8: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// MMV import agent CLI
#[derive(Parser, Debug)]
#[command(
    name = "mmv-agent",
    author = "AIOps Team",
    version,
    about = "Import agent for memory-mapped value (MMV) export files",
    long_about = "Scans a directory of memory-mapped export files written by instrumented \
                  applications, validates them, and exposes their metrics, instance \
                  domains and labels as a live catalog."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "mmv-agent.toml", env = "MMV_CONFIG")]
    pub config: PathBuf,

    /// Override the stats directory from the configuration
    #[arg(short, long)]
    pub stats_dir: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "MMV_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the stats directory once and print a summary
    Scan,

    /// List exported metrics
    List {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch the current value of one metric
    Fetch {
        /// Full metric name, e.g. mmv.myapp.requests
        name: String,

        /// Instance name (default: every instance)
        #[arg(short, long)]
        instance: Option<String>,
    },

    /// Poll the reload detector and report catalog changes
    Watch {
        /// Poll interval
        #[arg(short, long, default_value_t = DEFAULT_WATCH_INTERVAL_MS)]
        interval_ms: u64,

        /// Stop after this many polls
        #[arg(long)]
        count: Option<u64>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 8.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> MmvResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AgentConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nConfiguration Summary:");
            println!("  - Stats directory: {}", config.agent.stats_dir.display());
            println!("  - Name prefix: {}", config.agent.prefix);
            println!("  - Domain: {}", config.agent.domain);
            println!("  - Log level: {} ({})", config.logging.level, config.logging.format);
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(e.into())
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> MmvResult<()> {
    let config_str = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str).map_err(|e| mmv_agent::MmvError::io(path, e))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} ({}) v{}", AGENT_FULL_NAME, AGENT_NAME, AGENT_VERSION);
    println!();
    println!("Build Information:");
    println!("  - Target: {}", std::env::consts::ARCH);
    println!("  - OS: {}", std::env::consts::OS);
    println!();
    println!("Supported export format versions: 1, 2, 3");
}

fn print_report(report: &ScanReport) {
    println!(
        "scan #{} ({}): {} clients, {} metrics, {} indoms, {} rejected, {} unstable",
        report.sequence,
        report.reason,
        report.clients,
        report.metrics,
        report.indoms,
        report.rejected,
        report.unstable
    );
}

fn handle_scan(agent: &Agent) -> MmvResult<()> {
    let report = agent.rescan(ReloadReason::Requested)?;
    print_report(&report);
    for client in agent.catalog().clients() {
        println!(
            "  {:<24} cluster {:>4}  v{}  generation {}  {} bytes",
            client.name,
            client.cluster,
            client.header.version,
            client.header.generation,
            client.len()
        );
    }
    Ok(())
}

fn handle_list(agent: &Agent, json: bool) -> AnyhowResult<()> {
    agent.reload_maybe()?;
    let catalog = agent.catalog();
    let metrics: Vec<&MetricEntry> = catalog.metrics();
    if json {
        let descs: Vec<_> = metrics.iter().map(|m| &m.desc).collect();
        println!("{}", serde_json::to_string_pretty(&descs)?);
        return Ok(());
    }
    for metric in metrics {
        let desc = &metric.desc;
        let indom = desc.indom.map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "{:<12} {:<40} {:<8} {:<9} indom {}",
            desc.pmid.to_string(),
            desc.name,
            desc.value_type.to_string(),
            desc.semantics.to_string(),
            indom
        );
    }
    Ok(())
}

fn handle_fetch(agent: &Agent, name: &str, instance: Option<&str>) -> AnyhowResult<()> {
    let Some(pmid) = agent.lookup(name)? else {
        bail!("unknown metric {name}");
    };
    let catalog = agent.catalog();
    let indom = catalog.metric(pmid).and_then(|m| m.desc.indom);

    let targets: Vec<(Option<i32>, String)> = match (indom, instance) {
        (None, _) => vec![(None, String::new())],
        (Some(indom), Some(wanted)) => {
            let Some(found) = catalog.instance_by_name(indom, wanted) else {
                bail!("metric {name} has no instance {wanted:?}");
            };
            vec![(Some(found.id), format!("[{:?}]", found.name.as_str()))]
        }
        (Some(indom), None) => catalog
            .instances(indom)
            .unwrap_or_default()
            .iter()
            .map(|i| (Some(i.id), format!("[{:?}]", i.name.as_str())))
            .collect(),
    };

    for (instance, label) in targets {
        match agent.value(pmid, instance)? {
            Some(value) => println!("{name}{label} = {value}"),
            None => println!("{name}{label} = (no value yet)"),
        }
    }
    Ok(())
}

fn handle_watch(agent: &Agent, interval_ms: u64, count: Option<u64>) -> MmvResult<()> {
    let interval = Duration::from_millis(interval_ms.max(1));
    let mut polls = 0u64;
    loop {
        if let Some(report) = agent.reload_maybe()? {
            print_report(&report);
        }
        if agent.take_names_changed() {
            println!("  names changed");
        }
        if agent.take_labels_changed() {
            println!("  labels changed");
        }
        polls += 1;
        if count.is_some_and(|limit| polls >= limit) {
            return Ok(());
        }
        thread::sleep(interval);
    }
}

// ============================================================================
// SECTION 9: MAIN ENTRY POINT
// ============================================================================

fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config_found = cli.config.exists();
    let mut config = if config_found {
        AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        AgentConfig::from_env().context("Failed to build default configuration")?
    };
    if let Some(dir) = cli.stats_dir {
        config.agent.stats_dir = dir;
    }

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    // Initialize logging
    init_logging(&logging_config)?;
    if !config_found {
        warn!(target: "mmv::init", "Config file not found at {}, using defaults", cli.config.display());
    }
    info!(
        target: "mmv::init",
        version = AGENT_VERSION,
        stats_dir = %config.agent.stats_dir.display(),
        "{} starting",
        AGENT_FULL_NAME
    );

    let agent = Agent::new(config.options());

    match cli.command {
        Some(Commands::Scan) | None => handle_scan(&agent)?,
        Some(Commands::List { json }) => handle_list(&agent, json)?,
        Some(Commands::Fetch { name, instance }) => handle_fetch(&agent, &name, instance.as_deref())?,
        Some(Commands::Watch { interval_ms, count }) => handle_watch(&agent, interval_ms, count)?,
        Some(Commands::Validate { .. } | Commands::GenerateConfig { .. } | Commands::Version) => {}
    }

    Ok(())
}
