//! suitesched CLI - schedules test suites across exclusive environments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use suitesched::config::{self, Config, build_scheduler};
use suitesched::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use suitesched::scheduler::plan::SuiteClass;

#[derive(Parser)]
#[command(name = "suitesched")]
#[command(about = "Schedules test suites across exclusive environments", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "suitesched.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Selection {
    /// Run only the named suite (repeatable)
    #[arg(short, long = "suite")]
    suites: Vec<String>,

    /// Run only suites whose name matches this regex
    #[arg(long)]
    filter: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run suites
    Run {
        /// Dispatch pinned suites ahead of flexible ones
        #[arg(long)]
        optimize: bool,

        /// Override the per-suite timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        #[command(flatten)]
        selection: Selection,
    },

    /// Show which configs each suite may use and the dispatch queues
    Plan {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Show the optimized queue order
        #[arg(long)]
        optimize: bool,

        #[command(flatten)]
        selection: Selection,
    },

    /// Validate configuration file
    Validate,

    /// Drop environment locks held by processes that are no longer running
    PruneLocks {
        /// Also drop locks recorded under this process id
        #[arg(long)]
        all: bool,
    },

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            optimize,
            timeout,
            junit,
            selection,
        } => run_suites(&cli.config, optimize, timeout, junit, &selection, cli.verbose).await,
        Commands::Plan {
            format,
            optimize,
            selection,
        } => show_plan(&cli.config, &format, optimize, &selection),
        Commands::Validate => validate_config(&cli.config),
        Commands::PruneLocks { all } => prune_locks(&cli.config, all),
        Commands::Init => init_config(&cli.config),
    }
}

fn compile_filter(selection: &Selection) -> Result<Option<Regex>> {
    selection
        .filter
        .as_deref()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("Invalid filter: {}", pattern)))
        .transpose()
}

async fn run_suites(
    config_path: &Path,
    optimize: bool,
    timeout: Option<u64>,
    junit_path: Option<PathBuf>,
    selection: &Selection,
    verbose: bool,
) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let mut options = config.scheduler.options();
    if optimize {
        options = options.with_optimize(true);
    }
    if let Some(secs) = timeout {
        options = options.with_suite_timeout(Duration::from_secs(secs));
    }

    let filter = compile_filter(selection)?;
    let selected = config.select_suites(&selection.suites, filter.as_ref())?;
    let scheduler = build_scheduler(&config, &selected, options)?;

    std::fs::create_dir_all(&config.report.output_dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.report.output_dir.display()
        )
    })?;

    let reporter = create_reporter(&config, junit_path, verbose);
    let result = scheduler.run_with_reporter(&reporter).await?;

    std::process::exit(result.exit_code());
}

fn show_plan(config_path: &Path, format: &str, optimize: bool, selection: &Selection) -> Result<()> {
    let config = config::load_config(config_path)?;

    let mut options = config.scheduler.options();
    if optimize {
        options = options.with_optimize(true);
    }

    let filter = compile_filter(selection)?;
    let selected = config.select_suites(&selection.suites, filter.as_ref())?;
    let scheduler = build_scheduler(&config, &selected, options)?;
    let plan = scheduler.describe();

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&plan)?;
            println!("{}", json);
        }
        _ => {
            println!("Suites ({}):", plan.suites.len());
            for suite in &plan.suites {
                let class = match suite.class {
                    SuiteClass::Pinned => "pinned",
                    SuiteClass::Flexible => "flexible",
                };
                println!(
                    "  {} [{}] {} -> {}",
                    suite.name,
                    class,
                    suite.requirement,
                    suite.eligible.join(", ")
                );
            }
            println!();
            println!("Queues{}:", if plan.optimize { " (optimized)" } else { "" });
            for config in &plan.configs {
                println!("  {} ({}): {}", config.name, config.env, config.queue.join(", "));
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        let selected = config.select_suites(&[], None)?;
        build_scheduler(&config, &selected, config.scheduler.options())?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Handler configurations: {}", config.handler_configurations.len());
            println!("  Suites: {}", config.suites.len());
            println!("  Optimize: {}", config.scheduler.optimize);
            match config.scheduler.suite_timeout_secs {
                Some(secs) => println!("  Suite timeout: {}s", secs),
                None => println!("  Suite timeout: none"),
            }
            if let Some(path) = &config.scheduler.lock_file {
                println!("  Lock file: {}", path.display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn prune_locks(config_path: &Path, include_self: bool) -> Result<()> {
    let config = config::load_config(config_path)?;
    let Some(locks) = config.environment_locks() else {
        bail!("No [scheduler] lock_file configured in {}", config_path.display());
    };

    let pruned = locks.prune(include_self)?;
    if pruned.is_empty() {
        println!("No stale locks in {}", locks.path().display());
    } else {
        println!("Released {} lock(s):", pruned.len());
        for env_id in &pruned {
            println!("  {}", env_id);
        }
    }

    Ok(())
}

const STARTER_CONFIG: &str = r#"# suitesched configuration file

[scheduler]
optimize = false
suite_timeout_secs = 5400

[process]
shell = "/bin/sh"
working_dir = "."

[variables]

[handler_configurations.local-1]
env = "local-1"
tags = ["local"]

[[suites]]
name = "hello-world"
requires = ["local"]
command = "echo hello from $HANDLER_CONFIGURATION"

[report]
output_dir = "suite-results"
junit = true
junit_file = "junit.xml"
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, STARTER_CONFIG)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  suitesched run");

    Ok(())
}

fn create_reporter(config: &Config, junit_override: Option<PathBuf>, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new();

    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override.unwrap_or_else(|| config.report.junit_path());
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    multi
}
