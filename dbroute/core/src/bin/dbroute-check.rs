//! dbroute-check
//!
//! Loads a routing file, validates it, and prints the master/slave layout of
//! every entity.
//!
//! # Usage
//!
//! ```bash
//! # Default file ($XDG_CONFIG_HOME/dbroute/routing.toml) or DBROUTE_CONFIG
//! dbroute-check
//!
//! # Explicit file, JSON output
//! dbroute-check --config ./routing.toml --json
//!
//! # Verbose logging
//! RUST_LOG=debug dbroute-check
//! ```
//!
//! Exits non-zero when the file cannot be read or fails validation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use dbroute_core::{load_config, load_config_from_path, ConfigSource, RouterConfig, RoutingFile};

/// Validate a dbroute routing file
#[derive(Parser, Debug)]
#[command(name = "dbroute-check")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Routing file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "DBROUTE_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Serialize)]
struct EntitySummary {
    entity: String,
    master: String,
    slaves: Vec<String>,
    force_slave_reads: bool,
    options: usize,
}

#[derive(Debug, Serialize)]
struct Summary {
    source: String,
    router: RouterConfig,
    entities: Vec<EntitySummary>,
}

fn summarize(file: &RoutingFile, source: &ConfigSource) -> Result<Summary> {
    let entities = file
        .entity_configs()?
        .into_iter()
        .map(|(entity, config)| EntitySummary {
            entity,
            master: config.master.to_string(),
            slaves: config.slaves.iter().map(ToString::to_string).collect(),
            force_slave_reads: config.force_slave_reads,
            options: config.options.len(),
        })
        .collect();
    Ok(Summary {
        source: source.to_string(),
        router: file.router.clone(),
        entities,
    })
}

fn print_text(summary: &Summary) {
    println!("source: {}", summary.source);
    println!(
        "router: window={}s connections_should_exist={} force_slave_reads={}",
        summary.router.eligibility_window_secs,
        summary.router.connections_should_exist,
        summary.router.force_slave_reads
    );
    for entity in &summary.entities {
        let slaves = if entity.slaves.is_empty() {
            "-".to_string()
        } else {
            entity.slaves.join(", ")
        };
        println!(
            "{}: master={} slaves=[{}]{}",
            entity.entity,
            entity.master,
            slaves,
            if entity.force_slave_reads { " (forced slave reads)" } else { "" }
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let (file, source) = match &args.config {
        Some(path) => {
            let file = load_config_from_path(path)
                .with_context(|| format!("Failed to load routing file {}", path.display()))?;
            let file = RoutingFile {
                router: file.router.with_env_overrides(),
                ..file
            };
            (file, ConfigSource::File(path.clone()))
        }
        None => load_config().context("Failed to load routing configuration")?,
    };

    let summary = summarize(&file, &source)?;
    info!(source = %source, entities = summary.entities.len(), "Routing file valid");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_text(&summary);
    }
    Ok(())
}
