// src/main.rs

//! Command-line client: runs each stdin line through the pool and prints the results
//! as JSON lines.

use anyhow::{Context, Result, anyhow};
use pgcluster::config::Config;
use pgcluster::core::transport::PgConnector;
use pgcluster::core::{Cluster, Cursor, Driver, PoolError, QueryOptions};
use serde_json::json;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

const USAGE: &str = "Usage: pgcluster [--config path] [--listen channel]...";

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = match option_env!("PGCLUSTER_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    };

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("pgcluster version {VERSION}");
        return Ok(());
    }
    if args.contains(&"--help".to_string()) {
        println!("{USAGE}");
        return Ok(());
    }

    // It can be provided via a --config flag; otherwise, it defaults to "pgcluster.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("pgcluster.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    let mut channels = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--listen" {
            match iter.next() {
                Some(channel) => channels.push(channel.clone()),
                None => {
                    eprintln!("--listen flag requires a value\n{USAGE}");
                    std::process::exit(1);
                }
            }
        }
    }

    // Logs go to stderr so that stdout carries only results.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = run(config, channels).await {
        error!("pgcluster runtime error: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config, channels: Vec<String>) -> Result<()> {
    let driver = config.driver();
    let cluster = Cluster::new(PgConnector::new(), config.cluster_config());
    cluster
        .connect(config.address(), config.database.pool_size)
        .await
        .context("Failed to connect the pool")?;

    for channel in &channels {
        cluster.subscribe(channel, |notification| {
            println!("{}", json!({ "notification": notification }));
        });
    }
    if !channels.is_empty() {
        cluster.listen(channels.iter().cloned()).await?;
        info!("Listening on {}", channels.join(", "));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match execute(&cluster, &driver, line).await {
                    Ok(output) => println!("{output}"),
                    Err(e) => println!("{}", json!({ "error": format!("{e:#}") })),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted.");
                break;
            }
        }
    }

    cluster.disconnect().await;
    Ok(())
}

/// Runs one input line. `\stats` and `\sweep` are local commands, `:name args...` runs a
/// named template, anything else is sent as-is.
async fn execute(cluster: &Cluster, driver: &Driver, line: &str) -> Result<serde_json::Value> {
    if line == "\\stats" {
        return Ok(serde_json::to_value(cluster.stats())?);
    }
    if line == "\\sweep" {
        return Ok(json!({ "evicted": cluster.sweep_cache() }));
    }

    let cursor: Result<Cursor, PoolError> = match line.strip_prefix(':') {
        Some(invocation) => {
            let mut words = invocation.split_whitespace();
            let name = words
                .next()
                .ok_or_else(|| anyhow!("missing template name after ':'"))?;
            let args: Vec<&str> = words.collect();
            driver
                .query(cluster, name, &args, QueryOptions::empty(), None)?
                .await
        }
        None => cluster.query(line, QueryOptions::empty(), None).await,
    };
    Ok(serde_json::to_value(cursor?)?)
}
