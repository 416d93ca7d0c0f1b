//! CLI interface for toolwatch

use anyhow::{bail, Context, Result};
use chrono::{TimeDelta, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::{self, TelemetryConfig};
use crate::metrics::{ToolStats, VarianceEvent};
use crate::perf::{PerfLogStore, PerformanceSample};
use crate::shipper::{labels, LabelSelector, LokiQuery, QueriedLine};
use crate::types::ExceptionRecord;

#[derive(Parser)]
#[command(name = "toolwatch")]
#[command(about = "Inspect tool-call telemetry: performance logs, exceptions and variance", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(short, long, global = true, env = "TOOLWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or create the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// List tools with on-disk performance logs
    Tools,
    /// Duration statistics for one tool from its performance log
    Stats {
        /// Tool name
        tool: String,
    },
    /// Query recent records for a tool from the log backend
    Query {
        /// Tool name
        tool: String,
        /// Which records to fetch
        #[arg(short, long, value_enum, default_value = "exceptions")]
        kind: QueryKind,
        /// How far back to look
        #[arg(short, long, default_value = "60", value_parser = clap::value_parser!(i64).range(1..))]
        minutes: i64,
        /// Maximum records to return
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete all on-disk performance logs
    Cleanup {
        /// Skip the confirmation notice and delete
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum QueryKind {
    Exceptions,
    Variance,
}

impl QueryKind {
    fn label(self) -> &'static str {
        match self {
            QueryKind::Exceptions => "exception",
            QueryKind::Variance => "variance",
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let config = load_config(cli.config.as_deref())?;
                let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
                println!("{}", rendered);
            }
            ConfigCommands::Init { force } => {
                let path = match cli.config {
                    Some(path) => path,
                    None => config::config_path()?,
                };
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                TelemetryConfig::default().save_to(&path)?;
                println!("Wrote default configuration to {}", path.display());
            }
            ConfigCommands::Path => {
                let path = match cli.config {
                    Some(path) => path,
                    None => config::config_path()?,
                };
                println!("{}", path.display());
            }
        },
        Commands::Tools => {
            let store = perf_store(cli.config.as_deref())?;
            list_tools(&store)?;
        }
        Commands::Stats { tool } => {
            let store = perf_store(cli.config.as_deref())?;
            show_stats(&store, &tool)?;
        }
        Commands::Query { tool, kind, minutes, limit } => {
            let config = load_config(cli.config.as_deref())?;
            query(&config, &tool, kind, minutes, limit)?;
        }
        Commands::Cleanup { yes } => {
            let store = perf_store(cli.config.as_deref())?;
            cleanup(&store, yes)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<TelemetryConfig> {
    match path {
        Some(path) => {
            let mut config = TelemetryConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
        None => TelemetryConfig::load(),
    }
}

fn perf_store(path: Option<&std::path::Path>) -> Result<PerfLogStore> {
    let config = load_config(path)?;
    Ok(PerfLogStore::new(config.storage_directory()?))
}

fn list_tools(store: &PerfLogStore) -> Result<()> {
    let tools = store.tools()?;
    if tools.is_empty() {
        println!("No performance logs in {}", store.base_dir().display());
        return Ok(());
    }

    println!("{:<40} {:>10}", "TOOL", "SAMPLES");
    for (tool, count) in tools {
        println!("{:<40} {:>10}", tool, count);
    }
    Ok(())
}

fn show_stats(store: &PerfLogStore, tool: &str) -> Result<()> {
    let samples = store.read_tool(tool, None)?;
    let durations: Vec<f64> = samples.iter().map(PerformanceSample::duration_ms).collect();
    let Some(stats) = ToolStats::from_samples(&durations) else {
        println!("No samples recorded for '{}'", tool);
        return Ok(());
    };

    let detailed = samples.iter().filter(|s| s.is_detailed()).count();
    let failed = samples
        .iter()
        .filter(|s| matches!(s, PerformanceSample::Detailed { error: Some(_), .. }))
        .count();

    println!("Statistics for '{}'", tool);
    println!("  samples:   {} ({} detailed, {} failed)", stats.count, detailed, failed);
    println!("  mean:      {:.2} ms", stats.mean);
    println!("  median:    {:.2} ms", stats.median);
    println!("  stdev:     {:.2} ms", stats.stdev);
    println!("  min / max: {:.2} / {:.2} ms", stats.min, stats.max);
    println!("  p95 / p99: {:.2} / {:.2} ms", stats.p95, stats.p99);
    Ok(())
}

fn query(config: &TelemetryConfig, tool: &str, kind: QueryKind, minutes: i64, limit: usize) -> Result<()> {
    let url = config
        .loki
        .url
        .as_deref()
        .context("No log backend configured (set loki.url or TOOLWATCH_LOKI_URL)")?;
    let client = LokiQuery::new(url, config.loki_timeout())
        .context("Failed to create log backend client")?
        .with_tenant(config.loki.tenant_id.clone());

    let window = TimeDelta::try_minutes(minutes)
        .with_context(|| format!("--minutes {} is out of range", minutes))?;
    let selector = LabelSelector::new()
        .eq(labels::JOB, &config.loki.job)
        .eq(labels::KIND, kind.label())
        .eq(labels::TOOL_NAME, tool);
    let lines = client
        .query_recent(&selector, window, limit)
        .with_context(|| format!("Query {} failed", selector))?;

    if lines.is_empty() {
        println!("No {} records for '{}' in the last {} minutes", kind.label(), tool, minutes);
        return Ok(());
    }

    for line in &lines {
        println!("{}", render_line(line, kind));
    }
    Ok(())
}

fn render_line(line: &QueriedLine, kind: QueryKind) -> String {
    let at = Utc.timestamp_nanos(line.timestamp_ns).format("%Y-%m-%d %H:%M:%S");
    match kind {
        QueryKind::Exceptions => match line.decode::<ExceptionRecord>() {
            Ok(record) => format!(
                "{} [{}] {}: {}{}",
                at,
                record.severity,
                record.exception_type,
                record.message,
                if record.uncaught { " (uncaught)" } else { "" }
            ),
            Err(_) => format!("{} {}", at, line.line),
        },
        QueryKind::Variance => match line.decode::<VarianceEvent>() {
            Ok(event) => format!(
                "{} {:.1}ms vs mean {:.1}ms ({:+.1}%)",
                at,
                event.current_ms,
                event.mean_ms,
                (event.current_ms - event.mean_ms) / event.mean_ms * 100.0
            ),
            Err(_) => format!("{} {}", at, line.line),
        },
    }
}

fn cleanup(store: &PerfLogStore, yes: bool) -> Result<()> {
    let tools = store.tools()?;
    if tools.is_empty() {
        println!("Nothing to clean up in {}", store.base_dir().display());
        return Ok(());
    }
    if !yes {
        println!(
            "This will delete {} performance logs in {}. Re-run with --yes to confirm.",
            tools.len(),
            store.base_dir().display()
        );
        return Ok(());
    }

    let deleted = store.delete_all()?;
    println!("Deleted {} performance logs", deleted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::collections::BTreeMap;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_query_arguments() {
        let cli = Cli::try_parse_from(["toolwatch", "query", "sum_tool", "--kind", "variance", "-m", "5"]).unwrap();
        match cli.command {
            Commands::Query { tool, kind, minutes, limit } => {
                assert_eq!(tool, "sum_tool");
                assert_eq!(kind, QueryKind::Variance);
                assert_eq!(minutes, 5);
                assert_eq!(limit, 20);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_query_minutes_must_be_positive() {
        for minutes in ["0", "-5"] {
            let parsed = Cli::try_parse_from(["toolwatch", "query", "sum_tool", "--minutes", minutes]);
            assert!(parsed.is_err(), "accepted --minutes {}", minutes);
        }
    }

    #[test]
    fn test_huge_query_window_is_an_error() {
        let mut config = TelemetryConfig::default();
        config.loki.url = Some("http://127.0.0.1:9".to_string());
        let err = query(&config, "sum_tool", QueryKind::Exceptions, i64::MAX, 10).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_render_exception_line() {
        let line = QueriedLine {
            labels: BTreeMap::new(),
            timestamp_ns: 0,
            line: serde_json::json!({
                "request_id": "r1",
                "exception_type": "ValueError",
                "message": "bad input",
                "stack_trace": "",
                "severity": "medium",
                "context": {
                    "request_id": "r1",
                    "tool_name": "sum_tool",
                    "started_at": "2024-01-01T00:00:00Z"
                },
                "captured_at": "2024-01-01T00:00:00Z"
            })
            .to_string(),
        };
        assert_eq!(
            render_line(&line, QueryKind::Exceptions),
            "1970-01-01 00:00:00 [medium] ValueError: bad input"
        );
    }
}
