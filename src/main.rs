use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use weave_core::config::{load_chain, AppConfig};
use weave_core::event::EventBus;
use weave_core::types::{EngineEvent, Vars};
use weave_engine::{ComposedTool, ToolEngine};
use weave_tools::ToolRegistry;

const DEFAULT_CONFIG: &str = "weave.toml";

#[derive(Parser)]
#[command(name = "weave", version, about = "Declarative tool-chain runner")]
struct Cli {
    /// Path to config file (defaults to ./weave.toml when present)
    #[arg(short, long, env = "WEAVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a chain file (TOML or JSON) and print the result as JSON
    Run {
        /// Chain definition
        chain: PathBuf,
        /// Seed variable, `name=value`; values parse as JSON, else as text
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
        /// Stream units from a JSON-lines file through the chain as a pipeline
        #[arg(long)]
        feed: Option<PathBuf>,
    },
    /// Check a chain file without running it
    Validate {
        chain: PathBuf,
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
    },
    /// List available tools, including composed tools from the config
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    // Initialize tracing
    let default_filter = config
        .as_ref()
        .ok()
        .and_then(|c| c.log.level.clone())
        .unwrap_or_else(|| "weave=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let config = config?;

    let mut registry = ToolRegistry::with_builtins();
    for def in &config.composed {
        info!(tool = %def.name, steps = def.chain.steps.len(), "Registering composed tool");
        registry.register(ComposedTool::from_config(def, &config.engine));
    }

    match cli.command {
        Commands::Tools => {
            for def in registry.definitions() {
                println!("{:<20} {}", def.name, def.description);
            }
        }
        Commands::Validate { chain, vars } => {
            let chain_def = load_chain(&chain)
                .with_context(|| format!("loading chain {}", chain.display()))?;
            let engine = ToolEngine::new(Arc::new(registry), config.engine.clone());
            let graph = engine.validate_with(&chain_def, &into_vars(vars))?;
            let order: Vec<String> = graph
                .topological_order()
                .iter()
                .map(|&i| format!("{}:{}", i, chain_def.steps[i].tool))
                .collect();
            println!(
                "{}: ok ({:?}, {} steps; order {})",
                chain.display(),
                chain_def.mode,
                chain_def.steps.len(),
                order.join(" -> ")
            );
        }
        Commands::Run { chain, vars, feed } => {
            let chain_def = load_chain(&chain)
                .with_context(|| format!("loading chain {}", chain.display()))?;

            let event_bus = Arc::new(EventBus::default());
            spawn_event_logger(&event_bus);
            let engine = ToolEngine::new(Arc::new(registry), config.engine.clone())
                .with_events(event_bus);

            let vars = into_vars(vars);
            let result = match feed {
                Some(path) => {
                    let units = read_units(&path)?;
                    info!(units = units.len(), path = %path.display(), "Streaming units");
                    let out = engine.pipeline(&chain_def).with_vars(vars).feed(units).run().await;
                    for unit in &out.outputs {
                        println!("{}", serde_json::to_string(unit)?);
                    }
                    out.result
                }
                None => engine.execute_with(&chain_def, vars).await,
            };

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// An explicit path must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> weave_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None if Path::new(DEFAULT_CONFIG).exists() => AppConfig::load(Path::new(DEFAULT_CONFIG)),
        None => Ok(AppConfig::default()),
    }
}

fn parse_var(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    if name.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn into_vars(pairs: Vec<(String, serde_json::Value)>) -> Vars {
    pairs.into_iter().collect()
}

/// One JSON value per non-empty line.
fn read_units(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid JSON", path.display(), n + 1))
        })
        .collect()
}

fn spawn_event_logger(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::StepRetrying {
                    index,
                    attempt,
                    error,
                    ..
                } => debug!(step = index, attempt, error = %error, "event: retrying"),
                EngineEvent::StepFallback {
                    index, fallback, ..
                } => debug!(step = index, fallback = %fallback, "event: fallback"),
                EngineEvent::StepSkipped { index, .. } => debug!(step = index, "event: skipped"),
                EngineEvent::StepCompleted {
                    index,
                    success,
                    elapsed_ms,
                    ..
                } => debug!(step = index, success, elapsed_ms, "event: step completed"),
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_json_and_text() {
        assert_eq!(parse_var("n=3").unwrap(), ("n".into(), serde_json::json!(3)));
        assert_eq!(
            parse_var("url=https://example.com").unwrap(),
            ("url".into(), serde_json::json!("https://example.com"))
        );
        assert_eq!(
            parse_var(r#"obj={"a":1}"#).unwrap().1,
            serde_json::json!({"a": 1})
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "weave", "run", "chain.toml", "--var", "url=x", "--var", "n=2", "--feed", "in.jsonl",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { chain, vars, feed } => {
                assert_eq!(chain, PathBuf::from("chain.toml"));
                assert_eq!(vars.len(), 2);
                assert_eq!(feed, Some(PathBuf::from("in.jsonl")));
            }
            _ => panic!("expected run"),
        }
    }
}
