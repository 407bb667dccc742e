//! dispatch-ctl — operator CLI for the dispatch engine
//!
//! Inspects and resets persisted breaker, stats and cache state, and runs
//! tasks through command-line backends configured in the same TOML file:
//!
//! ```toml
//! [commands]
//! fast = "llm-cli --model small"
//! deep = "llm-cli --model large --name {backend}"
//! ```

mod invoker;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dispatch_coordination::{
    compute_key, BackendId, BreakerRecord, Complexity, Domain, Engine, EngineConfig, TaskProfile,
};
use serde::Deserialize;
use tracing::info;

use invoker::CommandInvoker;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file
    #[arg(long, short, default_value = "dispatch.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or reset circuit breakers
    Breaker {
        #[command(subcommand)]
        action: BreakerAction,
    },
    /// Show per-backend success and latency metrics
    Stats,
    /// Inspect or maintain the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show which backends a task would be routed to, in order
    Select(TaskArgs),
    /// Execute a task; the payload is read from --payload or stdin
    Run {
        #[command(flatten)]
        task: TaskArgs,

        #[arg(long)]
        payload: Option<String>,

        /// Cache the result under this owner (workflow name)
        #[arg(long)]
        owner: Option<String>,

        /// JSON parameters included in the cache key
        #[arg(long, default_value = "{}")]
        params: String,

        /// Files whose contents are part of the cache key
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum BreakerAction {
    Status,
    Reset {
        /// Backend to reset; every backend when omitted
        backend: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    Stats,
    /// Remove expired entries
    Cleanup,
    /// Remove every entry
    Clear,
    /// Remove one entry
    Remove { key: String },
    /// Print the cache key for a set of inputs
    Key {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "{}")]
        params: String,
        /// Files whose contents are part of the key
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct TaskArgs {
    #[arg(long, value_enum, default_value_t = ComplexityArg::Medium)]
    complexity: ComplexityArg,
    #[arg(long, default_value_t = 8_000)]
    token_budget: u32,
    #[arg(long)]
    deep_reasoning: bool,
    #[arg(long)]
    code_generation: bool,
    #[arg(long)]
    speed: bool,
    #[arg(long)]
    creativity: bool,
    #[arg(long, value_enum)]
    domain: Option<DomainArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ComplexityArg {
    Low,
    Medium,
    High,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DomainArg {
    Security,
    Architecture,
    Debugging,
    Performance,
    General,
}

impl TaskArgs {
    fn profile(&self) -> TaskProfile {
        let mut builder = TaskProfile::builder()
            .complexity(match self.complexity {
                ComplexityArg::Low => Complexity::Low,
                ComplexityArg::Medium => Complexity::Medium,
                ComplexityArg::High => Complexity::High,
            })
            .token_budget(self.token_budget);
        if self.deep_reasoning {
            builder = builder.deep_reasoning();
        }
        if self.code_generation {
            builder = builder.code_generation();
        }
        if self.speed {
            builder = builder.speed();
        }
        if self.creativity {
            builder = builder.creativity();
        }
        if let Some(domain) = self.domain {
            builder = builder.domain(match domain {
                DomainArg::Security => Domain::Security,
                DomainArg::Architecture => Domain::Architecture,
                DomainArg::Debugging => Domain::Debugging,
                DomainArg::Performance => Domain::Performance,
                DomainArg::General => Domain::General,
            });
        }
        builder.build()
    }
}

/// CLI-only sections of the config file
#[derive(Debug, Default, Deserialize)]
struct CtlFile {
    #[serde(default)]
    commands: HashMap<String, String>,
}

fn load_commands(path: &Path) -> Result<CommandInvoker> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: CtlFile = toml::from_str(&content).context("Failed to parse [commands]")?;
    CommandInvoker::from_templates(&file.commands)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let invoker = load_commands(&args.config)?;

    let mut engine = Engine::from_config(config, Arc::new(invoker.clone())).await;
    let result = dispatch(&engine, &invoker, args.command, args.json).await;
    engine.shutdown().await;
    result
}

async fn dispatch(
    engine: &Engine,
    invoker: &CommandInvoker,
    command: Command,
    json: bool,
) -> Result<()> {
    match command {
        Command::Breaker { action } => breaker(engine, action, json).await,
        Command::Stats => {
            let metrics = engine.stats().snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                for m in metrics {
                    println!(
                        "{:<16} calls={:<6} ok={:<6} failed={:<6} success={:>5.1}% \
                         avg={:.0}ms last={}",
                        m.backend.to_string(),
                        m.total_calls,
                        m.successful_calls,
                        m.failed_calls,
                        m.success_rate() * 100.0,
                        m.avg_response_time_ms,
                        m.last_used.to_rfc3339()
                    );
                }
            }
            Ok(())
        }
        Command::Cache { action } => cache(engine, action, json).await,
        Command::Select(task) => {
            let profile = task.profile();
            let candidates = engine.registry().ids();
            let selection = engine.selector().select(&profile, &candidates);
            let ranked = engine.selector().rank(&profile, &candidates);
            if json {
                let out = serde_json::json!({ "selection": selection, "ranked": ranked });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                match selection {
                    Some(s) => println!("{} ({}): {}", s.backend, s.class, s.rule),
                    None => println!("no backend available"),
                }
                let names: Vec<&str> = ranked.iter().map(BackendId::as_str).collect();
                println!("order: {}", names.join(" → "));
            }
            Ok(())
        }
        Command::Run {
            task,
            payload,
            owner,
            params,
            files,
        } => {
            let missing: Vec<String> = engine
                .registry()
                .ids()
                .into_iter()
                .filter(|b| !invoker.has_command(b))
                .map(|b| b.to_string())
                .collect();
            if !missing.is_empty() {
                tracing::warn!(
                    backends = ?missing,
                    "Backends without a [commands] entry will fail"
                );
            }

            let payload = match payload {
                Some(p) => p,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read payload from stdin")?;
                    buf
                }
            };
            let profile = task.profile();

            match owner {
                Some(owner) => {
                    let params: serde_json::Value =
                        serde_json::from_str(&params).context("--params is not valid JSON")?;
                    let contents = read_files(&files)?;
                    let result = engine
                        .execute_cached(&owner, &params, &contents, &profile, &payload)
                        .await?;
                    info!(key = %result.key, hit = result.hit, "Run complete");
                    print!("{}", result.output);
                }
                None => {
                    let outcome = engine.execute(&profile, &payload).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&outcome)?);
                    } else {
                        info!(
                            backend = %outcome.backend,
                            attempts = outcome.attempts,
                            fallbacks = outcome.fallbacks,
                            "Run complete"
                        );
                        print!("{}", outcome.output);
                    }
                }
            }
            Ok(())
        }
    }
}

async fn breaker(engine: &Engine, action: BreakerAction, json: bool) -> Result<()> {
    match action {
        BreakerAction::Status => {
            let records: Vec<_> = engine
                .registry()
                .ids()
                .iter()
                .map(|id| {
                    engine
                        .breaker()
                        .record(id)
                        .unwrap_or_else(|| BreakerRecord::closed(id.clone()))
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    let last = r
                        .last_failure_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<16} {:<10} failures={:<4} last_failure={}",
                        r.backend.to_string(),
                        r.state.to_string(),
                        r.consecutive_failures,
                        last
                    );
                }
            }
        }
        BreakerAction::Reset { backend: Some(name) } => {
            let id = BackendId::new(name);
            if !engine.registry().contains(&id) {
                bail!("Unknown backend '{id}'");
            }
            engine.breaker().reset(&id).await;
            println!("reset {id}");
        }
        BreakerAction::Reset { backend: None } => {
            engine.breaker().reset_all().await;
            println!("reset all backends");
        }
    }
    Ok(())
}

async fn cache(engine: &Engine, action: CacheAction, json: bool) -> Result<()> {
    let cache = engine.cache();
    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "total={} live={} expired={}",
                    stats.total, stats.live, stats.expired
                );
                for (owner, count) in stats.by_owner {
                    println!("  {owner:<24} {count}");
                }
            }
        }
        CacheAction::Cleanup => println!("removed {}", cache.cleanup().await),
        CacheAction::Clear => {
            cache.clear().await;
            println!("cleared");
        }
        CacheAction::Remove { key } => {
            if cache.remove(&key).await {
                println!("removed {key}");
            } else {
                bail!("No cache entry for {key}");
            }
        }
        CacheAction::Key {
            owner,
            params,
            files,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            let contents = read_files(&files)?;
            println!("{}", compute_key(&owner, &params, &contents));
        }
    }
    Ok(())
}

/// Contents of `files` keyed by path, as they enter the cache key.
fn read_files(files: &[PathBuf]) -> Result<HashMap<String, String>> {
    let mut contents = HashMap::new();
    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        contents.insert(path.display().to_string(), content);
    }
    Ok(contents)
}
