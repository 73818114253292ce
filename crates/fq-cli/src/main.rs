use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fq_core::{
    output_channel, ConversationReport, ConversationRunner, KnowledgeLookup, Provider, Scheduler,
    ToolDispatcher,
};
use fq_providers::OpenAIProvider;
use fq_tools::WikipediaLookup;

mod config;
mod console;

use config::{Config, Overrides};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything, including each stream chunk
    Trace,
    /// Requests, tool dispatch and lookup details
    Debug,
    /// Task scheduling and completion
    Info,
    /// Quiet: failed conversations and lookups
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "fq")]
#[command(author, version, about = "Fanout-query: run every query against every model concurrently", long_about = None)]
pub struct Cli {
    /// Model to query (repeatable; overrides config)
    #[arg(short, long = "model")]
    pub models: Vec<String>,

    /// Query to send (repeatable; overrides config)
    #[arg(short, long = "query")]
    pub queries: Vec<String>,

    /// Base URL of the OpenAI-compatible service (overrides config)
    #[arg(long)]
    pub base_url: Option<String>,

    /// API key for the completion service
    #[arg(long, env = "FQ_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Config file (defaults to ~/.config/fq/config.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Write logs to file (JSON-lines format) instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; stdout is reserved for conversation output
    let filter = EnvFilter::new(cli.log_level.as_filter());
    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::load(cli.config.as_deref())?.with_overrides(Overrides {
        models: cli.models.clone(),
        queries: cli.queries.clone(),
        base_url: cli.base_url.clone(),
        api_key: cli.api_key.clone(),
    });

    match &cli.command {
        Some(Commands::Config) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        None => batch_mode(&config).await,
    }
}

async fn batch_mode(config: &Config) -> Result<()> {
    if config.models.is_empty() || config.queries.is_empty() {
        anyhow::bail!("Nothing to do: at least one model and one query are required");
    }

    let timeout = config.completion.request_timeout();
    let provider: Arc<dyn Provider> = Arc::new(
        OpenAIProvider::with_timeout(&config.completion.api_key, timeout)
            .with_base_url(&config.completion.base_url),
    );
    let lookup: Arc<dyn KnowledgeLookup> = Arc::new(
        WikipediaLookup::with_options(&config.lookup.user_agent, timeout)
            .with_endpoint(&config.lookup.endpoint),
    );

    let reports = run_batch(config, provider, lookup).await;

    let failed = reports.iter().filter(|r| r.history.is_none()).count();
    tracing::info!(total = reports.len(), failed, "Batch finished");
    println!();
    Ok(())
}

/// Fan the configured batch out and wait until the console has printed
/// every event.
async fn run_batch(
    config: &Config,
    provider: Arc<dyn Provider>,
    lookup: Arc<dyn KnowledgeLookup>,
) -> Vec<ConversationReport> {
    let (events, rx) = output_channel();
    let console = console::spawn_console(rx);

    let dispatcher = Arc::new(ToolDispatcher::new(lookup, events.clone()));
    let runner = ConversationRunner::new(provider, dispatcher, events)
        .with_temperature(config.completion.temperature);
    let scheduler = Scheduler::new(runner, config.system_prompt.as_str());

    // The scheduler owns the last senders; once it returns the channel closes
    let reports = scheduler.run(&config.models, &config.queries).await;

    if let Err(e) = console.await {
        tracing::error!(error = %e, "Console task failed");
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use fq_core::testing::{MockLookup, MockProvider};
    use fq_core::Role;

    #[tokio::test]
    async fn test_run_batch_completes_every_pair() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..4 {
            provider.queue_text("Short answer.", 4);
        }
        let config = Config::default().with_overrides(Overrides {
            models: vec!["model-a".into(), "model-b".into()],
            queries: vec!["What is entropy?".into(), "What is a qubit?".into()],
            ..Default::default()
        });

        let reports = run_batch(&config, provider.clone(), Arc::new(MockLookup::new())).await;

        assert_eq!(reports.len(), 4);
        for report in &reports {
            let history = report.history.as_ref().expect("conversation finished");
            assert_eq!(history[0].role, Role::System);
            assert_eq!(history[0].content, config.system_prompt);
        }
        // No tool calls, so one tool-offering request per pair
        assert_eq!(provider.request_count(), 4);
        let request = provider.last_request().expect("request captured");
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.tools.len(), 1);
    }

    #[test]
    fn test_cli_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "fq",
            "-m",
            "starling-lm-7b-beta",
            "--model",
            "nexusraven-v2-13b",
            "-q",
            "Explain the concept of neural networks in AI.",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.models.len(), 2);
        assert_eq!(cli.queries.len(), 1);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_config_subcommand() {
        let cli = Cli::try_parse_from(["fq", "config"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Config)));
    }
}
