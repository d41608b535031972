use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tooldrive_core::config::{Config, LoggingConfig};
use tooldrive_providers::cache::GeminiCacheManager;
use tooldrive_providers::{AdapterFactory, ConfigAdapterFactory};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

mod chat;

#[derive(Parser)]
#[command(
    name = "tooldrive",
    about = "Tool-calling agent for OpenAI-compatible, Gemini and Claude backends",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent (one-shot or interactive)
    Chat {
        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Image to attach to the first message (repeatable)
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        /// Replace the default system prompt
        #[arg(long)]
        system: Option<String>,
    },

    /// Show resolved settings and configuration problems
    Status,

    /// Gemini context cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete the server-side cache and the local metadata
    Clear,
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let default = LoggingConfig::default();
    let logging = logging.unwrap_or(&default);

    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
        }
    }

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_status(config: &Config, config_path: &std::path::Path) {
    println!("tooldrive v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    match config.provider_kind() {
        Some(kind) => println!("Provider: {kind}"),
        None => println!("Provider: (none)"),
    }
    println!("Model: {}", config.model());
    println!("Base URL: {}", config.base_url().as_deref().unwrap_or("(none)"));
    println!(
        "API key: {}",
        if config.api_key().is_some() { "set" } else { "missing" }
    );
    println!("Responses API: {}", config.use_responses());
    println!("Streaming: {}", config.streaming());
    println!("Send tools: {}", config.send_tools());
    println!("Max rounds: {}", config.max_rounds());
    println!(
        "Retries: {} (backoff {}s, cap {}s)",
        config.max_retries(),
        config.backoff_base_secs(),
        config.backoff_cap_secs()
    );
    println!("Gemini cache: {}", config.gemini_cache_enabled());
    println!("Log dir: {}", config.log_dir().display());

    let (warnings, errors) = config.validate();
    for w in &warnings {
        println!("Warning: {w}");
    }
    for e in &errors {
        println!("Error: {e}");
    }
    if warnings.is_empty() && errors.is_empty() {
        println!("Configuration OK");
    }
}

async fn clear_cache(config: Config) -> anyhow::Result<()> {
    let manager = GeminiCacheManager::from_config(&config);
    let adapter = match ConfigAdapterFactory::new(std::sync::Arc::new(config)).create() {
        Ok(adapter) => Some(adapter),
        Err(e) => {
            tracing::warn!(error = %e, "No provider available; clearing local metadata only");
            None
        }
    };
    manager
        .clear(adapter.as_ref().and_then(|a| a.cache_backend()))
        .await;
    println!("Cleared {}", manager.meta_path().display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::config_path);
    let config = Config::load_with_env(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Chat {
            message,
            images,
            system,
        } => {
            chat::run(
                config,
                chat::ChatOptions {
                    message,
                    images,
                    system,
                },
            )
            .await?;
        }
        Commands::Status => print_status(&config, &config_path),
        Commands::Cache {
            action: CacheAction::Clear,
        } => clear_cache(config).await?,
    }

    Ok(())
}
