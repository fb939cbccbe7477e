use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley_core::config::{Config, LoggingConfig};
use parley_gateway::{GatewayState, SessionManager};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Real-time voice agent gateway: speech in, generated speech out",
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
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Query a running gateway's health endpoint
    Status {
        /// Gateway base URL (default: http://127.0.0.1:<port>)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration (secrets redacted)
    Show,
    /// Validate the configuration
    Check,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so ${VAR} substitution and *_env lookups can see it
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_tracing(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            let gateway = config.gateway.get_or_insert_with(Default::default);
            if let Some(port) = port {
                gateway.port = port;
            }
            if bind.is_some() {
                gateway.bind = bind;
            }

            if !report_validation(&config) {
                anyhow::bail!("Refusing to start with an invalid configuration");
            }

            tracing::info!(
                config = %config_path.display(),
                port = config.port(),
                "Starting Parley gateway"
            );
            let manager = Arc::new(SessionManager::new(Arc::new(config)));
            let state = GatewayState::new(manager);

            #[cfg(feature = "prometheus")]
            let state = match parley_gateway::metrics::install_prometheus_recorder() {
                Ok(handle) => state.with_prometheus(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "Prometheus recorder not installed");
                    state
                }
            };

            parley_gateway::start_gateway(Arc::new(state)).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted(&config))?;
                println!("{json}");
            }
            ConfigAction::Check => {
                if !report_validation(&config) {
                    anyhow::bail!("Configuration has errors");
                }
                println!("Configuration OK: {}", config_path.display());
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
        Commands::Status { url } => {
            let base = url.unwrap_or_else(|| format!("http://127.0.0.1:{}", config.port()));
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            match reqwest::get(format!("{base}/health")).await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Gateway: running at {base}");
                    println!("Version: {}", body["version"].as_str().unwrap_or("unknown"));
                    println!("Sessions: {}", body["sessions"]);
                }
                Ok(resp) => println!("Gateway: unhealthy ({})", resp.status()),
                Err(_) => println!("Gateway: not running at {base}"),
            }
        }
    }

    Ok(())
}

/// Log warnings and errors. Returns false when there are errors.
fn report_validation(config: &Config) -> bool {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    for error in &errors {
        tracing::error!("{error}");
    }
    errors.is_empty()
}

fn redacted(config: &Config) -> Config {
    const MASK: &str = "********";
    let mut config = config.clone();
    if let Some(recognition) = config.recognition.as_mut() {
        if recognition.api_key.is_some() {
            recognition.api_key = Some(MASK.into());
        }
    }
    if let Some(generation) = config.generation.as_mut() {
        if generation.api_key.is_some() {
            generation.api_key = Some(MASK.into());
        }
    }
    if let Some(synthesis) = config.synthesis.as_mut() {
        if synthesis.api_key.is_some() {
            synthesis.api_key = Some(MASK.into());
        }
    }
    config
}

/// `RUST_LOG` wins; otherwise `--verbose`, then `logging.level`, plus any
/// per-target `logging.filters`.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = if verbose {
            "debug".to_string()
        } else {
            logging.level.clone().unwrap_or_else(|| "info".to_string())
        };
        for directive in &logging.filters {
            directives.push(',');
            directives.push_str(directive);
        }
        EnvFilter::new(directives)
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}
