mod config;
mod error;
mod handlers;
mod http;
mod server;
mod signals;
mod supervisor;

use crate::config::{ Config, ServeMode };
use crate::error::ConfigError;
use crate::handlers::Dispatcher;
use crate::server::Server;
use crate::supervisor::Supervisor;

use clap::{ ArgAction, Parser, ValueEnum };
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Serve a PHP document root over HTTP.
#[derive(Parser, Debug)]
#[command(name = "phpgate", version, about)]
struct Cli {
    /// Configuration file; missing means built-in defaults.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Document root (defaults to the working directory).
    #[arg(long)]
    root: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// static, script, router or standalone.
    #[arg(long)]
    mode: Option<ServeMode>,

    /// Interpreter executable.
    #[arg(long)]
    php: Option<String>,

    /// Run `php -S` under supervision instead of serving requests ourselves.
    #[arg(long)]
    supervise: bool,

    /// Increase output verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = match load(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("fatal config error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.supervise {
        return match Supervisor::new(&config).run() {
            Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
            Err(e) => {
                tracing::error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    signals::install();

    let dispatcher = Dispatcher::from_config(&config);
    let mut server = match Server::new(config, dispatcher) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.bind() {
        tracing::error!("{}", e);
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}

/// File values, then command-line overrides, then a fixed document root.
fn load(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = config::load_config(&cli.config)?;

    if let Some(root) = &cli.root {
        config.document_root = root.clone();
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(php) = &cli.php {
        config.interpreter.path = php.clone();
    }

    let root = config.document_root
        .canonicalize()
        .map_err(|source| ConfigError::DocumentRoot {
            path: config.document_root.display().to_string(),
            source,
        })?;
    config.document_root = root;

    Ok(config)
}
