//! Error types for phpgate

use std::time::Duration;

use thiserror::Error;

/// Problems reading `config.yaml` or applying overrides.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for `{key}`: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("document root {path} is not usable: {source}")]
    DocumentRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while running a script through the interpreter.
///
/// Every variant ends up as a single `500` with the `Display` text as body.
#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to launch interpreter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interpreter I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("interpreter did not finish within {0:?}")]
    Timeout(Duration),

    #[error("interpreter exited with {0}")]
    ExitStatus(String),
}

/// Standalone bootstrap failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {program} -S {addr}: {source}")]
    Spawn {
        program: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("interpreter server died {0:?} after launch, not relaunching yet")]
    Backoff(Duration),

    #[error("lost track of interpreter process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Reactor setup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {addr}: {reason}")]
    Address { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("poll error: {0}")]
    Poll(#[from] std::io::Error),
}
