use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How requests are split between the static responder and the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Files only, never runs the interpreter.
    Static,
    /// `*.php` paths run that file, everything else is static.
    Script,
    /// `*.php`, extensionless and root paths all go through the router script.
    Router,
    /// Start `php -S` once and redirect every client to it.
    Standalone,
}

impl FromStr for ServeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(ServeMode::Static),
            "script" => Ok(ServeMode::Script),
            "router" => Ok(ServeMode::Router),
            "standalone" => Ok(ServeMode::Standalone),
            other => Err(format!("unknown mode `{}`", other)),
        }
    }
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServeMode::Static => "static",
            ServeMode::Script => "script",
            ServeMode::Router => "router",
            ServeMode::Standalone => "standalone",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub path: String,
    pub router_script: String,
    pub timeout_seconds: u64,
    pub standalone_host: String,
    pub standalone_port: u16,
}

impl InterpreterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn standalone_addr(&self) -> String {
        format!("{}:{}", self.standalone_host, self.standalone_port)
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            path: "php".to_string(),
            router_script: "router.php".to_string(),
            timeout_seconds: 30,
            standalone_host: "0.0.0.0".to_string(),
            standalone_port: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub document_root: PathBuf,
    pub index: String,
    pub mode: ServeMode,
    pub allow_traversal: bool,
    pub interpreter: InterpreterConfig,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            timeout_seconds: 30,
            max_header_size: 8192,
            max_body_size: 10485760,
            document_root: PathBuf::from("."),
            index: "index.html".to_string(),
            mode: ServeMode::Router,
            allow_traversal: false,
            interpreter: InterpreterConfig::default(),
        }
    }
}
