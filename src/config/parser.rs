use crate::config::models::{ Config, InterpreterConfig, ServeMode };
use crate::error::ConfigError;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

#[derive(PartialEq)]
enum ParseMode {
    General,
    Interpreter,
}

/// Reads `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
        Err(source) => Err(ConfigError::Read { path: path.display().to_string(), source }),
    }
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut mode = ParseMode::General;

    for raw_line in content.lines() {
        let line = strip_comment(raw_line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let indent = line
            .chars()
            .take_while(|c| c.is_whitespace())
            .count();
        let (key, value) = split_kv(trimmed);

        if indent == 0 {
            if key == "interpreter" && value.is_empty() {
                mode = ParseMode::Interpreter;
                continue;
            }
            mode = ParseMode::General;
            apply_general_field(&mut config, key, value)?;
            continue;
        }

        match mode {
            ParseMode::Interpreter => apply_interpreter_field(&mut config.interpreter, key, value)?,
            // Indented keys outside a block are treated as top-level ones.
            ParseMode::General => apply_general_field(&mut config, key, value)?,
        }
    }

    Ok(config)
}

fn apply_general_field(config: &mut Config, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "host" => {
            config.host = value.to_string();
        }
        "port" => {
            config.port = parse_value(key, value)?;
        }
        "timeout_seconds" => {
            config.timeout_seconds = parse_value(key, value)?;
        }
        "max_header_size" => {
            config.max_header_size = parse_value(key, value)?;
        }
        "max_body_size" => {
            config.max_body_size = parse_value(key, value)?;
        }
        "document_root" => {
            config.document_root = value.into();
        }
        "index" => {
            config.index = value.to_string();
        }
        "mode" => {
            config.mode = parse_value(key, value)?;
        }
        "allow_traversal" => {
            config.allow_traversal = parse_bool(key, value)?;
        }
        _ => {
            tracing::debug!(key, "ignoring unknown config key");
        }
    }
    Ok(())
}

fn apply_interpreter_field(
    interp: &mut InterpreterConfig,
    key: &str,
    value: &str
) -> Result<(), ConfigError> {
    match key {
        "path" => {
            interp.path = value.to_string();
        }
        "router_script" => {
            interp.router_script = value.trim_start_matches('/').to_string();
        }
        "timeout_seconds" => {
            interp.timeout_seconds = parse_value(key, value)?;
        }
        "standalone_host" => {
            interp.standalone_host = value.to_string();
        }
        "standalone_port" => {
            interp.standalone_port = parse_value(key, value)?;
        }
        _ => {
            tracing::debug!(key, "ignoring unknown interpreter key");
        }
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }),
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn split_kv(line: &str) -> (&str, &str) {
    if let Some((k, v)) = line.split_once(':') {
        (k.trim(), v.trim().trim_matches('"').trim_matches('\''))
    } else {
        (line.trim(), "")
    }
}
