//! `KEY=VALUE` env files, as used by `docker run --env-file`.
//!
//! Supported: blank lines, `#` comments, an optional `export ` prefix and values
//! wrapped in single or double quotes. Later keys override earlier ones.

use crate::error::ConfigError;
use crate::service::Environment;
use std::path::Path;

pub fn read_env_file(path: &Path) -> Result<Environment, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_env(&content).map_err(|(line, message)| ConfigError::EnvFile {
        path: path.to_path_buf(),
        line,
        message,
    })
}

/// Parses env file content. Errors carry the 1-based line number.
pub fn parse_env(content: &str) -> Result<Environment, (usize, String)> {
    let mut environment = Environment::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);

        let Some((key, value)) = line.split_once('=') else {
            return Err((index + 1, format!("expected KEY=VALUE, got {line:?}")));
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err((index + 1, format!("invalid key {key:?}")));
        }

        environment.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(environment)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
