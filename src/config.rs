use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::units;

// Defaults for the server configuration file
pub const DEFAULT_CONFIG_FILE: &str = "httpe.toml";
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:3000";
pub const DEFAULT_RULES_FILE: &str = "rules.yaml";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_DATA_RETENTION: &str = "1d";
pub const DEFAULT_SMTP_PORT: u16 = 25;

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_rules_file() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_FILE)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./")
}

fn default_data_retention() -> String {
    DEFAULT_DATA_RETENTION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Empty logs to stdout.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub access_log: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_data_retention")]
    pub data_retention: String,
    /// Send internal error details to clients.
    #[serde(default)]
    pub expose_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            rules_file: default_rules_file(),
            log_level: default_log_level(),
            log_file: None,
            access_log: true,
            data_dir: default_data_dir(),
            data_retention: default_data_retention(),
            expose_errors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_SMTP_PORT,
            username: String::new(),
            password: String::new(),
            from: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

/// Values given on the command line or through `HTTPE_*` variables. They win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub address: Option<String>,
    pub rules_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn parse(toml_text: &str) -> Result<Self> {
        toml::from_str(toml_text).context("error parsing config")
    }

    /// Reads `path`, or `httpe.toml` when it exists. Without a file the defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("error reading config file '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file '{}'", path.display()))
    }

    pub fn apply(&mut self, overrides: Overrides) {
        let s = &mut self.server;
        if let Some(v) = overrides.address {
            s.address = v;
        }
        if let Some(v) = overrides.rules_file {
            s.rules_file = v;
        }
        if let Some(v) = overrides.log_level {
            s.log_level = v;
        }
        if let Some(v) = overrides.log_file {
            s.log_file = Some(v);
        }
        if let Some(v) = overrides.data_dir {
            s.data_dir = v;
        }
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.server
            .log_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn data_retention(&self) -> Result<Duration> {
        units::parse_duration(&self.server.data_retention)
            .with_context(|| format!("invalid data_retention '{}'", self.server.data_retention))
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.address.contains("://") {
            bail!("address '{}' must not contain a scheme", s.address);
        }
        if s.address.is_empty() {
            bail!("address must not be empty");
        }
        std::fs::File::open(&s.rules_file)
            .with_context(|| format!("rules file '{}' is not readable", s.rules_file.display()))?;
        match s.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => bail!("unknown log level '{}'", other),
        }
        if let Some(smtp) = &self.smtp {
            if smtp.server.is_empty() {
                bail!("smtp server must not be empty");
            }
        }
        self.data_retention()?;
        Ok(())
    }
}
