//! Process configuration.
//!
//! Precedence: env vars (`FLOWGATE_*`) > `./flowgate.toml` (or
//! `$FLOWGATE_CONFIG_PATH`) > defaults. Built once at startup by the
//! orchestrator's `Init` phase and read-only thereafter. Invalid values
//! are fatal; only the ACL file itself is fail-open (see [`crate::acl`]).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use url::Url;

/// Process-wide immutable settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint name, unique within the mesh.
    pub name: String,
    /// Socket file name to listen on (placed under a temp dir).
    pub listen_on: String,
    /// URL of the upstream to forward requests to.
    pub connect_to: Url,
    /// Maximum lifetime of per-call credentials.
    #[serde(deserialize_with = "de_duration")]
    pub max_token_lifetime: Duration,
    /// Name of the service this endpoint provides.
    pub service_name: String,
    /// Labels rewritten onto outbound requests and advertised to the
    /// registry.
    pub labels: BTreeMap<String, String>,
    /// Path to the ACL rule file.
    pub acl_config_path: PathBuf,
    /// Default log level (overridden by `RUST_LOG`).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "firewall-server".to_owned(),
            listen_on: "listen.on.sock".to_owned(),
            connect_to: Url::parse("unix:///var/lib/flowgate/registry.sock")
                .unwrap_or_else(|_| unreachable!("default connect_to URL is valid")),
            max_token_lifetime: Duration::from_secs(600),
            service_name: "firewall".to_owned(),
            labels: BTreeMap::new(),
            acl_config_path: PathBuf::from("/etc/flowgate/config.yaml"),
            log_level: "info".to_owned(),
        }
    }
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file >
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error on an unreadable or unparsable config file or
    /// an invalid env override. Configuration errors are fatal at
    /// startup.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file(|key| std::env::var(key).ok())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_from_file(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = env("FLOWGATE_CONFIG_PATH")
            .map_or_else(|| PathBuf::from("flowgate.toml"), PathBuf::from);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML does not describe a valid config.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("FLOWGATE_NAME") {
            self.name = v;
        }
        if let Some(v) = env("FLOWGATE_LISTEN_ON") {
            self.listen_on = v;
        }
        if let Some(v) = env("FLOWGATE_CONNECT_TO") {
            self.connect_to = Url::parse(&v)
                .with_context(|| format!("invalid FLOWGATE_CONNECT_TO {v:?}"))?;
        }
        if let Some(v) = env("FLOWGATE_MAX_TOKEN_LIFETIME") {
            self.max_token_lifetime = parse_duration(&v)
                .with_context(|| format!("invalid FLOWGATE_MAX_TOKEN_LIFETIME {v:?}"))?;
        }
        if let Some(v) = env("FLOWGATE_SERVICE_NAME") {
            self.service_name = v;
        }
        if let Some(v) = env("FLOWGATE_LABELS") {
            self.labels =
                parse_labels(&v).with_context(|| format!("invalid FLOWGATE_LABELS {v:?}"))?;
        }
        if let Some(v) = env("FLOWGATE_ACL_CONFIG_PATH") {
            self.acl_config_path = PathBuf::from(v);
        }
        if let Some(v) = env("FLOWGATE_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }
}

/// Parse durations like `10m`, `90s`, `2h`, `250ms`, or bare seconds.
fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let (number, unit) = match input.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("not a number: {number:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => bail!("unknown duration unit {other:?}"),
    }
}

/// Parse `key1=val1,key2=val2` label maps.
fn parse_labels(input: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in input.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("label {pair:?} is not key=value"))?;
        labels.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(labels)
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}
