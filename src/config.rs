//! TOML configuration layer (ambient C7 concern) for both binaries.
//!
//! Grounded on `examples/original_source/src/server/conf.c`'s per-identity
//! `authorize` blocks; the teacher crate (`countermeasures`) has no config
//! file of its own, so the `serde`/`toml` pairing is enriched from the
//! wider retrieval pack (`oasis-types`' config handling).

use crate::error::Error;
use serde::Deserialize;
use std::path::Path;

fn default_listen() -> String {
    "*:5668".to_string()
}

fn default_temp_directory() -> String {
    "/tmp".to_string()
}

fn default_tls_ciphers() -> String {
    "PSK-AES256-CBC-SHA:PSK-AES128-CBC-SHA:PSK-3DES-EDE-CBC-SHA:PSK-RC4-SHA".to_string()
}

fn default_timeout() -> f64 {
    10.0
}

fn default_max_queue_size() -> usize {
    // megabytes; multiplied by 1024^2 when consumed.
    10
}

/// One `authorize "<identity>"` block.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeEntry {
    pub identity: String,
    pub password: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// The receiver's configuration document. Every optional key falls back
/// to the hardcoded default named in §6 of the spec when absent from
/// both the config file and the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    pub command_file: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub log_level: Option<String>,
    #[serde(default)]
    pub max_command_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    pub pid_file: Option<String>,
    #[serde(default = "default_temp_directory")]
    pub temp_directory: String,
    #[serde(default = "default_tls_ciphers")]
    pub tls_ciphers: String,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    pub user: Option<String>,
    pub chroot: Option<String>,
    #[serde(default)]
    pub authorize: Vec<AuthorizeEntry>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            command_file: None,
            listen: default_listen(),
            log_level: None,
            max_command_size: 0,
            max_queue_size: default_max_queue_size(),
            pid_file: None,
            temp_directory: default_temp_directory(),
            tls_ciphers: default_tls_ciphers(),
            timeout: default_timeout(),
            user: None,
            chroot: None,
            authorize: Vec::new(),
        }
    }
}

impl ReceiverConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ReceiverConfig = toml::from_str(&text)?;
        Ok(config)
    }

    /// `max_queue_size` is stored in megabytes in the config file but
    /// consumed in bytes everywhere else.
    pub fn max_queue_size_bytes(&self) -> usize {
        self.max_queue_size.saturating_mul(1024 * 1024)
    }
}

/// The submitter's configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SubmitterConfig {
    pub identity: Option<String>,
    pub password: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<f64>,
    pub delay: Option<f64>,
    pub tls_ciphers: Option<String>,
}

impl SubmitterConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SubmitterConfig = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn tls_ciphers(&self) -> String {
        self.tls_ciphers.clone().unwrap_or_else(default_tls_ciphers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_config_parses_authorize_blocks() {
        let toml = r#"
            command_file = "/var/run/nsca.cmd"
            listen = "*:5668"

            [[authorize]]
            identity = "tester"
            password = "forty-two"
            services = ["disk@h1"]
        "#;
        let config: ReceiverConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.authorize.len(), 1);
        assert_eq!(config.authorize[0].identity, "tester");
        assert_eq!(config.authorize[0].services, vec!["disk@h1".to_string()]);
        assert_eq!(config.max_queue_size_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn defaults_apply_when_keys_absent() {
        let config: ReceiverConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen, "*:5668");
        assert_eq!(config.timeout, 10.0);
        assert!(config.authorize.is_empty());
    }
}
