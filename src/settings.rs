use serde::Deserialize;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::mail_move_rules::mail_move_settings::RulesConfig;
use crate::mail_reader::encryption::{KEY_FILE, PASSWORD_FILE};
use crate::spam_filter::spam_filter_settings::SpamFilterSettings;

pub const DEFAULT_SETTINGS_PATH: &str = "src/resources/settings.yaml";

// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub imap: ImapConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub spam_filter: SpamFilterSettings,
    #[serde(default)]
    pub mail_mover: RulesConfig,
}

fn default_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Plain password; when absent the encrypted store is used.
    pub password: Option<String>,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(rename = "connect_timeout", default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(rename = "command_timeout", default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default)]
    pub password_store: PasswordStoreConfig,
}

impl ImapConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PasswordStoreConfig {
    pub password_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for PasswordStoreConfig {
    fn default() -> Self {
        Self {
            password_file: PathBuf::from(PASSWORD_FILE),
            key_file: PathBuf::from(KEY_FILE),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(rename = "idle_renew")]
    pub idle_renew_seconds: u64,
    #[serde(rename = "backoff_initial")]
    pub backoff_initial_seconds: u64,
    #[serde(rename = "backoff_max")]
    pub backoff_max_seconds: u64,
    pub state_file: PathBuf,
    pub catchup: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_renew_seconds: 23 * 60,
            backoff_initial_seconds: 1,
            backoff_max_seconds: 5 * 60,
            state_file: PathBuf::from("last_seen_uid.json"),
            catchup: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Rejects values that would turn the monitor into a busy loop.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("imap.connect_timeout", self.imap.connect_timeout_seconds),
            ("imap.command_timeout", self.imap.command_timeout_seconds),
            ("monitor.idle_renew", self.monitor.idle_renew_seconds),
            ("monitor.backoff_initial", self.monitor.backoff_initial_seconds),
            ("monitor.backoff_max", self.monitor.backoff_max_seconds),
        ];
        for (key, seconds) in durations {
            if seconds == 0 {
                bail!("{} must be at least one second", key);
            }
        }
        if self.monitor.backoff_max_seconds < self.monitor.backoff_initial_seconds {
            bail!(
                "monitor.backoff_max ({}) is below monitor.backoff_initial ({})",
                self.monitor.backoff_max_seconds,
                self.monitor.backoff_initial_seconds
            );
        }
        Ok(())
    }
}

pub fn parse_settings(yaml: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

// Runs before the logger exists, so failures are only returned, never logged.
pub fn load_settings(path: &Path) -> Result<Config> {
    // Open the YAML file
    let file = File::open(path)
        .with_context(|| format!("Cannot find settings at {}", path.display()))?;
    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let config: Config = serde_yaml::from_reader(reader)
        .with_context(|| format!("Cannot deserialize settings in {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid settings in {}", path.display()))?;

    Ok(config)
}
