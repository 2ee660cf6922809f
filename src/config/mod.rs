use std::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use derive_getters::Getters;
use log::LevelFilter;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::config::args::{read_cli_args, read_config};
use crate::mqtt::MqttBrokerConnectArgsResolved;

pub mod args;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file \"{1}\"")]
    CouldNotReadConfigFile(#[source] io::Error, PathBuf),
    #[error("Could not parse config file \"{1}\"")]
    CouldNotParseConfigFile(#[source] serde_yaml::Error, PathBuf),
    #[error("Invalid configuration")]
    InvalidConfiguration(#[source] ValidationErrors),
}

/// Top-level process configuration: CLI flags merged over a YAML config
/// file, the way the teacher's `MqtliConfig::merge` layers `MqtliArgs`.
#[derive(Debug, Getters, Validate)]
pub struct HearthConfig {
    #[validate(nested)]
    broker: MqttBrokerConnectArgsResolved,
    log_level: LevelFilter,
    #[validate(length(min = 1, message = "Topic prefix must be given"))]
    topic_prefix: String,
    database: PathBuf,
    #[validate(nested)]
    telegram: TelegramConfig,
    #[validate(nested)]
    location: LocationConfig,
    store_write_delay: Duration,
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            broker: Default::default(),
            log_level: LevelFilter::Info,
            topic_prefix: "automation".to_string(),
            database: PathBuf::from("automation.json"),
            telegram: Default::default(),
            location: Default::default(),
            store_write_delay: Duration::from_secs(20),
        }
    }
}

impl HearthConfig {
    fn merge(&mut self, other: &args::HearthArgs) {
        self.broker.merge(&other.broker);

        if let Some(log_level) = other.log_level {
            self.log_level = log_level;
        }
        if let Some(prefix) = &other.topic_prefix {
            self.topic_prefix = prefix.clone();
        }
        if let Some(database) = &other.database {
            self.database = database.clone();
        }
        if let Some(delay) = other.store_write_delay {
            self.store_write_delay = delay;
        }

        self.telegram.merge(&other.telegram);
        self.location.merge(&other.location);
    }
}

#[derive(Clone, Debug, Getters, Validate)]
pub struct TelegramConfig {
    token: Option<String>,
    chat: Option<i64>,
    timeout: Duration,
    update: bool,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            chat: None,
            timeout: Duration::from_secs(10),
            update: false,
        }
    }
}

impl TelegramConfig {
    fn merge(&mut self, other: &args::TelegramArgs) {
        if let Some(token) = &other.token {
            self.token = Some(token.clone());
        }
        if let Some(chat) = other.chat {
            self.chat = Some(chat);
        }
        if let Some(timeout) = other.timeout {
            self.timeout = timeout;
        }
        if let Some(update) = other.update {
            self.update = update;
        }
    }
}

#[derive(Clone, Debug, Getters, Validate)]
pub struct LocationConfig {
    #[validate(range(min = -90.0, max = 90.0, message = "Latitude out of range"))]
    latitude: f64,
    #[validate(range(min = -180.0, max = 180.0, message = "Longitude out of range"))]
    longitude: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

impl LocationConfig {
    fn merge(&mut self, other: &args::LocationArgs) {
        if let Some(latitude) = other.latitude {
            self.latitude = latitude;
        }
        if let Some(longitude) = other.longitude {
            self.longitude = longitude;
        }
    }
}

impl Display for HearthConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "broker={}:{} prefix={} database={:?}",
            self.broker.host(),
            self.broker.port(),
            self.topic_prefix,
            self.database
        )
    }
}

pub fn parse_config() -> Result<HearthConfig, ConfigError> {
    let cli = read_cli_args();
    let config_file = cli
        .config_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("hearthd.yaml"));

    let file_args = read_config(&config_file)?;

    let mut config = HearthConfig::default();
    config.merge(&file_args);
    config.merge(&cli);

    match config.validate() {
        Ok(_) => Ok(config),
        Err(e) => Err(ConfigError::InvalidConfiguration(e)),
    }
}
