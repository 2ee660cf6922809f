use std::fs::read_to_string;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser};
use log::LevelFilter;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::config::ConfigError;
use crate::mqtt::args::MqttBrokerConnectArgs;

/// CLI flags layered over a YAML config file. The same struct is used for
/// both, matching the teacher's `MqtliArgs` / `config.yaml` duality.
#[derive(Debug, Deserialize, Parser)]
#[command(author, version, about, long_about = None)]
pub struct HearthArgs {
    #[command(flatten)]
    pub broker: MqttBrokerConnectArgs,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_level_filter")]
    #[arg(
        short = 'l',
        long = "log-level",
        env = "LOG_LEVEL",
        help = "Log level (default: info)"
    )]
    pub log_level: Option<LevelFilter>,

    #[arg(
        short = 'c',
        long = "config-file",
        env = "CONFIG_FILE_PATH",
        help = "Path to the config file (default: hearthd.yaml)"
    )]
    #[serde(skip_serializing)]
    pub config_file: Option<PathBuf>,

    #[arg(
        long = "topic-prefix",
        env = "TOPIC_PREFIX",
        help = "MQTT topic namespace prefix (default: automation)"
    )]
    pub topic_prefix: Option<String>,

    #[arg(
        long = "database",
        env = "AUTOMATION_DATABASE",
        help = "Path to the persisted rule/state JSON file"
    )]
    pub database: Option<PathBuf>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_duration_seconds_opt")]
    #[arg(
        long = "store-write-delay",
        help = "Debounce window for persisted-store writes, in seconds",
        value_parser = parse_seconds
    )]
    pub store_write_delay: Option<Duration>,

    #[serde(default)]
    #[command(flatten)]
    pub telegram: TelegramArgs,

    #[serde(default)]
    #[command(flatten)]
    pub location: LocationArgs,
}

#[derive(Args, Debug, Default, Deserialize)]
pub struct TelegramArgs {
    #[arg(long = "telegram-token", env = "TELEGRAM_TOKEN", help_heading = "Telegram")]
    pub token: Option<String>,
    #[arg(long = "telegram-chat", env = "TELEGRAM_CHAT", help_heading = "Telegram")]
    pub chat: Option<i64>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_duration_seconds_opt")]
    #[arg(long = "telegram-timeout", help_heading = "Telegram", value_parser = parse_seconds)]
    pub timeout: Option<Duration>,
    #[arg(long = "telegram-update", help_heading = "Telegram")]
    pub update: Option<bool>,
}

#[derive(Args, Debug, Default, Deserialize)]
pub struct LocationArgs {
    #[arg(long = "latitude", env = "LOCATION_LATITUDE", help_heading = "Location")]
    pub latitude: Option<f64>,
    #[arg(long = "longitude", env = "LOCATION_LONGITUDE", help_heading = "Location")]
    pub longitude: Option<f64>,
}

pub fn read_config(path: &PathBuf) -> Result<HearthArgs, ConfigError> {
    let content = match read_to_string(path) {
        Ok(content) => content,
        Err(e) => return Err(ConfigError::CouldNotReadConfigFile(e, path.clone())),
    };

    serde_yaml::from_str(content.as_str())
        .map_err(|e| ConfigError::CouldNotParseConfigFile(e, path.clone()))
}

pub fn read_cli_args() -> HearthArgs {
    HearthArgs::parse()
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    s.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

fn deserialize_duration_seconds_opt<'a, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'a>,
{
    let value: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Some(Duration::from_secs(value)))
}

fn deserialize_level_filter<'a, D>(deserializer: D) -> Result<Option<LevelFilter>, D::Error>
where
    D: Deserializer<'a>,
{
    let value: String = Deserialize::deserialize(deserializer)?;
    LevelFilter::from_str(value.as_str())
        .map(Some)
        .map_err(|_| DeError::custom("invalid log level"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let args: HearthArgs = serde_yaml::from_str("broker:\n  host: localhost\n").unwrap();
        assert_eq!(args.broker.host.as_deref(), Some("localhost"));
    }
}
