use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::mqtt::QoS;

#[derive(Args, Debug, Default, Deserialize)]
pub struct MqttBrokerConnectArgs {
    #[arg(short = 'h', long = "host", env = "BROKER_HOST", help_heading = "Broker")]
    pub host: Option<String>,

    #[arg(short = 'p', long = "port", env = "BROKER_PORT", help_heading = "Broker")]
    pub port: Option<u16>,

    #[arg(short = 'i', long = "client-id", env = "BROKER_CLIENT_ID", help_heading = "Broker")]
    pub client_id: Option<String>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_duration_seconds_opt")]
    #[arg(long = "keep-alive", env = "BROKER_KEEP_ALIVE", value_parser = parse_duration_seconds, help_heading = "Broker")]
    pub keep_alive: Option<Duration>,

    #[arg(short = 'u', long = "username", env = "BROKER_USERNAME", help_heading = "Broker")]
    pub username: Option<String>,

    #[arg(short = 'w', long = "password", env = "BROKER_PASSWORD", help_heading = "Broker")]
    pub password: Option<String>,

    #[arg(long = "use-tls", env = "BROKER_USE_TLS", help_heading = "TLS")]
    pub use_tls: Option<bool>,

    #[arg(long = "ca-file", env = "BROKER_TLS_CA_FILE", help_heading = "TLS")]
    pub tls_ca_file: Option<PathBuf>,

    #[arg(long = "client-cert", env = "BROKER_TLS_CLIENT_CERTIFICATE_FILE", help_heading = "TLS")]
    pub tls_client_certificate: Option<PathBuf>,

    #[arg(long = "client-key", env = "BROKER_TLS_CLIENT_KEY_FILE", help_heading = "TLS")]
    pub tls_client_key: Option<PathBuf>,

    #[arg(long = "tls-version", env = "BROKER_TLS_VERSION", help_heading = "TLS")]
    pub tls_version: Option<TlsVersion>,

    #[serde(default)]
    #[command(flatten)]
    pub last_will: LastWillArgs,
}

#[derive(Args, Debug, Default, Deserialize)]
pub struct LastWillArgs {
    #[arg(long = "last-will-payload", env = "BROKER_LAST_WILL_PAYLOAD", help_heading = "Last will")]
    pub payload: Option<String>,
    #[arg(long = "last-will-topic", env = "BROKER_LAST_WILL_TOPIC", help_heading = "Last will")]
    pub topic: Option<String>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_qos_opt")]
    #[arg(long = "last-will-qos", value_parser = parse_qos, help_heading = "Last will")]
    pub qos: Option<QoS>,
    #[arg(long = "last-will-retain", help_heading = "Last will")]
    pub retain: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, ValueEnum, PartialEq)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "1.2")]
    Version1_2,
    #[serde(rename = "1.3")]
    Version1_3,
}

fn deserialize_duration_seconds_opt<'a, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'a>,
{
    let value: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Some(Duration::from_secs(value)))
}

fn deserialize_qos_opt<'a, D>(deserializer: D) -> Result<Option<QoS>, D::Error>
where
    D: Deserializer<'a>,
{
    let value: u8 = Deserialize::deserialize(deserializer)?;
    Ok(Some(match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => return Err(DeError::custom("QoS value must be 0, 1 or 2")),
    }))
}

fn parse_duration_seconds(input: &str) -> Result<Duration, String> {
    let secs: u64 = input
        .parse()
        .map_err(|_| format!("{input} is not a valid duration in seconds"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_qos(input: &str) -> Result<QoS, String> {
    match input {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        _ => Err("QoS value must be 0, 1 or 2".to_string()),
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TlsVersion::All),
            "1.2" => Ok(TlsVersion::Version1_2),
            "1.3" => Ok(TlsVersion::Version1_3),
            _ => Err(format!("unknown TLS version \"{s}\"")),
        }
    }
}
