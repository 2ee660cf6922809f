use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rumqttc::tokio_rustls::rustls::version::{TLS12, TLS13};
use rumqttc::tokio_rustls::rustls::SupportedProtocolVersion;
use rumqttc::TlsConfiguration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub mod args;
pub mod client;

pub use args::{MqttBrokerConnectArgs, TlsVersion};

#[derive(Error, Debug)]
pub enum MqttServiceError {
    #[error("CA certificate must be present when using TLS")]
    CaCertificateMustBePresent(),
    #[error("Could not read CA certificate from file \"{1}\"")]
    CertificateNotReadable(#[source] io::Error, PathBuf),
    #[error("Could not add CA certificate to root store")]
    CaCertificateNotAdded(#[source] rumqttc::tokio_rustls::rustls::Error),
    #[error("Could not read client key from file \"{1}\"")]
    PrivateKeyNotReadable(#[source] io::Error, PathBuf),
    #[error("No PKCS8-encoded private key found in file \"{0}\"")]
    PrivateKeyNoneFound(PathBuf),
    #[error("More than one PKCS8-encoded private key found in file \"{0}\"")]
    PrivateKeyTooManyFound(PathBuf),
    #[error("Client key must be present when using TLS authentication")]
    ClientKeyMustBePresent(),
    #[error("Client error occurred")]
    ClientError(#[from] Box<rumqttc::v5::ClientError>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<QoS> for rumqttc::v5::mqttbytes::QoS {
    fn from(value: QoS) -> Self {
        Self::from(&value)
    }
}

impl From<&QoS> for rumqttc::v5::mqttbytes::QoS {
    fn from(value: &QoS) -> Self {
        match value {
            QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// Narrow interface the rest of the engine programs against. `client::MqttClient`
/// is the only concrete implementation (over `rumqttc`'s v5 client); the Controller
/// never reaches for `rumqttc` types directly.
#[async_trait]
pub trait MqttTransport: Send {
    async fn connect(
        &mut self,
        channel: broadcast::Sender<MqttEvent>,
    ) -> Result<JoinHandle<()>, MqttServiceError>;

    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Vec<u8>);

    async fn subscribe(&mut self, topic: String, qos: QoS);

    async fn unsubscribe(&mut self, topic: String);
}

#[derive(Clone)]
pub struct MqttEvent {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub fn configure_tls_rustls(
    config: Arc<MqttBrokerConnectArgsResolved>,
) -> Result<TlsConfiguration, MqttServiceError> {
    fn load_private_key_from_file(path: &PathBuf) -> Result<PrivateKeyDer<'static>, MqttServiceError> {
        let file = File::open(path)
            .map_err(|e| MqttServiceError::PrivateKeyNotReadable(e, path.clone()))?;
        let mut reader = BufReader::new(file);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|e| MqttServiceError::PrivateKeyNotReadable(e, path.clone()))?;

        match keys.len() {
            0 => Err(MqttServiceError::PrivateKeyNoneFound(path.clone())),
            1 => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(keys.remove(0)))),
            _ => Err(MqttServiceError::PrivateKeyTooManyFound(path.clone())),
        }
    }

    fn load_certificates_from_file(
        path: &PathBuf,
    ) -> Result<Vec<CertificateDer<'static>>, MqttServiceError> {
        let file = File::open(path)
            .map_err(|e| MqttServiceError::CertificateNotReadable(e, path.clone()))?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .map_err(|e| MqttServiceError::CertificateNotReadable(e, path.clone()))?;

        Ok(certs.into_iter().map(CertificateDer::from).collect())
    }

    let mut root_store = rumqttc::tokio_rustls::rustls::RootCertStore::empty();

    let Some(ca_file) = &config.tls_ca_file else {
        return Err(MqttServiceError::CaCertificateMustBePresent());
    };

    let certificates = load_certificates_from_file(ca_file)?;
    info!("Found {} root ca certificates", certificates.len());

    for certificate in certificates {
        root_store
            .add(certificate)
            .map_err(MqttServiceError::CaCertificateNotAdded)?;
    }

    let protocol_versions: Vec<&'static SupportedProtocolVersion> = match config.tls_version {
        TlsVersion::All => {
            debug!("Using TLS versions 1.2 and 1.3");
            vec![&TLS12, &TLS13]
        }
        TlsVersion::Version1_2 => {
            debug!("Using TLS version 1.2");
            vec![&TLS12]
        }
        TlsVersion::Version1_3 => {
            debug!("Using TLS version 1.3");
            vec![&TLS13]
        }
    };

    let tls_config = rumqttc::tokio_rustls::rustls::ClientConfig::builder_with_protocol_versions(
        protocol_versions.as_slice(),
    )
    .with_root_certificates(root_store);

    let tls_config = match &config.tls_client_certificate {
        None => tls_config.with_no_client_auth(),
        Some(client_certificate_file) => {
            info!("Using TLS client certificate authentication");

            let client_certificate = load_certificates_from_file(client_certificate_file)?;

            let Some(client_key_file) = &config.tls_client_key else {
                return Err(MqttServiceError::ClientKeyMustBePresent());
            };

            let client_key = load_private_key_from_file(client_key_file)?;

            tls_config
                .with_client_auth_cert(client_certificate, client_key)
                .map_err(MqttServiceError::CaCertificateNotAdded)?
        }
    };

    Ok(TlsConfiguration::Rustls(Arc::new(tls_config)))
}

pub use client::MqttBrokerConnectArgsResolved;
