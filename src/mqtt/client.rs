use std::sync::Arc;
use std::time::Duration;

use derive_getters::Getters;
use log::{debug, error, info};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill, Publish};
use rumqttc::v5::mqttbytes::QoS as RumqttcQoS;
use rumqttc::v5::{AsyncClient, Event, Incoming, MqttOptions};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use validator::{Validate, ValidationError};

use crate::mqtt::args::{self, TlsVersion};
use crate::mqtt::{configure_tls_rustls, MqttEvent, MqttServiceError, MqttTransport, QoS};

/// Resolved broker connection settings: CLI/file `args::MqttBrokerConnectArgs`
/// merged over sensible defaults, validated once at startup.
#[derive(Clone, Debug, Getters, Validate)]
#[validate(
    schema(function = "validate_credentials"),
    schema(function = "validate_tls_client")
)]
pub struct MqttBrokerConnectArgsResolved {
    #[validate(length(min = 1, message = "Hostname must be given"))]
    pub(crate) host: String,
    pub(crate) port: u16,
    #[validate(length(min = 1, message = "Client id must be given"))]
    client_id: String,
    keep_alive: Duration,
    username: Option<String>,
    password: Option<String>,

    use_tls: bool,
    pub(crate) tls_ca_file: Option<std::path::PathBuf>,
    pub(crate) tls_client_certificate: Option<std::path::PathBuf>,
    pub(crate) tls_client_key: Option<std::path::PathBuf>,
    pub(crate) tls_version: TlsVersion,

    last_will: Option<LastWillConfig>,
}

#[derive(Clone, Debug, Default, Getters)]
pub struct LastWillConfig {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

impl Default for MqttBrokerConnectArgsResolved {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hearthd".to_string(),
            keep_alive: Duration::from_secs(5),
            username: None,
            password: None,
            use_tls: false,
            tls_ca_file: None,
            tls_client_certificate: None,
            tls_client_key: None,
            tls_version: Default::default(),
            last_will: None,
        }
    }
}

impl MqttBrokerConnectArgsResolved {
    pub(crate) fn merge(&mut self, other: &args::MqttBrokerConnectArgs) {
        if let Some(host) = &other.host {
            self.host = host.clone();
        }
        if let Some(port) = other.port {
            self.port = port;
        }
        if let Some(client_id) = &other.client_id {
            self.client_id = client_id.clone();
        }
        if let Some(keep_alive) = other.keep_alive {
            self.keep_alive = keep_alive;
        }
        if let Some(username) = &other.username {
            self.username = Some(username.clone());
        }
        if let Some(password) = &other.password {
            self.password = Some(password.clone());
        }
        if let Some(use_tls) = other.use_tls {
            self.use_tls = use_tls;
        }
        if let Some(ca) = &other.tls_ca_file {
            self.tls_ca_file = Some(ca.clone());
        }
        if let Some(cert) = &other.tls_client_certificate {
            self.tls_client_certificate = Some(cert.clone());
        }
        if let Some(key) = &other.tls_client_key {
            self.tls_client_key = Some(key.clone());
        }
        if let Some(version) = other.tls_version {
            self.tls_version = version;
        }

        if other.last_will.topic.is_some() || other.last_will.payload.is_some() {
            let mut lw = self.last_will.clone().unwrap_or_default();
            if let Some(topic) = &other.last_will.topic {
                lw.topic = topic.clone();
            }
            if let Some(payload) = &other.last_will.payload {
                lw.payload = payload.clone().into_bytes();
            }
            if let Some(qos) = other.last_will.qos {
                lw.qos = qos;
            }
            if let Some(retain) = other.last_will.retain {
                lw.retain = retain;
            }
            self.last_will = Some(lw);
        }
    }
}

fn validate_credentials(value: &MqttBrokerConnectArgsResolved) -> Result<(), ValidationError> {
    if value.username.is_none() && value.password.is_some() {
        return Err(ValidationError::new("wrong_credentials"));
    }
    if value.username.is_some() && value.password.is_none() {
        return Err(ValidationError::new("wrong_credentials"));
    }
    Ok(())
}

fn validate_tls_client(value: &MqttBrokerConnectArgsResolved) -> Result<(), ValidationError> {
    if value.tls_client_key.is_none() && value.tls_client_certificate.is_some() {
        return Err(ValidationError::new("wrong_tls_client"));
    }
    if value.tls_client_key.is_some() && value.tls_client_certificate.is_none() {
        return Err(ValidationError::new("wrong_tls_client"));
    }
    Ok(())
}

/// `MqttTransport` implementation over `rumqttc`'s v5 async client.
pub struct MqttClient {
    config: Arc<MqttBrokerConnectArgsResolved>,
    client: Option<AsyncClient>,
}

impl MqttClient {
    pub fn new(config: Arc<MqttBrokerConnectArgsResolved>) -> Self {
        Self {
            config,
            client: None,
        }
    }

    fn build_options(&self) -> Result<MqttOptions, MqttServiceError> {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        if self.config.use_tls {
            let tls = configure_tls_rustls(self.config.clone())?;
            options.set_transport(rumqttc::Transport::tls_with_config(tls));
        }

        if let Some(last_will) = &self.config.last_will {
            options.set_last_will(LastWill::new(
                last_will.topic.clone(),
                last_will.payload.clone(),
                (*last_will.qos()).into(),
                *last_will.retain(),
                None,
            ));
        }

        Ok(options)
    }
}

#[async_trait::async_trait]
impl MqttTransport for MqttClient {
    async fn connect(
        &mut self,
        channel: broadcast::Sender<MqttEvent>,
    ) -> Result<JoinHandle<()>, MqttServiceError> {
        let options = self.build_options()?;
        let (client, mut event_loop) = AsyncClient::new(options, 32);
        self.client = Some(client);

        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("Connected to MQTT broker");
                        } else {
                            error!("Broker rejected connection: {:?}", ack.code);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Some(event) = to_mqtt_event(&publish) {
                            if channel.send(event).is_err() {
                                debug!("No active listeners for incoming publish");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(handle)
    }

    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: Vec<u8>) {
        if let Some(client) = &self.client {
            let qos: RumqttcQoS = qos.into();
            if let Err(e) = client.publish(topic.clone(), qos, retain, payload).await {
                error!("Could not publish to topic {topic}: {e}");
            }
        }
    }

    async fn subscribe(&mut self, topic: String, qos: QoS) {
        if let Some(client) = &self.client {
            let qos: RumqttcQoS = qos.into();
            if let Err(e) = client.subscribe(topic.clone(), qos).await {
                error!("Could not subscribe to topic {topic}: {e}");
            }
        }
    }

    async fn unsubscribe(&mut self, topic: String) {
        if let Some(client) = &self.client {
            if let Err(e) = client.unsubscribe(topic.clone()).await {
                error!("Could not unsubscribe from topic {topic}: {e}");
            }
        }
    }
}

fn to_mqtt_event(publish: &Publish) -> Option<MqttEvent> {
    let topic = std::str::from_utf8(publish.topic.as_ref()).ok()?;
    Some(MqttEvent {
        topic: topic.to_string(),
        payload: publish.payload.to_vec(),
    })
}
