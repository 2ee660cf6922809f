//! # hearthd
//! A home-automation rule engine: subscribes to an MQTT broker, evaluates
//! user-authored automations against incoming events, and executes their
//! action sequences.

use std::sync::Arc;

use anyhow::Context;
use hearthd::config::parse_config;
use hearthd::controller::{Controller, RESTART_EXIT_CODE};
use hearthd::mqtt::client::MqttClient;
use hearthd::store::Store;
use hearthd::sun::SolarPosition;
use hearthd::telegram::TelegramClient;
use log::info;
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_config().context("could not load configuration")?;

    init_logger(*config.log_level());

    info!("hearthd {} starting", hearthd::built_info::PKG_VERSION);
    info!("{config}");

    let store = Store::load(config.database().clone(), *config.store_write_delay())
        .await
        .context("could not load rule store")?;

    let mqtt = Box::new(MqttClient::new(Arc::new(config.broker().clone())));
    let sun = Arc::new(SolarPosition::new(*config.location().latitude(), *config.location().longitude()));
    let telegram = config.telegram().token().clone().map(|token| {
        Arc::new(TelegramClient::new(token, *config.telegram().timeout()))
            as Arc<dyn hearthd::telegram::TelegramTransport>
    });

    let (controller, effects_rx) = Controller::new(Arc::new(config), mqtt, store, sun, telegram);

    controller.run(effects_rx).await.context("controller loop exited")?;

    if controller.should_restart() {
        std::process::exit(RESTART_EXIT_CODE);
    }

    Ok(())
}

fn init_logger(level: log::LevelFilter) {
    TermLogger::init(level, LogConfig::default(), TerminalMode::Mixed, ColorChoice::Auto)
        .expect("terminal logger can always be initialized once at startup");
}
