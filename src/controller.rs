//! Top-level orchestrator (spec §4.7): MQTT I/O, device-topic lifecycle, the
//! 1 Hz ticker, trigger dispatch, Runner lifecycle, and command handling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use log::warn;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::HearthConfig;
use crate::effects::Effect;
use crate::expr::pattern::PatternContext;
use crate::model::{Automation, Device, Mode, TriggerKind, Value};
use crate::mqtt::{MqttEvent, MqttTransport, QoS};
use crate::runner::{Runner, RunnerAbort};
use crate::store::Store;
use crate::sun::SunCalculator;
use crate::telegram::TelegramTransport;

/// A point-in-time, read-only view a Runner can query without touching the
/// Controller's live, mutex-guarded state. Built once per run from the
/// Controller's state at dispatch time (spec §5, "Runners read immutable
/// snapshots ... and never mutate them").
pub struct RunnerContext {
    pub properties: HashMap<(String, String), Value>,
    pub retained: HashMap<String, Vec<u8>>,
    pub states: HashMap<String, Value>,
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl PatternContext for RunnerContext {
    fn property(&self, endpoint: &str, prop: &str) -> Option<Value> {
        self.properties
            .iter()
            .find(|((ep, p), _)| ep == endpoint && p.eq_ignore_ascii_case(prop))
            .map(|(_, v)| v.clone())
    }

    fn mqtt_payload(&self, topic: &str) -> Option<Vec<u8>> {
        self.retained.get(topic).cloned()
    }

    fn state(&self, name: &str) -> Option<Value> {
        self.states.get(name).cloned()
    }

    fn file_contents(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }

    fn sunrise_today(&self) -> Option<DateTime<Utc>> {
        self.sunrise
    }

    fn sunset_today(&self) -> Option<DateTime<Utc>> {
        self.sunset
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

#[derive(Default)]
struct RunnerSet {
    active: HashMap<Uuid, RunnerAbort>,
    queued: VecDeque<(Arc<crate::model::ActionList>, crate::expr::pattern::PatternMeta, String)>,
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum Command {
    RestartService,
    UpdateAutomation { automation: Uuid, data: serde_json::Value },
    RemoveAutomation { automation: Uuid },
    RemoveState { state: String },
}

pub struct Controller {
    config: Arc<HearthConfig>,
    mqtt: Arc<Mutex<Box<dyn MqttTransport>>>,
    store: Arc<Store>,
    sun: Arc<dyn SunCalculator>,
    telegram: Option<Arc<dyn TelegramTransport>>,
    devices: Mutex<HashMap<String, Device>>,
    retained: Mutex<HashMap<String, Vec<u8>>>,
    runners: Mutex<HashMap<Uuid, RunnerSet>>,
    subscribed_topics: Mutex<HashSet<String>>,
    startup_fired: AtomicBool,
    restart_requested: AtomicBool,
    effects_tx: mpsc::Sender<Effect>,
}

/// Exit code a supervisor should interpret as "please respawn me" (spec §6,
/// "Process exit codes").
pub const RESTART_EXIT_CODE: i32 = 75;

impl Controller {
    pub fn new(
        config: Arc<HearthConfig>,
        mqtt: Box<dyn MqttTransport>,
        store: Arc<Store>,
        sun: Arc<dyn SunCalculator>,
        telegram: Option<Arc<dyn TelegramTransport>>,
    ) -> (Arc<Self>, mpsc::Receiver<Effect>) {
        let (effects_tx, effects_rx) = mpsc::channel(256);
        let controller = Arc::new(Self {
            config,
            mqtt: Arc::new(Mutex::new(mqtt)),
            store,
            sun,
            telegram,
            devices: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            subscribed_topics: Mutex::new(HashSet::new()),
            startup_fired: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            effects_tx,
        });
        (controller, effects_rx)
    }

    pub fn should_restart(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Connects to the broker, subscribes to the fixed topic set, and spawns
    /// the 1 Hz ticker and effect-draining tasks. Runs until the MQTT event
    /// stream closes.
    pub async fn run(self: &Arc<Self>, mut effects_rx: mpsc::Receiver<Effect>) -> anyhow::Result<()> {
        let (event_tx, mut event_rx) = tokio::sync::broadcast::channel(256);
        {
            let mut mqtt = self.mqtt.lock().await;
            mqtt.connect(event_tx).await?;
        }

        let prefix = self.config.topic_prefix().clone();
        self.subscribe(format!("command/{prefix}")).await;
        self.subscribe("service/#".to_string()).await;
        self.subscribe(format!("status/{prefix}")).await;

        for automation in self.store.all().await {
            for topic in Store::referenced_topics(&automation) {
                self.subscribe(topic).await;
            }
        }

        {
            let controller = self.clone();
            tokio::spawn(async move {
                while let Some(effect) = effects_rx.recv().await {
                    controller.apply_effect(effect).await;
                }
            });
        }

        {
            let controller = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    controller.tick().await;
                }
            });
        }

        self.fire_startup_once().await;

        while let Ok(event) = event_rx.recv().await {
            self.handle_mqtt_event(event).await;
        }

        Ok(())
    }

    async fn subscribe(&self, topic: String) {
        let mut subscribed = self.subscribed_topics.lock().await;
        if subscribed.insert(topic.clone()) {
            self.mqtt.lock().await.subscribe(topic, QoS::AtLeastOnce).await;
        }
    }

    async fn unsubscribe(&self, topic: String) {
        let mut subscribed = self.subscribed_topics.lock().await;
        if subscribed.remove(&topic) {
            self.mqtt.lock().await.unsubscribe(topic).await;
        }
    }

    async fn fire_startup_once(self: &Arc<Self>) {
        if self.startup_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        for automation in self.store.all().await {
            if !automation.active {
                continue;
            }
            for trigger in &automation.triggers {
                if matches!(trigger.kind, TriggerKind::Startup) && trigger.active {
                    self.dispatch(&automation, trigger.name.clone(), None, None).await;
                }
            }
        }
    }

    async fn handle_mqtt_event(self: &Arc<Self>, event: MqttEvent) {
        let previous = self.retained.lock().await.insert(event.topic.clone(), event.payload.clone());

        let prefix = self.config.topic_prefix().clone();
        if event.topic == format!("command/{prefix}") {
            self.handle_command(&event.payload).await;
            return;
        }

        if let Some(rest) = event.topic.strip_prefix("service/") {
            self.handle_service_status(rest, &event.payload).await;
            return;
        }

        if let Some(rest) = event.topic.strip_prefix("status/") {
            self.handle_device_inventory(rest, &event.payload).await;
            return;
        }

        if let Some(rest) = event.topic.strip_prefix("fd/") {
            self.handle_device_update(rest.to_string(), &event.payload).await;
            return;
        }

        self.dispatch_mqtt_triggers(&event.topic, &event.payload, previous.as_deref()).await;
    }

    /// Handles a sibling service's online/offline announcement on
    /// `service/<type>/<name>`: subscribes to its device inventory on
    /// `status/<service>` when it comes online, and tears down its devices'
    /// `fd/` subscriptions when it goes offline.
    async fn handle_service_status(self: &Arc<Self>, service: &str, payload: &[u8]) {
        let Some((service_type, _)) = service.split_once('/') else { return };
        if !SERVICE_TYPES.contains(&service_type) {
            return;
        }
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) else { return };

        if json.get("status").and_then(|v| v.as_str()) == Some("online") {
            self.subscribe(format!("status/{service}")).await;
            return;
        }

        let prefix = format!("{service}/");
        let stale: Vec<String> = {
            let devices = self.devices.lock().await;
            devices.keys().filter(|topic| topic.starts_with(&prefix)).cloned().collect()
        };
        for topic in stale {
            self.devices.lock().await.remove(&topic);
            self.unsubscribe(format!("fd/{topic}")).await;
            self.unsubscribe(format!("fd/{topic}/#")).await;
        }
        self.unsubscribe(format!("status/{service}")).await;
    }

    /// Reconciles the device catalog against a sibling service's inventory
    /// dump on `status/<service>`: registers newly-seen devices (subscribing
    /// to their `fd/` topics and requesting a full property dump) and
    /// re-subscribes renamed ones.
    async fn handle_device_inventory(self: &Arc<Self>, service: &str, payload: &[u8]) {
        let Some((service_type, _)) = service.split_once('/') else { return };
        if !SERVICE_TYPES.contains(&service_type) {
            return;
        }
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) else { return };
        let Some(items) = json.get("devices").and_then(|v| v.as_array()) else { return };
        let names = json.get("names").and_then(|v| v.as_bool()).unwrap_or(false);

        for item in items {
            let Some(id) = device_identity(service_type, item) else { continue };
            let name = item
                .get("name")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(&id)
                .to_string();
            let key = format!("{service_type}/{id}");
            let topic = format!("{service}/{}", if names { &name } else { &id });

            let existing_topic = {
                let devices = self.devices.lock().await;
                devices.values().find(|d| d.key == key).map(|d| d.topic.clone())
            };
            if existing_topic.as_deref() == Some(topic.as_str()) {
                continue;
            }

            if let Some(old_topic) = existing_topic {
                self.devices.lock().await.remove(&old_topic);
                self.unsubscribe(format!("fd/{old_topic}")).await;
                self.unsubscribe(format!("fd/{old_topic}/#")).await;
            }

            let mut device = Device::new(topic.clone(), name.clone());
            device.key = key;
            self.devices.lock().await.insert(topic.clone(), device);

            self.subscribe(format!("fd/{topic}")).await;
            self.subscribe(format!("fd/{topic}/#")).await;

            let command_payload = serde_json::json!({
                "action": "getProperties",
                "device": if names { &name } else { &id },
                "service": self.config.topic_prefix(),
            })
            .to_string();
            self.mqtt
                .lock()
                .await
                .publish(format!("command/{service}"), QoS::AtMostOnce, false, command_payload.into_bytes())
                .await;
        }
    }

    async fn handle_command(self: &Arc<Self>, payload: &[u8]) {
        let Ok(command) = serde_json::from_slice::<Command>(payload) else {
            warn!("Could not parse command payload");
            return;
        };

        match command {
            Command::RestartService => {
                self.restart_requested.store(true, Ordering::SeqCst);
            }
            Command::UpdateAutomation { automation: uuid, data } => {
                match serde_json::from_value::<Automation>(data) {
                    Ok(automation) if automation.uuid == uuid => {
                        let topics = Store::referenced_topics(&automation);
                        if let Err(e) = self.store.add_or_replace(automation, true).await {
                            warn!("Could not update automation: {e}");
                        } else {
                            for topic in topics {
                                self.subscribe(topic).await;
                            }
                            self.store.schedule_write(true);
                        }
                    }
                    Ok(_) => warn!("Update command's automation uuid doesn't match its payload"),
                    Err(e) => warn!("Could not parse automation update: {e}"),
                }
            }
            Command::RemoveAutomation { automation } => {
                if self.store.remove(&automation).await {
                    self.store.schedule_write(true);
                }
            }
            Command::RemoveState { state } => {
                self.store.set_state(state, None).await;
                self.store.schedule_write(false);
            }
        }
    }

    async fn handle_device_update(self: &Arc<Self>, topic: String, payload: &[u8]) {
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) else {
            return;
        };
        let Some(props) = json.as_object() else { return };

        let mut devices = self.devices.lock().await;
        let device = devices.entry(topic.clone()).or_insert_with(|| Device::new(topic.clone(), topic.clone()));

        let mut changed = Vec::new();
        for (key, value) in props {
            if matches!(key.as_str(), "action" | "event" | "scene") {
                continue;
            }
            let new_value = json_to_value(value);
            let old_value = device.property(0, key).cloned();
            if old_value.as_ref() != Some(&new_value) {
                changed.push((key.clone(), old_value, new_value.clone()));
            }
            device.set_property(0, key.clone(), new_value);
        }
        drop(devices);

        for (property, old, new) in changed {
            self.dispatch_property_triggers(&topic, &property, old, new).await;
        }
    }

    async fn dispatch_property_triggers(
        self: &Arc<Self>,
        endpoint: &str,
        property: &str,
        old: Option<Value>,
        new: Value,
    ) {
        for automation in self.store.all().await {
            if !automation.active {
                continue;
            }
            for trigger in &automation.triggers {
                if !trigger.active {
                    continue;
                }
                if let TriggerKind::Property { endpoint: ep, property: prop, statement, value, force } = &trigger.kind {
                    if ep != endpoint || !prop.eq_ignore_ascii_case(property) {
                        continue;
                    }
                    let fired = if *statement == crate::model::Statement::Between {
                        false
                    } else {
                        crate::model::Trigger::matches_transition(*statement, old.as_ref(), &new, value, *force)
                    };
                    if fired {
                        self.dispatch(&automation, trigger.name.clone(), Some(endpoint.to_string()), Some(property.to_string())).await;
                    }
                }
            }
        }
    }

    async fn dispatch_mqtt_triggers(self: &Arc<Self>, topic: &str, payload: &[u8], previous: Option<&[u8]>) {
        for automation in self.store.all().await {
            if !automation.active {
                continue;
            }
            for trigger in &automation.triggers {
                if !trigger.active {
                    continue;
                }
                if let TriggerKind::Mqtt { topic: t, sub_field, statement, value, force } = &trigger.kind {
                    if t != topic {
                        continue;
                    }
                    let new = crate::model::condition::mqtt_leaf_value(payload, sub_field.as_deref());
                    let old = previous.map(|p| crate::model::condition::mqtt_leaf_value(p, sub_field.as_deref()));
                    if crate::model::Trigger::matches_transition(*statement, old.as_ref(), &new, value, *force) {
                        self.dispatch(&automation, trigger.name.clone(), None, None).await;
                    }
                }
            }
        }
    }

    /// Called each second by the ticker; fires Time and Interval triggers on
    /// minute boundaries (spec §4.7's `updateTime`).
    async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        if now.second() != 0 {
            return;
        }
        let minute_of_day = now.hour() * 60 + now.minute();

        for automation in self.store.all().await {
            if !automation.active {
                continue;
            }
            for trigger in &automation.triggers {
                if !trigger.active {
                    continue;
                }
                match &trigger.kind {
                    TriggerKind::Interval { minutes, offset_minutes }
                        if minute_of_day >= *offset_minutes && (minute_of_day - offset_minutes) % minutes == 0 =>
                    {
                        self.dispatch(&automation, trigger.name.clone(), None, None).await;
                    }
                    TriggerKind::Time { spec } if self.time_spec_matches(spec, minute_of_day).await => {
                        self.dispatch(&automation, trigger.name.clone(), None, None).await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn time_spec_matches(&self, spec: &str, minute_of_day: u32) -> bool {
        let today = Utc::now().date_naive();
        let sunrise_minute = self.sun.sunrise(today).hour() * 60 + self.sun.sunrise(today).minute();
        let sunset_minute = self.sun.sunset(today).hour() * 60 + self.sun.sunset(today).minute();

        let target = if let Some(offset) = spec.strip_prefix("sunrise") {
            offset.parse::<i64>().ok().map(|o| sunrise_minute as i64 + o)
        } else if let Some(offset) = spec.strip_prefix("sunset") {
            offset.parse::<i64>().ok().map(|o| sunset_minute as i64 + o)
        } else {
            spec.split_once(':').and_then(|(h, m)| {
                Some(h.parse::<i64>().ok()? * 60 + m.parse::<i64>().ok()?)
            })
        };

        target == Some(minute_of_day as i64)
    }

    /// Applies execution-mode policy, builds a snapshot context, and starts
    /// or enqueues a Runner (spec §4.5's four modes).
    async fn dispatch(
        self: &Arc<Self>,
        automation: &Automation,
        firing_trigger_name: Option<String>,
        trigger_endpoint: Option<String>,
        trigger_property: Option<String>,
    ) {
        let now = Utc::now();
        if !automation.debounce_elapsed(now) {
            return;
        }
        self.store.record_fired(&automation.uuid, now).await;
        self.store.schedule_write(false);

        let meta = crate::expr::pattern::PatternMeta {
            trigger_name: firing_trigger_name,
            trigger_endpoint,
            trigger_property,
            shell_output: None,
        };
        let actions = Arc::new(automation.actions.clone());

        let mut runners = self.runners.lock().await;
        let set = runners.entry(automation.uuid).or_default();

        match automation.mode {
            Mode::Single => {
                if !set.active.is_empty() {
                    warn!("Automation \"{}\" is single-mode and already running; dropping trigger", automation.name);
                    return;
                }
                self.spawn_runner(automation.uuid, automation.name.clone(), actions, meta, set);
            }
            Mode::Restart => {
                for (_, abort) in set.active.drain() {
                    abort.abort();
                }
                self.spawn_runner(automation.uuid, automation.name.clone(), actions, meta, set);
            }
            Mode::Queued => {
                if set.active.is_empty() {
                    self.spawn_runner(automation.uuid, automation.name.clone(), actions, meta, set);
                } else {
                    set.queued.push_back((actions, meta, automation.name.clone()));
                }
            }
            Mode::Parallel => {
                self.spawn_runner(automation.uuid, automation.name.clone(), actions, meta, set);
            }
        }
    }

    fn spawn_runner(
        self: &Arc<Self>,
        automation_uuid: Uuid,
        name: String,
        actions: Arc<crate::model::ActionList>,
        meta: crate::expr::pattern::PatternMeta,
        set: &mut RunnerSet,
    ) {
        let run_id = Uuid::new_v4();
        let (runner, abort) = Runner::new(name, actions, meta, self.effects_tx.clone());
        set.active.insert(run_id, abort);

        let controller = self.clone();
        tokio::spawn(async move {
            let ctx = controller.snapshot_context().await;
            runner.run(Arc::new(ctx)).await;
            controller.on_runner_finished(automation_uuid, run_id).await;
        });
    }

    /// Starts the next queued Runner for this automation, if any (spec
    /// §4.5's queued mode: "start when the previous completes").
    async fn on_runner_finished(self: &Arc<Self>, automation_uuid: Uuid, run_id: Uuid) {
        let mut runners = self.runners.lock().await;
        let Some(set) = runners.get_mut(&automation_uuid) else { return };
        set.active.remove(&run_id);

        if let Some((actions, meta, name)) = set.queued.pop_front() {
            self.spawn_runner(automation_uuid, name, actions, meta, set);
        }
    }

    async fn snapshot_context(&self) -> RunnerContext {
        let devices = self.devices.lock().await;
        let mut properties = HashMap::new();
        for (endpoint, device) in devices.iter() {
            for props in device.endpoints.values() {
                for (prop, value) in props {
                    properties.insert((endpoint.clone(), prop.clone()), value.clone());
                }
            }
        }
        drop(devices);

        let today = Utc::now().date_naive();
        RunnerContext {
            properties,
            retained: self.retained.lock().await.clone(),
            states: self.store.all_states().await,
            sunrise: Some(self.sun.sunrise(today)),
            sunset: Some(self.sun.sunset(today)),
            now: Utc::now(),
        }
    }

    async fn apply_effect(&self, effect: Effect) {
        match effect {
            Effect::Publish { topic, payload, qos, retain } => {
                self.mqtt.lock().await.publish(topic, qos, retain, payload).await;
            }
            Effect::SetState { name, value } => {
                let value = value.map(Value::String);
                self.store.set_state(name, value).await;
                self.store.schedule_write(false);
            }
            Effect::Telegram { action_uuid, message, chats, silent, update, remove, message_thread_id, .. } => {
                let Some(telegram) = &self.telegram else { return };
                for chat in chats {
                    if remove {
                        if let Some(message_id) = self.store.message_id(&action_uuid, chat).await {
                            let _ = telegram.delete_message(chat, message_id).await;
                            self.store.clear_message_id(&action_uuid, chat).await;
                        }
                    } else if update {
                        if let Some(message_id) = self.store.message_id(&action_uuid, chat).await {
                            let _ = telegram.edit_message(chat, message_id, &message).await;
                        }
                    } else {
                        match telegram.send_message(chat, &message, silent, message_thread_id).await {
                            Ok(message_id) => self.store.set_message_id(&action_uuid, chat, message_id).await,
                            Err(e) => warn!("Telegram send failed: {e}"),
                        }
                    }
                }
            }
        }
    }
}

/// Recognized sibling-service types carried in `service/<type>/<name>` and
/// `status/<type>/<name>` topics.
const SERVICE_TYPES: [&str; 3] = ["zigbee", "modbus", "custom"];

/// Derives a device's stable per-type identity from its inventory entry.
/// Zigbee entries that were removed or lack a logical type are skipped.
fn device_identity(service_type: &str, device: &serde_json::Value) -> Option<String> {
    match service_type {
        "zigbee" => {
            if device.get("removed").and_then(|v| v.as_bool()).unwrap_or(false) {
                return None;
            }
            if device.get("logicalType").and_then(|v| v.as_i64()).unwrap_or(0) == 0 {
                return None;
            }
            device.get("ieeeAddress").and_then(|v| v.as_str()).map(str::to_string)
        }
        "modbus" => {
            let port = device.get("portId").and_then(|v| v.as_i64())?;
            let slave = device.get("slaveId").and_then(|v| v.as_i64())?;
            Some(format!("{port}.{slave}"))
        }
        "custom" => device.get("id").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Null => Value::Null,
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_to_value_preserves_bool() {
        assert_eq!(json_to_value(&serde_json::json!(true)), Value::Bool(true));
    }
}
