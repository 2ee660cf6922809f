//! Rule store: load/parse/validate automations, serialize and persist to a
//! JSON file with debounced write-back (spec §4.6).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{Automation, Condition, TriggerKind, Value};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Could not read store file \"{1}\"")]
    Io(#[source] io::Error, PathBuf),
    #[error("Could not parse store file \"{1}\"")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("Automation \"{0}\" is missing required fields")]
    IncompleteData(String),
    #[error("An automation named \"{0}\" already exists")]
    NameDuplicate(String),
}

const STORE_VERSION: &str = "1.0";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PersistedDocument {
    #[serde(default)]
    automations: Vec<Automation>,
    #[serde(default)]
    states: HashMap<String, Value>,
    /// keyed by `"<action-uuid>:<chat-id>"`.
    #[serde(default)]
    messages: HashMap<String, i64>,
    #[serde(default)]
    timestamp: i64,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    STORE_VERSION.to_string()
}

pub struct Store {
    inner: Mutex<PersistedDocument>,
    path: PathBuf,
    write_delay: Duration,
    generation: AtomicU64,
}

impl Store {
    pub async fn load(path: PathBuf, write_delay: Duration) -> Result<Arc<Store>, StoreError> {
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::Parse(e, path.clone()))?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => PersistedDocument::default(),
            Err(e) => return Err(StoreError::Io(e, path.clone())),
        };

        Ok(Arc::new(Store {
            inner: Mutex::new(document),
            path,
            write_delay,
            generation: AtomicU64::new(0),
        }))
    }

    pub async fn by_uuid(&self, uuid: &Uuid) -> Option<Automation> {
        self.inner.lock().await.automations.iter().find(|a| &a.uuid == uuid).cloned()
    }

    pub async fn by_name(&self, name: &str) -> Option<Automation> {
        self.inner.lock().await.automations.iter().find(|a| a.name == name).cloned()
    }

    pub async fn all(&self) -> Vec<Automation> {
        self.inner.lock().await.automations.clone()
    }

    /// Parses a JSON array of raw automation documents, validating each
    /// independently: unknown enum strings or empty required fields drop the
    /// offending item rather than failing the whole batch. Duplicate action
    /// UUIDs within one automation are reassigned.
    pub fn parse(json: &str) -> (Vec<Automation>, Vec<String>) {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();

        let Ok(raw_items) = serde_json::from_str::<Vec<serde_json::Value>>(json) else {
            return (valid, vec!["payload is not a JSON array".to_string()]);
        };

        for raw in raw_items {
            let label = raw.get("name").and_then(|v| v.as_str()).unwrap_or("<unnamed>").to_string();
            match serde_json::from_value::<Automation>(raw) {
                Ok(mut automation) => {
                    if !automation.is_structurally_valid() {
                        rejected.push(label);
                        continue;
                    }
                    reassign_duplicate_action_uuids(&mut automation);
                    valid.push(automation);
                }
                Err(_) => rejected.push(label),
            }
        }

        (valid, rejected)
    }

    /// Replaces an automation by UUID, or adds it if `add` is set and no
    /// UUID match exists. Rejects name duplicates against other automations.
    pub async fn add_or_replace(&self, automation: Automation, add: bool) -> Result<(), StoreError> {
        if !automation.is_structurally_valid() {
            return Err(StoreError::IncompleteData(automation.name.clone()));
        }

        let mut doc = self.inner.lock().await;
        let name_taken = doc
            .automations
            .iter()
            .any(|a| a.name == automation.name && a.uuid != automation.uuid);
        if name_taken {
            return Err(StoreError::NameDuplicate(automation.name.clone()));
        }

        match doc.automations.iter().position(|a| a.uuid == automation.uuid) {
            Some(index) => doc.automations[index] = automation,
            None if add => doc.automations.push(automation),
            None => return Err(StoreError::IncompleteData(automation.name.clone())),
        }
        Ok(())
    }

    /// Records a firing on the stored automation: bumps `counter` and sets
    /// `last_triggered` so a later `debounce_elapsed` check sees it.
    pub async fn record_fired(&self, uuid: &Uuid, now: DateTime<Utc>) {
        let mut doc = self.inner.lock().await;
        if let Some(automation) = doc.automations.iter_mut().find(|a| &a.uuid == uuid) {
            automation.last_triggered = Some(now);
            automation.counter += 1;
        }
    }

    pub async fn remove(&self, uuid: &Uuid) -> bool {
        let mut doc = self.inner.lock().await;
        let before = doc.automations.len();
        doc.automations.retain(|a| &a.uuid != uuid);
        doc.automations.len() != before
    }

    pub async fn state(&self, name: &str) -> Option<Value> {
        self.inner.lock().await.states.get(name).cloned()
    }

    pub async fn all_states(&self) -> HashMap<String, Value> {
        self.inner.lock().await.states.clone()
    }

    pub async fn set_state(&self, name: String, value: Option<Value>) {
        let mut doc = self.inner.lock().await;
        match value {
            Some(value) => {
                doc.states.insert(name, value);
            }
            None => {
                doc.states.remove(&name);
            }
        }
    }

    pub async fn message_id(&self, action_uuid: &Uuid, chat: i64) -> Option<i64> {
        self.inner.lock().await.messages.get(&message_key(action_uuid, chat)).copied()
    }

    pub async fn set_message_id(&self, action_uuid: &Uuid, chat: i64, message_id: i64) {
        self.inner
            .lock()
            .await
            .messages
            .insert(message_key(action_uuid, chat), message_id);
    }

    pub async fn clear_message_id(&self, action_uuid: &Uuid, chat: i64) {
        self.inner.lock().await.messages.remove(&message_key(action_uuid, chat));
    }

    /// MQTT topics referenced by this automation's triggers/conditions, so
    /// the Controller can subscribe lazily.
    pub fn referenced_topics(automation: &Automation) -> Vec<String> {
        let mut topics = Vec::new();
        for trigger in &automation.triggers {
            if let TriggerKind::Mqtt { topic, .. } = &trigger.kind {
                topics.push(topic.clone());
            }
        }
        collect_condition_topics(&automation.conditions, &mut topics);
        topics
    }

    /// Schedules a debounced write; `sync` marks the next write as durable
    /// (skips the debounce window and writes immediately).
    pub fn schedule_write(self: &Arc<Self>, sync: bool) {
        if sync {
            let store = self.clone();
            tokio::spawn(async move {
                if let Err(e) = store.write_now().await {
                    error!("Could not persist store: {e}");
                }
            });
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let store = self.clone();
        let delay = self.write_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if store.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = store.write_now().await {
                error!("Could not persist store: {e}");
            }
        });
    }

    async fn write_now(&self) -> Result<(), StoreError> {
        let mut doc = self.inner.lock().await;
        doc.timestamp = chrono::Utc::now().timestamp();
        doc.version = STORE_VERSION.to_string();
        let json = serde_json::to_vec(&*doc).expect("store document always serializes");
        drop(doc);

        write_atomic(&self.path, &json).await.map_err(|e| StoreError::Io(e, self.path.clone()))
    }
}

fn message_key(action_uuid: &Uuid, chat: i64) -> String {
    format!("{action_uuid}:{chat}")
}

fn collect_condition_topics(conditions: &[Condition], out: &mut Vec<String>) {
    for condition in conditions {
        match condition {
            Condition::Mqtt { topic, .. } => out.push(topic.clone()),
            Condition::And { children } | Condition::Or { children } | Condition::Not { children } => {
                collect_condition_topics(children, out);
            }
            _ => {}
        }
    }
}

fn reassign_duplicate_action_uuids(automation: &mut Automation) {
    let mut seen = std::collections::HashSet::new();
    reassign_in_list(&mut automation.actions, &mut seen);
}

fn reassign_in_list(actions: &mut [crate::model::Action], seen: &mut std::collections::HashSet<Uuid>) {
    for action in actions.iter_mut() {
        if !seen.insert(action.uuid) {
            warn!("Duplicate action UUID {} reassigned", action.uuid);
            action.uuid = Uuid::new_v4();
            seen.insert(action.uuid);
        }
        if let crate::model::ActionKind::Condition { then, else_, .. } = &mut action.kind {
            reassign_in_list(then, seen);
            reassign_in_list(else_, seen);
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let file = tokio::fs::File::create(&tmp_path).await?;
    use tokio::io::AsyncWriteExt;
    let mut file = file;
    file.write_all(contents).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"[
            {
                "uuid": "3fa85f64-5717-4562-b3fc-2c963f66afa6",
                "name": "valid",
                "active": true,
                "mode": "single",
                "triggers": [{"kind": "startup", "name": null, "active": true}],
                "conditions": [],
                "actions": [{"uuid": "3fa85f64-5717-4562-b3fc-2c963f66afa7", "kind": "exit", "active": true}]
            },
            {
                "uuid": "3fa85f64-5717-4562-b3fc-2c963f66afa8",
                "name": "incomplete",
                "active": true,
                "mode": "single",
                "triggers": [],
                "conditions": [],
                "actions": []
            }
        ]"#
        .to_string()
    }

    #[test]
    fn parse_drops_incomplete_automations() {
        let (valid, rejected) = Store::parse(&sample_json());
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].name, "valid");
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::load(path, Duration::from_secs(20)).await.unwrap();
        assert!(store.all().await.is_empty());
    }

    #[tokio::test]
    async fn record_fired_sets_last_triggered_and_bumps_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::load(path, Duration::from_secs(20)).await.unwrap();

        let (valid, _) = Store::parse(&sample_json());
        let uuid = valid[0].uuid;
        store.add_or_replace(valid[0].clone(), true).await.unwrap();

        let now = Utc::now();
        store.record_fired(&uuid, now).await;

        let stored = store.by_uuid(&uuid).await.unwrap();
        assert_eq!(stored.last_triggered, Some(now));
        assert_eq!(stored.counter, 1);
    }

    #[test]
    fn referenced_topics_collects_trigger_and_nested_condition_topics() {
        let json = r#"[{
            "uuid": "3fa85f64-5717-4562-b3fc-2c963f66afa6",
            "name": "mqtt-rule",
            "active": true,
            "mode": "single",
            "triggers": [{"kind": "mqtt", "topic": "sensors/door", "statement": "equals", "value": "open", "name": null, "active": true}],
            "conditions": [{"kind": "and", "children": [{"kind": "mqtt", "topic": "sensors/alarm", "statement": "equals", "value": "armed"}]}],
            "actions": [{"uuid": "3fa85f64-5717-4562-b3fc-2c963f66afa7", "kind": "exit", "active": true}]
        }]"#;
        let (valid, rejected) = Store::parse(json);
        assert!(rejected.is_empty());

        let topics = Store::referenced_topics(&valid[0]);
        assert_eq!(topics, vec!["sensors/door".to_string(), "sensors/alarm".to_string()]);
    }

    #[tokio::test]
    async fn add_or_replace_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::load(path, Duration::from_secs(20)).await.unwrap();

        let (valid, _) = Store::parse(&sample_json());
        store.add_or_replace(valid[0].clone(), true).await.unwrap();

        let mut duplicate = valid[0].clone();
        duplicate.uuid = Uuid::new_v4();
        let result = store.add_or_replace(duplicate, true).await;
        assert!(matches!(result, Err(StoreError::NameDuplicate(_))));
    }
}
