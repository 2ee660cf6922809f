use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Condition;

/// An ordered list of actions. Nested condition branches own their own
/// `ActionList`; the Runner tracks its way back out via a cursor stack
/// rather than a parent back-pointer (see runner.rs).
pub type ActionList = Vec<Action>;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ActionKind {
    Property {
        endpoint: String,
        property: String,
        statement: PropertyStatement,
        value: String,
    },
    Mqtt {
        topic: String,
        message: String,
        #[serde(default)]
        retain: bool,
    },
    /// `value = None` deletes the named state entry.
    State { name: String, value: Option<String> },
    Telegram {
        message: String,
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        keyboard: Option<String>,
        #[serde(default)]
        message_thread_id: Option<i64>,
        #[serde(default)]
        silent: bool,
        #[serde(default)]
        remove: bool,
        #[serde(default)]
        update: bool,
        #[serde(default)]
        chats: Vec<i64>,
    },
    Shell { command: String, timeout_seconds: u64 },
    Condition {
        condition: Condition,
        then: ActionList,
        #[serde(rename = "else")]
        else_: ActionList,
    },
    /// Expression-expandable duration in seconds.
    Delay { seconds: String },
    Exit,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PropertyStatement {
    Value,
    Increase,
    Decrease,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Action {
    pub uuid: Uuid,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Skip this action unless the run's firing trigger carries this name.
    #[serde(default)]
    pub trigger_name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Action {
    /// Actions other than `Condition` are skipped entirely when inactive;
    /// `Condition` nodes are always walked (its branches carry their own
    /// activity).
    pub fn should_dispatch(&self, firing_trigger_name: Option<&str>) -> bool {
        if let Some(gate) = &self.trigger_name {
            if Some(gate.as_str()) != firing_trigger_name {
                return false;
            }
        }
        if !self.active && !matches!(self.kind, ActionKind::Condition { .. }) {
            return false;
        }
        true
    }
}
