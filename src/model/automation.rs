use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Action, Condition, Trigger};

/// Policy applied when a fresh trigger arrives while a Runner for the same
/// automation is already in progress.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    #[default]
    Single,
    Restart,
    Queued,
    Parallel,
}

/// A complete trigger-condition-action recipe, uniquely identified by a
/// stable UUID. Mutated only through the rule store's parse/replace/remove
/// operations.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Automation {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, with = "duration_millis_opt")]
    pub debounce: Option<Duration>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub counter: u64,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

fn default_active() -> bool {
    true
}

impl Automation {
    /// Required to be valid: a name, at least one trigger, at least one action.
    pub fn is_structurally_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.triggers.is_empty() && !self.actions.is_empty()
    }

    pub fn debounce_elapsed(&self, now: DateTime<Utc>) -> bool {
        let (Some(last), Some(debounce)) = (self.last_triggered, self.debounce) else {
            return true;
        };
        match chrono::Duration::from_std(debounce) {
            Ok(debounce) => now - last >= debounce,
            Err(_) => true,
        }
    }
}

mod duration_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_automation() -> Automation {
        Automation {
            uuid: Uuid::new_v4(),
            name: "test".to_string(),
            note: None,
            active: true,
            debounce: None,
            last_triggered: None,
            mode: Mode::Single,
            counter: 0,
            triggers: vec![],
            conditions: vec![],
            actions: vec![],
        }
    }

    #[test]
    fn requires_name_trigger_and_action() {
        let mut automation = bare_automation();
        assert!(!automation.is_structurally_valid());

        automation.name = "".to_string();
        assert!(!automation.is_structurally_valid());
    }

    #[test]
    fn debounce_elapsed_true_without_prior_run() {
        let automation = bare_automation();
        assert!(automation.debounce_elapsed(Utc::now()));
    }
}
