//! Side-effect requests a Runner emits back to the Controller. Runners never
//! touch MQTT, Telegram, or the state map directly — see spec §4.5's
//! "side-effect emission contract" — so every mutation funnels through one
//! channel the Controller drains serially.

use uuid::Uuid;

use crate::mqtt::QoS;

#[derive(Clone, Debug)]
pub enum Effect {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    SetState {
        name: String,
        /// `None` deletes the entry.
        value: Option<String>,
    },
    Telegram {
        action_uuid: Uuid,
        message: String,
        file: Option<String>,
        keyboard: Option<String>,
        message_thread_id: Option<i64>,
        silent: bool,
        remove: bool,
        update: bool,
        chats: Vec<i64>,
    },
}
