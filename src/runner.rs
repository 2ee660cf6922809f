//! The Action interpreter and its concurrency wrapper, the Runner (spec
//! §4.5). A Runner owns one concurrent in-progress execution of one
//! automation. Per-run state (shell output, action-list cursor, last
//! trigger) lives here, not on the Automation, so parallel mode is safe
//! (spec §9, "Per-run state").

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use crate::effects::Effect;
use crate::expr::pattern::{coerce_scalar, expand_pattern, PatternContext, PatternMeta};
use crate::model::condition::evaluate_condition;
use crate::model::{split_endpoint_spec, ActionKind, ActionList, PropertyStatement, Value};
use crate::mqtt::QoS;

/// Shared handle used by the Controller to abort an in-progress run.
#[derive(Clone)]
pub struct RunnerAbort {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl RunnerAbort {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Stops the run's timer (if any) and signals the shell child, if one is
    /// in flight, to be killed. A side-effect request already serialized to
    /// the Controller still completes.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Runner {
    pub automation_name: String,
    pub actions: Arc<ActionList>,
    pub meta: PatternMeta,
    pub effects: mpsc::Sender<Effect>,
    pub abort: RunnerAbort,
}

impl Runner {
    pub fn new(automation_name: String, actions: Arc<ActionList>, meta: PatternMeta, effects: mpsc::Sender<Effect>) -> (Self, RunnerAbort) {
        let abort = RunnerAbort::new();
        (
            Self {
                automation_name,
                actions,
                meta,
                effects,
                abort: abort.clone(),
            },
            abort,
        )
    }

    /// Interprets the action list to completion, following nested Condition
    /// branches via a cursor stack rather than a parent back-pointer (spec
    /// §9, "Parent link in ActionList").
    pub async fn run(mut self, ctx: Arc<dyn PatternContext>) {
        let mut stack: Vec<(Arc<ActionList>, usize)> = vec![(self.actions.clone(), 0)];

        'walk: while let Some((list, index)) = stack.last().cloned() {
            if self.abort.is_aborted() {
                return;
            }

            if index >= list.len() {
                stack.pop();
                continue;
            }
            stack.last_mut().unwrap().1 += 1;

            let action = &list[index];
            if !action.should_dispatch(self.meta.trigger_name.as_deref()) {
                continue;
            }

            match &action.kind {
                ActionKind::Property { endpoint, property, statement, value } => {
                    self.dispatch_property(endpoint, property, *statement, value, ctx.as_ref()).await;
                }
                ActionKind::Mqtt { topic, message, retain } => {
                    let expanded = expand_pattern(message, &self.meta, ctx.as_ref(), false);
                    let _ = self
                        .effects
                        .send(Effect::Publish {
                            topic: topic.clone(),
                            payload: expanded.to_string().into_bytes(),
                            qos: QoS::AtMostOnce,
                            retain: *retain,
                        })
                        .await;
                }
                ActionKind::State { name, value } => {
                    let expanded = value
                        .as_ref()
                        .map(|v| expand_pattern(v, &self.meta, ctx.as_ref(), false).to_string());
                    let _ = self
                        .effects
                        .send(Effect::SetState { name: name.clone(), value: expanded })
                        .await;
                }
                ActionKind::Telegram {
                    message,
                    file,
                    keyboard,
                    message_thread_id,
                    silent,
                    remove,
                    update,
                    chats,
                } => {
                    let _ = self
                        .effects
                        .send(Effect::Telegram {
                            action_uuid: action.uuid,
                            message: expand_pattern(message, &self.meta, ctx.as_ref(), false).to_string(),
                            file: file.clone(),
                            keyboard: keyboard.clone(),
                            message_thread_id: *message_thread_id,
                            silent: *silent,
                            remove: *remove,
                            update: *update,
                            chats: chats.clone(),
                        })
                        .await;
                }
                ActionKind::Shell { command, timeout_seconds } => {
                    let expanded = expand_pattern(command, &self.meta, ctx.as_ref(), false).to_string();
                    let output = self.run_shell(&expanded, *timeout_seconds).await;
                    if self.abort.is_aborted() {
                        return;
                    }
                    self.meta.shell_output = output;
                }
                ActionKind::Condition { condition, then, else_ } => {
                    let result = evaluate_condition(condition, &self.meta, ctx.as_ref());
                    let branch: Arc<ActionList> = Arc::new(if result { then.clone() } else { else_.clone() });
                    stack.push((branch, 0));
                    continue 'walk;
                }
                ActionKind::Delay { seconds } => {
                    let expanded = expand_pattern(seconds, &self.meta, ctx.as_ref(), false);
                    let secs = expanded.as_f64().unwrap_or(0.0).max(0.0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {}
                        _ = self.abort.notify.notified() => { return; }
                    }
                }
                ActionKind::Exit => return,
            }
        }
    }

    async fn dispatch_property(
        &self,
        endpoint: &str,
        property: &str,
        statement: PropertyStatement,
        value: &str,
        ctx: &dyn PatternContext,
    ) {
        let expanded = expand_pattern(value, &self.meta, ctx, false);
        let old = ctx.property(endpoint, property);
        let new_value = match statement {
            PropertyStatement::Value => expanded,
            PropertyStatement::Increase => {
                let delta = expanded.as_f64().unwrap_or(0.0);
                let base = old.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
                Value::Number(base + delta)
            }
            PropertyStatement::Decrease => {
                let delta = expanded.as_f64().unwrap_or(0.0);
                let base = old.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
                Value::Number(base - delta)
            }
        };

        let (device_topic, endpoint_id) = split_endpoint_spec(endpoint);
        let topic = if endpoint_id != 0 {
            format!("td/{device_topic}/{endpoint_id}")
        } else {
            format!("td/{device_topic}")
        };

        let payload_value = match &new_value {
            Value::String(s) if s.contains(',') => {
                let array: Vec<Value> = s.split(',').map(|part| coerce_scalar(part.trim())).collect();
                serde_json::to_value(array).unwrap_or(serde_json::Value::Null)
            }
            other => serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
        };
        let payload = serde_json::json!({ property: payload_value }).to_string();
        let _ = self
            .effects
            .send(Effect::Publish {
                topic,
                payload: payload.into_bytes(),
                qos: QoS::AtMostOnce,
                retain: false,
            })
            .await;
    }

    /// Spawns `/bin/sh -c <command>` in its own process group so a timeout
    /// reaches the whole descendant tree (spec §9, "Shell processes").
    async fn run_shell(&self, command: &str, timeout_seconds: u64) -> Option<String> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Could not spawn shell action for {}: {e}", self.automation_name);
                return None;
            }
        };
        let pid = child.id();

        let timeout = Duration::from_secs(timeout_seconds);
        let abort = self.abort.clone();

        tokio::select! {
            result = child.wait_with_output() => {
                match result {
                    Ok(output) => {
                        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                        combined.push_str(&String::from_utf8_lossy(&output.stderr));
                        Some(combined)
                    }
                    Err(e) => {
                        error!("Shell action failed for {}: {e}", self.automation_name);
                        None
                    }
                }
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("Shell action timed out after {timeout_seconds}s for {}", self.automation_name);
                kill_process_group(pid);
                None
            }
            _ = abort.notify.notified() => {
                kill_process_group(pid);
                None
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Condition};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    struct TestContext {
        now: DateTime<Utc>,
    }

    impl PatternContext for TestContext {
        fn property(&self, _endpoint: &str, _prop: &str) -> Option<Value> {
            None
        }
        fn mqtt_payload(&self, _topic: &str) -> Option<Vec<u8>> {
            None
        }
        fn state(&self, _name: &str) -> Option<Value> {
            None
        }
        fn file_contents(&self, _path: &str) -> Option<String> {
            None
        }
        fn sunrise_today(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn sunset_today(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn now(&self) -> DateTime<Utc> {
            self.now
        }
    }

    fn make_action(kind: ActionKind) -> Action {
        Action {
            uuid: Uuid::new_v4(),
            kind,
            trigger_name: None,
            active: true,
        }
    }

    #[tokio::test]
    async fn nested_condition_picks_night_branch() {
        tokio::time::pause();
        let night = DateTime::parse_from_rfc3339("2024-06-21T23:30:00Z").unwrap().with_timezone(&Utc);
        let ctx: Arc<dyn PatternContext> = Arc::new(TestContext { now: night });

        let actions = vec![make_action(ActionKind::Condition {
            condition: Condition::Time {
                from: "22:00".to_string(),
                to: Some("06:00".to_string()),
                active: true,
            },
            then: vec![make_action(ActionKind::Mqtt {
                topic: "t".to_string(),
                message: "night".to_string(),
                retain: false,
            })],
            else_: vec![make_action(ActionKind::Mqtt {
                topic: "t".to_string(),
                message: "day".to_string(),
                retain: false,
            })],
        })];

        let (tx, mut rx) = mpsc::channel(8);
        let (runner, _abort) = Runner::new("night-day".to_string(), Arc::new(actions), PatternMeta::default(), tx);
        runner.run(ctx).await;

        let Effect::Publish { payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected publish effect");
        };
        assert_eq!(String::from_utf8(payload).unwrap(), "night");
    }

    #[tokio::test]
    async fn exit_action_stops_the_run() {
        let ctx: Arc<dyn PatternContext> = Arc::new(TestContext { now: Utc::now() });
        let actions = vec![
            make_action(ActionKind::Exit),
            make_action(ActionKind::Mqtt {
                topic: "t".to_string(),
                message: "unreachable".to_string(),
                retain: false,
            }),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let (runner, _abort) = Runner::new("exit".to_string(), Arc::new(actions), PatternMeta::default(), tx);
        runner.run(ctx).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_a_pending_delay() {
        let ctx: Arc<dyn PatternContext> = Arc::new(TestContext { now: Utc::now() });
        let actions = vec![
            make_action(ActionKind::Delay { seconds: "10".to_string() }),
            make_action(ActionKind::Mqtt {
                topic: "t".to_string(),
                message: "after-delay".to_string(),
                retain: false,
            }),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let (runner, abort) = Runner::new("delay".to_string(), Arc::new(actions), PatternMeta::default(), tx);

        let handle = tokio::spawn(runner.run(ctx));
        tokio::task::yield_now().await;
        abort.abort();
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn property_action_splits_commas_into_json_array_and_suffixes_endpoint() {
        let ctx: Arc<dyn PatternContext> = Arc::new(TestContext { now: Utc::now() });
        let actions = vec![make_action(ActionKind::Property {
            endpoint: "zigbee/lamp/2".to_string(),
            property: "color".to_string(),
            statement: PropertyStatement::Value,
            value: "255,0,0".to_string(),
        })];

        let (tx, mut rx) = mpsc::channel(8);
        let (runner, _abort) = Runner::new("property".to_string(), Arc::new(actions), PatternMeta::default(), tx);
        runner.run(ctx).await;

        let Effect::Publish { topic, payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected publish effect");
        };
        assert_eq!(topic, "td/zigbee/lamp/2");
        let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(body["color"], serde_json::json!([255.0, 0.0, 0.0]));
    }
}
