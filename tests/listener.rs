mod common;

use async_trait::async_trait;
use common::{Harness, eventually};
use dpsmove::command::{CommandHandler, CommandKey, CommandRequest, UNKNOWN_METHOD};
use dpsmove::error::{DeviceError, Result};
use dpsmove::listener::run_command_listener;
use dpsmove::Device;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Echoes the payload back and records what it was given.
#[derive(Default)]
struct Recording {
    key: Option<CommandKey>,
    responses_built: Mutex<Vec<Value>>,
    handled: Mutex<Vec<Value>>,
    failures: Mutex<Vec<DeviceError>>,
}

impl Recording {
    fn for_key(component: &str, method: &str) -> Self {
        Self {
            key: Some(CommandKey::new(component, method)),
            ..Default::default()
        }
    }

    fn fail_next(&self, err: DeviceError) {
        self.failures.lock().push(err);
    }
}

#[async_trait]
impl CommandHandler for Recording {
    fn key(&self) -> Option<CommandKey> {
        self.key.clone()
    }

    fn build_response(&self, payload: &Value) -> Value {
        self.responses_built.lock().push(payload.clone());
        json!({ "echo": payload })
    }

    async fn on_command(&self, _device: &Device, payload: Value) -> Result<()> {
        self.handled.lock().push(payload);
        match self.failures.lock().pop() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn connected() -> Harness {
    let h = Harness::new("scope1");
    h.device.connect().await.unwrap();
    h
}

fn spawn_listener(
    h: &Harness,
    handler: Arc<Recording>,
) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_command_listener(
        h.device.clone(),
        handler,
        cancel.clone(),
    ));
    (cancel, task)
}

#[tokio::test(start_paused = true)]
async fn unknown_commands_get_not_found() {
    let h = connected().await;
    let handler = Arc::new(Recording::for_key("migration", "DeviceMove"));
    let (cancel, task) = spawn_listener(&h, handler.clone());

    h.client(0)
        .inject(CommandRequest::new("r1", "DeviceMove", Some(json!({"idScope": "x"}))));
    eventually(WAIT, || h.recorder.responses().len() == 1).await;

    let (_, response) = &h.recorder.responses()[0];
    assert_eq!(response.request_id, "r1");
    assert_eq!(response.status, 404);
    assert_eq!(response.payload, json!(UNKNOWN_METHOD));
    assert!(handler.responses_built.lock().is_empty());
    assert!(handler.handled.lock().is_empty());

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn missing_and_null_payloads_become_empty_objects() {
    let h = connected().await;
    let handler = Arc::new(Recording::for_key("migration", "DeviceMove"));
    let (cancel, task) = spawn_listener(&h, handler.clone());

    let client = h.client(0);
    client.inject(CommandRequest::new("a", "migration*DeviceMove", None));
    client.inject(CommandRequest::new("b", "migration*DeviceMove", Some(Value::Null)));
    client.inject(CommandRequest::new("c", "migration*DeviceMove", Some(json!({}))));
    eventually(WAIT, || handler.handled.lock().len() == 3).await;

    for seen in handler.responses_built.lock().iter() {
        assert_eq!(*seen, json!({}));
    }
    for seen in handler.handled.lock().iter() {
        assert_eq!(*seen, json!({}));
    }

    let responses = h.recorder.responses();
    let ids: Vec<_> = responses.iter().map(|(_, r)| r.request_id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
    for (_, response) in &responses {
        assert_eq!(response.status, 200);
        assert_eq!(response.payload, json!({"echo": {}}));
    }

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn non_fatal_handler_errors_keep_listening() {
    let h = connected().await;
    let handler = Arc::new(Recording::for_key("migration", "DeviceMove"));
    handler.fail_next(DeviceError::InvalidPayload("bad scope".to_string()));
    let (cancel, task) = spawn_listener(&h, handler.clone());

    let client = h.client(0);
    client.inject(CommandRequest::new("1", "migration*DeviceMove", None));
    client.inject(CommandRequest::new("2", "migration*DeviceMove", None));
    eventually(WAIT, || handler.handled.lock().len() == 2).await;

    assert!(!task.is_finished());
    assert_eq!(h.recorder.responses().len(), 2);

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn fatal_handler_errors_stop_the_listener() {
    let h = connected().await;
    let handler = Arc::new(Recording::for_key("migration", "DeviceMove"));
    handler.fail_next(DeviceError::Provisioning("status Failed".to_string()));
    let (_cancel, task) = spawn_listener(&h, handler.clone());

    h.client(0)
        .inject(CommandRequest::new("1", "migration*DeviceMove", None));
    let result = timeout(WAIT, task).await.unwrap().unwrap();

    assert_eq!(
        result,
        Err(DeviceError::Provisioning("status Failed".to_string()))
    );
    // Answered before the handler ran.
    assert_eq!(h.recorder.responses().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn handler_without_key_accepts_everything() {
    let h = connected().await;
    let handler = Arc::new(Recording::default());
    let (cancel, task) = spawn_listener(&h, handler.clone());

    let client = h.client(0);
    client.inject(CommandRequest::new("1", "reboot", Some(json!({"delay": 3}))));
    client.inject(CommandRequest::new("2", "thermostat*setTarget", Some(json!(21))));
    eventually(WAIT, || handler.handled.lock().len() == 2).await;

    assert_eq!(*handler.handled.lock(), vec![json!({"delay": 3}), json!(21)]);
    assert!(h.recorder.responses().iter().all(|(_, r)| r.status == 200));

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn listener_needs_a_session() {
    let h = Harness::new("scope1");
    let handler = Arc::new(Recording::default());
    let result = run_command_listener(h.device.clone(), handler, CancellationToken::new()).await;
    assert_eq!(result, Err(DeviceError::NotConnected));
}
