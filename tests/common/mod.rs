#![allow(dead_code)]

use async_trait::async_trait;
use dpsmove::command::{CommandRequest, CommandResponse};
use dpsmove::config::DeviceIdentity;
use dpsmove::error::{DeviceError, Result};
use dpsmove::transport::{
    HubClient, HubConnector, Message, Provisioner, RegistrationResult, RegistrationStatus,
};
use dpsmove::Device;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

pub const REGISTRATION_ID: &str = "sensor-01";
pub const DEVICE_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

/// Everything the fakes were asked to do, in order. Client indices follow
/// creation order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Register(String),
    Create(usize, String),
    Connect(usize),
    Disconnect(usize),
    Shutdown(usize),
    SendMessage(usize, Value),
    SendMethodResponse(usize, CommandResponse),
}

#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    pub fn push(&self, call: Call) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn position(&self, f: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.lock().iter().position(f)
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| f(c)).count()
    }

    pub fn responses(&self) -> Vec<(usize, CommandResponse)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::SendMethodResponse(i, r) => Some((*i, r.clone())),
                _ => None,
            })
            .collect()
    }
}

pub fn identity(scope: &str) -> DeviceIdentity {
    DeviceIdentity::new(scope, REGISTRATION_ID, DEVICE_KEY)
}

pub fn hub_for(scope: &str) -> String {
    format!("hub-{}.azure-devices.net", scope)
}

/// Assigns every scope to `hub-{scope}` unless told otherwise.
pub struct FakeProvisioner {
    recorder: Arc<Recorder>,
    outcomes: Mutex<HashMap<String, Result<RegistrationResult>>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeProvisioner {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            outcomes: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
        }
    }

    /// Makes every registration from now on take `delay` of (virtual) time.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_outcome(&self, scope: &str, outcome: Result<RegistrationResult>) {
        self.outcomes.lock().insert(scope.to_string(), outcome);
    }

    pub fn reject(&self, scope: &str, status: RegistrationStatus) {
        self.set_outcome(scope, Ok(RegistrationResult::with_status(status)));
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn register(&self, identity: &DeviceIdentity) -> Result<RegistrationResult> {
        self.recorder.push(Call::Register(identity.scope_id.clone()));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        match self.outcomes.lock().get(&identity.scope_id) {
            Some(outcome) => outcome.clone(),
            None => Ok(RegistrationResult::assigned(
                hub_for(&identity.scope_id),
                identity.registration_id.clone(),
            )),
        }
    }
}

pub struct FakeHubClient {
    index: usize,
    recorder: Arc<Recorder>,
    connected: AtomicBool,
    fail_connect: bool,
    pub fail_sends: AtomicBool,
    pub fail_acks: AtomicBool,
    requests_tx: mpsc::UnboundedSender<Result<CommandRequest>>,
    requests_rx: AsyncMutex<mpsc::UnboundedReceiver<Result<CommandRequest>>>,
    telemetry: Mutex<Vec<(Instant, Value)>>,
    closed: CancellationToken,
}

impl FakeHubClient {
    fn new(index: usize, recorder: Arc<Recorder>, fail_connect: bool) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            index,
            recorder,
            connected: AtomicBool::new(false),
            fail_connect,
            fail_sends: AtomicBool::new(false),
            fail_acks: AtomicBool::new(false),
            requests_tx,
            requests_rx: AsyncMutex::new(requests_rx),
            telemetry: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Delivers a command as if the hub had sent it.
    pub fn inject(&self, request: CommandRequest) {
        let _ = self.requests_tx.send(Ok(request));
    }

    /// Simulates the transport giving up on the session for good.
    pub fn lose_session(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .requests_tx
            .send(Err(DeviceError::Transport(reason.to_string())));
    }

    /// Simulates the network dropping the connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn telemetry(&self) -> Vec<(Instant, Value)> {
        self.telemetry.lock().clone()
    }
}

#[async_trait]
impl HubClient for FakeHubClient {
    async fn connect(&self) -> Result<()> {
        self.recorder.push(Call::Connect(self.index));
        if self.fail_connect {
            return Err(DeviceError::Transport("handshake refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.recorder.push(Call::Disconnect(self.index));
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.recorder.push(Call::Shutdown(self.index));
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DeviceError::Send("broker unavailable".to_string()));
        }
        let body: Value = serde_json::from_slice(&message.body)?;
        self.telemetry.lock().push((Instant::now(), body.clone()));
        self.recorder.push(Call::SendMessage(self.index, body));
        Ok(())
    }

    async fn receive_method_request(&self) -> Result<CommandRequest> {
        let mut rx = self.requests_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(DeviceError::Transport("session was shut down".to_string()))
            }
            request = rx.recv() => match request {
                Some(request) => request,
                None => Err(DeviceError::Transport("request channel closed".to_string())),
            },
        }
    }

    async fn send_method_response(&self, response: CommandResponse) -> Result<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(DeviceError::Send("response rejected".to_string()));
        }
        self.recorder
            .push(Call::SendMethodResponse(self.index, response));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    recorder: Arc<Recorder>,
    clients: Mutex<Vec<Arc<FakeHubClient>>>,
    fail_connect: AtomicBool,
}

impl FakeConnector {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            clients: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Makes every client created from now on refuse to connect.
    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn client(&self, index: usize) -> Arc<FakeHubClient> {
        self.clients.lock()[index].clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

#[async_trait]
impl HubConnector for FakeConnector {
    async fn create(
        &self,
        hostname: &str,
        _device_id: &str,
        _symmetric_key: &str,
    ) -> Result<Arc<dyn HubClient>> {
        let mut clients = self.clients.lock();
        let index = clients.len();
        self.recorder.push(Call::Create(index, hostname.to_string()));
        let client = Arc::new(FakeHubClient::new(
            index,
            self.recorder.clone(),
            self.fail_connect.load(Ordering::SeqCst),
        ));
        clients.push(client.clone());
        Ok(client)
    }
}

/// A device wired to fakes.
pub struct Harness {
    pub recorder: Arc<Recorder>,
    pub provisioner: Arc<FakeProvisioner>,
    pub connector: Arc<FakeConnector>,
    pub device: Device,
}

impl Harness {
    pub fn new(scope: &str) -> Self {
        let recorder = Arc::new(Recorder::default());
        let provisioner = Arc::new(FakeProvisioner::new(recorder.clone()));
        let connector = Arc::new(FakeConnector::new(recorder.clone()));
        let device = Device::new(identity(scope), provisioner.clone(), connector.clone());
        Self {
            recorder,
            provisioner,
            connector,
            device,
        }
    }

    pub fn client(&self, index: usize) -> Arc<FakeHubClient> {
        self.connector.client(index)
    }
}

pub fn move_command(request_id: &str, scope: &str) -> CommandRequest {
    CommandRequest::new(
        request_id,
        "migration*DeviceMove",
        Some(serde_json::json!({ "idScope": scope })),
    )
}

/// Polls `condition` until it holds, panicking after `limit` of (virtual) time.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", limit);
        sleep(Duration::from_millis(10)).await;
    }
}
