//! Hub session over MQTT.
//! Publishes telemetry, receives direct method requests and answers them.

use crate::command::{CommandRequest, CommandResponse};
use crate::crypto::{DEFAULT_TOKEN_TTL, SasSigner, expiry_from_now};
use crate::error::{DeviceError, Result};
use crate::transport::{HubClient, HubConnector, Message};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

const MQTT_PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const REQUEST_CAPACITY: usize = 32;

const METHODS_SUBSCRIPTION: &str = "$iothub/methods/POST/#";
const METHODS_POST_PREFIX: &str = "$iothub/methods/POST/";
const REQUEST_ID_PARAM: &str = "$rid=";

/// Creates [`MqttHubClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttHubConnector;

#[async_trait]
impl HubConnector for MqttHubConnector {
    async fn create(
        &self,
        hostname: &str,
        device_id: &str,
        symmetric_key: &str,
    ) -> Result<Arc<dyn HubClient>> {
        Ok(Arc::new(MqttHubClient::new(hostname, device_id, symmetric_key)?))
    }
}

/// Hub login. The password is a SAS token, so it is minted again before
/// every (re)connect instead of being reused past its expiry.
#[derive(Clone)]
struct Credentials {
    username: String,
    resource: String,
    signer: SasSigner,
}

impl Credentials {
    fn new(hostname: &str, device_id: &str, signer: SasSigner) -> Self {
        Self {
            username: format!("{}/{}/?api-version={}", hostname, device_id, API_VERSION),
            resource: format!("{}/devices/{}", hostname, device_id),
            signer,
        }
    }

    fn apply(&self, options: &mut MqttOptions) -> Result<()> {
        self.apply_at(options, expiry_from_now(DEFAULT_TOKEN_TTL))
    }

    fn apply_at(&self, options: &mut MqttOptions, expiry: u64) -> Result<()> {
        let password = self.signer.token(&self.resource, None, expiry)?;
        options.set_credentials(self.username.clone(), password);
        Ok(())
    }
}

/// A live MQTT connection and the task driving its event loop.
struct Connection {
    client: AsyncClient,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// Device session with a hub, authenticated with a SAS token.
pub struct MqttHubClient {
    hostname: String,
    device_id: String,
    broker_host: String,
    broker_port: u16,
    tls: bool,
    credentials: Credentials,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
    // Carries method requests, or the error that ended the session.
    requests_tx: mpsc::UnboundedSender<Result<CommandRequest>>,
    requests_rx: AsyncMutex<mpsc::UnboundedReceiver<Result<CommandRequest>>>,
    closed: CancellationToken,
}

impl MqttHubClient {
    pub fn new(hostname: &str, device_id: &str, symmetric_key: &str) -> Result<Self> {
        Self::with_broker(hostname, device_id, symmetric_key, hostname, MQTT_PORT, true)
    }

    fn with_broker(
        hostname: &str,
        device_id: &str,
        symmetric_key: &str,
        broker_host: &str,
        broker_port: u16,
        tls: bool,
    ) -> Result<Self> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let signer = SasSigner::new(symmetric_key)?;
        Ok(Self {
            hostname: hostname.to_string(),
            device_id: device_id.to_string(),
            broker_host: broker_host.to_string(),
            broker_port,
            tls,
            credentials: Credentials::new(hostname, device_id, signer),
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            requests_tx,
            requests_rx: AsyncMutex::new(requests_rx),
            closed: CancellationToken::new(),
        })
    }

    fn options(&self) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(&self.device_id, &self.broker_host, self.broker_port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        self.credentials.apply(&mut options)?;
        Ok(options)
    }

    fn client(&self) -> Result<AsyncClient> {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or(DeviceError::NotConnected)
    }

    fn telemetry_topic(&self, message: &Message) -> String {
        format!(
            "devices/{}/messages/events/$.ct={}&$.ce={}",
            self.device_id,
            urlencoding::encode(&message.content_type),
            urlencoding::encode(&message.content_encoding)
        )
    }
}

#[async_trait]
impl HubClient for MqttHubClient {
    /// Returns once the hub accepted the connection and the direct method
    /// subscription.
    async fn connect(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(DeviceError::Transport("session was shut down".to_string()));
        }
        if self.connection.lock().is_some() {
            debug!("Session for {} already open", self.device_id);
            return Ok(());
        }

        info!("Connecting {} to hub {}", self.device_id, self.hostname);
        let (client, eventloop) = AsyncClient::new(self.options()?, REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = self.closed.child_token();

        let driver = EventLoopDriver {
            eventloop,
            client: client.clone(),
            device_id: self.device_id.clone(),
            credentials: self.credentials.clone(),
            connected: self.connected.clone(),
            requests: self.requests_tx.clone(),
            cancel: cancel.clone(),
            ready: Some(ready_tx),
        };
        let driver = tokio::spawn(driver.run());

        let ready = match timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::Transport(
                "event loop stopped before connecting".to_string(),
            )),
            Err(_) => Err(DeviceError::Transport(format!(
                "no CONNACK/SUBACK from {} within {}s",
                self.hostname,
                CONNECT_TIMEOUT.as_secs()
            ))),
        };
        if let Err(e) = ready {
            cancel.cancel();
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }

        *self.connection.lock() = Some(Connection {
            client,
            cancel,
            driver,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut conn) = self.connection.lock().take() else {
            return Ok(());
        };

        info!("Disconnecting {} from hub {}", self.device_id, self.hostname);
        let result = conn
            .client
            .disconnect()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()));

        // Give the event loop a chance to flush DISCONNECT before stopping it.
        if timeout(DISCONNECT_TIMEOUT, &mut conn.driver).await.is_err() {
            debug!("Event loop for {} did not stop in time", self.device_id);
        }
        conn.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        result
    }

    async fn shutdown(&self) -> Result<()> {
        let result = self.disconnect().await;
        self.closed.cancel();
        result
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let topic = self.telemetry_topic(&message);
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, message.body)
            .await
            .map_err(|e| DeviceError::Send(e.to_string()))
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
        let topic = format!(
            "$iothub/methods/res/{}/?{}{}",
            response.status, REQUEST_ID_PARAM, response.request_id
        );
        let body = serde_json::to_vec(&response.payload)?;
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| DeviceError::Send(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Polls the rumqttc event loop, which reconnects on its own after an error.
///
/// Every accepted CONNACK is followed by a fresh methods subscription, since a
/// clean session starts without one. Once the loop gives up, the error is
/// queued for `receive_method_request` so the session does not end silently.
struct EventLoopDriver {
    eventloop: EventLoop,
    client: AsyncClient,
    device_id: String,
    credentials: Credentials,
    connected: Arc<AtomicBool>,
    requests: mpsc::UnboundedSender<Result<CommandRequest>>,
    cancel: CancellationToken,
    ready: Option<oneshot::Sender<Result<()>>>,
}

impl EventLoopDriver {
    async fn run(mut self) {
        let mut failures = 0;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    info!("Device {} connected to hub", self.device_id);
                    self.connected.store(true, Ordering::SeqCst);
                    if let Err(e) = self
                        .client
                        .try_subscribe(METHODS_SUBSCRIPTION, QoS::AtMostOnce)
                    {
                        self.fail(format!("failed to subscribe to methods: {}", e));
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        self.fail("hub rejected the methods subscription".to_string());
                        break;
                    }
                    debug!("Subscribed to direct methods for {}", self.device_id);
                    if let Some(tx) = self.ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match parse_method_topic(&publish.topic) {
                        Some((name, request_id)) => {
                            debug!(
                                "Method request {} ({}) for {}",
                                name, request_id, self.device_id
                            );
                            let payload = parse_payload(&publish.payload);
                            let _ = self
                                .requests
                                .send(Ok(CommandRequest::new(request_id, name, payload)));
                        }
                        None => debug!("Ignoring publish on {}", publish.topic),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Hub closed the session for {}", self.device_id);
                    self.connected.store(false, Ordering::SeqCst);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    // The credentials were fresh, so retrying cannot help.
                    self.fail(format!("connection refused: {:?}", code));
                    break;
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.ready.is_some() {
                        self.fail(e.to_string());
                        break;
                    }

                    failures += 1;
                    if failures > MAX_RECONNECT_ATTEMPTS {
                        self.fail(format!(
                            "gave up reconnecting after {} attempts: {}",
                            MAX_RECONNECT_ATTEMPTS, e
                        ));
                        break;
                    }
                    warn!(
                        "Connection lost for {} (attempt {}/{}): {}",
                        self.device_id, failures, MAX_RECONNECT_ATTEMPTS, e
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(RECONNECT_DELAY) => {}
                    }
                    if let Err(e) = self.credentials.apply(&mut self.eventloop.mqtt_options) {
                        self.fail(e.to_string());
                        break;
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!("Event loop for {} stopped", self.device_id);
    }

    /// Reports a terminal failure to whoever is waiting: `connect` while the
    /// session is being established, the method listener afterwards.
    fn fail(&mut self, reason: String) {
        self.connected.store(false, Ordering::SeqCst);
        let err = DeviceError::Transport(reason);
        match self.ready.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                error!("Session for {} lost: {}", self.device_id, err);
                let _ = self.requests.send(Err(err));
            }
        }
    }
}

/// Extracts `(method name, request id)` from a direct method topic such as
/// `$iothub/methods/POST/migration*DeviceMove/?$rid=1`.
fn parse_method_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(METHODS_POST_PREFIX)?;
    let (name, query) = rest.split_once("/?")?;
    let request_id = query
        .split('&')
        .find_map(|param| param.strip_prefix(REQUEST_ID_PARAM))?;
    if name.is_empty() || request_id.is_empty() {
        return None;
    }
    Some((name.to_string(), request_id.to_string()))
}

/// JSON payloads are decoded; anything else is kept as a string.
fn parse_payload(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice(bytes) {
        Ok(v) => Some(v),
        Err(_) => Some(Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}
