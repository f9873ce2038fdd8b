use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
};
use tracing::{info, warn};

use envnode_common::{
    ble::{CMD_GET_READINGS, CMD_REGISTER, INITIAL_VALUE},
    cloud, BleAction, BleEvent, CommandProcessor, DeviceIdentity, DeviceRegistration,
    LifecycleEngine, LinkId, NodeAction, RadioPowerState, ReadingSubmission, RuntimeConfig,
    SensorSample,
};

const STATUS_LOG_EVERY_TICKS: u64 = 100;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = RuntimeConfig::default();
    runtime.timing.sanitize();

    let cloud_port = std::env::var("NODE_CLOUD_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let base_url = std::env::var("NODE_CLOUD_URL")
        .unwrap_or_else(|_| format!("http://127.0.0.1:{cloud_port}/rest/v1"));
    runtime.cloud.base_url = base_url;
    runtime.cloud.api_key = std::env::var("NODE_API_KEY").unwrap_or_else(|_| "host-sim".into());

    spawn_cloud_sim(cloud_port).await?;

    let identity = DeviceIdentity::from_mac(parse_mac_env());
    let device_name = identity.name(&runtime.name_prefix);
    info!("device identity {} ({device_name})", identity.id_hex());

    let (ble_tx, ble_rx) = mpsc::channel::<BleEvent>(32);
    let (radio_tx, radio_rx) = watch::channel(false);
    spawn_sim_central(radio_rx, ble_tx);

    let cloud = CloudClient::new(&runtime.cloud.base_url, &runtime.cloud.api_key)?;

    let pair_after_ms = std::env::var("HOST_PAIR_AFTER_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(3_000);

    let mut runner = HostRunner {
        engine: LifecycleEngine::new(runtime.timing.clone()),
        processor: CommandProcessor::new(),
        cloud,
        identity,
        device_name,
        sensor_tag: runtime.cloud.sensor_tag.clone(),
        radio_tx,
        char_value: INITIAL_VALUE.to_vec(),
        tick: 0,
    };

    runner
        .main_loop(runtime.timing.poll_tick_ms, ble_rx, pair_after_ms)
        .await
}

struct HostRunner {
    engine: LifecycleEngine,
    processor: CommandProcessor,
    cloud: CloudClient,
    identity: DeviceIdentity,
    device_name: String,
    sensor_tag: String,
    radio_tx: watch::Sender<bool>,
    char_value: Vec<u8>,
    tick: u64,
}

impl HostRunner {
    async fn main_loop(
        &mut self,
        poll_tick_ms: u64,
        mut ble_rx: mpsc::Receiver<BleEvent>,
        pair_after_ms: u64,
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(poll_tick_ms));
        let mut pair_at = Some(monotonic_ms().saturating_add(pair_after_ms));

        info!("node loop started, pairing button fires in {pair_after_ms}ms");

        loop {
            interval.tick().await;
            self.tick = self.tick.saturating_add(1);
            let now_ms = monotonic_ms();

            // Radio events land before scheduled work so a registration
            // confirmed mid-interval wins over the pairing timeout.
            while let Ok(event) = ble_rx.try_recv() {
                self.handle_ble_event(event, now_ms).await;
            }

            if pair_at.is_some_and(|at| now_ms >= at) {
                pair_at = None;
                info!("pairing button pressed");
                let actions = self.engine.pairing_requested(now_ms);
                self.execute_node_actions(actions, now_ms).await;
            }

            let actions = self.engine.tick(now_ms);
            self.execute_node_actions(actions, now_ms).await;

            if self.tick % STATUS_LOG_EVERY_TICKS == 0 {
                match serde_json::to_string(&self.engine.status(now_ms)) {
                    Ok(status) => info!("status {status}"),
                    Err(err) => warn!("status serialization failed: {err}"),
                }
            }
        }
    }

    async fn handle_ble_event(&mut self, event: BleEvent, now_ms: u64) {
        match &event {
            BleEvent::Connected(link) => {
                info!("ble link {link} up");
                self.engine.note_radio_state(RadioPowerState::Connected);
            }
            BleEvent::Disconnected(link) => {
                info!("ble link {link} down");
            }
            BleEvent::Written { link, value } => {
                info!(
                    "ble write on link {link}: {}",
                    String::from_utf8_lossy(value)
                );
            }
        }

        let actions = self.processor.handle_event(event);

        if !self.processor.has_connections() {
            let state = if *self.radio_tx.borrow() {
                RadioPowerState::Advertising
            } else {
                RadioPowerState::Off
            };
            self.engine.note_radio_state(state);
        }

        self.execute_ble_actions(actions, now_ms).await;
    }

    async fn execute_ble_actions(&mut self, actions: Vec<BleAction>, now_ms: u64) {
        for action in actions {
            match action {
                BleAction::Notify { link, payload } => {
                    info!(
                        "notify link {link}: {}",
                        String::from_utf8_lossy(&payload)
                    );
                }
                BleAction::WriteValue(value) => {
                    self.char_value = value;
                }
                BleAction::ReadSample { link } => {
                    let sample = simulated_sample(self.tick);
                    let followups =
                        self.processor
                            .sample_ready(link, sample, Utc::now().timestamp());
                    Box::pin(self.execute_ble_actions(followups, now_ms)).await;
                }
                BleAction::Register { link } => {
                    self.perform_registration(link, now_ms).await;
                }
                BleAction::ResumeAdvertising => {
                    info!("advertising resumed after disconnect");
                }
            }
        }
    }

    async fn perform_registration(&mut self, link: LinkId, now_ms: u64) {
        let registration = DeviceRegistration {
            mac_address: self.identity.id_hex(),
            name: self.device_name.clone(),
            connected_at: Utc::now().to_rfc3339(),
        };

        let created = match self.cloud.register_device(&registration).await {
            Ok(created) => created,
            Err(err) => {
                warn!("device registration request failed: {err:#}");
                false
            }
        };

        let (ble_actions, confirmed) = self.processor.registration_result(link, created);
        Box::pin(self.execute_ble_actions(ble_actions, now_ms)).await;

        if confirmed {
            let actions = self.engine.registration_confirmed(now_ms);
            self.execute_node_actions(actions, now_ms).await;
        } else if !created {
            let actions = self.engine.registration_failed(now_ms);
            self.execute_node_actions(actions, now_ms).await;
        }
    }

    async fn execute_node_actions(&mut self, actions: Vec<NodeAction>, now_ms: u64) {
        // Result mutators return further actions; run to quiescence.
        let mut queue = actions;
        while !queue.is_empty() {
            let mut followups = Vec::new();
            for action in queue {
                match action {
                    NodeAction::SetIndicator(color) => {
                        info!("indicator #{:06X}", color.0);
                    }
                    NodeAction::RadioOn => {
                        self.processor.session_started();
                        self.char_value = INITIAL_VALUE.to_vec();
                        let payload = envnode_common::advertising_payload(&self.device_name);
                        let _ = self.radio_tx.send(true);
                        info!(
                            "radio on, advertising `{}` ({} bytes)",
                            self.device_name,
                            payload.len()
                        );
                    }
                    NodeAction::RadioOff => {
                        self.processor.session_ended();
                        let _ = self.radio_tx.send(false);
                        info!("radio off");
                    }
                    NodeAction::Delay(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    NodeAction::ResetRadio => {
                        // The simulated radio has nothing to reinitialize.
                        self.processor.session_ended();
                        let _ = self.radio_tx.send(false);
                        info!("radio stack reset");
                        self.engine.radio_reset_succeeded();
                    }
                    NodeAction::CheckRegistration => {
                        let device_id = self.identity.id_hex();
                        match self.cloud.check_registration(&device_id).await {
                            Ok(registered) => {
                                info!("registration check: registered={registered}");
                                followups.extend(
                                    self.engine.registration_check_succeeded(now_ms, registered),
                                );
                            }
                            Err(err) => {
                                warn!("registration check failed: {err:#}");
                                followups.extend(self.engine.registration_check_failed(now_ms));
                            }
                        }
                    }
                    NodeAction::CollectAndUpload => {
                        let sample = simulated_sample(self.tick);
                        let reading = ReadingSubmission {
                            mac_address: self.identity.id_hex(),
                            temperature: sample.temperature,
                            humidity: sample.humidity,
                            pressure: sample.pressure,
                            sensor: self.sensor_tag.clone(),
                        };
                        match self.cloud.submit_reading(&reading).await {
                            Ok(()) => {
                                info!(
                                    "reading uploaded: {:.1}C {:.1}% {:.1}hPa",
                                    sample.temperature, sample.humidity, sample.pressure
                                );
                                followups.extend(self.engine.upload_succeeded(now_ms));
                            }
                            Err(err) => {
                                warn!("reading upload failed: {err:#}");
                                followups.extend(self.engine.upload_failed(now_ms));
                            }
                        }
                    }
                }
            }
            queue = followups;
        }
    }
}

// Hardware integration point:
// the ESP build replaces this with the I2C environmental sensor read.
fn simulated_sample(tick: u64) -> SensorSample {
    SensorSample {
        temperature: 21.0 + ((tick % 8) as f32 * 0.2),
        humidity: 42.0 + ((tick % 6) as f32 * 0.5),
        pressure: 1012.0 + ((tick % 5) as f32 * 0.3),
    }
}

fn parse_mac_env() -> [u8; 6] {
    let fallback = [0x24, 0x58, 0x7C, 0xA1, 0xB2, 0xC3];
    let Ok(raw) = std::env::var("NODE_MAC") else {
        return fallback;
    };

    let cleaned: String = raw.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if cleaned.len() != 12 {
        warn!("ignoring malformed NODE_MAC `{raw}`");
        return fallback;
    }

    let mut mac = [0u8; 6];
    for (index, byte) in mac.iter_mut().enumerate() {
        match u8::from_str_radix(&cleaned[index * 2..index * 2 + 2], 16) {
            Ok(value) => *byte = value,
            Err(_) => return fallback,
        }
    }
    mac
}

/// Scripted central: once advertising starts it connects, asks for a
/// reading, then registers the device.
fn spawn_sim_central(mut radio: watch::Receiver<bool>, ble_tx: mpsc::Sender<BleEvent>) {
    tokio::spawn(async move {
        while !*radio.borrow() {
            if radio.changed().await.is_err() {
                return;
            }
        }

        let link: LinkId = 1;
        if ble_tx.send(BleEvent::Connected(link)).await.is_err() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = ble_tx
            .send(BleEvent::Written {
                link,
                value: CMD_GET_READINGS.to_vec(),
            })
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = ble_tx
            .send(BleEvent::Written {
                link,
                value: CMD_REGISTER.to_vec(),
            })
            .await;

        // The node tears the radio down after the grace window; report the
        // dropped link once that happens.
        while *radio.borrow() {
            if radio.changed().await.is_err() {
                return;
            }
        }
        let _ = ble_tx.send(BleEvent::Disconnected(link)).await;
    });
}

struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CloudClient {
    fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn check_registration(&self, device_id: &str) -> anyhow::Result<bool> {
        let url = format!("{}{}", self.base_url, cloud::device_query_path(device_id));
        let response = self
            .http
            .get(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
            .context("device query request failed")?;

        let status = response.status().as_u16();
        if !cloud::is_success(status) {
            bail!("device query returned HTTP {status}");
        }

        let body = response.bytes().await.context("device query body read")?;
        cloud::parse_device_list(&body).map_err(|err| anyhow!("device query body: {err}"))
    }

    async fn register_device(&self, registration: &DeviceRegistration) -> anyhow::Result<bool> {
        let url = format!("{}{}", self.base_url, cloud::devices_path());
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .header("Prefer", "return=representation")
            .json(registration)
            .send()
            .await
            .context("device insert request failed")?;

        Ok(cloud::is_created(response.status().as_u16()))
    }

    async fn submit_reading(&self, reading: &ReadingSubmission) -> anyhow::Result<()> {
        let url = format!("{}{}", self.base_url, cloud::readings_path());
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(reading)
            .send()
            .await
            .context("reading insert request failed")?;

        let status = response.status().as_u16();
        if !cloud::is_success(status) {
            bail!("reading insert returned HTTP {status}");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CloudSimState {
    store: Arc<Mutex<CloudStore>>,
}

#[derive(Default)]
struct CloudStore {
    next_id: u64,
    devices: Vec<StoredDevice>,
    readings: u64,
}

struct StoredDevice {
    id: u64,
    mac_address: String,
}

#[derive(Debug, Deserialize)]
struct DeviceInsert {
    mac_address: String,
    name: String,
    connected_at: String,
}

/// In-memory stand-in for the cloud REST backend, so the host build runs
/// the full registration and upload path without external services.
async fn spawn_cloud_sim(port: u16) -> anyhow::Result<()> {
    let state = CloudSimState::default();

    let app = Router::new()
        .route("/rest/v1/devices", get(handle_query_devices).post(handle_insert_device))
        .route("/rest/v1/readings", post(handle_insert_reading))
        .with_state(state);

    let addr: SocketAddr = format!("127.0.0.1:{port}")
        .parse()
        .map_err(|err| anyhow!("invalid cloud sim address: {err}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind cloud sim at {addr}"))?;

    info!("cloud sim listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("cloud sim server stopped: {err}");
        }
    });
    Ok(())
}

async fn handle_query_devices(
    State(state): State<CloudSimState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let wanted = params
        .get("mac_address")
        .and_then(|filter| filter.strip_prefix("eq."))
        .map(str::to_string);

    let store = state.store.lock().await;
    let rows: Vec<serde_json::Value> = store
        .devices
        .iter()
        .filter(|device| wanted.as_deref().map_or(true, |mac| device.mac_address == mac))
        .map(|device| serde_json::json!({ "id": device.id }))
        .collect();

    Json(rows)
}

async fn handle_insert_device(
    State(state): State<CloudSimState>,
    Json(insert): Json<DeviceInsert>,
) -> impl IntoResponse {
    let mut store = state.store.lock().await;
    if store
        .devices
        .iter()
        .any(|device| device.mac_address == insert.mac_address)
    {
        return StatusCode::CONFLICT;
    }

    store.next_id += 1;
    let id = store.next_id;
    store.devices.push(StoredDevice {
        id,
        mac_address: insert.mac_address.clone(),
    });
    info!(
        "cloud sim: registered {} ({}) at {}",
        insert.mac_address, insert.name, insert.connected_at
    );
    StatusCode::CREATED
}

async fn handle_insert_reading(
    State(state): State<CloudSimState>,
    Json(reading): Json<serde_json::Value>,
) -> impl IntoResponse {
    let mut store = state.store.lock().await;
    store.readings += 1;
    info!("cloud sim: reading #{} {reading}", store.readings);
    StatusCode::CREATED
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
