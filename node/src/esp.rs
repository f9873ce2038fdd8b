use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp32_nimble::{
    utilities::mutex::Mutex as NimbleMutex, uuid128, BLEAdvertisementData, BLECharacteristic,
    BLEDevice, NimbleProperties,
};
use esp_idf_hal::{
    delay::{Ets, BLOCK},
    gpio::{IOPin, OutputPin, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, FixedLengthSignal, PinState, Pulse, RmtChannel, TxRmtDriver,
    },
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi, WifiDeviceId},
};
use log::{info, warn};

use envnode_common::{
    ble::{ADV_INTERVAL_US, INITIAL_VALUE},
    cloud, BleAction, BleEvent, CloudConfig, CommandProcessor, DeviceIdentity, DeviceRegistration,
    LifecycleEngine, LinkId, NodeAction, NodeError, RadioPowerState, ReadingSubmission, Rgb,
    RuntimeConfig, SensorSample,
};

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const PAIRING_HOLD_MS: u64 = 1_000;

const SHT40_ADDR: u8 = 0x44;
const BMP280_ADDR: u8 = 0x76;
const MAX_HTTP_RESPONSE: usize = 4096;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    // A startup failure leaves shared state unrecoverable; log it as fatal
    // and reboot rather than leaving the node wedged.
    if let Err(err) = run_node() {
        warn!("{}", NodeError::Fatal(format!("{err:#}")));
        thread::sleep(Duration::from_secs(1));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    Ok(())
}

fn run_node() -> anyhow::Result<()> {
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = RuntimeConfig::default();
    runtime.network.wifi_ssid = option_env!("ENVNODE_WIFI_SSID").unwrap_or("").to_string();
    runtime.network.wifi_pass = option_env!("ENVNODE_WIFI_PASS").unwrap_or("").to_string();
    runtime.cloud.base_url = option_env!("ENVNODE_CLOUD_URL").unwrap_or("").to_string();
    runtime.cloud.api_key = option_env!("ENVNODE_API_KEY").unwrap_or("").to_string();
    runtime.timing.sanitize();

    let Peripherals {
        modem,
        pins,
        rmt,
        i2c0,
        ..
    } = Peripherals::take()?;

    // NanoC6: the WS2812 data line is GPIO20 and its power rail is gated
    // behind GPIO19.
    let mut led_power = PinDriver::output(pins.gpio19)?;
    led_power.set_high()?;
    let mut indicator =
        IndicatorLed::new(rmt.channel0, pins.gpio20).context("failed to initialize status LED")?;
    indicator.set(Rgb::OFF)?;

    let mut button = PinDriver::input(pins.gpio9.downgrade())?;
    button.set_pull(Pull::Up)?;

    let sensor = EnvSensor::new(I2cDriver::new(
        i2c0,
        pins.gpio1,
        pins.gpio2,
        &I2cConfig::new().baudrate(100.kHz().into()),
    )?)
    .map_err(|err| {
        warn!("environmental sensor unavailable: {err:#}");
        err
    })
    .ok();

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let identity = DeviceIdentity::from_mac(esp_wifi.get_mac(WifiDeviceId::Sta)?);
    let device_name = identity.name(&runtime.name_prefix);
    info!("device identity {} ({device_name})", identity.id_hex());

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    if let Err(err) = connect_wifi(&mut wifi, &runtime) {
        // Registration checks and uploads will fail and surface through
        // the lifecycle; the node keeps running so pairing still works.
        warn!("wifi startup failed: {err:#}");
    }
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().map_err(|err| {
        warn!("sntp startup failed: {err:?}");
        err
    });

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let (ble_tx, ble_rx) = mpsc::channel::<BleEvent>();
    let radio = BleRadio::new(&device_name, ble_tx).context("failed to start BLE stack")?;

    let mut runner = EspRunner {
        engine: LifecycleEngine::new(runtime.timing.clone()),
        processor: CommandProcessor::new(),
        cloud: CloudHttp::new(runtime.cloud.clone()),
        identity,
        device_name,
        sensor_tag: runtime.cloud.sensor_tag.clone(),
        radio,
        sensor,
        indicator,
    };

    let poll = Duration::from_millis(runtime.timing.poll_tick_ms);
    let mut press_since: Option<Instant> = None;
    let mut pairing_signalled = false;

    loop {
        feed_watchdog();
        thread::sleep(poll);
        let now_ms = monotonic_ms();

        while let Ok(event) = ble_rx.try_recv() {
            runner.handle_ble_event(event, now_ms)?;
        }

        // Button hold arms the pairing window once per press.
        if button.is_low() {
            let held = press_since.get_or_insert_with(Instant::now);
            if !pairing_signalled && held.elapsed().as_millis() as u64 >= PAIRING_HOLD_MS {
                pairing_signalled = true;
                info!("pairing button held");
                let actions = runner.engine.pairing_requested(now_ms);
                runner.execute_node_actions(actions, now_ms)?;
            }
        } else {
            press_since = None;
            pairing_signalled = false;
        }

        let actions = runner.engine.tick(now_ms);
        runner.execute_node_actions(actions, now_ms)?;
    }
}

struct EspRunner {
    engine: LifecycleEngine,
    processor: CommandProcessor,
    cloud: CloudHttp,
    identity: DeviceIdentity,
    device_name: String,
    sensor_tag: String,
    radio: BleRadio,
    sensor: Option<EnvSensor>,
    indicator: IndicatorLed,
}

impl EspRunner {
    fn handle_ble_event(&mut self, event: BleEvent, now_ms: u64) -> anyhow::Result<()> {
        if let BleEvent::Connected(_) = event {
            self.engine.note_radio_state(RadioPowerState::Connected);
        }

        let actions = self.processor.handle_event(event);

        if !self.processor.has_connections() {
            let state = if self.radio.advertising {
                RadioPowerState::Advertising
            } else {
                RadioPowerState::Off
            };
            self.engine.note_radio_state(state);
        }

        self.execute_ble_actions(actions, now_ms)
    }

    fn execute_ble_actions(&mut self, actions: Vec<BleAction>, now_ms: u64) -> anyhow::Result<()> {
        for action in actions {
            match action {
                BleAction::Notify { link, payload } => {
                    info!("notify link {link} ({} bytes)", payload.len());
                    self.radio.notify(&payload);
                }
                BleAction::WriteValue(value) => {
                    self.radio.set_value(&value);
                }
                BleAction::ReadSample { link } => match self.read_sample() {
                    Ok(sample) => {
                        let followups =
                            self.processor
                                .sample_ready(link, sample, Utc::now().timestamp());
                        self.execute_ble_actions(followups, now_ms)?;
                    }
                    Err(err) => {
                        warn!("{}", NodeError::SensorRead(format!("{err:#}")));
                        let followups = self.processor.sample_unavailable(link);
                        self.execute_ble_actions(followups, now_ms)?;
                    }
                },
                BleAction::Register { link } => {
                    self.perform_registration(link, now_ms)?;
                }
                BleAction::ResumeAdvertising => {
                    if let Err(err) = self.radio.start_advertising() {
                        warn!("{}", NodeError::RadioFault(format!("{err:#}")));
                        let actions = self.engine.radio_fault(now_ms);
                        self.execute_node_actions(actions, now_ms)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn perform_registration(&mut self, link: LinkId, now_ms: u64) -> anyhow::Result<()> {
        let registration = DeviceRegistration {
            mac_address: self.identity.id_hex(),
            name: self.device_name.clone(),
            connected_at: Utc::now().to_rfc3339(),
        };

        let created = match self.cloud.register_device(&registration) {
            Ok(created) => created,
            Err(err) => {
                warn!("device registration request failed: {err:#}");
                false
            }
        };

        let (ble_actions, confirmed) = self.processor.registration_result(link, created);
        self.execute_ble_actions(ble_actions, now_ms)?;

        if confirmed {
            let actions = self.engine.registration_confirmed(now_ms);
            self.execute_node_actions(actions, now_ms)?;
        } else if !created {
            let actions = self.engine.registration_failed(now_ms);
            self.execute_node_actions(actions, now_ms)?;
        }
        Ok(())
    }

    fn execute_node_actions(&mut self, actions: Vec<NodeAction>, now_ms: u64) -> anyhow::Result<()> {
        let mut queue = actions;
        while !queue.is_empty() {
            let mut followups = Vec::new();
            for action in queue {
                match action {
                    NodeAction::SetIndicator(color) => {
                        if let Err(err) = self.indicator.set(color) {
                            warn!("status LED update failed: {err:#}");
                        }
                    }
                    NodeAction::RadioOn => {
                        self.processor.session_started();
                        self.radio.set_value(INITIAL_VALUE);
                        if let Err(err) = self.radio.start_advertising() {
                            warn!("{}", NodeError::RadioFault(format!("{err:#}")));
                            followups.extend(self.engine.radio_fault(now_ms));
                        } else {
                            info!("radio on, advertising `{}`", self.device_name);
                        }
                    }
                    NodeAction::RadioOff => {
                        let links: Vec<LinkId> = self.processor.connections().collect();
                        self.processor.session_ended();
                        self.radio.power_down(&links);
                        info!("radio off");
                    }
                    NodeAction::Delay(ms) => {
                        thread::sleep(Duration::from_millis(ms));
                    }
                    NodeAction::ResetRadio => {
                        let links: Vec<LinkId> = self.processor.connections().collect();
                        self.processor.session_ended();
                        // A failed reinit is a fatal condition; the caller
                        // logs it and reboots.
                        self.radio
                            .reset(&links)
                            .context("ble stack reset failed")?;
                        info!("ble stack reset complete");
                        self.engine.radio_reset_succeeded();
                    }
                    NodeAction::CheckRegistration => {
                        let device_id = self.identity.id_hex();
                        match self.cloud.check_registration(&device_id) {
                            Ok(registered) => {
                                info!("registration check: registered={registered}");
                                followups.extend(
                                    self.engine.registration_check_succeeded(now_ms, registered),
                                );
                            }
                            Err(err) => {
                                warn!("{}", NodeError::TransientNetwork(format!("{err:#}")));
                                followups.extend(self.engine.registration_check_failed(now_ms));
                            }
                        }
                    }
                    NodeAction::CollectAndUpload => match self.read_sample() {
                        Ok(sample) => {
                            let reading = ReadingSubmission {
                                mac_address: self.identity.id_hex(),
                                temperature: sample.temperature,
                                humidity: sample.humidity,
                                pressure: sample.pressure,
                                sensor: self.sensor_tag.clone(),
                            };
                            match self.cloud.submit_reading(&reading) {
                                Ok(()) => {
                                    info!(
                                        "reading uploaded: {:.1}C {:.1}% {:.1}hPa",
                                        sample.temperature, sample.humidity, sample.pressure
                                    );
                                    followups.extend(self.engine.upload_succeeded(now_ms));
                                }
                                Err(err) => {
                                    warn!("{}", NodeError::TransientNetwork(format!("{err:#}")));
                                    followups.extend(self.engine.upload_failed(now_ms));
                                }
                            }
                        }
                        Err(err) => {
                            warn!("{}", NodeError::SensorRead(format!("{err:#}")));
                            followups.extend(self.engine.upload_failed(now_ms));
                        }
                    },
                }
            }
            queue = followups;
        }
        Ok(())
    }

    fn read_sample(&mut self) -> anyhow::Result<SensorSample> {
        match self.sensor.as_mut() {
            Some(sensor) => sensor.read(),
            None => bail!("no environmental sensor attached"),
        }
    }
}

/// NimBLE stays initialized for the process lifetime; sessions toggle
/// advertising and drop links. Callbacks forward raw events into the
/// channel, all interpretation happens on the main loop.
struct BleRadio {
    characteristic: Arc<NimbleMutex<BLECharacteristic>>,
    advertising: bool,
}

impl BleRadio {
    fn new(device_name: &str, events: mpsc::Sender<BleEvent>) -> anyhow::Result<Self> {
        let ble_device = BLEDevice::take();
        BLEDevice::set_device_name(device_name)
            .map_err(|err| anyhow!("failed to set device name: {err:?}"))?;

        let server = ble_device.get_server();

        let connect_events = events.clone();
        server.on_connect(move |_server, desc| {
            info!("ble client connected (link {})", desc.conn_handle());
            let _ = connect_events.send(BleEvent::Connected(desc.conn_handle()));
        });

        let disconnect_events = events.clone();
        server.on_disconnect(move |desc, _reason| {
            info!("ble client disconnected (link {})", desc.conn_handle());
            let _ = disconnect_events.send(BleEvent::Disconnected(desc.conn_handle()));
        });

        let service = server.create_service(uuid128!("6E400001-B5A3-F393-E0A9-E50E24DCCA9E"));

        let characteristic = service.lock().create_characteristic(
            uuid128!("6E400002-B5A3-F393-E0A9-E50E24DCCA9E"),
            NimbleProperties::READ | NimbleProperties::WRITE | NimbleProperties::NOTIFY,
        );
        characteristic.lock().set_value(INITIAL_VALUE);

        let write_events = events;
        characteristic.lock().on_write(move |args| {
            let _ = write_events.send(BleEvent::Written {
                link: args.desc().conn_handle(),
                value: args.recv_data().to_vec(),
            });
        });

        let advertising = ble_device.get_advertising();
        advertising
            .lock()
            .set_data(
                BLEAdvertisementData::new()
                    .name(device_name)
                    .add_service_uuid(uuid128!("6E400001-B5A3-F393-E0A9-E50E24DCCA9E")),
            )
            .map_err(|err| anyhow!("failed to set advertising data: {err:?}"))?;
        // Advertising interval is in 0.625ms units.
        let interval = (ADV_INTERVAL_US / 625) as u16;
        advertising
            .lock()
            .min_interval(interval)
            .max_interval(interval);

        Ok(Self {
            characteristic,
            advertising: false,
        })
    }

    fn start_advertising(&mut self) -> anyhow::Result<()> {
        BLEDevice::take()
            .get_advertising()
            .lock()
            .start()
            .map_err(|err| anyhow!("failed to start advertising: {err:?}"))?;
        self.advertising = true;
        Ok(())
    }

    /// Full stack reset: drop every link, deinitialize NimBLE, bring it
    /// back up, and verify the controller answers by starting advertising
    /// once. Leaves the radio off.
    fn reset(&mut self, links: &[LinkId]) -> anyhow::Result<()> {
        self.power_down(links);
        BLEDevice::deinit().map_err(|err| anyhow!("ble stack deinit failed: {err:?}"))?;
        let _ = BLEDevice::take();
        self.start_advertising()
            .context("ble controller did not come back after reinit")?;
        self.power_down(&[]);
        Ok(())
    }

    fn power_down(&mut self, links: &[LinkId]) {
        let device = BLEDevice::take();
        for link in links {
            if let Err(err) = device.get_server().disconnect(*link) {
                warn!("failed to drop ble link {link}: {err:?}");
            }
        }
        if let Err(err) = device.get_advertising().lock().stop() {
            warn!("failed to stop advertising: {err:?}");
        }
        self.advertising = false;
    }

    fn set_value(&mut self, value: &[u8]) {
        self.characteristic.lock().set_value(value);
    }

    fn notify(&mut self, payload: &[u8]) {
        self.characteristic.lock().set_value(payload).notify();
    }
}

/// Single WS2812 pixel over RMT. One 24-bit GRB frame per update.
struct IndicatorLed {
    tx: TxRmtDriver<'static>,
}

impl IndicatorLed {
    fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx =
            TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;
        Ok(Self { tx })
    }

    fn set(&mut self, color: Rgb) -> anyhow::Result<()> {
        let grb = ((color.green() as u32) << 16) | ((color.red() as u32) << 8) | color.blue() as u32;
        let ticks_hz = self.tx.counter_clock()?;

        let mut signal = FixedLengthSignal::<24>::new();
        for bit in 0..24u32 {
            let one = (grb >> (23 - bit)) & 1 == 1;
            let (high_ns, low_ns) = if one { (700, 600) } else { (350, 800) };
            signal.set(
                bit as usize,
                &(
                    Pulse::new_with_duration(
                        ticks_hz,
                        PinState::High,
                        &Duration::from_nanos(high_ns),
                    )?,
                    Pulse::new_with_duration(
                        ticks_hz,
                        PinState::Low,
                        &Duration::from_nanos(low_ns),
                    )?,
                ),
            )?;
        }
        self.tx.start_blocking(&signal)?;
        Ok(())
    }
}

/// M5 ENV IV unit: SHT40 for temperature and humidity, BMP280 for
/// pressure. A failure in either chip fails the whole sample.
struct EnvSensor {
    i2c: I2cDriver<'static>,
    bmp_calib: Bmp280Calibration,
}

struct Bmp280Calibration {
    dig_t1: u16,
    dig_t2: i16,
    dig_t3: i16,
    dig_p1: u16,
    dig_p2: i16,
    dig_p3: i16,
    dig_p4: i16,
    dig_p5: i16,
    dig_p6: i16,
    dig_p7: i16,
    dig_p8: i16,
    dig_p9: i16,
}

impl EnvSensor {
    fn new(mut i2c: I2cDriver<'static>) -> anyhow::Result<Self> {
        let mut chip_id = [0u8; 1];
        i2c.write_read(BMP280_ADDR, &[0xD0], &mut chip_id, BLOCK)
            .map_err(|err| anyhow!("bmp280 probe failed: {err}"))?;
        if chip_id[0] != 0x58 {
            bail!("unexpected bmp280 chip id 0x{:02X}", chip_id[0]);
        }

        let mut calib = [0u8; 24];
        i2c.write_read(BMP280_ADDR, &[0x88], &mut calib, BLOCK)
            .map_err(|err| anyhow!("bmp280 calibration read failed: {err}"))?;

        let word = |index: usize| u16::from_le_bytes([calib[index], calib[index + 1]]);
        let bmp_calib = Bmp280Calibration {
            dig_t1: word(0),
            dig_t2: word(2) as i16,
            dig_t3: word(4) as i16,
            dig_p1: word(6),
            dig_p2: word(8) as i16,
            dig_p3: word(10) as i16,
            dig_p4: word(12) as i16,
            dig_p5: word(14) as i16,
            dig_p6: word(16) as i16,
            dig_p7: word(18) as i16,
            dig_p8: word(20) as i16,
            dig_p9: word(22) as i16,
        };

        // osrs_t x2, osrs_p x16, normal mode; standby 1000ms.
        i2c.write(BMP280_ADDR, &[0xF4, 0x57], BLOCK)
            .map_err(|err| anyhow!("bmp280 configuration failed: {err}"))?;
        i2c.write(BMP280_ADDR, &[0xF5, 0xA0], BLOCK)
            .map_err(|err| anyhow!("bmp280 configuration failed: {err}"))?;

        Ok(Self { i2c, bmp_calib })
    }

    fn read(&mut self) -> anyhow::Result<SensorSample> {
        let (temperature, humidity) = self.read_sht40()?;
        let pressure = self.read_bmp280_pressure()?;
        Ok(SensorSample {
            temperature,
            humidity,
            pressure,
        })
    }

    fn read_sht40(&mut self) -> anyhow::Result<(f32, f32)> {
        self.i2c
            .write(SHT40_ADDR, &[0xFD], BLOCK)
            .map_err(|err| anyhow!("sht40 measure command failed: {err}"))?;
        Ets::delay_ms(10);

        let mut raw = [0u8; 6];
        self.i2c
            .read(SHT40_ADDR, &mut raw, BLOCK)
            .map_err(|err| anyhow!("sht40 read failed: {err}"))?;

        if crc8(&raw[0..2]) != raw[2] || crc8(&raw[3..5]) != raw[5] {
            bail!("sht40 crc mismatch");
        }

        let t_ticks = u16::from_be_bytes([raw[0], raw[1]]) as f32;
        let rh_ticks = u16::from_be_bytes([raw[3], raw[4]]) as f32;

        let temperature = -45.0 + 175.0 * t_ticks / 65535.0;
        let humidity = (-6.0 + 125.0 * rh_ticks / 65535.0).clamp(0.0, 100.0);
        Ok((temperature, humidity))
    }

    fn read_bmp280_pressure(&mut self) -> anyhow::Result<f32> {
        let mut raw = [0u8; 6];
        self.i2c
            .write_read(BMP280_ADDR, &[0xF7], &mut raw, BLOCK)
            .map_err(|err| anyhow!("bmp280 read failed: {err}"))?;

        let adc_p = (i32::from(raw[0]) << 12) | (i32::from(raw[1]) << 4) | (i32::from(raw[2]) >> 4);
        let adc_t = (i32::from(raw[3]) << 12) | (i32::from(raw[4]) << 4) | (i32::from(raw[5]) >> 4);

        // Compensation from the BMP280 datasheet, 64-bit integer variant.
        let c = &self.bmp_calib;
        let var1 = ((adc_t >> 3) - ((c.dig_t1 as i32) << 1)) * (c.dig_t2 as i32) >> 11;
        let var2 = (((adc_t >> 4) - (c.dig_t1 as i32)) * ((adc_t >> 4) - (c.dig_t1 as i32)) >> 12)
            * (c.dig_t3 as i32)
            >> 14;
        let t_fine = var1 + var2;

        let mut var1 = (t_fine as i64) - 128_000;
        let mut var2 = var1 * var1 * (c.dig_p6 as i64);
        var2 += (var1 * (c.dig_p5 as i64)) << 17;
        var2 += (c.dig_p4 as i64) << 35;
        var1 = ((var1 * var1 * (c.dig_p3 as i64)) >> 8) + ((var1 * (c.dig_p2 as i64)) << 12);
        var1 = ((1i64 << 47) + var1) * (c.dig_p1 as i64) >> 33;
        if var1 == 0 {
            bail!("bmp280 pressure compensation divides by zero");
        }

        let mut p = 1_048_576 - adc_p as i64;
        p = ((p << 31) - var2) * 3_125 / var1;
        let var1 = ((c.dig_p9 as i64) * (p >> 13) * (p >> 13)) >> 25;
        let var2 = ((c.dig_p8 as i64) * p) >> 19;
        p = ((p + var1 + var2) >> 8) + ((c.dig_p7 as i64) << 4);

        // Q24.8 pascals to hectopascals.
        Ok((p as f32) / 256.0 / 100.0)
    }
}

/// SHT4x CRC-8, polynomial 0x31, init 0xFF.
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

struct CloudHttp {
    config: CloudConfig,
}

impl CloudHttp {
    fn new(config: CloudConfig) -> Self {
        Self { config }
    }

    fn check_registration(&self, device_id: &str) -> anyhow::Result<bool> {
        let (status, body) =
            self.request(Method::Get, &cloud::device_query_path(device_id), None, &[])?;
        if !cloud::is_success(status) {
            bail!("device query returned HTTP {status}");
        }
        cloud::parse_device_list(&body).map_err(|err| anyhow!("device query body: {err}"))
    }

    fn register_device(&self, registration: &DeviceRegistration) -> anyhow::Result<bool> {
        let payload = serde_json::to_vec(registration)?;
        let (status, _) = self.request(
            Method::Post,
            cloud::devices_path(),
            Some(&payload),
            &[("Prefer", "return=representation")],
        )?;
        Ok(cloud::is_created(status))
    }

    fn submit_reading(&self, reading: &ReadingSubmission) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(reading)?;
        let (status, _) =
            self.request(Method::Post, cloud::readings_path(), Some(&payload), &[])?;
        if !cloud::is_success(status) {
            bail!("reading insert returned HTTP {status}");
        }
        Ok(())
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(u16, Vec<u8>)> {
        if self.config.base_url.is_empty() {
            bail!("cloud base url is not configured");
        }

        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(10)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let content_length = body.map(|b| b.len().to_string());
        let mut headers: Vec<(&str, &str)> = vec![("apikey", self.config.api_key.as_str())];
        if let Some(length) = content_length.as_deref() {
            headers.push(("Content-Type", "application/json"));
            headers.push(("Content-Length", length));
        }
        headers.extend_from_slice(extra_headers);

        let mut request = client
            .request(method, &url, &headers)
            .map_err(|err| anyhow!("http request setup failed: {err:?}"))?;
        if let Some(body) = body {
            request
                .write_all(body)
                .map_err(|err| anyhow!("http body write failed: {err:?}"))?;
        }

        let mut response = request
            .submit()
            .map_err(|err| anyhow!("http submit failed: {err:?}"))?;
        let status = response.status();

        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| anyhow!("http body read failed: {err:?}"))?;
            if read == 0 {
                break;
            }
            if out.len() + read > MAX_HTTP_RESPONSE {
                bail!("http response exceeds {MAX_HTTP_RESPONSE} bytes");
            }
            out.extend_from_slice(&chunk[..read]);
        }

        Ok((status, out))
    }
}

fn connect_wifi(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    runtime: &RuntimeConfig,
) -> anyhow::Result<()> {
    if runtime.network.wifi_ssid.is_empty() {
        bail!("wifi credentials missing");
    }

    let auth_method = if runtime.network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: runtime
            .network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: runtime
            .network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", runtime.network.wifi_ssid);

    let retry_delay = runtime.timing.wifi_connect_timeout_ms / WIFI_CONNECT_ATTEMPTS as u64;
    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(retry_delay));
        }
    }

    match last_err {
        Some(err) => Err(err.into()),
        None => Err(anyhow!("wifi connection failed")),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
