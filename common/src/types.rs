use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleMode {
    Unregistered,
    Pairing,
    Registered,
    Error,
}

impl LifecycleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Pairing => "PAIRING",
            Self::Registered => "REGISTERED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RadioPowerState {
    Off,
    Advertising,
    Connected,
}

impl RadioPowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Advertising => "ADVERTISING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// 24-bit RGB color for the status LED, `0xRRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u32);

impl Rgb {
    pub const OFF: Rgb = Rgb(0x000000);
    pub const UNREGISTERED: Rgb = Rgb(0xFFFFFF);
    pub const PAIRING: Rgb = Rgb(0x0000FF);
    pub const ERROR: Rgb = Rgb(0xFF0000);
    pub const SUCCESS: Rgb = Rgb(0x33CC00);

    pub fn red(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn green(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn blue(self) -> u8 {
        self.0 as u8
    }
}

/// Stable identity derived from the radio MAC at boot; never changes
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
}

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self { mac }
    }

    /// 12-char uppercase hex identifier, e.g. `A1B2C3D4E5F6`.
    pub fn id_hex(&self) -> String {
        let mut out = String::with_capacity(12);
        for byte in self.mac {
            use core::fmt::Write as _;
            let _ = write!(&mut out, "{byte:02X}");
        }
        out
    }

    /// Advertised local name, `<prefix>-<last-6-hex>`.
    pub fn name(&self, prefix: &str) -> String {
        let hex = self.id_hex();
        format!("{prefix}-{}", &hex[hex.len() - 6..])
    }
}

/// One environmental sample. All three fields come from the same read; a
/// partial read is an error, never a partial sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub mode: &'static str,
    pub registered: bool,
    pub radio: &'static str,
    #[serde(rename = "pairingRemainingMs")]
    pub pairing_remaining_ms: u64,
    #[serde(rename = "nextRegistrationCheckMs")]
    pub next_registration_check_ms: u64,
    #[serde(rename = "nextUploadMs")]
    pub next_upload_ms: u64,
    #[serde(rename = "uploadPending")]
    pub upload_pending: bool,
}
