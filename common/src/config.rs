use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub poll_tick_ms: u64,
    pub reading_interval_ms: u64,
    pub registration_check_unregistered_ms: u64,
    pub registration_check_registered_ms: u64,
    pub pairing_timeout_ms: u64,
    /// Window granted to a connected client to receive the REGISTERED
    /// notification before the radio is torn down.
    pub registration_grace_ms: u64,
    pub success_flash_ms: u64,
    pub wifi_connect_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_tick_ms: 100,
            reading_interval_ms: 600_000,
            registration_check_unregistered_ms: 10_000,
            registration_check_registered_ms: 300_000,
            pairing_timeout_ms: 120_000,
            registration_grace_ms: 500,
            success_flash_ms: 400,
            wifi_connect_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        self.poll_tick_ms = self.poll_tick_ms.clamp(10, 1_000);
        self.reading_interval_ms = self.reading_interval_ms.max(1_000);
        self.registration_check_unregistered_ms =
            self.registration_check_unregistered_ms.max(1_000);
        self.registration_check_registered_ms = self
            .registration_check_registered_ms
            .max(self.registration_check_unregistered_ms);
        self.pairing_timeout_ms = self.pairing_timeout_ms.clamp(5_000, 600_000);
        self.registration_grace_ms = self.registration_grace_ms.clamp(0, 5_000);
        self.success_flash_ms = self.success_flash_ms.clamp(0, 5_000);
        self.wifi_connect_timeout_ms = self.wifi_connect_timeout_ms.clamp(1_000, 60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// REST root, e.g. `https://example.supabase.co/rest/v1`.
    pub base_url: String,
    pub api_key: String,
    /// Tag recorded alongside every reading so the backend can tell sensor
    /// hardware revisions apart.
    pub sensor_tag: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            sensor_tag: "m5_env_4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub timing: TimingConfig,
    pub cloud: CloudConfig,
    pub network: NetworkConfig,
    /// Prefix of the advertised device name.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

fn default_name_prefix() -> String {
    "NanoC6".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            cloud: CloudConfig::default(),
            network: NetworkConfig::default(),
            name_prefix: default_name_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_device_policy() {
        let timing = TimingConfig::default();
        assert_eq!(timing.poll_tick_ms, 100);
        assert_eq!(timing.reading_interval_ms, 600_000);
        assert_eq!(timing.registration_check_unregistered_ms, 10_000);
        assert_eq!(timing.registration_check_registered_ms, 300_000);
        assert_eq!(timing.pairing_timeout_ms, 120_000);
    }

    #[test]
    fn sanitize_keeps_registered_interval_at_least_unregistered() {
        let mut timing = TimingConfig {
            registration_check_unregistered_ms: 60_000,
            registration_check_registered_ms: 5_000,
            ..TimingConfig::default()
        };
        timing.sanitize();
        assert_eq!(timing.registration_check_registered_ms, 60_000);
    }

    #[test]
    fn sanitize_clamps_tick_bounds() {
        let mut timing = TimingConfig {
            poll_tick_ms: 0,
            ..TimingConfig::default()
        };
        timing.sanitize();
        assert_eq!(timing.poll_tick_ms, 10);
    }
}
