use std::collections::BTreeSet;

use serde::Serialize;

use crate::types::SensorSample;

/// Nordic UART service, as advertised by the original hardware.
pub const SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";
pub const CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

pub const CMD_GET_READINGS: &[u8] = b"GET_READINGS";
pub const CMD_REGISTER: &[u8] = b"REGISTER";
pub const RSP_REGISTERED: &[u8] = b"REGISTERED";
pub const RSP_REGISTER_FAILED: &[u8] = b"REGISTER_FAILED";
pub const INITIAL_VALUE: &[u8] = b"Ready";

pub const ADV_INTERVAL_US: u32 = 500_000;

/// Legacy advertising payloads are capped at 31 octets.
const ADV_PAYLOAD_MAX: usize = 31;

/// Link handle of one open BLE connection.
pub type LinkId = u16;

/// Radio interrupts, decoded once at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    Connected(LinkId),
    Disconnected(LinkId),
    Written { link: LinkId, value: Vec<u8> },
}

/// The three commands of the wire contract. Anything unrecognized is
/// echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetReadings,
    Register,
    Other(Vec<u8>),
}

impl Command {
    pub fn parse(value: &[u8]) -> Self {
        if value == CMD_GET_READINGS {
            Self::GetReadings
        } else if value == CMD_REGISTER {
            Self::Register
        } else {
            Self::Other(value.to_vec())
        }
    }
}

/// I/O requested by the command processor, executed by the platform
/// adapter. Notify/write failures are logged there, never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleAction {
    Notify { link: LinkId, payload: Vec<u8> },
    /// Update the characteristic value (used by the echo policy).
    WriteValue(Vec<u8>),
    /// Read one sample and feed it back through `sample_ready`. If no
    /// sensor is attached the adapter drops the request silently.
    ReadSample { link: LinkId },
    /// Register the device with the backend and feed the outcome back
    /// through `registration_result`.
    Register { link: LinkId },
    ResumeAdvertising,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ReadingsNotification {
    temperature: f32,
    humidity: f32,
    pressure: f32,
    timestamp: i64,
}

/// Interprets characteristic writes as commands and tracks the connection
/// set. Single writer for that set: membership changes only inside
/// `handle_event`, never concurrently with lifecycle-level teardown.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    connections: BTreeSet<LinkId>,
    /// Last intent commanded by the lifecycle controller. Advertising is
    /// resumed after a disconnect only when this is still set; the
    /// processor never re-derives lifecycle mode on its own.
    advertising_intent: bool,
    /// Set once the registration confirmation has been propagated; any
    /// later REGISTER in the same session is answered without touching
    /// the backend again.
    registration_signalled: bool,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self {
            connections: BTreeSet::new(),
            advertising_intent: false,
            registration_signalled: false,
        }
    }

    /// Radio powered on for a new pairing session.
    pub fn session_started(&mut self) {
        self.connections.clear();
        self.advertising_intent = true;
        self.registration_signalled = false;
    }

    /// Radio powered off; all links are gone.
    pub fn session_ended(&mut self) {
        self.connections.clear();
        self.advertising_intent = false;
    }

    pub fn connections(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.connections.iter().copied()
    }

    pub fn has_connections(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn handle_event(&mut self, event: BleEvent) -> Vec<BleAction> {
        match event {
            BleEvent::Connected(link) => {
                self.connections.insert(link);
                Vec::new()
            }
            BleEvent::Disconnected(link) => {
                self.connections.remove(&link);
                if self.advertising_intent {
                    vec![BleAction::ResumeAdvertising]
                } else {
                    Vec::new()
                }
            }
            BleEvent::Written { link, value } => self.handle_command(link, &value),
        }
    }

    fn handle_command(&mut self, link: LinkId, value: &[u8]) -> Vec<BleAction> {
        match Command::parse(value) {
            Command::GetReadings => vec![BleAction::ReadSample { link }],
            Command::Register => {
                if self.registration_signalled {
                    // Duplicate REGISTER after success: re-acknowledge
                    // without a second backend insert.
                    vec![BleAction::Notify {
                        link,
                        payload: RSP_REGISTERED.to_vec(),
                    }]
                } else {
                    vec![BleAction::Register { link }]
                }
            }
            Command::Other(bytes) => vec![BleAction::WriteValue(bytes)],
        }
    }

    /// Backend answered a REGISTER. Returns the response actions plus
    /// whether the lifecycle controller must be told, which is true at
    /// most once per session.
    pub fn registration_result(&mut self, link: LinkId, created: bool) -> (Vec<BleAction>, bool) {
        if !created {
            return (
                vec![BleAction::Notify {
                    link,
                    payload: RSP_REGISTER_FAILED.to_vec(),
                }],
                false,
            );
        }

        let confirm = !self.registration_signalled;
        self.registration_signalled = true;
        // The radio is coming down once the grace delay passes; do not
        // resume advertising for the disconnect that follows.
        self.advertising_intent = false;
        (
            vec![BleAction::Notify {
                link,
                payload: RSP_REGISTERED.to_vec(),
            }],
            confirm,
        )
    }

    /// No sensor could answer a GET_READINGS request. Nothing goes back
    /// over the link; the client is free to ask again.
    pub fn sample_unavailable(&self, _link: LinkId) -> Vec<BleAction> {
        Vec::new()
    }

    /// Sensor sample arrived for a GET_READINGS request.
    pub fn sample_ready(
        &self,
        link: LinkId,
        sample: SensorSample,
        epoch_secs: i64,
    ) -> Vec<BleAction> {
        let notification = ReadingsNotification {
            temperature: sample.temperature,
            humidity: sample.humidity,
            pressure: sample.pressure,
            timestamp: epoch_secs,
        };
        match serde_json::to_vec(&notification) {
            Ok(payload) => vec![BleAction::Notify { link, payload }],
            Err(_) => Vec::new(),
        }
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Advertising payload: flags, 16-bit service UUID field, complete local
/// name. The name is truncated if the payload would exceed the 31-octet
/// legacy limit.
pub fn advertising_payload(name: &str) -> Vec<u8> {
    let mut payload = vec![
        0x02, 0x01, 0x06, // Flags
        0x02, 0x0A, 0x1A, // 16-bit Service UUID
    ];

    let room = ADV_PAYLOAD_MAX - payload.len() - 2;
    let name_bytes = &name.as_bytes()[..name.len().min(room)];
    payload.push(name_bytes.len() as u8 + 1);
    payload.push(0x09); // Complete local name
    payload.extend_from_slice(name_bytes);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_exact_command_bytes() {
        assert_eq!(Command::parse(b"GET_READINGS"), Command::GetReadings);
        assert_eq!(Command::parse(b"REGISTER"), Command::Register);
        assert_eq!(
            Command::parse(b"register"),
            Command::Other(b"register".to_vec())
        );
    }

    #[test]
    fn unknown_bytes_are_echoed() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(3));

        let actions = processor.handle_event(BleEvent::Written {
            link: 3,
            value: b"PING".to_vec(),
        });
        assert_eq!(actions, vec![BleAction::WriteValue(b"PING".to_vec())]);
    }

    #[test]
    fn get_readings_requests_a_sample() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(1));

        let actions = processor.handle_event(BleEvent::Written {
            link: 1,
            value: CMD_GET_READINGS.to_vec(),
        });
        assert_eq!(actions, vec![BleAction::ReadSample { link: 1 }]);
    }

    #[test]
    fn get_readings_without_sensor_stays_silent() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(6));

        let actions = processor.handle_event(BleEvent::Written {
            link: 6,
            value: CMD_GET_READINGS.to_vec(),
        });
        assert_eq!(actions, vec![BleAction::ReadSample { link: 6 }]);

        // The read found no sensor attached: no notification, no error.
        let actions = processor.sample_unavailable(6);
        assert!(actions.is_empty());
    }

    #[test]
    fn readings_notification_is_json() {
        let processor = CommandProcessor::new();
        let sample = SensorSample {
            temperature: 21.5,
            humidity: 40.0,
            pressure: 1013.2,
        };

        let actions = processor.sample_ready(1, sample, 1_700_000_000);
        let BleAction::Notify { link, payload } = &actions[0] else {
            panic!("expected notify, got {actions:?}");
        };
        assert_eq!(*link, 1);

        let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["temperature"], 21.5);
        assert_eq!(value["humidity"], 40.0);
        assert_eq!(value["timestamp"], 1_700_000_000_i64);
    }

    #[test]
    fn register_confirms_exactly_once_per_session() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(7));

        let actions = processor.handle_event(BleEvent::Written {
            link: 7,
            value: CMD_REGISTER.to_vec(),
        });
        assert_eq!(actions, vec![BleAction::Register { link: 7 }]);

        let (actions, confirm) = processor.registration_result(7, true);
        assert!(confirm);
        assert_eq!(
            actions,
            vec![BleAction::Notify {
                link: 7,
                payload: RSP_REGISTERED.to_vec(),
            }]
        );

        // Duplicate write: acknowledged locally, no backend call, no
        // second confirmation.
        let actions = processor.handle_event(BleEvent::Written {
            link: 7,
            value: CMD_REGISTER.to_vec(),
        });
        assert_eq!(
            actions,
            vec![BleAction::Notify {
                link: 7,
                payload: RSP_REGISTERED.to_vec(),
            }]
        );

        let (_, confirm) = processor.registration_result(7, true);
        assert!(!confirm);
    }

    #[test]
    fn failed_register_reports_and_allows_retry() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(2));

        let (actions, confirm) = processor.registration_result(2, false);
        assert!(!confirm);
        assert_eq!(
            actions,
            vec![BleAction::Notify {
                link: 2,
                payload: RSP_REGISTER_FAILED.to_vec(),
            }]
        );

        // The retry goes back to the backend.
        let actions = processor.handle_event(BleEvent::Written {
            link: 2,
            value: CMD_REGISTER.to_vec(),
        });
        assert_eq!(actions, vec![BleAction::Register { link: 2 }]);
    }

    #[test]
    fn disconnect_resumes_advertising_only_while_commanded() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(4));

        let actions = processor.handle_event(BleEvent::Disconnected(4));
        assert_eq!(actions, vec![BleAction::ResumeAdvertising]);

        let _ = processor.handle_event(BleEvent::Connected(5));
        processor.session_ended();
        let actions = processor.handle_event(BleEvent::Disconnected(5));
        assert!(actions.is_empty());
        assert!(!processor.has_connections());
    }

    #[test]
    fn successful_registration_stops_advertising_resume() {
        let mut processor = CommandProcessor::new();
        processor.session_started();
        let _ = processor.handle_event(BleEvent::Connected(9));
        let _ = processor.registration_result(9, true);

        // Client drops after the grace window; the radio is going off, so
        // advertising must not restart underneath the teardown.
        let actions = processor.handle_event(BleEvent::Disconnected(9));
        assert!(actions.is_empty());
    }

    #[test]
    fn advertising_payload_layout() {
        let payload = advertising_payload("NanoC6-D4E5F6");

        assert_eq!(&payload[..3], &[0x02, 0x01, 0x06]);
        assert_eq!(&payload[3..6], &[0x02, 0x0A, 0x1A]);
        assert_eq!(payload[6] as usize, "NanoC6-D4E5F6".len() + 1);
        assert_eq!(payload[7], 0x09);
        assert_eq!(&payload[8..], b"NanoC6-D4E5F6");
        assert!(payload.len() <= 31);
    }

    #[test]
    fn advertising_payload_truncates_long_names() {
        let payload = advertising_payload("a-very-long-device-name-that-does-not-fit");
        assert_eq!(payload.len(), 31);
        assert_eq!(payload[6] as usize, 24);
    }
}
