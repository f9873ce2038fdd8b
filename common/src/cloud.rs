use serde::{Deserialize, Serialize};

/// Query for the device row matching `device_id`. A non-empty result
/// means the device is registered.
pub fn device_query_path(device_id: &str) -> String {
    format!("/devices?mac_address=eq.{device_id}&select=id")
}

pub fn devices_path() -> &'static str {
    "/devices"
}

pub fn readings_path() -> &'static str {
    "/readings"
}

/// Device registration insert. Created from a pairing-session REGISTER.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRegistration {
    pub mac_address: String,
    pub name: String,
    pub connected_at: String,
}

/// One telemetry row. All three measurements come from a single sensor
/// read.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingSubmission {
    pub mac_address: String,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    pub sensor: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRow {
    #[allow(dead_code)]
    id: serde_json::Value,
}

/// Interprets the body of a device query. Malformed bodies are treated as
/// a failed check, not as "unregistered".
pub fn parse_device_list(body: &[u8]) -> Result<bool, serde_json::Error> {
    let rows: Vec<DeviceRow> = serde_json::from_slice(body)?;
    Ok(!rows.is_empty())
}

/// Registration inserts must report 201; anything else is a failure even
/// when the status is 2xx.
pub fn is_created(status: u16) -> bool {
    status == 201
}

/// Reading inserts accept any 2xx.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn query_path_filters_by_device_id() {
        assert_eq!(
            device_query_path("A1B2C3D4E5F6"),
            "/devices?mac_address=eq.A1B2C3D4E5F6&select=id"
        );
    }

    #[test]
    fn device_list_parsing() {
        assert_eq!(parse_device_list(b"[]").unwrap(), false);
        assert_eq!(parse_device_list(br#"[{"id": 17}]"#).unwrap(), true);
        assert!(parse_device_list(b"<html>bad gateway</html>").is_err());
    }

    #[test]
    fn registration_requires_created() {
        assert!(is_created(201));
        assert!(!is_created(200));
        assert!(!is_created(409));
    }

    #[test]
    fn readings_accept_any_2xx() {
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(!is_success(301));
        assert!(!is_success(500));
    }

    #[test]
    fn registration_payload_shape() {
        let body = DeviceRegistration {
            mac_address: "A1B2C3D4E5F6".into(),
            name: "NanoC6-D4E5F6".into(),
            connected_at: "2026-08-30T12:00:00Z".into(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["mac_address"], "A1B2C3D4E5F6");
        assert_eq!(value["name"], "NanoC6-D4E5F6");
        assert_eq!(value["connected_at"], "2026-08-30T12:00:00Z");
    }

    #[test]
    fn reading_payload_shape() {
        let body = ReadingSubmission {
            mac_address: "A1B2C3D4E5F6".into(),
            temperature: 22.1,
            humidity: 38.5,
            pressure: 1008.9,
            sensor: "m5_env_4".into(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["sensor"], "m5_env_4");
        assert_eq!(value["pressure"], 1008.9_f32 as f64);
    }
}
