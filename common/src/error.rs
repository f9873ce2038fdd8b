use thiserror::Error;

/// Failure taxonomy for the node. Every error is caught at the tick or
/// event-handler boundary and converted into a mode transition; nothing
/// propagates out of the main loop.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Wi-Fi or HTTP failure. Retried on the next scheduled deadline,
    /// never immediately.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The sensor could not produce a complete sample. Treated exactly
    /// like an upload failure; partial telemetry is never submitted.
    #[error("sensor read failed: {0}")]
    SensorRead(String),

    /// The BLE stack failed to register, advertise, or tear down.
    #[error("radio fault: {0}")]
    RadioFault(String),

    /// Shared state is unrecoverable; the device reboots after logging.
    #[error("fatal condition: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
