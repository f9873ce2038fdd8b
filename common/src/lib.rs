pub mod ble;
pub mod cloud;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod types;

pub use ble::{advertising_payload, BleAction, BleEvent, Command, CommandProcessor, LinkId};
pub use cloud::{DeviceRegistration, ReadingSubmission};
pub use config::{CloudConfig, NetworkConfig, RuntimeConfig, TimingConfig};
pub use error::NodeError;
pub use lifecycle::{LifecycleEngine, NodeAction};
pub use types::{
    DeviceIdentity, LifecycleMode, NodeStatus, RadioPowerState, Rgb, SensorSample,
};
