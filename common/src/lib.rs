pub mod cache;
pub mod config;
pub mod control;
pub mod credential;
pub mod ecobee;
pub mod types;

pub use cache::{QueryKind, TtlCache, CACHE_LIFE};
pub use config::{ConfigError, ControlConfig, FireplaceConfig, PinConfig};
pub use control::{ControlAction, ControlEngine, ControlState, TickDecision};
pub use credential::{Credential, PairingState};
pub use types::{ControlStatus, SensorReading, TemperatureSample};
