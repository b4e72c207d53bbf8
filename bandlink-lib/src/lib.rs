pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod heart_rate;
pub mod registry;
pub mod sim;
pub mod transport;

#[cfg(feature = "ble")]
pub mod ble;


// Re-export the client surface for easy access
pub use client::{BandClient, ConnectionObserver, SessionState};
pub use config::BandConfig;
pub use error::BandError;
pub use heart_rate::{HeartRateMonitor, HeartRateReading};
pub use registry::{DeviceRegistry, JsonFileRegistry, MemoryRegistry, PairedDevice};
pub use transport::HardwareAddress;
