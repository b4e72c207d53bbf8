//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bandlink_lib::codec::{Alarm, AuthKey};
#[allow(unused_imports)]
pub use bandlink_lib::constants::*;
#[allow(unused_imports)]
pub use bandlink_lib::error::BandError;
#[allow(unused_imports)]
pub use bandlink_lib::sim::{AuthBehavior, SimulatedBand};
#[allow(unused_imports)]
pub use bandlink_lib::{
    BandClient, BandConfig, DeviceRegistry, HardwareAddress, MemoryRegistry, PairedDevice, SessionState,
};
#[allow(unused_imports)]
pub use std::sync::Arc;
#[allow(unused_imports)]
pub use std::time::Duration;

/// Key the simulated band is provisioned with
#[allow(dead_code)]
pub const KEY: &str = "f0e1d2c3b4a5968778695a4b3c2d1e0f";

/// A valid key that is not the band's
#[allow(dead_code)]
pub const WRONG_KEY: &str = "00112233445566778899aabbccddeeff";

#[allow(dead_code)]
pub const ADDRESS: [u8; 6] = [0xC8, 0x0F, 0x10, 0x80, 0xD2, 0x41];

#[allow(dead_code)]
pub fn address() -> HardwareAddress {
    HardwareAddress::new(ADDRESS)
}

#[allow(dead_code)]
pub fn key() -> AuthKey {
    AuthKey::from_hex(KEY).expect("test key is valid")
}

/// Route library logs to the test harness output; safe to call from every test
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A simulated band already paired with a fresh client
#[allow(dead_code)]
pub struct Fixture {
    pub band: SimulatedBand,
    pub registry: Arc<MemoryRegistry>,
    pub client: BandClient<SimulatedBand>,
    pub device: PairedDevice,
}

#[allow(dead_code)]
impl Fixture {
    /// Current record of the paired band, as the registry holds it
    pub fn stored(&self) -> PairedDevice {
        self.registry.get(self.device.id).expect("device is registered")
    }
}

#[allow(dead_code)]
pub async fn fixture() -> Fixture {
    fixture_with(BandConfig::default()).await
}

#[allow(dead_code)]
pub async fn fixture_with(config: BandConfig) -> Fixture {
    init_tracing();
    let band = SimulatedBand::new(address(), &key());
    let registry = Arc::new(MemoryRegistry::new());
    let client = BandClient::new(band.clone(), registry.clone(), config).expect("config is valid");
    let device = client.pair("Test Band", KEY).await.expect("pairing succeeds");
    Fixture {
        band,
        registry,
        client,
        device,
    }
}

/// Paired and authenticated
#[allow(dead_code)]
pub async fn connected() -> Fixture {
    connected_with(BandConfig::default()).await
}

#[allow(dead_code)]
pub async fn connected_with(config: BandConfig) -> Fixture {
    let fixture = fixture_with(config).await;
    fixture
        .client
        .connect(&fixture.device, ())
        .await
        .expect("connect succeeds");
    assert_eq!(fixture.client.state(), SessionState::Authenticated);
    fixture
}
