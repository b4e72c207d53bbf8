//! Pairing, platform handles across reconnects, and forgetting a band

mod common;

use bandlink_lib::JsonFileRegistry;
use bandlink_lib::registry::NewPairedDevice;
use bandlink_lib::transport::Radio;
use common::*;

#[tokio::test]
async fn test_pair_stores_record() {
    let fx = fixture().await;

    assert_eq!(fx.device.nickname, "Test Band");
    assert_eq!(fx.device.hardware_address, address());
    assert_eq!(fx.device.auth_key, key());
    assert_eq!(fx.device.transport_handle_id, Some(fx.band.handle_id()));
    assert!(fx.device.alarms.is_empty());
    assert_eq!(fx.registry.list().unwrap(), vec![fx.device.clone()]);
    // pairing alone never opens a link
    assert_eq!(fx.band.connections(), 0);
}

#[tokio::test]
async fn test_pair_defaults_nickname_to_band_name() {
    let band = SimulatedBand::new(address(), &key());
    let client = BandClient::new(band, Arc::new(MemoryRegistry::new()), BandConfig::default()).unwrap();

    let device = client.pair("", KEY).await.unwrap();

    assert_eq!(device.nickname, "Simulated Band");
}

#[tokio::test]
async fn test_pair_rejects_bad_key() {
    let band = SimulatedBand::new(address(), &key());
    let registry = Arc::new(MemoryRegistry::new());
    let client = BandClient::new(band.clone(), registry.clone(), BandConfig::default()).unwrap();

    for bad in ["", "f0e1d2", "f0e1d2c3b4a5968778695a4b3c2d1e0g"] {
        let result = client.pair("Band", bad).await;
        assert!(matches!(result, Err(BandError::InvalidKeyFormat(_))), "accepted {bad:?}");
    }
    assert!(registry.list().unwrap().is_empty());
    // the key is checked before the discovery prompt
    assert!(band.authorized_peripherals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pair_twice_is_refused() {
    let fx = fixture().await;

    let result = fx.client.pair("Again", KEY).await;

    assert!(matches!(result, Err(BandError::Registry(_))));
    assert_eq!(fx.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_reissued_handle_is_stored() {
    let fx = connected().await;
    fx.client.disconnect().await;
    let fresh = fx.band.reissue_handle();
    assert_ne!(Some(fresh.clone()), fx.device.transport_handle_id);

    fx.client.connect(&fx.device, ()).await.unwrap();

    assert_eq!(fx.client.state(), SessionState::Authenticated);
    assert_eq!(fx.stored().transport_handle_id, Some(fresh));
    assert_eq!(fx.stored().hardware_address, fx.device.hardware_address);
}

#[tokio::test]
async fn test_connect_by_address_without_authorization() {
    let fx = fixture().await;
    fx.band.set_authorized(false);

    fx.client.connect(&fx.device, ()).await.unwrap();

    assert_eq!(fx.client.state(), SessionState::Authenticated);
    assert_eq!(fx.stored().transport_handle_id, fx.device.transport_handle_id);
}

#[tokio::test]
async fn test_unknown_band_is_unavailable() {
    let fx = fixture().await;
    let stranger = fx
        .registry
        .create(NewPairedDevice {
            nickname: "Stranger".to_string(),
            hardware_address: HardwareAddress::new([1, 2, 3, 4, 5, 6]),
            auth_key: key(),
            transport_handle_id: None,
        })
        .unwrap();

    let result = fx.client.connect(&stranger, ()).await;

    assert!(matches!(result, Err(BandError::DeviceUnavailable(_))));
    assert_eq!(fx.client.state(), SessionState::Error);
}

#[tokio::test]
async fn test_handle_for_other_band_is_wrong_device() {
    let fx = fixture().await;
    let impostor = fx
        .registry
        .create(NewPairedDevice {
            nickname: "Impostor".to_string(),
            hardware_address: HardwareAddress::new([1, 2, 3, 4, 5, 6]),
            auth_key: key(),
            transport_handle_id: Some(fx.band.handle_id()),
        })
        .unwrap();

    let result = fx.client.connect(&impostor, ()).await;

    assert!(matches!(result, Err(BandError::WrongDevice { .. })));
    assert_eq!(fx.client.state(), SessionState::Error);
    assert!(!fx.band.is_connected());
    assert!(fx.band.writes_to(AUTH_CHAR).is_empty());
}

#[tokio::test]
async fn test_forget_tears_everything_down() {
    let fx = connected().await;

    fx.client.forget(&fx.device).await.unwrap();

    assert_eq!(fx.client.state(), SessionState::Disconnected);
    assert!(!fx.band.is_connected());
    assert!(fx.registry.list().unwrap().is_empty());
    assert!(fx.band.authorized_peripherals().await.unwrap().is_empty());
    assert!(matches!(fx.registry.get(fx.device.id), Err(BandError::Registry(_))));
}

#[tokio::test]
async fn test_idle_link_loss_marks_session_failed() {
    let fx = connected().await;
    let mut state = fx.client.subscribe_state();

    fx.band.drop_link("supervision timeout");
    state.wait_for(|state| *state == SessionState::Error).await.unwrap();

    assert!(matches!(fx.client.get_battery_level().await, Err(BandError::NotAuthenticated)));

    fx.client.connect(&fx.device, ()).await.unwrap();
    assert_eq!(fx.client.state(), SessionState::Authenticated);
    assert_eq!(fx.band.connections(), 2);
    assert!(fx.client.get_battery_level().await.is_ok());
}

#[tokio::test]
async fn test_records_survive_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let band = SimulatedBand::new(address(), &key());

    let device = {
        let registry = Arc::new(JsonFileRegistry::open(dir.path()).unwrap());
        let client = BandClient::new(band.clone(), registry, BandConfig::default()).unwrap();
        let device = client.pair("Desk Band", KEY).await.unwrap();
        client.connect(&device, ()).await.unwrap();
        client.save_goal_settings(&device, 7500, true).await.unwrap();
        client.disconnect().await;
        device
    };

    let registry = Arc::new(JsonFileRegistry::open(dir.path()).unwrap());
    let stored = registry.get(device.id).unwrap();
    assert_eq!(stored.nickname, "Desk Band");
    assert_eq!(stored.auth_key, key());
    assert_eq!(stored.activity_goal, 7500);
    assert!(stored.goal_notifications);

    let client = BandClient::new(band, registry, BandConfig::default()).unwrap();
    client.connect(&stored, ()).await.unwrap();
    assert_eq!(client.get_battery_level().await.unwrap().level, 87);
}
