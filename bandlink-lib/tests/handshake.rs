//! Connection and challenge-response authentication against the simulated band

mod common;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use common::*;
use std::sync::Mutex;

fn recorder() -> (Arc<Mutex<Vec<SessionState>>>, impl Fn(SessionState) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |state| sink.lock().unwrap().push(state))
}

#[tokio::test]
async fn test_connect_walks_every_state() {
    let fx = fixture().await;
    let (seen, observer) = recorder();

    fx.client.connect(&fx.device, observer).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            SessionState::Connecting,
            SessionState::AwaitingService,
            SessionState::Authenticating,
            SessionState::Authenticated,
        ]
    );
    assert_eq!(fx.client.state(), SessionState::Authenticated);
    assert_eq!(fx.client.hardware_address(), Some(address()));
    assert_eq!(fx.client.connected_device().map(|d| d.id), Some(fx.device.id));

    let battery = fx.client.get_battery_level().await.unwrap();
    assert!(battery.level <= 100);
}

#[tokio::test]
async fn test_handshake_frames_on_the_wire() {
    let fx = fixture().await;
    let challenge: [u8; 16] = *b"band-challenge!!";
    fx.band.set_fixed_challenge(challenge);

    fx.client.connect(&fx.device, ()).await.unwrap();

    let cipher = Aes128::new(key().as_bytes().into());
    let mut block = aes::Block::from(challenge);
    cipher.encrypt_block(&mut block);

    let writes = fx.band.writes_to(AUTH_CHAR);
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], vec![0x02, 0x00]);
    assert_eq!(writes[1][..2], [0x03, 0x00]);
    assert_eq!(writes[1][2..], block[..]);
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    init_tracing();
    let band = SimulatedBand::new(address(), &key());
    let client = BandClient::new(band.clone(), Arc::new(MemoryRegistry::new()), BandConfig::default()).unwrap();
    let device = client.pair("Band", WRONG_KEY).await.unwrap();
    let (seen, observer) = recorder();

    let result = client.connect(&device, observer).await;

    assert!(matches!(result, Err(BandError::AuthenticationRejected { status: 0x04 })));
    assert_eq!(client.state(), SessionState::Error);
    assert_eq!(seen.lock().unwrap().last(), Some(&SessionState::Error));
    assert!(!band.is_connected());
    assert!(matches!(client.get_battery_level().await, Err(BandError::NotAuthenticated)));
}

#[tokio::test(start_paused = true)]
async fn test_silent_band_times_out() {
    let fx = fixture().await;
    fx.band.set_auth_behavior(AuthBehavior::Silent);
    let started = tokio::time::Instant::now();

    let result = fx.client.connect(&fx.device, ()).await;

    match result {
        Err(BandError::AuthenticationTimeout(limit)) => assert_eq!(limit, Duration::from_secs(10)),
        other => panic!("expected an auth timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(11));
    assert_eq!(fx.client.state(), SessionState::Error);
    assert!(!fx.band.is_connected());
}

#[tokio::test]
async fn test_answer_to_wrong_command_is_protocol_violation() {
    let fx = fixture().await;
    fx.band.set_auth_behavior(AuthBehavior::WrongCommand);

    let result = fx.client.connect(&fx.device, ()).await;

    assert!(matches!(result, Err(BandError::ProtocolViolation(_))));
    assert_eq!(fx.client.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_band() {
    let fx = fixture().await;
    fx.band.set_reachable(false);

    let result = fx.client.connect(&fx.device, ()).await;

    assert!(matches!(result, Err(BandError::DeviceUnavailable(_))));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(fx.client.state(), SessionState::Error);
}

#[tokio::test]
async fn test_permission_denied() {
    let fx = fixture().await;
    fx.band.set_permission_denied(true);

    let result = fx.client.connect(&fx.device, ()).await;

    assert!(matches!(result, Err(BandError::PermissionDenied)));
    assert_eq!(fx.client.state(), SessionState::Error);
}

#[tokio::test]
async fn test_missing_service() {
    let fx = fixture().await;
    fx.band.omit_service(HEART_RATE_SERVICE);
    let (seen, observer) = recorder();

    let result = fx.client.connect(&fx.device, observer).await;

    match result {
        Err(BandError::ServiceNotFound(uuid)) => assert_eq!(uuid, HEART_RATE_SERVICE),
        other => panic!("expected a missing service, got {other:?}"),
    }
    // never got as far as the handshake
    assert!(!seen.lock().unwrap().contains(&SessionState::Authenticating));
    assert!(fx.band.writes_to(AUTH_CHAR).is_empty());
    assert!(!fx.band.is_connected());
}

#[tokio::test]
async fn test_reauthenticate_requests_fresh_challenge() {
    let fx = connected().await;

    fx.client.reauthenticate().await.unwrap();

    let requests = fx
        .band
        .writes_to(AUTH_CHAR)
        .into_iter()
        .filter(|frame| frame == &[0x02, 0x00])
        .count();
    assert_eq!(requests, 2);
    assert_eq!(fx.client.state(), SessionState::Authenticated);
    assert!(fx.client.get_current_status().await.is_ok());
}

#[tokio::test]
async fn test_reauthenticate_needs_a_session() {
    let fx = fixture().await;
    assert!(matches!(fx.client.reauthenticate().await, Err(BandError::NotAuthenticated)));
}

#[tokio::test]
async fn test_second_connect_replaces_session() {
    let fx = connected().await;

    fx.client.connect(&fx.device, ()).await.unwrap();

    assert_eq!(fx.band.connections(), 2);
    assert_eq!(fx.client.state(), SessionState::Authenticated);
    assert_eq!(fx.client.get_battery_level().await.unwrap().level, 87);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_connect() {
    let fx = fixture().await;
    fx.band.set_auth_behavior(AuthBehavior::Silent);

    let (result, ()) = tokio::join!(fx.client.connect(&fx.device, ()), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        fx.client.disconnect().await;
    });

    assert!(matches!(result, Err(BandError::Transport(_))));
    assert_eq!(fx.client.state(), SessionState::Disconnected);
    assert!(!fx.band.is_connected());
}

#[tokio::test]
async fn test_link_lost_right_after_auth_fails_connect() {
    let fx = fixture().await;
    fx.band.set_auth_behavior(AuthBehavior::DropAfterSuccess);
    let (seen, observer) = recorder();

    let result = fx.client.connect(&fx.device, observer).await;

    assert!(matches!(result, Err(BandError::Transport(_))), "got {result:?}");
    assert_eq!(fx.client.state(), SessionState::Error);
    assert!(matches!(fx.client.get_battery_level().await, Err(BandError::NotAuthenticated)));
    let seen = seen.lock().unwrap();
    assert!(!seen.contains(&SessionState::Authenticated));
    assert_eq!(seen.last(), Some(&SessionState::Error));
}
