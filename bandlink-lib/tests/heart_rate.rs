//! Single and continuous heart-rate measurement

mod common;

use bandlink_lib::codec::HeartRateControl;
use common::*;
use tokio::sync::mpsc;

fn control_writes(band: &SimulatedBand) -> Vec<HeartRateControl> {
    band.writes_to(HR_CONTROL_CHAR)
        .iter()
        .map(|frame| HeartRateControl::decode(frame).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_single_measurement_settles() {
    let fx = connected().await;
    fx.band.set_heart_rate_script(vec![0, 70, 72, 71], Duration::from_secs(1));
    let mut progress = Vec::new();

    let reading = fx
        .client
        .measure_heart_rate_once(|reading| progress.push(reading.bpm))
        .await
        .unwrap();

    assert_eq!(reading.bpm, 71);
    assert_eq!(progress, vec![0, 70, 72]);
    assert_eq!(
        control_writes(&fx.band),
        vec![
            HeartRateControl::ContinuousOff,
            HeartRateControl::Stop,
            HeartRateControl::Ping
        ]
    );
    // notifications are switched off again
    assert!(!fx.band.emit_heart_rate(80));
    assert_eq!(fx.client.state(), SessionState::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_single_measurement_times_out() {
    let fx = connected().await;
    let started = tokio::time::Instant::now();

    let result = fx.client.measure_heart_rate_once(|_| {}).await;

    match result {
        Err(BandError::MeasurementTimeout(limit)) => assert_eq!(limit, Duration::from_secs(30)),
        other => panic!("expected a measurement timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(30));
    // the measurement was aborted on the band
    assert_eq!(control_writes(&fx.band).last(), Some(&HeartRateControl::Stop));
    assert_eq!(fx.client.state(), SessionState::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_unsteady_readings_time_out() {
    let fx = connected().await;
    fx.band.set_heart_rate_script(vec![60, 90, 60, 90, 60, 90], Duration::from_secs(1));
    let mut progress = 0;

    let result = fx.client.measure_heart_rate_once(|_| progress += 1).await;

    assert!(matches!(result, Err(BandError::MeasurementTimeout(_))));
    assert_eq!(progress, 6);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_skipped() {
    let fx = connected().await;
    let mut progress = Vec::new();

    let (result, ()) = tokio::join!(
        fx.client.measure_heart_rate_once(|reading| progress.push(reading.bpm)),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(fx.band.emit_raw(HR_MEASUREMENT_CHAR, &[0x00, 0x48, 0x00]));
            assert!(fx.band.emit_raw(HR_MEASUREMENT_CHAR, &[0x00, 0xFF]));
            for bpm in [70, 71, 70] {
                tokio::time::sleep(Duration::from_secs(1)).await;
                fx.band.emit_heart_rate(bpm);
            }
        }
    );

    assert_eq!(result.unwrap().bpm, 70);
    assert_eq!(progress, vec![70, 71]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_during_measurement() {
    let fx = connected().await;
    fx.band.set_heart_rate_script(vec![0], Duration::from_secs(1));

    let (result, ()) = tokio::join!(fx.client.measure_heart_rate_once(|_| {}), async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        fx.band.drop_link("band out of range");
    });

    assert!(matches!(result, Err(BandError::Transport(_))));
    assert_eq!(fx.client.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_stream_stops_cleanly() {
    let fx = connected().await;
    fx.band.set_heart_rate_script(vec![72, 75, 74], Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let monitor = fx
        .client
        .start_continuous_heart_rate(move |reading| {
            let _ = tx.send(reading.bpm);
        })
        .await
        .unwrap();
    assert!(fx.band.state().continuous_heart_rate);

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(rx.recv().await.unwrap());
    }
    monitor.stop().await.unwrap();
    assert!(monitor.is_stopped());
    // a late frame the band still had queued reaches the host anyway
    assert!(fx.band.emit_stray(HR_MEASUREMENT_CHAR, &[0x00, 80]));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(seen, vec![72, 75, 74]);
    assert!(rx.try_recv().is_err());
    assert!(!fx.band.state().continuous_heart_rate);
    assert_eq!(
        control_writes(&fx.band),
        vec![HeartRateControl::ContinuousOn, HeartRateControl::ContinuousOff]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let fx = connected().await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();

    monitor.stop().await.unwrap();
    monitor.stop().await.unwrap();

    let offs = control_writes(&fx.band)
        .into_iter()
        .filter(|command| *command == HeartRateControl::ContinuousOff)
        .count();
    assert_eq!(offs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_while_streaming() {
    let fx = connected().await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fx.band.state().keepalives, 2);

    monitor.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fx.band.state().keepalives, 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_monitor_ends_keepalive() {
    let fx = connected().await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();

    drop(monitor);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(fx.band.state().keepalives, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_link_loss() {
    let fx = connected().await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();

    fx.band.drop_link("band out of range");
    let mut state = fx.client.subscribe_state();
    state.wait_for(|state| *state == SessionState::Error).await.unwrap();

    monitor.stop().await.unwrap();
    assert_eq!(control_writes(&fx.band), vec![HeartRateControl::ContinuousOn]);
}

#[tokio::test]
async fn test_heart_rate_needs_authentication() {
    let fx = fixture().await;
    assert!(matches!(
        fx.client.measure_heart_rate_once(|_| {}).await,
        Err(BandError::NotAuthenticated)
    ));
    assert!(matches!(
        fx.client.start_continuous_heart_rate(|_| {}).await,
        Err(BandError::NotAuthenticated)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_frame_in_flight_at_stop_is_not_delivered() {
    let fx = connected().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = fx
        .client
        .start_continuous_heart_rate(move |reading| {
            let _ = tx.send(reading.bpm);
        })
        .await
        .unwrap();

    assert!(fx.band.emit_heart_rate(72));
    assert_eq!(rx.recv().await, Some(72));

    // queued on the link but not yet handed to the host
    assert!(fx.band.emit_heart_rate(75));
    monitor.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_zero_keepalive_interval_is_refused() {
    let band = SimulatedBand::new(address(), &key());
    let config = BandConfig {
        keepalive_interval: Duration::ZERO,
        ..BandConfig::default()
    };

    let result = BandClient::new(band, Arc::new(MemoryRegistry::new()), config);

    assert!(matches!(result, Err(BandError::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn test_short_keepalive_interval_pings() {
    let fx = connected_with(BandConfig {
        keepalive_interval: Duration::from_secs(1),
        ..BandConfig::default()
    })
    .await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    monitor.stop().await.unwrap();

    assert_eq!(fx.band.state().keepalives, 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_measurement_refused_while_streaming() {
    let fx = connected().await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();

    let result = fx.client.measure_heart_rate_once(|_| {}).await;

    assert!(matches!(result, Err(BandError::InvalidArgument(_))));
    assert!(fx.band.state().continuous_heart_rate);
    assert_eq!(control_writes(&fx.band), vec![HeartRateControl::ContinuousOn]);
    assert!(matches!(
        fx.client.start_continuous_heart_rate(|_| {}).await,
        Err(BandError::InvalidArgument(_))
    ));

    monitor.stop().await.unwrap();
    fx.band.set_heart_rate_script(vec![70, 70, 70], Duration::from_secs(1));
    assert_eq!(fx.client.measure_heart_rate_once(|_| {}).await.unwrap().bpm, 70);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_monitor_releases_heart_rate() {
    let fx = connected().await;
    let monitor = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();
    drop(monitor);

    let again = fx.client.start_continuous_heart_rate(|_| {}).await.unwrap();
    again.stop().await.unwrap();
}
