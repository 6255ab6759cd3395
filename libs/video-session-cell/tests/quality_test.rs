// =====================================================================================
// CONNECTION QUALITY MONITOR TESTS
// Sampling cadence, hysteresis, rolling window, stop semantics
// =====================================================================================

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use uuid::Uuid;

use video_session_cell::capabilities::{TransportFactory, TransportSession};
use video_session_cell::events::{self, EventStream};
use video_session_cell::testing::{stats_sequence, FakeTransport, FakeTransportFactory};
use video_session_cell::{
    ConnectionQualityMonitor, Participant, ParticipantType, QualityLevel, Session, SessionConfig,
    SessionEvent, SessionState, VideoSessionError,
};

const INTERVAL: Duration = Duration::from_secs(1);
const POOR: (f64, f64, f64) = (600.0, 0.20, 150.0);
const GOOD: (f64, f64, f64) = (50.0, 0.0, 5.0);

fn config() -> SessionConfig {
    SessionConfig {
        quality_sample_interval: INTERVAL,
        quality_window_size: 5,
        ..SessionConfig::default()
    }
}

fn connected_session() -> Session {
    let mut session = Session::new(Participant::new(Uuid::new_v4(), ParticipantType::Doctor));
    session.state = SessionState::Connected;
    session
}

async fn transport(
    readings: &[(f64, f64, f64)],
) -> (Arc<dyn TransportSession>, Arc<FakeTransport>) {
    let factory = FakeTransportFactory::new().with_stats(stats_sequence(readings, INTERVAL));
    let connection = factory.connect(Uuid::new_v4()).await.unwrap();
    let fake = factory.last_transport().unwrap();
    (connection.session, fake)
}

fn monitor() -> (ConnectionQualityMonitor, EventStream) {
    let (sink, events) = events::channel();
    (ConnectionQualityMonitor::new(&config(), sink), events)
}

fn quality_changes(events: &mut EventStream) -> Vec<QualityLevel> {
    events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::QualityChanged { level, .. } => Some(level),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_requires_a_connected_session() {
    let (monitor, _events) = monitor();
    let (transport, fake) = transport(&[GOOD]).await;
    let mut session = connected_session();

    for state in [SessionState::Connecting, SessionState::Reconnecting, SessionState::Ended] {
        session.state = state;
        assert_matches!(
            monitor.start(&session, transport.clone()),
            Err(VideoSessionError::InvalidSessionState { .. })
        );
    }
    assert!(!monitor.is_running());
    assert_eq!(fake.ledger().stats_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_level_is_unknown_until_confirmed() {
    let (monitor, mut events) = monitor();
    let (transport, _fake) = transport(&[GOOD, GOOD]).await;
    assert_eq!(monitor.level(), QualityLevel::Unknown);

    assert_ok!(monitor.start(&connected_session(), transport));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(monitor.level(), QualityLevel::Unknown);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.level(), QualityLevel::Excellent);
    assert_eq!(quality_changes(&mut events), vec![QualityLevel::Excellent]);
}

#[tokio::test(start_paused = true)]
async fn test_single_good_reading_does_not_flip_a_poor_connection() {
    let (monitor, mut events) = monitor();
    let (transport, fake) = transport(&[POOR, POOR, GOOD]).await;

    assert_ok!(monitor.start(&connected_session(), transport));
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert_eq!(quality_changes(&mut events), vec![QualityLevel::Poor]);
    assert_eq!(monitor.level(), QualityLevel::Poor);
    assert_eq!(fake.ledger().stats_requests, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_resets_the_level_then_goes_quiet() {
    let (monitor, mut events) = monitor();
    let (transport, fake) = transport(&[POOR, POOR, GOOD, GOOD, GOOD]).await;

    assert_ok!(monitor.start(&connected_session(), transport));
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    monitor.stop();
    monitor.stop();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(
        quality_changes(&mut events),
        vec![QualityLevel::Poor, QualityLevel::Unknown]
    );
    assert_eq!(fake.ledger().stats_requests, 2);
    assert!(!monitor.is_running());
    assert_eq!(monitor.level(), QualityLevel::Unknown);
    assert!(monitor.recent_samples().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_any_confirmed_level_emits_nothing() {
    let (monitor, mut events) = monitor();
    let (transport, _fake) = transport(&[POOR, POOR]).await;

    assert_ok!(monitor.start(&connected_session(), transport));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    monitor.stop();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(quality_changes(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_start_keeps_one_sampling_loop() {
    let (monitor, _events) = monitor();
    let (transport, fake) = transport(&[GOOD, GOOD]).await;
    let session = connected_session();

    assert_ok!(monitor.start(&session, transport.clone()));
    assert_ok!(monitor.start(&session, transport));
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(fake.ledger().stats_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_keeps_the_most_recent_samples() {
    let (monitor, mut events) = monitor();
    let readings: Vec<(f64, f64, f64)> = (1..=8).map(|i| (i as f64 * 10.0, 0.0, 5.0)).collect();
    let (transport, _fake) = transport(&readings).await;

    assert_ok!(monitor.start(&connected_session(), transport));
    tokio::time::sleep(Duration::from_millis(8_500)).await;

    let samples = monitor.recent_samples();
    assert_eq!(samples.len(), 5);
    assert_eq!(samples[0].round_trip_time_ms, 40.0);
    assert_eq!(samples[4].round_trip_time_ms, 80.0);

    let trend = monitor.trend().unwrap();
    assert!((trend.round_trip_time_ms - 60.0).abs() < 1e-9);
    assert_eq!(trend.packet_loss_ratio, 0.0);
    // 250 kB per one-second interval after the baseline sample.
    assert!((trend.bitrate_kbps - 2_000.0).abs() < 1e-6);

    assert_eq!(quality_changes(&mut events), vec![QualityLevel::Excellent]);
}

#[tokio::test(start_paused = true)]
async fn test_stats_errors_are_skipped() {
    let (monitor, mut events) = monitor();
    let (transport, fake) = transport(&[]).await;

    assert_ok!(monitor.start(&connected_session(), transport));
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert!(monitor.is_running());
    assert_eq!(fake.ledger().stats_requests, 2);
    assert!(monitor.recent_samples().is_empty());
    assert!(quality_changes(&mut events).is_empty());
}
