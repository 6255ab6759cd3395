// libs/video-session-cell/src/services/quality.rs
//! Connection quality monitor.
//!
//! Samples transport statistics on a fixed interval, turns cumulative
//! counters into per-interval loss and bitrate, scores each sample and maps
//! the score to a [`QualityLevel`]. A level change is only reported once the
//! same level has been observed on two consecutive samples, so a single
//! noisy reading never flips the indicator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::TransportSession;
use crate::error::VideoSessionError;
use crate::events::{EventSink, SessionEvent};
use crate::models::{
    QualityLevel, QualitySample, Session, SessionConfig, SessionState, TransportStats,
};

// Sub-score bounds: at or below `good` scores 100, at or above `bad` scores 0.
const RTT_GOOD_MS: f64 = 100.0;
const RTT_BAD_MS: f64 = 500.0;
const LOSS_GOOD: f64 = 0.005;
const LOSS_BAD: f64 = 0.10;
const JITTER_GOOD_MS: f64 = 10.0;
const JITTER_BAD_MS: f64 = 100.0;

const RTT_WEIGHT: f64 = 0.4;
const LOSS_WEIGHT: f64 = 0.4;
const JITTER_WEIGHT: f64 = 0.2;

const EXCELLENT_SCORE: f64 = 80.0;
const GOOD_SCORE: f64 = 60.0;
const FAIR_SCORE: f64 = 40.0;

/// Consecutive identical classifications needed before a change is reported.
const CONFIRMATIONS: u32 = 2;

fn sub_score(value: f64, good: f64, bad: f64) -> f64 {
    if value <= good {
        100.0
    } else if value >= bad {
        0.0
    } else {
        100.0 * (bad - value) / (bad - good)
    }
}

/// Weighted 0-100 score of one sample.
pub fn quality_score(sample: &QualitySample) -> f64 {
    RTT_WEIGHT * sub_score(sample.round_trip_time_ms, RTT_GOOD_MS, RTT_BAD_MS)
        + LOSS_WEIGHT * sub_score(sample.packet_loss_ratio, LOSS_GOOD, LOSS_BAD)
        + JITTER_WEIGHT * sub_score(sample.jitter_ms, JITTER_GOOD_MS, JITTER_BAD_MS)
}

pub fn classify(sample: &QualitySample) -> QualityLevel {
    let score = quality_score(sample);
    if score >= EXCELLENT_SCORE {
        QualityLevel::Excellent
    } else if score >= GOOD_SCORE {
        QualityLevel::Good
    } else if score >= FAIR_SCORE {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

/// Turn a cumulative stats snapshot into a per-interval sample. Counters that
/// went backwards (transport restarted) are treated as a fresh baseline.
pub fn derive_sample(previous: Option<&TransportStats>, current: &TransportStats) -> QualitySample {
    let delta = previous.filter(|p| {
        current.packets_received >= p.packets_received
            && current.packets_lost >= p.packets_lost
            && current.timestamp > p.timestamp
    });

    let (received, lost, bytes, seconds) = match delta {
        Some(p) => (
            current.packets_received - p.packets_received,
            current.packets_lost - p.packets_lost,
            current.bytes_received.saturating_sub(p.bytes_received),
            (current.timestamp - p.timestamp).num_milliseconds() as f64 / 1000.0,
        ),
        None => (current.packets_received, current.packets_lost, 0, 0.0),
    };

    let total = received + lost;
    let packet_loss_ratio = if total > 0 {
        lost as f64 / total as f64
    } else {
        0.0
    };
    let bitrate_kbps = if seconds > 0.0 {
        bytes as f64 * 8.0 / seconds / 1000.0
    } else {
        0.0
    };

    QualitySample {
        timestamp: current.timestamp,
        round_trip_time_ms: current.round_trip_time_ms,
        packet_loss_ratio,
        jitter_ms: current.jitter_ms,
        bitrate_kbps,
    }
}

#[derive(Debug, Default)]
struct Hysteresis {
    confirmed: QualityLevel,
    pending: Option<(QualityLevel, u32)>,
}

impl Hysteresis {
    /// Feed one classification; returns the new level when a change is confirmed.
    fn observe(&mut self, level: QualityLevel) -> Option<QualityLevel> {
        if level == self.confirmed {
            self.pending = None;
            return None;
        }

        let count = match self.pending {
            Some((pending, count)) if pending == level => count + 1,
            _ => 1,
        };

        if count >= CONFIRMATIONS {
            self.confirmed = level;
            self.pending = None;
            Some(level)
        } else {
            self.pending = Some((level, count));
            None
        }
    }
}

#[derive(Default)]
struct MonitorState {
    running: bool,
    generation: u64,
    session_id: Option<Uuid>,
    hysteresis: Hysteresis,
    window: VecDeque<QualitySample>,
    previous_stats: Option<TransportStats>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

pub struct ConnectionQualityMonitor {
    interval: Duration,
    window_size: usize,
    events: EventSink,
    state: Arc<Mutex<MonitorState>>,
}

impl ConnectionQualityMonitor {
    pub fn new(config: &SessionConfig, events: EventSink) -> Self {
        Self {
            interval: config.quality_sample_interval,
            window_size: config.quality_window_size,
            events,
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin sampling `transport` for `session`, which must be connected.
    pub fn start(
        &self,
        session: &Session,
        transport: Arc<dyn TransportSession>,
    ) -> Result<(), VideoSessionError> {
        if session.state != SessionState::Connected {
            return Err(VideoSessionError::InvalidSessionState {
                state: session.state,
            });
        }

        let mut state = self.lock();
        if state.running {
            debug!("Quality monitor already running for session {:?}", state.session_id);
            return Ok(());
        }

        state.generation += 1;
        state.running = true;
        state.session_id = Some(session.id);
        state.hysteresis = Hysteresis::default();
        state.window.clear();
        state.previous_stats = None;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sampling_loop(
            Arc::clone(&self.state),
            state.generation,
            cancel.clone(),
            transport,
            self.events.clone(),
            self.interval,
            self.window_size,
        ));
        state.cancel = Some(cancel);
        state.task = Some(task);

        info!(
            "Quality monitor started for session {} every {:?}",
            session.id, self.interval
        );
        Ok(())
    }

    /// Halt sampling. A confirmed level is reset with one final
    /// `QualityChanged(Unknown)`; after that nothing is emitted, including for
    /// a sample that was in flight. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        let reset = if state.hysteresis.confirmed != QualityLevel::Unknown {
            state.window.back().cloned()
        } else {
            None
        };

        state.running = false;
        state.generation += 1;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.hysteresis = Hysteresis::default();
        state.previous_stats = None;
        state.window.clear();
        let session_id = state.session_id.take();
        drop(state);

        info!("Quality monitor stopped for session {:?}", session_id);
        if let Some(sample) = reset {
            self.events.emit(SessionEvent::QualityChanged {
                level: QualityLevel::Unknown,
                sample,
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Confirmed level; `Unknown` before the first confirmed change and after stop.
    pub fn level(&self) -> QualityLevel {
        let state = self.lock();
        if state.running {
            state.hysteresis.confirmed
        } else {
            QualityLevel::Unknown
        }
    }

    pub fn recent_samples(&self) -> Vec<QualitySample> {
        self.lock().window.iter().cloned().collect()
    }

    /// Average of the rolling window.
    pub fn trend(&self) -> Option<QualitySample> {
        let state = self.lock();
        let latest = state.window.back()?;
        let n = state.window.len() as f64;

        let sum = state.window.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, s| {
            (
                acc.0 + s.round_trip_time_ms,
                acc.1 + s.packet_loss_ratio,
                acc.2 + s.jitter_ms,
                acc.3 + s.bitrate_kbps,
            )
        });

        Some(QualitySample {
            timestamp: latest.timestamp,
            round_trip_time_ms: sum.0 / n,
            packet_loss_ratio: sum.1 / n,
            jitter_ms: sum.2 / n,
            bitrate_kbps: sum.3 / n,
        })
    }
}

impl Drop for ConnectionQualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sampling_loop(
    state: Arc<Mutex<MonitorState>>,
    generation: u64,
    cancel: CancellationToken,
    transport: Arc<dyn TransportSession>,
    events: EventSink,
    period: Duration,
    window_size: usize,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stats = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            stats = transport.stats() => stats,
        };

        match stats {
            Ok(stats) => record_stats(&state, generation, stats, &events, window_size),
            Err(e) => warn!("Failed to read transport stats: {}", e),
        }
    }

    debug!("Quality sampling loop {} exited", generation);
}

fn record_stats(
    state: &Mutex<MonitorState>,
    generation: u64,
    stats: TransportStats,
    events: &EventSink,
    window_size: usize,
) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    // A stop (or restart) happened while this sample was in flight.
    if !state.running || state.generation != generation {
        return;
    }

    let sample = derive_sample(state.previous_stats.as_ref(), &stats);
    state.previous_stats = Some(stats);

    state.window.push_back(sample.clone());
    while state.window.len() > window_size {
        state.window.pop_front();
    }

    let level = classify(&sample);
    debug!(
        "Quality sample rtt={:.0}ms loss={:.3} jitter={:.0}ms -> {}",
        sample.round_trip_time_ms, sample.packet_loss_ratio, sample.jitter_ms, level
    );

    if let Some(level) = state.hysteresis.observe(level) {
        info!("Connection quality changed to {}", level);
        events.emit(SessionEvent::QualityChanged { level, sample });
    }
}
