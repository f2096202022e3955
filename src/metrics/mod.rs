//! Session-level aggregates.
//!
//! A small windowed collector fed by the event stream: request counts,
//! challenge outcomes, and latency percentiles. This is the data a session
//! snapshot exports; anything fancier (Prometheus, Influx) subscribes to the
//! events itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::events::{Event, EventSubscriber};

const LATENCY_WINDOW: usize = 128;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub responses_2xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
    pub challenges_detected: u64,
    pub challenges_solved: u64,
    pub challenges_failed: u64,
    #[serde(with = "serde_millis")]
    pub average_latency: Option<Duration>,
    #[serde(with = "serde_millis")]
    pub p95_latency: Option<Duration>,
    #[serde(with = "serde_millis")]
    pub average_solve_time: Option<Duration>,
}

mod serde_millis {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_millis()),
            None => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    requests: u64,
    responses_2xx: u64,
    responses_4xx: u64,
    responses_5xx: u64,
    challenges_detected: u64,
    challenges_solved: u64,
    challenges_failed: u64,
    latencies: VecDeque<Duration>,
    solve_times: VecDeque<Duration>,
}

impl MetricsState {
    fn push_window(window: &mut VecDeque<Duration>, value: Duration) {
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
    }

    fn latency_stats(window: &VecDeque<Duration>) -> (Option<Duration>, Option<Duration>) {
        if window.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<Duration> = window.iter().copied().collect();
        samples.sort_unstable();
        let avg_secs =
            samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (
            Some(Duration::from_secs_f64(avg_secs)),
            Some(samples[p95_index]),
        )
    }
}

/// Thread-safe recorder; register it on the event bus.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    state: Arc<Mutex<MetricsState>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().expect("metrics lock poisoned");
        let (average_latency, p95_latency) = MetricsState::latency_stats(&state.latencies);
        let (average_solve_time, _) = MetricsState::latency_stats(&state.solve_times);
        MetricsSnapshot {
            requests: state.requests,
            responses_2xx: state.responses_2xx,
            responses_4xx: state.responses_4xx,
            responses_5xx: state.responses_5xx,
            challenges_detected: state.challenges_detected,
            challenges_solved: state.challenges_solved,
            challenges_failed: state.challenges_failed,
            average_latency,
            p95_latency,
            average_solve_time,
        }
    }
}

impl EventSubscriber for MetricsRecorder {
    fn publish(&self, event: &Event) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        match event {
            Event::RequestStarted { .. } => state.requests += 1,
            Event::RequestCompleted { status, timing, .. } => {
                match status {
                    200..=299 => state.responses_2xx += 1,
                    400..=499 => state.responses_4xx += 1,
                    500..=599 => state.responses_5xx += 1,
                    _ => {}
                }
                MetricsState::push_window(&mut state.latencies, timing.total);
            }
            Event::ChallengeDetected { .. } => state.challenges_detected += 1,
            Event::ChallengeSolved { duration, .. } => {
                state.challenges_solved += 1;
                MetricsState::push_window(&mut state.solve_times, *duration);
            }
            Event::ChallengeFailed { .. } => state.challenges_failed += 1,
            Event::RateLimitAdjusted { .. } => {}
        }
    }
}
