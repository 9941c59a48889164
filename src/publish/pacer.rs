// src/publish/pacer.rs
use rand::Rng;
use std::time::{Duration, Instant};

/// Minimum spacing between consecutive sends on one channel.
/// - First send always goes immediately.
/// - Afterwards each send waits until `delay + random(0..=jitter)` has passed.
/// - State is updated explicitly via `record_send` after a send attempt.
#[derive(Debug, Clone)]
pub struct SendPacer {
    delay: Duration,
    jitter_ms: u64,
    last_send: Option<Instant>,
}

impl SendPacer {
    pub fn new(delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            jitter_ms,
            last_send: None,
        }
    }

    /// How long to wait at `now`, given a chosen `jitter`. Does NOT mutate state.
    pub fn wait_needed(&self, now: Instant, jitter: Duration) -> Duration {
        match self.last_send {
            None => Duration::ZERO,
            Some(ts) => (self.delay + jitter).saturating_sub(now.saturating_duration_since(ts)),
        }
    }

    pub async fn wait(&self) {
        let jitter = if self.jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=self.jitter_ms))
        } else {
            Duration::ZERO
        };
        let d = self.wait_needed(Instant::now(), jitter);
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        self.last_send = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_passes() {
        let p = SendPacer::new(2_000, 0);
        assert_eq!(p.wait_needed(Instant::now(), Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn inside_delay_waits_remaining() {
        let mut p = SendPacer::new(2_000, 0);
        let t0 = Instant::now();
        p.record_send(t0);
        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(p.wait_needed(t1, Duration::ZERO), Duration::from_millis(1_500));
        assert_eq!(
            p.wait_needed(t1, Duration::from_millis(100)),
            Duration::from_millis(1_600)
        );
    }

    #[test]
    fn after_delay_passes() {
        let mut p = SendPacer::new(2_000, 0);
        let t0 = Instant::now();
        p.record_send(t0);
        let later = t0 + Duration::from_millis(2_500);
        assert_eq!(p.wait_needed(later, Duration::ZERO), Duration::ZERO);
    }
}
