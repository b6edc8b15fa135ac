//! Minimum spacing between outgoing requests
//!
//! A single-slot token bucket shared by every worker of one client. Each
//! caller reserves the next free slot under a short lock and then sleeps
//! until it, so concurrent callers queue up at `interval` apart instead of
//! all firing once the previous request's delay has elapsed.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Spacing never drops below this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

pub struct RequestSpacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Claim the next send time.
    pub fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock();
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot
    }

    /// Sleep until this caller's slot. Cancel-safe: dropping the future
    /// forfeits the slot.
    pub async fn wait(&self) {
        let slot = self.reserve();
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_request_goes_immediately() {
        let spacer = RequestSpacer::new(Duration::from_secs(1));
        let start = Instant::now();
        spacer.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_reservations_are_spaced() {
        let spacer = RequestSpacer::new(Duration::from_secs(1));
        let start = Instant::now();
        let slots: Vec<Duration> = (0..3).map(|_| spacer.reserve() - start).collect();
        assert_eq!(
            slots,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gap_resets_the_bucket() {
        let spacer = RequestSpacer::new(Duration::from_secs(1));
        spacer.wait().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        let before = Instant::now();
        spacer.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn interval_is_clamped_to_minimum() {
        let spacer = RequestSpacer::new(Duration::from_millis(10));
        assert_eq!(spacer.interval(), MIN_INTERVAL);
    }
}
