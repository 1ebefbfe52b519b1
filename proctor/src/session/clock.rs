//! Wall-clock anchored countdown for an exam attempt.
//!
//! The deadline is derived from an anchor timestamp, never from a running
//! counter, so remaining time stays correct when the hosting process restarts
//! and the anchor is rebuilt from a server-confirmed elapsed time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::session::signal::{ServiceSignal, SignalSender};

/// Countdown tick period
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Clock trait for testable time
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;

    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Real clock: wall-clock at construction, advanced by the tokio monotonic clock.
///
/// Following the runtime's clock keeps it consistent with interval timers,
/// including when tokio time is paused in tests.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    base_epoch_ms: i64,
    base: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base_epoch_ms: Utc::now().timestamp_millis(),
            base: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = tokio::time::Instant::now().duration_since(self.base);
        self.base_epoch_ms + elapsed.as_millis() as i64
    }
}

/// Anchor + duration; all remaining-time math lives here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    anchor_ms: i64,
    duration_seconds: u64,
}

impl Deadline {
    /// Anchor a deadline at `now`, shifted back by time already spent
    pub fn starting_at(now_ms: i64, duration_seconds: u64, previously_elapsed_seconds: u64) -> Self {
        Self {
            anchor_ms: now_ms - (previously_elapsed_seconds as i64) * 1000,
            duration_seconds,
        }
    }

    pub fn from_anchor(anchor_ms: i64, duration_seconds: u64) -> Self {
        Self {
            anchor_ms,
            duration_seconds,
        }
    }

    pub fn anchor_ms(&self) -> i64 {
        self.anchor_ms
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    /// Whole seconds since the anchor, capped at the duration
    pub fn elapsed_seconds(&self, now_ms: i64) -> u64 {
        let elapsed_ms = (now_ms - self.anchor_ms).max(0) as u64;
        (elapsed_ms / 1000).min(self.duration_seconds)
    }

    pub fn remaining_seconds(&self, now_ms: i64) -> u64 {
        self.duration_seconds
            .saturating_sub(self.elapsed_seconds(now_ms))
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.remaining_seconds(now_ms) == 0
    }
}

/// 1 Hz countdown service raising a single `Expired` signal
pub struct DeadlineClock {
    clock: Arc<dyn Clock>,
    deadline: Option<Deadline>,
    expired: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl DeadlineClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            deadline: None,
            expired: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Start counting down. `previously_elapsed_seconds` is non-zero on resume.
    ///
    /// Starting while running replaces the previous countdown.
    pub fn start(
        &mut self,
        duration_seconds: u64,
        previously_elapsed_seconds: u64,
        signals: SignalSender,
    ) -> Deadline {
        let deadline = Deadline::starting_at(
            self.clock.now_ms(),
            duration_seconds,
            previously_elapsed_seconds,
        );
        self.start_with(deadline, signals);
        deadline
    }

    /// Start from an already computed anchor (journal recovery)
    pub fn start_with(&mut self, deadline: Deadline, signals: SignalSender) {
        self.stop();
        self.deadline = Some(deadline);
        self.expired = Arc::new(AtomicBool::new(false));

        let clock = Arc::clone(&self.clock);
        let expired = Arc::clone(&self.expired);
        let period = TICK_PERIOD;

        debug!(
            anchor_ms = deadline.anchor_ms(),
            duration_seconds = deadline.duration_seconds(),
            "deadline clock started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let remaining = deadline.remaining_seconds(clock.now_ms());
                let _ = signals.send(ServiceSignal::Tick {
                    remaining_seconds: remaining,
                });

                if remaining == 0 {
                    if !expired.swap(true, Ordering::SeqCst) {
                        info!("deadline reached");
                        let _ = signals.send(ServiceSignal::Expired);
                    }
                    break;
                }
            }
        }));
    }

    /// Cancel the tick source; no-op when already stopped
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("deadline clock stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn remaining_seconds(&self) -> Option<u64> {
        self.deadline
            .map(|d| d.remaining_seconds(self.clock.now_ms()))
    }

    pub fn elapsed_seconds(&self) -> Option<u64> {
        self.deadline
            .map(|d| d.elapsed_seconds(self.clock.now_ms()))
    }

    pub fn has_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for DeadlineClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::signal::{drain, signal_channel};

    #[test]
    fn test_remaining_counts_down_from_anchor() {
        let deadline = Deadline::starting_at(1_000_000, 60, 0);
        assert_eq!(deadline.remaining_seconds(1_000_000), 60);
        assert_eq!(deadline.remaining_seconds(1_010_500), 50);
        assert_eq!(deadline.remaining_seconds(1_060_000), 0);
        assert_eq!(deadline.remaining_seconds(2_000_000), 0);
    }

    #[test]
    fn test_resume_shifts_anchor_back() {
        let deadline = Deadline::starting_at(1_000_000, 600, 120);
        assert_eq!(deadline.anchor_ms(), 880_000);
        assert_eq!(deadline.elapsed_seconds(1_000_000), 120);
        assert_eq!(deadline.remaining_seconds(1_000_000), 480);
    }

    #[test]
    fn test_clock_skew_before_anchor_is_not_negative() {
        let deadline = Deadline::from_anchor(5_000, 30);
        assert_eq!(deadline.elapsed_seconds(1_000), 0);
        assert_eq!(deadline.remaining_seconds(1_000), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_time() {
        let clock = SystemClock::new();
        let before = clock.now_ms();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms() - before, 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_fires_once() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let mut deadline_clock = DeadlineClock::new(clock);
        let (tx, mut rx) = signal_channel();

        deadline_clock.start(3, 0, tx);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let signals = drain(&mut rx);
        let expired = signals
            .iter()
            .filter(|s| **s == ServiceSignal::Expired)
            .count();
        assert_eq!(expired, 1);
        assert!(deadline_clock.has_expired());
        assert!(!deadline_clock.is_running());
        assert_eq!(
            signals.last(),
            Some(&ServiceSignal::Expired),
            "no ticks after expiry"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_past_deadline_expires_immediately() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let mut deadline_clock = DeadlineClock::new(clock);
        let (tx, mut rx) = signal_channel();

        deadline_clock.start(60, 90, tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let signals = drain(&mut rx);
        assert_eq!(
            signals,
            vec![
                ServiceSignal::Tick {
                    remaining_seconds: 0
                },
                ServiceSignal::Expired
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences_ticks() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let mut deadline_clock = DeadlineClock::new(clock);
        let (tx, mut rx) = signal_channel();

        deadline_clock.start(30, 0, tx);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        deadline_clock.stop();
        deadline_clock.stop();
        drain(&mut rx);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(!deadline_clock.has_expired());
        assert!(!deadline_clock.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_report_remaining() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let mut deadline_clock = DeadlineClock::new(clock);
        let (tx, mut rx) = signal_channel();

        deadline_clock.start(5, 0, tx);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let signals = drain(&mut rx);
        assert_eq!(
            signals,
            vec![
                ServiceSignal::Tick {
                    remaining_seconds: 5
                },
                ServiceSignal::Tick {
                    remaining_seconds: 4
                },
                ServiceSignal::Tick {
                    remaining_seconds: 3
                },
            ]
        );
        assert_eq!(deadline_clock.remaining_seconds(), Some(3));
    }
}
