//! Test utilities for timer-driven session tests
//!
//! Timeouts are measured on the tokio clock, so these helpers behave the same
//! whether or not the test runs with paused time.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::session::protocol::SessionEvent;

/// Assert that an async condition eventually becomes true within a timeout.
///
/// Retries `f` every `interval` until it returns `Ok`, panicking with the
/// last error once `timeout` has passed.
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, e
                    );
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Wait for the first event matching `pred`, skipping everything before it
pub async fn expect_event<F>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    desc: &str,
    timeout: Duration,
    mut pred: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                panic!("Event stream closed while waiting for {}", desc)
            }
            Err(_) => panic!("Timeout waiting for {} after {:?}", desc, timeout),
        }
    }
}

/// Everything already queued on the receiver
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_assert_eventually_succeeds_immediately() {
        let value = assert_eventually(
            "immediate success",
            Duration::from_secs(1),
            Duration::from_millis(50),
            || async { Ok::<_, &str>(42) },
        )
        .await;
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_succeeds_after_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = assert_eventually(
            "counter to reach 3",
            Duration::from_secs(2),
            Duration::from_millis(50),
            move || {
                let c = Arc::clone(&counter_clone);
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    if val >= 2 {
                        Ok(val)
                    } else {
                        Err(format!("counter only at {}", val))
                    }
                }
            },
        )
        .await;

        assert!(result >= 2);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "Timeout waiting for never succeeds")]
    async fn test_assert_eventually_times_out_on_paused_clock() {
        assert_eventually(
            "never succeeds",
            Duration::from_millis(200),
            Duration::from_millis(50),
            || async { Err::<(), _>("always fails") },
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_event_skips_unrelated() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionEvent::Tick {
            remaining_seconds: 9,
        })
        .unwrap();
        tx.send(SessionEvent::TimeExpired).unwrap();

        let event = expect_event(&mut rx, "expiry", Duration::from_secs(1), |e| {
            *e == SessionEvent::TimeExpired
        })
        .await;
        assert_eq!(event, SessionEvent::TimeExpired);
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "Timeout waiting for submission")]
    async fn test_expect_event_times_out() {
        let (_tx, mut rx) = broadcast::channel::<SessionEvent>(8);
        expect_event(&mut rx, "submission", Duration::from_secs(5), |_| true).await;
    }
}
