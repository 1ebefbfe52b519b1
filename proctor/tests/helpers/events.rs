use exam_proctor_lib::session::protocol::SessionEvent;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::Instant;

/// Error returned when an expected session event never arrives.
#[derive(Debug)]
pub struct WaitError {
    desc: String,
    waited: Duration,
    seen: Vec<SessionEvent>,
    closed: bool,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Gave up after {:?} waiting for {}{}. Events seen: {:?}",
            self.waited,
            self.desc,
            if self.closed { " (stream closed)" } else { "" },
            self.seen
                .iter()
                .filter(|e| !matches!(e, SessionEvent::Tick { .. }))
                .collect::<Vec<_>>()
        )
    }
}

impl std::error::Error for WaitError {}

fn wait_error(desc: &str, start: Instant, seen: Vec<SessionEvent>, closed: bool) -> WaitError {
    WaitError {
        desc: desc.to_string(),
        waited: start.elapsed(),
        seen,
        closed,
    }
}

/// Receive events until one matches `predicate`.
///
/// Timeouts run on the tokio clock, so paused-time tests advance through them.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    desc: &str,
    timeout: Duration,
    predicate: F,
) -> Result<SessionEvent, WaitError>
where
    F: Fn(&SessionEvent) -> bool,
{
    let start = Instant::now();
    let mut seen = Vec::new();

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if predicate(&event) {
                    return Ok(event);
                }
                seen.push(event);
            }
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => return Err(wait_error(desc, start, seen, true)),
            Err(_) => return Err(wait_error(desc, start, seen, false)),
        }
    }
}

/// Events already delivered to this receiver, ticks excluded
pub fn drain_non_tick(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(SessionEvent::Tick { .. }) => {}
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

pub fn is_submitted(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Submitted { .. })
}
