// Internal signals from sub-services to the session controller
//
// Every periodic service (deadline ticks, camera capture, handoff polling)
// reports through one unbounded channel so the controller applies all
// transitions from a single task.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSignal {
    /// Countdown tick
    Tick { remaining_seconds: u64 },
    /// Countdown reached zero (sent once per deadline)
    Expired,
    /// Violation threshold reached (sent once per session)
    Escalate,
    /// Camera monitoring lost its stream but the session continues
    CameraDegraded { reason: String },
    /// Handoff poll saw a new upload count
    HandoffDetected { upload_count: u32 },
    /// Handoff token expired without upload
    HandoffExpired,
    /// Stop the controller's signal pump
    Shutdown,
}

pub type SignalSender = mpsc::UnboundedSender<ServiceSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<ServiceSignal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Drain everything currently queued without waiting
#[cfg(test)]
pub(crate) fn drain(rx: &mut SignalReceiver) -> Vec<ServiceSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}
