//! "Continue on your phone" upload channel.
//!
//! A request yields a single-use token and link (also the QR payload). A poll
//! loop watches the server-side upload count; each strictly larger count
//! raises one `HandoffDetected` signal. Past expiry without an upload the
//! token is marked expired and polling stops.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::clock::Clock;
use crate::session::collaborators::{HandoffApi, HandoffPoll, RemoteUploadStatus};
use crate::session::error::{ProctorError, ProctorResult};
use crate::session::protocol::{HandoffStatus, MobileUploadRequest};
use crate::session::signal::{ServiceSignal, SignalSender};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ().-]*[0-9]$").expect("valid phone regex"));

/// Accept an email address or a phone number of 7 to 15 digits
pub fn validate_contact(contact: &str) -> ProctorResult<String> {
    let contact = contact.trim();
    if EMAIL_RE.is_match(contact) {
        return Ok(contact.to_string());
    }
    if PHONE_RE.is_match(contact) {
        let digits = contact.chars().filter(|c| c.is_ascii_digit()).count();
        if (7..=15).contains(&digits) {
            return Ok(contact.to_string());
        }
    }
    Err(ProctorError::InvalidContact(contact.to_string()))
}

#[derive(Debug, Default)]
struct HandoffState {
    request: Option<MobileUploadRequest>,
    last_seen_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollStep {
    Continue,
    Detected(u32),
    Expired,
    /// Token is past expiry after an upload; nothing more can arrive
    Done,
}

/// Fold one poll result (or a failed poll) into the handoff state
fn apply_poll(state: &mut HandoffState, token: &str, poll: Option<HandoffPoll>, now_ms: i64) -> PollStep {
    let last_seen = state.last_seen_count;
    let Some(request) = state.request.as_mut() else {
        return PollStep::Done;
    };
    if request.token != token || request.status == HandoffStatus::Expired {
        return PollStep::Done;
    }

    if let Some(poll) = poll {
        if poll.upload_count > last_seen {
            request.status = HandoffStatus::Uploaded;
            request.upload_count = poll.upload_count;
            state.last_seen_count = poll.upload_count;
            return PollStep::Detected(poll.upload_count);
        }
    }

    let remote_expired = poll.is_some_and(|p| p.status == RemoteUploadStatus::Expired);
    if now_ms >= request.expires_at_epoch_ms || remote_expired {
        if request.status == HandoffStatus::Uploaded {
            return PollStep::Done;
        }
        request.status = HandoffStatus::Expired;
        return PollStep::Expired;
    }

    PollStep::Continue
}

pub struct MobileHandoff {
    api: Arc<dyn HandoffApi>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    state: Arc<StdMutex<HandoffState>>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl MobileHandoff {
    pub fn new(api: Arc<dyn HandoffApi>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            api,
            clock,
            poll_interval,
            state: Arc::new(StdMutex::new(HandoffState::default())),
            poller: StdMutex::new(None),
        }
    }

    /// Issue a fresh token and start polling for uploads.
    ///
    /// Any pending or expired request is abandoned; the new token is
    /// independent of it. Once an upload has arrived it cannot be replaced.
    pub async fn request(
        &self,
        contact: &str,
        expiry_minutes: u32,
        signals: SignalSender,
    ) -> ProctorResult<MobileUploadRequest> {
        let contact = validate_contact(contact)?;
        if self.status() == HandoffStatus::Uploaded {
            return Err(ProctorError::HandoffAlreadyUploaded);
        }
        self.stop();

        let ticket = self
            .api
            .request(&contact, expiry_minutes)
            .await
            .map_err(|e| ProctorError::Collaborator(format!("handoff request failed: {}", e)))?;

        let request = MobileUploadRequest {
            token: ticket.token.clone(),
            link: ticket.link,
            expires_at_epoch_ms: self.clock.now_ms() + i64::from(expiry_minutes) * 60_000,
            status: HandoffStatus::Requested,
            upload_count: 0,
        };
        {
            let mut state = self.state.lock().unwrap();
            state.request = Some(request.clone());
            state.last_seen_count = 0;
        }

        info!(expiry_minutes, "mobile handoff requested");
        self.spawn_poller(ticket.token, signals);
        Ok(request)
    }

    fn spawn_poller(&self, token: String, signals: SignalSender) {
        let api = Arc::clone(&self.api);
        let clock = Arc::clone(&self.clock);
        let state = Arc::clone(&self.state);
        let period = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let poll = match api.poll_status(&token).await {
                    Ok(poll) => Some(poll),
                    Err(e) => {
                        warn!(error = %e, "handoff poll failed, will retry");
                        None
                    }
                };

                let step = apply_poll(&mut state.lock().unwrap(), &token, poll, clock.now_ms());
                match step {
                    PollStep::Continue => {}
                    PollStep::Detected(upload_count) => {
                        info!(upload_count, "mobile upload detected");
                        let _ = signals.send(ServiceSignal::HandoffDetected { upload_count });
                    }
                    PollStep::Expired => {
                        info!("mobile handoff expired");
                        let _ = signals.send(ServiceSignal::HandoffExpired);
                        break;
                    }
                    PollStep::Done => break,
                }
            }
            debug!("handoff polling finished");
        });

        *self.poller.lock().unwrap() = Some(task);
    }

    /// Stop polling; status is kept. No-op when not polling.
    pub fn stop(&self) {
        if let Some(task) = self.poller.lock().unwrap().take() {
            task.abort();
            debug!("handoff polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn status(&self) -> HandoffStatus {
        self.state
            .lock()
            .unwrap()
            .request
            .as_ref()
            .map_or(HandoffStatus::Idle, |r| r.status)
    }

    pub fn current(&self) -> Option<MobileUploadRequest> {
        self.state.lock().unwrap().request.clone()
    }

    /// Link to encode as a QR code for the active request
    pub fn qr_payload(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .request
            .as_ref()
            .filter(|r| r.status == HandoffStatus::Requested)
            .map(|r| r.link.clone())
    }

    /// Local file picker and document camera are closed once the phone has uploaded
    pub fn local_capture_allowed(&self) -> bool {
        self.status() != HandoffStatus::Uploaded
    }
}

impl Drop for MobileHandoff {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::SystemClock;
    use crate::session::memory::{CallLog, InMemoryHandoff};
    use crate::session::signal::{drain, signal_channel};

    fn handoff(api: Arc<InMemoryHandoff>) -> MobileHandoff {
        MobileHandoff::new(api, Arc::new(SystemClock::new()), Duration::from_secs(30))
    }

    #[test]
    fn test_validate_contact() {
        assert!(validate_contact("student@example.edu").is_ok());
        assert!(validate_contact(" +1 (555) 010-9999 ").is_ok());
        assert!(validate_contact("5550100").is_ok());
        assert!(validate_contact("").is_err());
        assert!(validate_contact("not a contact").is_err());
        assert!(validate_contact("12345").is_err());
        assert!(validate_contact("a@b").is_err());
    }

    #[test]
    fn test_apply_poll_suppresses_duplicates() {
        let mut state = HandoffState {
            request: Some(MobileUploadRequest {
                token: "t".into(),
                link: "l".into(),
                expires_at_epoch_ms: 1_000,
                status: HandoffStatus::Requested,
                upload_count: 0,
            }),
            last_seen_count: 0,
        };
        let uploaded = |count| {
            Some(HandoffPoll {
                status: RemoteUploadStatus::Uploaded,
                upload_count: count,
            })
        };

        assert_eq!(apply_poll(&mut state, "t", uploaded(1), 0), PollStep::Detected(1));
        assert_eq!(apply_poll(&mut state, "t", uploaded(1), 10), PollStep::Continue);
        assert_eq!(apply_poll(&mut state, "t", None, 20), PollStep::Continue);
        assert_eq!(apply_poll(&mut state, "t", uploaded(2), 30), PollStep::Detected(2));
        assert_eq!(apply_poll(&mut state, "other", uploaded(3), 40), PollStep::Done);
        assert_eq!(apply_poll(&mut state, "t", uploaded(2), 2_000), PollStep::Done);
    }

    #[tokio::test]
    async fn test_invalid_contact_never_reaches_collaborator() {
        let log = CallLog::default();
        let api = Arc::new(InMemoryHandoff::new(log.clone()));
        let service = handoff(api);
        let (tx, _rx) = signal_channel();

        let err = service.request("nope", 15, tx).await.unwrap_err();
        assert!(matches!(err, ProctorError::InvalidContact(_)));
        assert!(log.entries().is_empty());
        assert_eq!(service.status(), HandoffStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_counts_detect_once() {
        let api = Arc::new(InMemoryHandoff::new(CallLog::default()));
        let service = handoff(api.clone());
        let (tx, mut rx) = signal_channel();

        let request = service.request("student@example.edu", 15, tx).await.unwrap();
        assert_eq!(service.status(), HandoffStatus::Requested);
        assert_eq!(service.qr_payload(), Some(request.link.clone()));
        assert!(service.local_capture_allowed());

        api.set_upload_count(&request.token, 1);
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(
            drain(&mut rx),
            vec![ServiceSignal::HandoffDetected { upload_count: 1 }]
        );
        assert_eq!(service.status(), HandoffStatus::Uploaded);
        assert!(!service.local_capture_allowed());

        api.set_upload_count(&request.token, 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServiceSignal::HandoffDetected { upload_count: 2 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_halts_polling() {
        let api = Arc::new(InMemoryHandoff::new(CallLog::default()));
        let service = handoff(api.clone());
        let (tx, mut rx) = signal_channel();

        service.request("+15550100999", 1, tx).await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;

        assert_eq!(drain(&mut rx), vec![ServiceSignal::HandoffExpired]);
        assert_eq!(service.status(), HandoffStatus::Expired);
        assert!(!service.is_polling());
        assert_eq!(service.qr_payload(), None);

        let polls = api.poll_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.poll_count(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_keep_polling() {
        let api = Arc::new(InMemoryHandoff::new(CallLog::default()));
        let service = handoff(api.clone());
        let (tx, mut rx) = signal_channel();

        let request = service.request("student@example.edu", 15, tx).await.unwrap();
        api.fail_polls(true);
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(service.is_polling());

        api.fail_polls(false);
        api.set_upload_count(&request.token, 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServiceSignal::HandoffDetected { upload_count: 1 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_request_replaces_old_token() {
        let api = Arc::new(InMemoryHandoff::new(CallLog::default()));
        let service = handoff(api.clone());
        let (tx, mut rx) = signal_channel();

        let first = service.request("student@example.edu", 1, tx.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(service.status(), HandoffStatus::Expired);
        drain(&mut rx);

        let second = service.request("student@example.edu", 15, tx).await.unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(service.status(), HandoffStatus::Requested);

        api.set_upload_count(&first.token, 5);
        api.set_upload_count(&second.token, 1);
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServiceSignal::HandoffDetected { upload_count: 1 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploaded_request_cannot_be_replaced() {
        let log = CallLog::default();
        let api = Arc::new(InMemoryHandoff::new(log.clone()));
        let service = handoff(api.clone());
        let (tx, mut rx) = signal_channel();

        let request = service.request("student@example.edu", 15, tx.clone()).await.unwrap();
        api.set_upload_count(&request.token, 1);
        tokio::time::sleep(Duration::from_secs(35)).await;
        drain(&mut rx);

        let err = service.request("student@example.edu", 15, tx).await.unwrap_err();
        assert_eq!(err, ProctorError::HandoffAlreadyUploaded);
        assert!(err.is_usage_error());
        assert_eq!(service.status(), HandoffStatus::Uploaded);
        assert_eq!(service.current().map(|r| r.token), Some(request.token));
        assert!(!service.local_capture_allowed());
        assert_eq!(api.contacts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let api = Arc::new(InMemoryHandoff::new(CallLog::default()));
        let service = handoff(api.clone());
        let (tx, _rx) = signal_channel();

        service.request("student@example.edu", 15, tx).await.unwrap();
        service.stop();
        service.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.poll_count(), 0);
        assert_eq!(service.status(), HandoffStatus::Requested);
    }
}
