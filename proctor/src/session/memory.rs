//! In-memory collaborators.
//!
//! Every trait in `collaborators` has an implementation here that records its
//! calls and can be told to fail. Tests and the `proctor-sim` binary run the
//! whole session core against these.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::session::capture::PageBlob;
use crate::session::collaborators::{
    ArtifactApi, CameraFacing, Collaborators, DisplayHost, FilePicker, HandoffApi, HandoffPoll,
    HandoffTicket, MediaDevices, MediaStream, MonitoringApi, MonitoringSettings,
    RemoteUploadStatus, SessionApi, StartResponse, SubmitResponse,
};
use crate::session::protocol::{ArtifactRef, MonitoringFrame, SubmitPayload, Violation};

/// Shared, ordered record of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<StdMutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct InMemorySessionApi {
    log: CallLog,
    start_response: StdMutex<StartResponse>,
    submissions: StdMutex<Vec<(String, SubmitPayload)>>,
    failing_submits: AtomicUsize,
    reject_submits: AtomicBool,
    submit_delay: StdMutex<Duration>,
}

impl InMemorySessionApi {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            start_response: StdMutex::new(StartResponse {
                accepted: true,
                resume_state: None,
                message: None,
            }),
            submissions: StdMutex::new(Vec::new()),
            failing_submits: AtomicUsize::new(0),
            reject_submits: AtomicBool::new(false),
            submit_delay: StdMutex::new(Duration::ZERO),
        }
    }

    pub fn set_start_response(&self, response: StartResponse) {
        *self.start_response.lock().unwrap() = response;
    }

    /// The next `n` submits fail with a transport error
    pub fn fail_next_submits(&self, n: usize) {
        self.failing_submits.store(n, Ordering::SeqCst);
    }

    /// Submits answer `accepted: false` until turned off
    pub fn reject_submits(&self, reject: bool) {
        self.reject_submits.store(reject, Ordering::SeqCst);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn submissions(&self) -> Vec<(String, SubmitPayload)> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn last_payload(&self) -> Option<SubmitPayload> {
        self.submissions.lock().unwrap().last().map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl SessionApi for InMemorySessionApi {
    async fn start(&self, test_id: &str) -> Result<StartResponse> {
        self.log.record(format!("session.start:{}", test_id));
        Ok(self.start_response.lock().unwrap().clone())
    }

    async fn submit(&self, test_id: &str, payload: &SubmitPayload) -> Result<SubmitResponse> {
        self.log.record("session.submit");
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing_submits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_submits.store(failing - 1, Ordering::SeqCst);
            return Err(anyhow!("submission endpoint unreachable"));
        }
        if self.reject_submits.load(Ordering::SeqCst) {
            return Ok(SubmitResponse {
                accepted: false,
                result_ref: None,
            });
        }

        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((test_id.to_string(), payload.clone()));
        Ok(SubmitResponse {
            accepted: true,
            result_ref: Some(format!("result-{}", submissions.len())),
        })
    }
}

// ============================================================================
// Monitoring
// ============================================================================

#[derive(Default)]
pub struct InMemoryMonitoring {
    next_session: AtomicU64,
    fail_start: AtomicBool,
    fail_frames: AtomicBool,
    fail_violations: AtomicBool,
    frame_delay: StdMutex<Duration>,
    late_frames: AtomicUsize,
    started: StdMutex<Vec<(String, MonitoringSettings)>>,
    frames: StdMutex<Vec<(String, MonitoringFrame)>>,
    violations: StdMutex<Vec<Violation>>,
    ended: StdMutex<Vec<String>>,
}

impl InMemoryMonitoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_frame_pushes(&self, fail: bool) {
        self.fail_frames.store(fail, Ordering::SeqCst);
    }

    pub fn fail_violation_pushes(&self, fail: bool) {
        self.fail_violations.store(fail, Ordering::SeqCst);
    }

    /// Slow frame ingest down by `delay` per push
    pub fn set_frame_delay(&self, delay: Duration) {
        *self.frame_delay.lock().unwrap() = delay;
    }

    /// Frames that arrived for a session that had already ended
    pub fn late_frames(&self) -> usize {
        self.late_frames.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<(String, MonitoringSettings)> {
        self.started.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<MonitoringFrame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().unwrap().clone()
    }

    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitoringApi for InMemoryMonitoring {
    async fn start(&self, test_id: &str, settings: &MonitoringSettings) -> Result<String> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("monitoring service unavailable"));
        }
        self.started
            .lock()
            .unwrap()
            .push((test_id.to_string(), settings.clone()));
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mon-{}", n))
    }

    async fn push_frame(&self, session_id: &str, frame: &MonitoringFrame) -> Result<()> {
        let delay = *self.frame_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_frames.load(Ordering::SeqCst) {
            return Err(anyhow!("frame ingest unavailable"));
        }
        if self.ended.lock().unwrap().iter().any(|id| id == session_id) {
            self.late_frames.fetch_add(1, Ordering::SeqCst);
        }
        self.frames
            .lock()
            .unwrap()
            .push((session_id.to_string(), frame.clone()));
        Ok(())
    }

    async fn push_violation(&self, _session_id: &str, violation: &Violation) -> Result<()> {
        if self.fail_violations.load(Ordering::SeqCst) {
            return Err(anyhow!("audit ingest unavailable"));
        }
        self.violations.lock().unwrap().push(violation.clone());
        Ok(())
    }

    async fn end(&self, session_id: &str) -> Result<()> {
        self.ended.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Artifacts
// ============================================================================

pub struct InMemoryArtifacts {
    log: CallLog,
    next_ref: AtomicU64,
    failing_uploads: AtomicUsize,
    singles: StdMutex<Vec<PageBlob>>,
    assembled: StdMutex<Vec<Vec<PageBlob>>>,
}

impl InMemoryArtifacts {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next_ref: AtomicU64::new(0),
            failing_uploads: AtomicUsize::new(0),
            singles: StdMutex::new(Vec::new()),
            assembled: StdMutex::new(Vec::new()),
        }
    }

    pub fn fail_next_uploads(&self, n: usize) {
        self.failing_uploads.store(n, Ordering::SeqCst);
    }

    pub fn singles(&self) -> Vec<PageBlob> {
        self.singles.lock().unwrap().clone()
    }

    pub fn assembled(&self) -> Vec<Vec<PageBlob>> {
        self.assembled.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.failing_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_ref(&self) -> ArtifactRef {
        let n = self.next_ref.fetch_add(1, Ordering::SeqCst) + 1;
        ArtifactRef::new(format!("artifact-{}", n))
    }
}

#[async_trait]
impl ArtifactApi for InMemoryArtifacts {
    async fn upload_single(&self, blob: &PageBlob) -> Result<ArtifactRef> {
        self.log.record("artifacts.upload_single");
        if self.take_failure() {
            return Err(anyhow!("storage unavailable"));
        }
        self.singles.lock().unwrap().push(blob.clone());
        Ok(self.next_ref())
    }

    async fn assemble_and_upload(&self, pages: &[PageBlob]) -> Result<ArtifactRef> {
        self.log.record("artifacts.assemble_and_upload");
        if self.take_failure() {
            return Err(anyhow!("assembly service unavailable"));
        }
        self.assembled.lock().unwrap().push(pages.to_vec());
        Ok(self.next_ref())
    }
}

// ============================================================================
// Mobile handoff
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RemoteToken {
    upload_count: u32,
    expired: bool,
}

pub struct InMemoryHandoff {
    log: CallLog,
    next_token: AtomicU64,
    fail_polls: AtomicBool,
    polls: AtomicUsize,
    tokens: StdMutex<HashMap<String, RemoteToken>>,
    contacts: StdMutex<Vec<String>>,
}

impl InMemoryHandoff {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next_token: AtomicU64::new(0),
            fail_polls: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
            tokens: StdMutex::new(HashMap::new()),
            contacts: StdMutex::new(Vec::new()),
        }
    }

    /// Pretend the phone has uploaded `count` files for this token
    pub fn set_upload_count(&self, token: &str, count: u32) {
        if let Some(remote) = self.tokens.lock().unwrap().get_mut(token) {
            remote.upload_count = count;
        }
    }

    pub fn expire(&self, token: &str) {
        if let Some(remote) = self.tokens.lock().unwrap().get_mut(token) {
            remote.expired = true;
        }
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn contacts(&self) -> Vec<String> {
        self.contacts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HandoffApi for InMemoryHandoff {
    async fn request(&self, contact: &str, _expiry_minutes: u32) -> Result<HandoffTicket> {
        self.log.record("handoff.request");
        self.contacts.lock().unwrap().push(contact.to_string());
        let n = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("handoff-{}", n);
        self.tokens.lock().unwrap().insert(
            token.clone(),
            RemoteToken {
                upload_count: 0,
                expired: false,
            },
        );
        Ok(HandoffTicket {
            link: format!("https://exam.invalid/continue/{}", token),
            token,
        })
    }

    async fn poll_status(&self, token: &str) -> Result<HandoffPoll> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(anyhow!("handoff status endpoint unreachable"));
        }
        let remote = self
            .tokens
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .ok_or_else(|| anyhow!("unknown handoff token"))?;

        let status = if remote.upload_count > 0 {
            RemoteUploadStatus::Uploaded
        } else if remote.expired {
            RemoteUploadStatus::Expired
        } else {
            RemoteUploadStatus::Pending
        };
        Ok(HandoffPoll {
            status,
            upload_count: remote.upload_count,
        })
    }
}

// ============================================================================
// Host: camera, display, file picker
// ============================================================================

pub struct InMemoryMediaDevices {
    log: CallLog,
    unavailable: StdMutex<HashSet<CameraFacing>>,
    acquire_delay: StdMutex<Duration>,
    active: Arc<AtomicUsize>,
    frames: Arc<AtomicU64>,
}

impl InMemoryMediaDevices {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            unavailable: StdMutex::new(HashSet::new()),
            acquire_delay: StdMutex::new(Duration::ZERO),
            active: Arc::new(AtomicUsize::new(0)),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make `acquire` for this camera fail as if permission was denied
    pub fn set_unavailable(&self, facing: CameraFacing, unavailable: bool) {
        let mut set = self.unavailable.lock().unwrap();
        if unavailable {
            set.insert(facing);
        } else {
            set.remove(&facing);
        }
    }

    /// How long the permission prompt stays open before `acquire` answers
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = delay;
    }

    /// Streams acquired and not yet released
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for InMemoryMediaDevices {
    async fn acquire(&self, facing: CameraFacing) -> Result<Box<dyn MediaStream>> {
        self.log.record(format!("media.acquire:{}", facing));
        let delay = *self.acquire_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.lock().unwrap().contains(&facing) {
            return Err(anyhow!("permission denied for {} camera", facing));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryStream {
            facing,
            log: self.log.clone(),
            active: Arc::clone(&self.active),
            frames: Arc::clone(&self.frames),
            released: false,
        }))
    }
}

struct InMemoryStream {
    facing: CameraFacing,
    log: CallLog,
    active: Arc<AtomicUsize>,
    frames: Arc<AtomicU64>,
    released: bool,
}

#[async_trait]
impl MediaStream for InMemoryStream {
    fn facing(&self) -> CameraFacing {
        self.facing
    }

    async fn grab_frame(&mut self) -> Result<Vec<u8>> {
        if self.released {
            return Err(anyhow!("stream already released"));
        }
        let n = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-frame-{}", self.facing, n).into_bytes())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.log.record(format!("media.release:{}", self.facing));
        }
    }
}

pub struct InMemoryDisplay {
    log: CallLog,
    deny: AtomicBool,
    fullscreen: AtomicBool,
}

impl InMemoryDisplay {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            deny: AtomicBool::new(false),
            fullscreen: AtomicBool::new(false),
        }
    }

    pub fn deny_fullscreen(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisplayHost for InMemoryDisplay {
    async fn request_fullscreen(&self) -> Result<()> {
        self.log.record("display.request_fullscreen");
        if self.deny.load(Ordering::SeqCst) {
            return Err(anyhow!("fullscreen request denied"));
        }
        self.fullscreen.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn exit_fullscreen(&self) -> Result<()> {
        self.log.record("display.exit_fullscreen");
        self.fullscreen.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// File picker answering from a queue of prepared selections
pub struct InMemoryFilePicker {
    log: CallLog,
    selections: StdMutex<VecDeque<Vec<PageBlob>>>,
    delay: StdMutex<Duration>,
}

impl InMemoryFilePicker {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            selections: StdMutex::new(VecDeque::new()),
            delay: StdMutex::new(Duration::ZERO),
        }
    }

    pub fn queue_selection(&self, files: Vec<PageBlob>) {
        self.selections.lock().unwrap().push_back(files);
    }

    /// How long the student takes to choose
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl FilePicker for InMemoryFilePicker {
    async fn pick(&self) -> Result<Vec<PageBlob>> {
        self.log.record("picker.pick");
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.selections.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// One of every in-memory collaborator sharing a call log
pub struct InMemoryBackend {
    pub log: CallLog,
    pub session: Arc<InMemorySessionApi>,
    pub monitoring: Arc<InMemoryMonitoring>,
    pub artifacts: Arc<InMemoryArtifacts>,
    pub handoff: Arc<InMemoryHandoff>,
    pub media: Arc<InMemoryMediaDevices>,
    pub display: Arc<InMemoryDisplay>,
    pub picker: Arc<InMemoryFilePicker>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let log = CallLog::default();
        Self {
            session: Arc::new(InMemorySessionApi::new(log.clone())),
            monitoring: Arc::new(InMemoryMonitoring::new()),
            artifacts: Arc::new(InMemoryArtifacts::new(log.clone())),
            handoff: Arc::new(InMemoryHandoff::new(log.clone())),
            media: Arc::new(InMemoryMediaDevices::new(log.clone())),
            display: Arc::new(InMemoryDisplay::new(log.clone())),
            picker: Arc::new(InMemoryFilePicker::new(log.clone())),
            log,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            session: self.session.clone(),
            monitoring: self.monitoring.clone(),
            artifacts: self.artifacts.clone(),
            handoff: self.handoff.clone(),
            media: self.media.clone(),
            display: self.display.clone(),
            picker: self.picker.clone(),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}
