//! Session controller: the one place session state changes.
//!
//! Sub-services report through a single signal channel; a pump task applies
//! their signals as transitions. Host calls (`start`, `submit`, `exit`, host
//! events, page capture) go through the same state container. The state lock
//! is a plain mutex and is never held across an await.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::camera::{CameraArbiter, CameraMonitor, CameraStartOutcome};
use crate::session::capture::{DocumentCapture, Page, PageBlob, PageId, PageLimits};
use crate::session::clock::{Clock, Deadline, DeadlineClock, SystemClock};
use crate::session::collaborators::{Collaborators, MonitoringSettings};
use crate::session::config::ExamConfig;
use crate::session::error::{ProctorError, ProctorResult};
use crate::session::handoff::MobileHandoff;
use crate::session::persistence::{JournalEntry, SessionJournal};
use crate::session::protocol::{
    ArtifactRef, HandoffStatus, MobileUploadRequest, Session, SessionEvent, SessionState,
    SubmitMode, SubmitPayload, SubmitReason, ViolationType,
};
use crate::session::signal::{signal_channel, ServiceSignal, SignalReceiver, SignalSender};
use crate::session::violations::{
    classify, AuditOutbox, Classification, DetectionContext, HostEvent, ViolationMonitor,
    ViolationOutcome,
};

const EVENT_CAPACITY: usize = 256;

/// What a `submit`/`exit`/`retry_submit` call ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// This call delivered the payload
    Submitted { result_ref: Option<String> },
    /// Another call is already delivering; nothing was done
    AlreadySubmitting,
    /// The session was already submitted; nothing was done
    AlreadySubmitted,
}

struct Core {
    session: Session,
    violations: ViolationMonitor,
    /// Cooperative capture UIs currently open (file picker, document camera)
    overlays: u32,
    document_camera_open: bool,
    starting: bool,
    disposed: bool,
    camera_degraded: Option<String>,
    last_submit_error: Option<String>,
}

/// Counts one cooperative overlay until dropped
struct OverlayGuard<'a> {
    core: &'a StdMutex<Core>,
    document_camera: bool,
}

impl<'a> OverlayGuard<'a> {
    fn picker(core: &'a StdMutex<Core>) -> Self {
        core.lock().unwrap().overlays += 1;
        Self {
            core,
            document_camera: false,
        }
    }

    /// `None` when the document camera is already counted
    fn document_camera(core: &'a StdMutex<Core>) -> Option<Self> {
        let mut guard = core.lock().unwrap();
        if guard.document_camera_open {
            return None;
        }
        guard.document_camera_open = true;
        guard.overlays += 1;
        Some(Self {
            core,
            document_camera: true,
        })
    }

    fn keep(self) {
        std::mem::forget(self);
    }
}

impl Drop for OverlayGuard<'_> {
    fn drop(&mut self) {
        let mut core = self.core.lock().unwrap();
        if self.document_camera {
            if !core.document_camera_open {
                return;
            }
            core.document_camera_open = false;
        }
        core.overlays = core.overlays.saturating_sub(1);
    }
}

/// Progress of the single in-flight submission; retries resume from here
#[derive(Default)]
struct SubmitProgress {
    services_stopped: bool,
    time_taken_seconds: u64,
    payload: Option<SubmitPayload>,
}

pub struct SessionController {
    config: ExamConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    core: StdMutex<Core>,
    deadline: StdMutex<DeadlineClock>,
    arbiter: Arc<CameraArbiter>,
    pipeline: Mutex<DocumentCapture>,
    handoff: MobileHandoff,
    outbox: Arc<AuditOutbox>,
    journal: Option<SessionJournal>,
    events: broadcast::Sender<SessionEvent>,
    signals: SignalSender,
    signal_rx: StdMutex<Option<SignalReceiver>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    submission: Mutex<SubmitProgress>,
}

impl SessionController {
    pub fn new(config: ExamConfig, collaborators: Collaborators) -> Arc<Self> {
        Self::with_parts(config, collaborators, Arc::new(SystemClock::new()), None)
    }

    /// Build with an explicit time source and optional local journal
    pub fn with_parts(
        config: ExamConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        journal: Option<SessionJournal>,
    ) -> Arc<Self> {
        let monitor = Arc::new(CameraMonitor::new(
            Arc::clone(&collaborators.media),
            Arc::clone(&collaborators.monitoring),
            Arc::clone(&clock),
            config.camera,
            config.capture_interval(),
            config.frame_buffer_cap,
        ));
        let arbiter = Arc::new(CameraArbiter::new(monitor));
        let pipeline = DocumentCapture::new(
            Arc::clone(&arbiter),
            Arc::clone(&collaborators.media),
            Arc::clone(&collaborators.artifacts),
            PageLimits {
                max_pages: config.max_pages,
                max_page_bytes: config.max_page_bytes,
            },
        );
        let handoff = MobileHandoff::new(
            Arc::clone(&collaborators.handoff),
            Arc::clone(&clock),
            config.handoff_poll_interval(),
        );
        let session = Session::new(
            config.test_id.clone(),
            config.student_id.clone(),
            config.duration_seconds,
        );
        let (signals, signal_rx) = signal_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            core: StdMutex::new(Core {
                session,
                violations: ViolationMonitor::new(config.max_violations),
                overlays: 0,
                document_camera_open: false,
                starting: false,
                disposed: false,
                camera_degraded: None,
                last_submit_error: None,
            }),
            deadline: StdMutex::new(DeadlineClock::new(Arc::clone(&clock))),
            arbiter,
            pipeline: Mutex::new(pipeline),
            handoff,
            outbox: Arc::new(AuditOutbox::new()),
            journal,
            events,
            signals,
            signal_rx: StdMutex::new(Some(signal_rx)),
            pump: StdMutex::new(None),
            submission: Mutex::new(SubmitProgress::default()),
            config,
            collaborators,
            clock,
        })
    }

    pub fn config(&self) -> &ExamConfig {
        &self.config
    }

    /// Observe everything the core reports to the presentation layer
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().unwrap().session.state
    }

    /// Current session record, with elapsed time brought up to date
    pub fn snapshot(&self) -> Session {
        let elapsed = self.elapsed_if_active();
        let mut core = self.core.lock().unwrap();
        if let Some(elapsed) = elapsed {
            core.session.time_taken_seconds = elapsed;
        }
        core.session.clone()
    }

    pub fn remaining_seconds(&self) -> Option<u64> {
        self.deadline.lock().unwrap().remaining_seconds()
    }

    /// Reason optional camera monitoring is running without a stream
    pub fn camera_degraded(&self) -> Option<String> {
        self.core.lock().unwrap().camera_degraded.clone()
    }

    pub fn last_submit_error(&self) -> Option<String> {
        self.core.lock().unwrap().last_submit_error.clone()
    }

    pub fn pending_audit(&self) -> usize {
        self.outbox.pending_len()
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// `NotStarted -> Active`.
    ///
    /// On failure nothing acquired is kept and the state stays `NotStarted`,
    /// so the host may try again.
    pub async fn start(self: &Arc<Self>) -> ProctorResult<()> {
        {
            let mut core = self.core.lock().unwrap();
            if core.session.state != SessionState::NotStarted || core.starting || core.disposed {
                return Err(ProctorError::InvalidTransition {
                    from: core.session.state,
                    action: "start",
                });
            }
            core.starting = true;
        }

        let result = self.start_inner().await;
        if let Err(e) = &result {
            warn!(error = %e, test_id = %self.config.test_id, "session start failed");
            self.core.lock().unwrap().starting = false;
        }
        result
    }

    async fn start_inner(self: &Arc<Self>) -> ProctorResult<()> {
        self.config
            .validate()
            .map_err(|e| ProctorError::StartRejected(format!("invalid exam configuration: {}", e)))?;
        self.ensure_pump();
        let test_id = self.config.test_id.as_str();

        let response = self
            .collaborators
            .session
            .start(test_id)
            .await
            .map_err(|e| ProctorError::StartRejected(e.to_string()))?;
        if !response.accepted {
            return Err(ProctorError::StartRejected(
                response
                    .message
                    .unwrap_or_else(|| "server declined the attempt".to_string()),
            ));
        }

        // Server progress wins over the local journal
        let (previously_elapsed, prior_violations, resumed) = match response.resume_state {
            Some(resume) => (resume.time_taken_seconds, resume.violations, true),
            None => match self.load_journal() {
                Some(entry) => {
                    let elapsed = Deadline::from_anchor(
                        entry.started_at_epoch_ms,
                        self.config.duration_seconds,
                    )
                    .elapsed_seconds(self.clock.now_ms());
                    (elapsed, entry.violations, true)
                }
                None => (0, Vec::new(), false),
            },
        };

        if self.config.fullscreen_required {
            if let Err(e) = self.collaborators.display.request_fullscreen().await {
                return Err(ProctorError::StartRejected(format!(
                    "fullscreen unavailable: {}",
                    e
                )));
            }
        }

        let settings = MonitoringSettings {
            camera: self.config.camera,
            capture_interval_ms: self.config.capture_interval_ms,
            fullscreen_required: self.config.fullscreen_required,
            max_violations: self.config.max_violations,
        };
        let session_id = match self.collaborators.monitoring.start(test_id, &settings).await {
            Ok(id) => Some(id),
            Err(e) if self.config.camera.is_mandatory() => {
                self.leave_fullscreen().await;
                return Err(ProctorError::StartRejected(format!(
                    "monitoring unavailable: {}",
                    e
                )));
            }
            Err(e) => {
                warn!(error = %e, "monitoring session unavailable, evidence stays local");
                None
            }
        };

        match self
            .arbiter
            .start_monitoring(session_id.clone(), self.signals.clone())
            .await
        {
            CameraStartOutcome::Fatal(reason) => {
                self.end_monitoring(session_id.as_deref()).await;
                self.leave_fullscreen().await;
                return Err(ProctorError::StartRejected(reason));
            }
            CameraStartOutcome::Degraded(reason) => {
                self.core.lock().unwrap().camera_degraded = Some(reason);
            }
            CameraStartOutcome::Active | CameraStartOutcome::Disabled => {}
        }

        let (already_escalated, entry) = {
            let mut core = self.core.lock().unwrap();
            let restored = core.violations.restore(prior_violations);
            let deadline = self.deadline.lock().unwrap().start(
                self.config.duration_seconds,
                previously_elapsed,
                self.signals.clone(),
            );

            core.session.session_id = session_id;
            core.session.state = SessionState::Active;
            core.session.started_at_epoch_ms = deadline.anchor_ms();
            core.session.time_taken_seconds =
                previously_elapsed.min(self.config.duration_seconds);
            core.session.violations = core.violations.violations().to_vec();
            core.starting = false;

            (
                restored == Some(ViolationOutcome::Escalate),
                journal_entry(&core.session),
            )
        };

        self.save_journal(&entry);
        info!(
            test_id,
            resumed,
            previously_elapsed,
            violations = entry.violations.len(),
            "session started"
        );
        self.emit(SessionEvent::Started { resumed });

        if already_escalated {
            let _ = self.signals.send(ServiceSignal::Escalate);
        }
        Ok(())
    }

    // ========================================================================
    // Signal pump
    // ========================================================================

    fn ensure_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.signal_rx.lock().unwrap().take() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if signal == ServiceSignal::Shutdown {
                    break;
                }
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.apply_signal(signal);
            }
            debug!("signal pump stopped");
        });
        *self.pump.lock().unwrap() = Some(task);
    }

    fn apply_signal(self: &Arc<Self>, signal: ServiceSignal) {
        let state = self.state();
        match signal {
            ServiceSignal::Tick { remaining_seconds } => {
                if state != SessionState::Active {
                    return;
                }
                let elapsed = self.config.duration_seconds.saturating_sub(remaining_seconds);
                self.core.lock().unwrap().session.time_taken_seconds = elapsed;
                self.emit(SessionEvent::Tick { remaining_seconds });
            }
            ServiceSignal::Expired => {
                if state == SessionState::Active {
                    info!("time limit reached, submitting");
                    self.emit(SessionEvent::TimeExpired);
                    self.spawn_auto_submit(SubmitReason::TimeLimit);
                }
            }
            ServiceSignal::Escalate => {
                if state == SessionState::Active {
                    info!("violation threshold reached, submitting");
                    self.spawn_auto_submit(SubmitReason::MaxViolationsExceeded);
                }
            }
            ServiceSignal::CameraDegraded { reason } => {
                self.core.lock().unwrap().camera_degraded = Some(reason.clone());
                self.emit(SessionEvent::CameraDegraded { reason });
            }
            ServiceSignal::HandoffDetected { upload_count } => {
                if state != SessionState::Active {
                    return;
                }
                if let Some(request) = self.handoff.current() {
                    self.core.lock().unwrap().session.answer_artifact_ref =
                        Some(ArtifactRef::from_handoff_token(&request.token));
                }
                self.emit(SessionEvent::HandoffDetected { upload_count });
            }
            ServiceSignal::HandoffExpired => self.emit(SessionEvent::HandoffExpired),
            ServiceSignal::Shutdown => {}
        }
    }

    fn spawn_auto_submit(self: &Arc<Self>, reason: SubmitReason) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = controller.submit(SubmitMode::Auto, reason).await {
                warn!(error = %e, %reason, "automatic submission failed");
            }
        });
    }

    // ========================================================================
    // Violations
    // ========================================================================

    /// Route one browser-boundary event through the classifiers.
    ///
    /// The returned classification tells the host whether to cancel the
    /// event's default action.
    pub fn handle_host_event(&self, event: &HostEvent) -> Classification {
        let ctx = {
            let core = self.core.lock().unwrap();
            DetectionContext {
                fullscreen_required: self.config.fullscreen_required,
                cooperative_overlay_open: core.overlays > 0,
            }
        };
        let classification = classify(event, ctx);

        if let Some((violation_type, details)) = &classification.violation {
            self.record_violation(*violation_type, details.clone());
        }
        classification
    }

    /// Append a violation while active; ignored in every other state
    pub fn record_violation(
        &self,
        violation_type: ViolationType,
        details: impl Into<String>,
    ) -> Option<ViolationOutcome> {
        let now = self.clock.now_utc();
        let (violation, outcome, entry, session_id) = {
            let mut core = self.core.lock().unwrap();
            if core.session.state != SessionState::Active || core.disposed {
                return None;
            }
            let (violation, outcome) = core.violations.record(violation_type, details, now);
            core.session.violations.push(violation.clone());
            (
                violation,
                outcome,
                journal_entry(&core.session),
                core.session.session_id.clone(),
            )
        };

        self.save_journal(&entry);
        self.outbox.enqueue(violation.clone());
        self.spawn_audit_flush(session_id);

        match outcome {
            ViolationOutcome::Warn { remaining } => {
                self.emit(SessionEvent::Warning {
                    violation,
                    remaining,
                });
            }
            ViolationOutcome::Escalate => {
                self.emit(SessionEvent::Escalated {
                    violation_count: entry.violations.len(),
                });
                let _ = self.signals.send(ServiceSignal::Escalate);
            }
            ViolationOutcome::AfterEscalation => {}
        }
        Some(outcome)
    }

    fn spawn_audit_flush(&self, session_id: Option<String>) {
        let outbox = Arc::clone(&self.outbox);
        let monitoring = Arc::clone(&self.collaborators.monitoring);
        tokio::spawn(async move {
            outbox.flush(monitoring, session_id).await;
        });
    }

    // ========================================================================
    // Answer pages
    // ========================================================================

    fn ensure_local_capture(&self, action: &'static str) -> ProctorResult<()> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(ProctorError::InvalidTransition {
                from: state,
                action,
            });
        }
        if !self.handoff.local_capture_allowed() {
            return Err(ProctorError::LocalCaptureDisabled);
        }
        Ok(())
    }

    /// Add files the host already collected
    pub async fn add_files(&self, files: Vec<PageBlob>) -> ProctorResult<Vec<PageId>> {
        self.ensure_local_capture("add pages")?;
        self.pipeline.lock().await.add_files(files)
    }

    /// Open the file picker and add whatever the student selects.
    ///
    /// Leaving the page for the picker is not a violation.
    pub async fn add_files_from_picker(&self) -> ProctorResult<Vec<PageId>> {
        self.ensure_local_capture("add pages")?;

        let overlay = OverlayGuard::picker(&self.core);
        let picked = self.collaborators.picker.pick().await;
        drop(overlay);

        let files = picked.map_err(|e| ProctorError::Collaborator(format!("file picker: {}", e)))?;
        if files.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_local_capture("add pages")?;
        self.pipeline.lock().await.add_files(files)
    }

    pub async fn open_document_camera(&self) -> ProctorResult<()> {
        self.ensure_local_capture("open the document camera")?;
        let overlay = OverlayGuard::document_camera(&self.core);

        let result = self.pipeline.lock().await.open_camera().await;
        if let (Ok(()), Some(overlay)) = (&result, overlay) {
            // Stays counted until close_document_camera
            overlay.keep();
        }
        result
    }

    pub async fn snap_page(&self) -> ProctorResult<PageId> {
        self.ensure_local_capture("capture a page")?;
        self.pipeline.lock().await.snap().await
    }

    pub async fn close_document_camera(&self) {
        self.pipeline.lock().await.close_camera().await;
        self.mark_document_camera_closed();
    }

    fn mark_document_camera_closed(&self) {
        let mut core = self.core.lock().unwrap();
        if core.document_camera_open {
            core.document_camera_open = false;
            core.overlays = core.overlays.saturating_sub(1);
        }
    }

    /// Photograph `shots` pages with the rear camera; the camera is always closed afterwards
    pub async fn capture_pages(&self, shots: usize) -> ProctorResult<Vec<PageId>> {
        self.open_document_camera().await?;

        let mut taken = Vec::with_capacity(shots);
        let mut failure = None;
        for _ in 0..shots {
            match self.snap_page().await {
                Ok(id) => taken.push(id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.close_document_camera().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(taken),
        }
    }

    pub async fn remove_page(&self, id: PageId) -> ProctorResult<()> {
        self.ensure_local_capture("remove a page")?;
        self.pipeline.lock().await.remove_page(id)
    }

    /// Drop all pages and unlock the set
    pub async fn reset_pages(&self) -> ProctorResult<()> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(ProctorError::InvalidTransition {
                from: state,
                action: "reset pages",
            });
        }
        self.pipeline.lock().await.reset().await;
        self.mark_document_camera_closed();
        let mobile_artifact = self
            .handoff
            .current()
            .filter(|r| r.status == HandoffStatus::Uploaded)
            .map(|r| ArtifactRef::from_handoff_token(&r.token));
        self.core.lock().unwrap().session.answer_artifact_ref = mobile_artifact;
        Ok(())
    }

    /// Upload the page set now instead of at submit
    pub async fn finalize_pages(&self) -> ProctorResult<ArtifactRef> {
        self.ensure_local_capture("finalize pages")?;
        let artifact = self.pipeline.lock().await.finalize().await?;
        self.core.lock().unwrap().session.answer_artifact_ref = Some(artifact.clone());
        Ok(artifact)
    }

    /// Pages in display order
    pub async fn pages(&self) -> Vec<Page> {
        self.pipeline
            .lock()
            .await
            .ordered_pages()
            .into_iter()
            .cloned()
            .collect()
    }

    // ========================================================================
    // Mobile handoff
    // ========================================================================

    pub async fn request_handoff(&self, contact: &str) -> ProctorResult<MobileUploadRequest> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(ProctorError::InvalidTransition {
                from: state,
                action: "request a mobile upload",
            });
        }
        self.handoff
            .request(contact, self.config.handoff_expiry_minutes, self.signals.clone())
            .await
    }

    pub fn handoff_status(&self) -> HandoffStatus {
        self.handoff.status()
    }

    pub fn handoff_qr_payload(&self) -> Option<String> {
        self.handoff.qr_payload()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    pub async fn submit_manual(&self) -> ProctorResult<SubmitOutcome> {
        self.submit(SubmitMode::Manual, SubmitReason::Manual).await
    }

    /// `Active -> Submitting -> Submitted`.
    ///
    /// Only the first caller delivers; concurrent callers get
    /// `AlreadySubmitting`. On delivery failure the session stays
    /// `Submitting` and `retry_submit` picks up where this left off.
    pub async fn submit(&self, mode: SubmitMode, reason: SubmitReason) -> ProctorResult<SubmitOutcome> {
        let needs_artifact = mode == SubmitMode::Manual && self.config.artifact_required;
        let pages_ready = if needs_artifact {
            let pipeline = self.pipeline.lock().await;
            pipeline.is_locked() || !pipeline.is_empty()
        } else {
            true
        };

        {
            let mut core = self.core.lock().unwrap();
            match core.session.state {
                SessionState::Active => {}
                SessionState::Submitting | SessionState::Exiting => {
                    return Ok(SubmitOutcome::AlreadySubmitting)
                }
                SessionState::Submitted => return Ok(SubmitOutcome::AlreadySubmitted),
                SessionState::NotStarted => {
                    return Err(ProctorError::InvalidTransition {
                        from: SessionState::NotStarted,
                        action: "submit",
                    })
                }
            }
            if needs_artifact && !pages_ready && core.session.answer_artifact_ref.is_none() {
                return Err(ProctorError::ArtifactRequired);
            }
            core.session.state = SessionState::Submitting;
            core.session.end_reason = Some(reason);
        }

        info!(%reason, ?mode, "submitting session");
        self.emit(SessionEvent::Submitting { reason });
        self.deliver(reason).await
    }

    /// Student leaves early: `Active -> Exiting -> Submitted`.
    ///
    /// No artifact is required; a failed page upload still delivers the rest.
    pub async fn exit(&self) -> ProctorResult<SubmitOutcome> {
        {
            let mut core = self.core.lock().unwrap();
            if core.session.state != SessionState::Active {
                return Err(ProctorError::InvalidTransition {
                    from: core.session.state,
                    action: "exit",
                });
            }
            core.session.state = SessionState::Exiting;
            core.session.end_reason = Some(SubmitReason::StudentExit);
        }

        info!("student exit, delivering partial submission");
        self.emit(SessionEvent::Submitting {
            reason: SubmitReason::StudentExit,
        });
        self.deliver(SubmitReason::StudentExit).await
    }

    /// Re-run the outstanding steps of a failed submission
    pub async fn retry_submit(&self) -> ProctorResult<SubmitOutcome> {
        let reason = {
            let core = self.core.lock().unwrap();
            match core.session.state {
                SessionState::Submitting | SessionState::Exiting => core
                    .session
                    .end_reason
                    .unwrap_or(SubmitReason::Manual),
                SessionState::Submitted => return Ok(SubmitOutcome::AlreadySubmitted),
                from => {
                    return Err(ProctorError::InvalidTransition {
                        from,
                        action: "retry submission",
                    })
                }
            }
        };
        debug!(%reason, "retrying submission");
        self.deliver(reason).await
    }

    async fn deliver(&self, reason: SubmitReason) -> ProctorResult<SubmitOutcome> {
        let mut progress = self.submission.lock().await;
        if self.state() == SessionState::Submitted {
            return Ok(SubmitOutcome::AlreadySubmitted);
        }

        if !progress.services_stopped {
            progress.time_taken_seconds = self.stop_services().await;
            progress.services_stopped = true;
        }

        let payload = match progress.payload.clone() {
            Some(payload) => payload,
            None => {
                let answer_artifact_ref = match self.resolve_artifact(reason).await {
                    Ok(artifact) => artifact,
                    Err(e) => {
                        self.record_submit_failure(&e);
                        return Err(e);
                    }
                };
                let violations = self.core.lock().unwrap().session.violations.clone();
                let payload = SubmitPayload {
                    answer_artifact_ref,
                    violations,
                    time_taken_seconds: progress.time_taken_seconds,
                    reason,
                };
                progress.payload = Some(payload.clone());
                payload
            }
        };

        let response = match self
            .collaborators
            .session
            .submit(&self.config.test_id, &payload)
            .await
        {
            Ok(response) if response.accepted => response,
            Ok(_) => {
                let e = ProctorError::SubmitFailed("submission was not accepted".to_string());
                self.record_submit_failure(&e);
                return Err(e);
            }
            Err(e) => {
                let e = ProctorError::SubmitFailed(e.to_string());
                self.record_submit_failure(&e);
                return Err(e);
            }
        };

        let session_id = {
            let mut core = self.core.lock().unwrap();
            core.session.state = SessionState::Submitted;
            core.session.result_ref = response.result_ref.clone();
            core.last_submit_error = None;
            core.session.session_id.clone()
        };

        info!(
            %reason,
            violations = payload.violations.len(),
            time_taken_seconds = payload.time_taken_seconds,
            "session submitted"
        );
        self.remove_journal();
        self.end_monitoring(session_id.as_deref()).await;
        self.emit(SessionEvent::Submitted {
            reason,
            result_ref: response.result_ref.clone(),
        });
        let _ = self.signals.send(ServiceSignal::Shutdown);

        Ok(SubmitOutcome::Submitted {
            result_ref: response.result_ref,
        })
    }

    /// Mobile upload first, then the local page set
    async fn resolve_artifact(&self, reason: SubmitReason) -> ProctorResult<Option<ArtifactRef>> {
        let existing = self.core.lock().unwrap().session.answer_artifact_ref.clone();
        if let Some(artifact) = existing {
            return Ok(Some(artifact));
        }

        let mut pipeline = self.pipeline.lock().await;
        if pipeline.is_empty() && !pipeline.is_locked() {
            return Ok(None);
        }

        match pipeline.finalize().await {
            Ok(artifact) => {
                self.core.lock().unwrap().session.answer_artifact_ref = Some(artifact.clone());
                Ok(Some(artifact))
            }
            Err(e) if reason == SubmitReason::StudentExit => {
                warn!(error = %e, "page upload failed on exit, submitting without pages");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn record_submit_failure(&self, error: &ProctorError) {
        warn!(error = %error, "submission failed, retry available");
        self.core.lock().unwrap().last_submit_error = Some(error.to_string());
        self.emit(SessionEvent::SubmitFailed {
            message: error.to_string(),
        });
    }

    /// Stop timers, polling and cameras; returns the frozen elapsed time
    async fn stop_services(&self) -> u64 {
        let time_taken = {
            let mut deadline = self.deadline.lock().unwrap();
            let elapsed = deadline.elapsed_seconds().unwrap_or(0);
            deadline.stop();
            elapsed
        };
        self.handoff.stop();
        self.arbiter.stop_monitoring().await;
        self.pipeline.lock().await.close_camera().await;
        self.mark_document_camera_closed();
        self.leave_fullscreen().await;

        let session_id = {
            let mut core = self.core.lock().unwrap();
            core.session.time_taken_seconds = time_taken;
            core.session.session_id.clone()
        };
        self.outbox
            .flush(Arc::clone(&self.collaborators.monitoring), session_id)
            .await;
        time_taken
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear everything down without submitting; idempotent
    pub async fn dispose(&self) {
        {
            let mut core = self.core.lock().unwrap();
            if core.disposed {
                return;
            }
            core.disposed = true;
        }

        self.deadline.lock().unwrap().stop();
        self.handoff.stop();
        self.arbiter.stop_monitoring().await;
        self.pipeline.lock().await.close_camera().await;
        self.mark_document_camera_closed();
        let _ = self.signals.send(ServiceSignal::Shutdown);
        debug!(state = %self.state(), "session controller disposed");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn elapsed_if_active(&self) -> Option<u64> {
        if self.state() != SessionState::Active {
            return None;
        }
        self.deadline.lock().unwrap().elapsed_seconds()
    }

    async fn leave_fullscreen(&self) {
        if !self.config.fullscreen_required {
            return;
        }
        if let Err(e) = self.collaborators.display.exit_fullscreen().await {
            debug!(error = %e, "exit fullscreen failed");
        }
    }

    async fn end_monitoring(&self, session_id: Option<&str>) {
        if let Some(session_id) = session_id {
            if let Err(e) = self.collaborators.monitoring.end(session_id).await {
                warn!(error = %e, "failed to end monitoring session");
            }
        }
    }

    fn load_journal(&self) -> Option<JournalEntry> {
        let journal = self.journal.as_ref()?;
        match journal.load(&self.config.test_id, &self.config.student_id) {
            Ok(entry) => entry.filter(|e| e.duration_seconds == self.config.duration_seconds),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable session journal");
                None
            }
        }
    }

    fn save_journal(&self, entry: &JournalEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(entry) {
                warn!(error = %e, "failed to write session journal");
            }
        }
    }

    fn remove_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(&self.config.test_id, &self.config.student_id) {
                warn!(error = %e, "failed to remove session journal");
            }
        }
    }
}

fn journal_entry(session: &Session) -> JournalEntry {
    JournalEntry {
        test_id: session.test_id.clone(),
        student_id: session.student_id.clone(),
        started_at_epoch_ms: session.started_at_epoch_ms,
        duration_seconds: session.duration_seconds,
        violations: session.violations.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::session::memory::InMemoryBackend;
    use crate::test_utils::{assert_eventually, expect_event};

    fn controller(config: ExamConfig) -> (Arc<SessionController>, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let controller = SessionController::new(config, backend.collaborators());
        (controller, backend)
    }

    #[tokio::test]
    async fn test_submit_before_start_is_rejected() {
        let (controller, _backend) = controller(ExamConfig::new("t-1", "s-1", 60));
        assert_eq!(
            controller.submit_manual().await,
            Err(ProctorError::InvalidTransition {
                from: SessionState::NotStarted,
                action: "submit",
            })
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (controller, _backend) = controller(ExamConfig::new("t-1", "s-1", 60));
        controller.start().await.unwrap();
        assert!(matches!(
            controller.start().await,
            Err(ProctorError::InvalidTransition { .. })
        ));
        controller.dispose().await;
    }

    #[tokio::test]
    async fn test_violations_ignored_outside_active() {
        let (controller, _backend) = controller(ExamConfig::new("t-1", "s-1", 60));
        assert_eq!(
            controller.record_violation(ViolationType::TabSwitch, "early"),
            None
        );
        assert!(controller.snapshot().violations.is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_keys_suppressed_before_start() {
        let (controller, _backend) = controller(ExamConfig::new("t-1", "s-1", 60));
        let result = controller.handle_host_event(&HostEvent::KeyDown(
            crate::session::violations::KeyCombo::new("c").ctrl(),
        ));
        assert!(result.suppress_default);
        assert!(controller.snapshot().violations.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_does_not_submit() {
        let (controller, backend) = controller(ExamConfig::new("t-1", "s-1", 60));
        controller.start().await.unwrap();
        controller.dispose().await;
        controller.dispose().await;

        assert_eq!(controller.state(), SessionState::Active);
        assert!(backend.session.submissions().is_empty());
        assert!(controller.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_auto_submits_once() {
        let (controller, backend) = controller(ExamConfig::new("t-1", "s-1", 5));
        let mut events = controller.subscribe();
        controller.start().await.unwrap();

        expect_event(&mut events, "time expiry", Duration::from_secs(10), |e| {
            *e == SessionEvent::TimeExpired
        })
        .await;
        expect_event(&mut events, "submission", Duration::from_secs(10), |e| {
            matches!(e, SessionEvent::Submitted { .. })
        })
        .await;

        let submissions = backend.session.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].1.reason, SubmitReason::TimeLimit);
        assert_eq!(submissions[0].1.time_taken_seconds, 5);
        assert_eq!(controller.state(), SessionState::Submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audit_outbox_drains_after_recovery() {
        let (controller, backend) = controller(ExamConfig::new("t-1", "s-1", 600));
        backend.monitoring.fail_violation_pushes(true);
        controller.start().await.unwrap();

        controller.record_violation(ViolationType::TabSwitch, "hidden");
        assert_eventually(
            "violation to stay queued",
            Duration::from_secs(1),
            Duration::from_millis(10),
            || {
                let controller = Arc::clone(&controller);
                let monitoring = Arc::clone(&backend.monitoring);
                async move {
                    if controller.pending_audit() == 1 && monitoring.violations().is_empty() {
                        Ok(())
                    } else {
                        Err("violation was not kept for retry")
                    }
                }
            },
        )
        .await;

        backend.monitoring.fail_violation_pushes(false);
        controller.record_violation(ViolationType::TabSwitch, "hidden again");
        assert_eventually(
            "both violations delivered in order",
            Duration::from_secs(1),
            Duration::from_millis(10),
            || {
                let monitoring = Arc::clone(&backend.monitoring);
                async move {
                    let details: Vec<String> = monitoring
                        .violations()
                        .into_iter()
                        .map(|v| v.details)
                        .collect();
                    if details == ["hidden", "hidden again"] {
                        Ok(())
                    } else {
                        Err(format!("delivered so far: {:?}", details))
                    }
                }
            },
        )
        .await;
        controller.dispose().await;
    }
}
