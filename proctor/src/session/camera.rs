//! Camera monitoring and exclusive camera ownership.
//!
//! `CameraMonitor` keeps a front-facing stream open and captures one
//! monitoring frame per interval. Frames are buffered (bounded, oldest dropped)
//! and drained to the monitoring collaborator in the background; delivery
//! failures never touch the capture interval.
//!
//! `CameraArbiter` is the only way into the camera. It serializes ownership
//! between background monitoring and foreground document capture: the monitor
//! is paused (tracks released) before a capture stream is acquired and resumed
//! after that stream is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::session::clock::Clock;
use crate::session::collaborators::{CameraFacing, MediaDevices, MediaStream, MonitoringApi};
use crate::session::config::CameraRequirement;
use crate::session::error::{ProctorError, ProctorResult};
use crate::session::protocol::MonitoringFrame;
use crate::session::signal::{ServiceSignal, SignalSender};

/// Owns a media stream and releases its tracks exactly once
pub struct StreamHandle {
    stream: Box<dyn MediaStream>,
    released: bool,
}

impl StreamHandle {
    pub fn new(stream: Box<dyn MediaStream>) -> Self {
        Self {
            stream,
            released: false,
        }
    }

    pub fn facing(&self) -> CameraFacing {
        self.stream.facing()
    }

    pub async fn grab_frame(&mut self) -> Result<Vec<u8>> {
        self.stream.grab_frame().await
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stream.release();
            debug!(facing = %self.stream.facing(), "camera stream released");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bounded queue of frames waiting for delivery
struct FrameBuffer {
    frames: VecDeque<MonitoringFrame>,
    capacity: usize,
}

impl FrameBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Queue a frame; returns true if the oldest frame was dropped to make room
    fn push(&mut self, frame: MonitoringFrame) -> bool {
        let dropped = if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            true
        } else {
            false
        };
        self.frames.push_back(frame);
        dropped
    }

    fn take_all(&mut self) -> Vec<MonitoringFrame> {
        self.frames.drain(..).collect()
    }

    /// Put undelivered frames back in front of anything captured since,
    /// keeping only the newest `capacity` frames overall
    fn requeue(&mut self, undelivered: Vec<MonitoringFrame>) {
        for frame in undelivered.into_iter().rev() {
            self.frames.push_front(frame);
        }
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Result of starting camera monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraStartOutcome {
    /// The test does not monitor the camera
    Disabled,
    Active,
    /// Optional monitoring could not get a stream; session continues
    Degraded(String),
    /// Mandatory monitoring could not get a stream; session must not start
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Active,
    Paused,
    Degraded,
    Stopped,
}

struct MonitorInner {
    state: MonitorState,
    task: Option<JoinHandle<()>>,
    session_id: Option<String>,
    signals: Option<SignalSender>,
}

/// Periodic evidence capture from the front camera
pub struct CameraMonitor {
    media: Arc<dyn MediaDevices>,
    monitoring: Arc<dyn MonitoringApi>,
    clock: Arc<dyn Clock>,
    requirement: CameraRequirement,
    interval: Duration,
    inner: StdMutex<MonitorInner>,
    stream: Arc<Mutex<Option<StreamHandle>>>,
    buffer: Arc<StdMutex<FrameBuffer>>,
    /// Held by whoever is delivering buffered frames
    drain_gate: Arc<Mutex<()>>,
    frames_captured: Arc<AtomicU64>,
}

impl CameraMonitor {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        monitoring: Arc<dyn MonitoringApi>,
        clock: Arc<dyn Clock>,
        requirement: CameraRequirement,
        interval: Duration,
        buffer_cap: usize,
    ) -> Self {
        Self {
            media,
            monitoring,
            clock,
            requirement,
            interval,
            inner: StdMutex::new(MonitorInner {
                state: MonitorState::Idle,
                task: None,
                session_id: None,
                signals: None,
            }),
            stream: Arc::new(Mutex::new(None)),
            buffer: Arc::new(StdMutex::new(FrameBuffer::new(buffer_cap))),
            drain_gate: Arc::new(Mutex::new(())),
            frames_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.inner.lock().unwrap().state
    }

    pub fn requirement(&self) -> CameraRequirement {
        self.requirement
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::SeqCst)
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Acquire the front camera and begin capturing
    pub async fn start(
        &self,
        session_id: Option<String>,
        signals: SignalSender,
    ) -> CameraStartOutcome {
        if !self.requirement.is_enabled() {
            return CameraStartOutcome::Disabled;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                MonitorState::Idle => {}
                MonitorState::Stopped => {
                    return CameraStartOutcome::Fatal("camera monitor already stopped".into())
                }
                _ => return CameraStartOutcome::Active,
            }
            inner.session_id = session_id;
            inner.signals = Some(signals);
        }

        match self.media.acquire(CameraFacing::User).await {
            Ok(stream) => {
                self.begin_capture(StreamHandle::new(stream)).await;
                info!(interval_ms = self.interval.as_millis() as u64, "camera monitoring active");
                CameraStartOutcome::Active
            }
            Err(e) => {
                let reason = format!("camera unavailable: {}", e);
                if self.requirement.is_mandatory() {
                    warn!(error = %e, "mandatory camera monitoring failed to start");
                    self.inner.lock().unwrap().state = MonitorState::Idle;
                    CameraStartOutcome::Fatal(reason)
                } else {
                    warn!(error = %e, "camera monitoring degraded");
                    self.mark_degraded(&reason);
                    CameraStartOutcome::Degraded(reason)
                }
            }
        }
    }

    /// Stop capturing and free the camera, keeping session state
    pub async fn pause(&self) {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != MonitorState::Active {
                return;
            }
            inner.state = MonitorState::Paused;
            inner.task.take()
        };

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.release();
        }
        debug!("camera monitoring paused");
    }

    /// Re-acquire the camera and resume the same cadence.
    ///
    /// Returns false if the stream could not be re-acquired (monitoring degrades).
    pub async fn resume(&self) -> bool {
        {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                MonitorState::Paused | MonitorState::Degraded => {}
                MonitorState::Active => return true,
                MonitorState::Idle | MonitorState::Stopped => return false,
            }
        }

        match self.media.acquire(CameraFacing::User).await {
            Ok(stream) => {
                if self.state() == MonitorState::Stopped {
                    // Stopped while we were waiting for the camera
                    drop(StreamHandle::new(stream));
                    return false;
                }
                self.begin_capture(StreamHandle::new(stream)).await;
                debug!("camera monitoring resumed");
                true
            }
            Err(e) => {
                warn!(error = %e, "camera monitoring could not resume");
                self.mark_degraded(&format!("camera unavailable after resume: {}", e));
                false
            }
        }
    }

    /// Release the camera and end the interval for good; idempotent
    pub async fn stop(&self) {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == MonitorState::Stopped {
                return;
            }
            inner.state = MonitorState::Stopped;
            inner.task.take()
        };

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.release();
        }
        self.final_drain().await;
        info!(
            frames = self.frames_captured(),
            "camera monitoring stopped"
        );
    }

    fn mark_degraded(&self, reason: &str) {
        let signals = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == MonitorState::Stopped {
                return;
            }
            inner.state = MonitorState::Degraded;
            inner.signals.clone()
        };
        if let Some(signals) = signals {
            let _ = signals.send(ServiceSignal::CameraDegraded {
                reason: reason.to_string(),
            });
        }
    }

    async fn begin_capture(&self, stream: StreamHandle) {
        *self.stream.lock().await = Some(stream);

        let stream = Arc::clone(&self.stream);
        let buffer = Arc::clone(&self.buffer);
        let drain_gate = Arc::clone(&self.drain_gate);
        let frames_captured = Arc::clone(&self.frames_captured);
        let monitoring = Arc::clone(&self.monitoring);
        let clock = Arc::clone(&self.clock);
        let period = self.interval;
        let session_id = self.inner.lock().unwrap().session_id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let image = {
                    let mut guard = stream.lock().await;
                    match guard.as_mut() {
                        Some(handle) => handle.grab_frame().await,
                        None => break,
                    }
                };

                match image {
                    Ok(bytes) => {
                        let frame = MonitoringFrame::new(bytes, clock.now_utc());
                        frames_captured.fetch_add(1, Ordering::SeqCst);
                        if buffer.lock().unwrap().push(frame) {
                            debug!("frame buffer full, dropped oldest frame");
                        }
                        spawn_frame_drain(
                            Arc::clone(&monitoring),
                            session_id.clone(),
                            Arc::clone(&buffer),
                            Arc::clone(&drain_gate),
                        );
                    }
                    Err(e) => warn!(error = %e, "monitoring frame capture failed"),
                }
            }
        });

        let mut inner = self.inner.lock().unwrap();
        inner.state = MonitorState::Active;
        inner.task = Some(task);
    }

    /// Wait out any delivery in flight, then push what is left
    async fn final_drain(&self) {
        let Some(session_id) = self.inner.lock().unwrap().session_id.clone() else {
            return;
        };
        let _gate = self.drain_gate.lock().await;
        drain_frames(self.monitoring.as_ref(), &session_id, &self.buffer).await;
    }
}

/// Deliver buffered frames without blocking the capture interval.
///
/// Only one drain runs at a time; if one is already running it picks up the
/// new frame on its next pass.
fn spawn_frame_drain(
    monitoring: Arc<dyn MonitoringApi>,
    session_id: Option<String>,
    buffer: Arc<StdMutex<FrameBuffer>>,
    drain_gate: Arc<Mutex<()>>,
) {
    let Some(session_id) = session_id else {
        return;
    };
    let Ok(gate) = drain_gate.try_lock_owned() else {
        return;
    };

    tokio::spawn(async move {
        let _gate = gate;
        drain_frames(monitoring.as_ref(), &session_id, &buffer).await;
    });
}

/// Push buffered frames until the buffer is empty. A failed push puts the
/// rest back for the next capture cycle.
async fn drain_frames(
    monitoring: &dyn MonitoringApi,
    session_id: &str,
    buffer: &StdMutex<FrameBuffer>,
) {
    loop {
        let frames = buffer.lock().unwrap().take_all();
        if frames.is_empty() {
            return;
        }

        for (index, frame) in frames.iter().enumerate() {
            if let Err(e) = monitoring.push_frame(session_id, frame).await {
                warn!(error = %e, "monitoring frame delivery failed, will retry");
                buffer.lock().unwrap().requeue(frames[index..].to_vec());
                return;
            }
        }
    }
}

/// Who currently holds the camera hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraOwner {
    Idle,
    Monitoring,
    Capture,
}

struct ArbiterState {
    owner: CameraOwner,
    /// Monitoring should run whenever capture does not own the camera
    monitoring_wanted: bool,
}

/// Exclusive-access arbiter between monitoring and document capture
pub struct CameraArbiter {
    monitor: Arc<CameraMonitor>,
    state: Mutex<ArbiterState>,
}

impl CameraArbiter {
    pub fn new(monitor: Arc<CameraMonitor>) -> Self {
        Self {
            monitor,
            state: Mutex::new(ArbiterState {
                owner: CameraOwner::Idle,
                monitoring_wanted: false,
            }),
        }
    }

    pub async fn owner(&self) -> CameraOwner {
        self.state.lock().await.owner
    }

    /// Start background monitoring if capture does not hold the camera
    pub async fn start_monitoring(
        &self,
        session_id: Option<String>,
        signals: SignalSender,
    ) -> CameraStartOutcome {
        let mut state = self.state.lock().await;
        if state.owner == CameraOwner::Capture {
            state.monitoring_wanted = true;
            return CameraStartOutcome::Degraded("camera in use by document capture".into());
        }

        let outcome = self.monitor.start(session_id, signals).await;
        match &outcome {
            CameraStartOutcome::Active => {
                state.owner = CameraOwner::Monitoring;
                state.monitoring_wanted = true;
            }
            CameraStartOutcome::Degraded(_) => state.monitoring_wanted = true,
            CameraStartOutcome::Disabled | CameraStartOutcome::Fatal(_) => {
                state.monitoring_wanted = false
            }
        }
        outcome
    }

    /// Hand the camera to document capture, pausing monitoring first
    pub async fn claim_capture(&self) -> ProctorResult<()> {
        let mut state = self.state.lock().await;
        match state.owner {
            CameraOwner::Capture => {
                return Err(ProctorError::CameraUnavailable(
                    "document camera already open".into(),
                ))
            }
            CameraOwner::Monitoring => self.monitor.pause().await,
            CameraOwner::Idle => {}
        }
        state.owner = CameraOwner::Capture;
        debug!("camera claimed by document capture");
        Ok(())
    }

    /// Take the camera back from document capture, resuming monitoring
    pub async fn release_capture(&self) {
        let mut state = self.state.lock().await;
        if state.owner != CameraOwner::Capture {
            return;
        }
        state.owner = CameraOwner::Idle;
        if state.monitoring_wanted && self.monitor.resume().await {
            state.owner = CameraOwner::Monitoring;
        }
        debug!(owner = ?state.owner, "camera released by document capture");
    }

    /// Stop monitoring permanently
    pub async fn stop_monitoring(&self) {
        let mut state = self.state.lock().await;
        state.monitoring_wanted = false;
        self.monitor.stop().await;
        if state.owner == CameraOwner::Monitoring {
            state.owner = CameraOwner::Idle;
        }
    }
}
