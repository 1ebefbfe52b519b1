//! Contracts the session core needs from the outside world.
//!
//! Server collaborators (session, monitoring ingest, artifact storage, mobile
//! handoff) and host capabilities (camera, fullscreen, file picker) are traits
//! so the core never depends on a wire format or a UI toolkit. The core owns
//! its dependencies through `Arc<dyn ...>` and calls them without holding its
//! own state locks.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::capture::PageBlob;
use crate::session::config::CameraRequirement;
use crate::session::protocol::{
    ArtifactRef, MonitoringFrame, ResumeState, SubmitPayload, Violation,
};

/// Reply to `SessionApi::start`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub accepted: bool,
    /// Present when the server already holds progress for this attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ResumeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reply to `SessionApi::submit`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

/// Exam attempt lifecycle on the server
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn start(&self, test_id: &str) -> Result<StartResponse>;

    async fn submit(&self, test_id: &str, payload: &SubmitPayload) -> Result<SubmitResponse>;
}

/// Settings announced when opening a monitoring session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    pub camera: CameraRequirement,
    pub capture_interval_ms: u64,
    pub fullscreen_required: bool,
    pub max_violations: u32,
}

/// Monitoring-ingest collaborator. Everything except `start` is best-effort.
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    /// Returns the monitoring session id
    async fn start(&self, test_id: &str, settings: &MonitoringSettings) -> Result<String>;

    async fn push_frame(&self, session_id: &str, frame: &MonitoringFrame) -> Result<()>;

    async fn push_violation(&self, session_id: &str, violation: &Violation) -> Result<()>;

    async fn end(&self, session_id: &str) -> Result<()>;
}

/// Answer artifact storage
#[async_trait]
pub trait ArtifactApi: Send + Sync {
    /// Store an artifact that is already a single document
    async fn upload_single(&self, blob: &PageBlob) -> Result<ArtifactRef>;

    /// Assemble ordered page images into one document server-side
    async fn assemble_and_upload(&self, pages: &[PageBlob]) -> Result<ArtifactRef>;
}

/// Token issued for a mobile handoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffTicket {
    pub token: String,
    pub link: String,
}

/// Server view of a handoff token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteUploadStatus {
    Pending,
    Uploaded,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPoll {
    pub status: RemoteUploadStatus,
    pub upload_count: u32,
}

/// Mobile handoff collaborator
#[async_trait]
pub trait HandoffApi: Send + Sync {
    async fn request(&self, contact: &str, expiry_minutes: u32) -> Result<HandoffTicket>;

    async fn poll_status(&self, token: &str) -> Result<HandoffPoll>;
}

/// Which camera a stream should come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    /// Front camera, used for monitoring the student
    User,
    /// Rear camera, used for photographing answer pages
    Environment,
}

impl std::fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraFacing::User => write!(f, "user"),
            CameraFacing::Environment => write!(f, "environment"),
        }
    }
}

/// A live camera stream. `release` stops its tracks and frees the hardware.
#[async_trait]
pub trait MediaStream: Send {
    fn facing(&self) -> CameraFacing;

    /// Encoded still image of the current frame
    async fn grab_frame(&mut self) -> Result<Vec<u8>>;

    fn release(&mut self);
}

/// Host camera access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, facing: CameraFacing) -> Result<Box<dyn MediaStream>>;
}

/// Host fullscreen control
#[async_trait]
pub trait DisplayHost: Send + Sync {
    async fn request_fullscreen(&self) -> Result<()>;

    async fn exit_fullscreen(&self) -> Result<()>;
}

/// Host file picker; resolves once the student has chosen (possibly nothing)
#[async_trait]
pub trait FilePicker: Send + Sync {
    async fn pick(&self) -> Result<Vec<PageBlob>>;
}

/// Everything the controller talks to, bundled for construction
#[derive(Clone)]
pub struct Collaborators {
    pub session: Arc<dyn SessionApi>,
    pub monitoring: Arc<dyn MonitoringApi>,
    pub artifacts: Arc<dyn ArtifactApi>,
    pub handoff: Arc<dyn HandoffApi>,
    pub media: Arc<dyn MediaDevices>,
    pub display: Arc<dyn DisplayHost>,
    pub picker: Arc<dyn FilePicker>,
}
