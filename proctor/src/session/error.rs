//! Error taxonomy for the exam session core.
//!
//! Transient delivery failures (frames, violations, polls) never show up here:
//! they are logged by the owning service and retried on its next cycle.

use thiserror::Error;

use crate::session::capture::PageId;
use crate::session::protocol::SessionState;

/// Errors surfaced to callers of the session core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProctorError {
    /// A mandatory precondition (camera, fullscreen, server acceptance) failed.
    #[error("session start rejected: {0}")]
    StartRejected(String),

    /// Manual submit without the answer artifact the test requires.
    #[error("an answer artifact is required before submitting")]
    ArtifactRequired,

    /// Finalize was asked for with no pages collected.
    #[error("no pages to build an answer artifact from")]
    EmptyArtifact,

    /// The page set was finalized; `reset` before changing it.
    #[error("page set is locked after finalize")]
    PipelineLocked,

    /// Local capture channels are closed while a mobile upload is active.
    #[error("local capture is disabled while a mobile upload is active")]
    LocalCaptureDisabled,

    /// No page with this id.
    #[error("page {0} not found")]
    PageNotFound(PageId),

    /// Page exceeds configured limits.
    #[error("page rejected: {0}")]
    PageRejected(String),

    /// A mobile upload already arrived; its token stays the answer.
    #[error("a mobile upload was already received for this attempt")]
    HandoffAlreadyUploaded,

    /// Contact address is neither an email nor a phone number.
    #[error("invalid contact address: {0}")]
    InvalidContact(String),

    /// Operation not allowed in the current state.
    #[error("cannot {action} while session is {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    /// The document camera could not be opened or used.
    #[error("document camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Assembly or upload of the answer artifact failed.
    #[error("artifact upload failed: {0}")]
    UploadFailed(String),

    /// The submission collaborator rejected or failed the delivery.
    #[error("submission failed: {0}")]
    SubmitFailed(String),

    /// A collaborator call failed outside the submission path.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl ProctorError {
    /// Errors that leave the session able to retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProctorError::UploadFailed(_)
                | ProctorError::SubmitFailed(_)
                | ProctorError::StartRejected(_)
                | ProctorError::CameraUnavailable(_)
                | ProctorError::Collaborator(_)
        )
    }

    /// Usage errors: rejected synchronously with state unchanged.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ProctorError::ArtifactRequired
                | ProctorError::EmptyArtifact
                | ProctorError::PipelineLocked
                | ProctorError::LocalCaptureDisabled
                | ProctorError::PageNotFound(_)
                | ProctorError::PageRejected(_)
                | ProctorError::HandoffAlreadyUploaded
                | ProctorError::InvalidContact(_)
                | ProctorError::InvalidTransition { .. }
        )
    }
}

pub type ProctorResult<T> = Result<T, ProctorError>;
