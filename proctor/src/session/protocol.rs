// Session protocol - shared structs for the exam session core and its host
// Uses framed JSON messages when exchanged with a presentation layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle state of an exam attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SessionState {
    /// Created but `start` has not succeeded yet
    NotStarted,
    /// Exam in progress
    Active,
    /// Student asked to leave; partial payload being delivered
    Exiting,
    /// Final payload being delivered (lock held)
    Submitting,
    /// Collaborator accepted the payload; terminal
    Submitted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::NotStarted => write!(f, "NotStarted"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Exiting => write!(f, "Exiting"),
            SessionState::Submitting => write!(f, "Submitting"),
            SessionState::Submitted => write!(f, "Submitted"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(SessionState::NotStarted),
            "Active" => Ok(SessionState::Active),
            "Exiting" => Ok(SessionState::Exiting),
            "Submitting" => Ok(SessionState::Submitting),
            "Submitted" => Ok(SessionState::Submitted),
            _ => Err(format!("Unknown session state: {}", s)),
        }
    }
}

/// Kinds of integrity violations detected during an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    TabSwitch,
    FullscreenExit,
    ProhibitedKeys,
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationType::TabSwitch => write!(f, "tab_switch"),
            ViolationType::FullscreenExit => write!(f, "fullscreen_exit"),
            ViolationType::ProhibitedKeys => write!(f, "prohibited_keys"),
        }
    }
}

/// A single entry of the append-only violation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

impl Violation {
    pub fn new(violation_type: ViolationType, details: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            violation_type,
            timestamp: at,
            details: details.into(),
        }
    }
}

/// Server-side reference to a finalized answer artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reference for work delivered through the mobile handoff channel.
    ///
    /// The phone uploads straight to the server under the handoff token, so the
    /// token is what identifies the artifact.
    pub fn from_handoff_token(token: &str) -> Self {
        Self(format!("mobile:{}", token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The authoritative record of one exam attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Monitoring session id issued by the monitoring collaborator (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub test_id: String,
    pub student_id: String,
    pub state: SessionState,
    /// Wall-clock anchor of the countdown (already shifted back on resume)
    pub started_at_epoch_ms: i64,
    pub duration_seconds: u64,
    pub time_taken_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_artifact_ref: Option<ArtifactRef>,
    pub violations: Vec<Violation>,
    /// Why the attempt ended, once it has
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<SubmitReason>,
    /// Receipt returned by the submission collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl Session {
    pub fn new(test_id: String, student_id: String, duration_seconds: u64) -> Self {
        Self {
            session_id: None,
            test_id,
            student_id,
            state: SessionState::NotStarted,
            started_at_epoch_ms: 0,
            duration_seconds,
            time_taken_seconds: 0,
            answer_artifact_ref: None,
            violations: Vec::new(),
            end_reason: None,
            result_ref: None,
        }
    }
}

/// Whether a submission was asked for by the student or forced by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    Manual,
    Auto,
}

/// Reason recorded alongside the final payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitReason {
    Manual,
    TimeLimit,
    MaxViolationsExceeded,
    StudentExit,
}

impl std::fmt::Display for SubmitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitReason::Manual => write!(f, "manual"),
            SubmitReason::TimeLimit => write!(f, "time_limit"),
            SubmitReason::MaxViolationsExceeded => write!(f, "max_violations_exceeded"),
            SubmitReason::StudentExit => write!(f, "student_exit"),
        }
    }
}

/// Final payload handed to the submission collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_artifact_ref: Option<ArtifactRef>,
    pub violations: Vec<Violation>,
    pub time_taken_seconds: u64,
    pub reason: SubmitReason,
}

/// Periodic camera snapshot kept as monitoring evidence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringFrame {
    pub timestamp: DateTime<Utc>,
    pub image: Vec<u8>,
    /// Hex SHA-256 of `image`, lets the ingest side detect tampering in transit
    pub digest: String,
}

impl MonitoringFrame {
    pub fn new(image: Vec<u8>, at: DateTime<Utc>) -> Self {
        let digest = hex::encode(Sha256::digest(&image));
        Self {
            timestamp: at,
            image,
            digest,
        }
    }
}

/// Status of a mobile handoff token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Idle,
    Requested,
    Uploaded,
    Expired,
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffStatus::Idle => write!(f, "idle"),
            HandoffStatus::Requested => write!(f, "requested"),
            HandoffStatus::Uploaded => write!(f, "uploaded"),
            HandoffStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A short-lived "continue on your phone" upload request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MobileUploadRequest {
    pub token: String,
    /// Link sent to the phone; also the QR payload
    pub link: String,
    pub expires_at_epoch_ms: i64,
    pub status: HandoffStatus,
    pub upload_count: u32,
}

/// Server-confirmed progress used to resume an attempt after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub time_taken_seconds: u64,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

// ============================================================================
// Core -> presentation layer notifications (broadcast)
// ============================================================================

/// Observable signal emitted by the session core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Attempt became active
    Started { resumed: bool },
    /// One countdown tick
    Tick { remaining_seconds: u64 },
    /// Countdown hit zero
    TimeExpired,
    /// A violation was recorded below the threshold
    Warning {
        violation: Violation,
        remaining: u32,
    },
    /// The violation threshold was reached
    Escalated { violation_count: usize },
    /// Camera monitoring continues without a stream
    CameraDegraded { reason: String },
    /// New work arrived through the mobile handoff
    HandoffDetected { upload_count: u32 },
    /// Handoff token expired without an upload
    HandoffExpired,
    /// Final payload delivery started
    Submitting { reason: SubmitReason },
    /// Collaborator accepted the payload
    Submitted {
        reason: SubmitReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_ref: Option<String>,
    },
    /// Delivery failed; `retry_submit` may be called
    SubmitFailed { message: String },
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message to JSON bytes with newline delimiter
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_roundtrip() {
        for state in [
            SessionState::NotStarted,
            SessionState::Active,
            SessionState::Exiting,
            SessionState::Submitting,
            SessionState::Submitted,
        ] {
            let s = state.to_string();
            let parsed: SessionState = s.parse().unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn test_violation_wire_format() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let violation = Violation::new(ViolationType::TabSwitch, "document hidden", at);
        let json = serde_json::to_value(&violation).unwrap();

        assert_eq!(json["type"], "tab_switch");
        assert_eq!(json["details"], "document hidden");
        assert_eq!(json["timestamp"], "2026-03-01T10:00:00Z");
    }

    #[test]
    fn test_event_framing() {
        let event = SessionEvent::Submitted {
            reason: SubmitReason::MaxViolationsExceeded,
            result_ref: Some("result-7".to_string()),
        };

        let bytes = serialize_message(&event).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert!(String::from_utf8_lossy(&bytes).contains("\"type\":\"submitted\""));

        let parsed: SessionEvent = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_frame_digest_is_sha256_hex() {
        let frame = MonitoringFrame::new(b"abc".to_vec(), Utc::now());
        assert_eq!(
            frame.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_handoff_artifact_ref() {
        let artifact = ArtifactRef::from_handoff_token("tok-1");
        assert_eq!(artifact.as_str(), "mobile:tok-1");
        assert_eq!(serde_json::to_string(&artifact).unwrap(), "\"mobile:tok-1\"");
    }
}
