// Exam configuration for a proctored session
// Loaded from JSON test settings, with PROCTOR_* environment overrides

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of violations that forces submission
pub const DEFAULT_MAX_VIOLATIONS: u32 = 3;
/// Default camera monitoring cadence
pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 30_000;
/// Monitoring frames held client-side before the oldest is dropped
pub const DEFAULT_FRAME_BUFFER_CAP: usize = 5;
pub const DEFAULT_HANDOFF_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HANDOFF_EXPIRY_MINUTES: u32 = 15;
pub const DEFAULT_MAX_PAGES: usize = 30;
pub const DEFAULT_MAX_PAGE_BYTES: usize = 10 * 1024 * 1024;

/// Whether the test monitors the student through the camera
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraRequirement {
    #[default]
    Disabled,
    /// Monitor when possible, continue degraded otherwise
    Optional,
    /// No camera, no exam
    Mandatory,
}

impl CameraRequirement {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CameraRequirement::Disabled)
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(self, CameraRequirement::Mandatory)
    }
}

impl std::str::FromStr for CameraRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(CameraRequirement::Disabled),
            "optional" => Ok(CameraRequirement::Optional),
            "mandatory" | "required" => Ok(CameraRequirement::Mandatory),
            _ => Err(format!("Unknown camera requirement: {}", s)),
        }
    }
}

/// Per-attempt test configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamConfig {
    pub test_id: String,
    pub student_id: String,
    /// Time limit for the attempt
    pub duration_seconds: u64,
    /// Violations that trigger auto-submit
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,
    #[serde(default)]
    pub camera: CameraRequirement,
    #[serde(default)]
    pub fullscreen_required: bool,
    /// Manual submit needs an answer artifact
    #[serde(default)]
    pub artifact_required: bool,
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,
    #[serde(default = "default_frame_buffer_cap")]
    pub frame_buffer_cap: usize,
    #[serde(default = "default_handoff_poll_interval_secs")]
    pub handoff_poll_interval_secs: u64,
    #[serde(default = "default_handoff_expiry_minutes")]
    pub handoff_expiry_minutes: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: usize,
    /// Directory for the local session journal
    #[serde(default = "ExamConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_max_violations() -> u32 {
    DEFAULT_MAX_VIOLATIONS
}

fn default_capture_interval_ms() -> u64 {
    DEFAULT_CAPTURE_INTERVAL_MS
}

fn default_frame_buffer_cap() -> usize {
    DEFAULT_FRAME_BUFFER_CAP
}

fn default_handoff_poll_interval_secs() -> u64 {
    DEFAULT_HANDOFF_POLL_INTERVAL_SECS
}

fn default_handoff_expiry_minutes() -> u32 {
    DEFAULT_HANDOFF_EXPIRY_MINUTES
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

fn default_max_page_bytes() -> usize {
    DEFAULT_MAX_PAGE_BYTES
}

impl ExamConfig {
    /// Configuration with defaults for everything but the identifiers and limit
    pub fn new(
        test_id: impl Into<String>,
        student_id: impl Into<String>,
        duration_seconds: u64,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            student_id: student_id.into(),
            duration_seconds,
            max_violations: DEFAULT_MAX_VIOLATIONS,
            camera: CameraRequirement::default(),
            fullscreen_required: false,
            artifact_required: false,
            capture_interval_ms: DEFAULT_CAPTURE_INTERVAL_MS,
            frame_buffer_cap: DEFAULT_FRAME_BUFFER_CAP,
            handoff_poll_interval_secs: DEFAULT_HANDOFF_POLL_INTERVAL_SECS,
            handoff_expiry_minutes: DEFAULT_HANDOFF_EXPIRY_MINUTES,
            max_pages: DEFAULT_MAX_PAGES,
            max_page_bytes: DEFAULT_MAX_PAGE_BYTES,
            state_dir: Self::default_state_dir(),
        }
    }

    /// Parse a JSON test configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse exam configuration")
    }

    /// Load a JSON test configuration from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read exam configuration: {}", path.display()))?;
        Self::from_json_str(&contents)
            .with_context(|| format!("Invalid exam configuration: {}", path.display()))
    }

    /// Apply PROCTOR_* overrides from the process environment
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PROCTOR_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("PROCTOR_MAX_VIOLATIONS") {
            self.max_violations = value
                .trim()
                .parse()
                .with_context(|| format!("PROCTOR_MAX_VIOLATIONS is not a number: {}", value))?;
        }
        if let Some(value) = lookup("PROCTOR_CAPTURE_INTERVAL_MS") {
            self.capture_interval_ms = value.trim().parse().with_context(|| {
                format!("PROCTOR_CAPTURE_INTERVAL_MS is not a number: {}", value)
            })?;
        }
        if let Some(value) = lookup("PROCTOR_HANDOFF_POLL_SECS") {
            self.handoff_poll_interval_secs = value.trim().parse().with_context(|| {
                format!("PROCTOR_HANDOFF_POLL_SECS is not a number: {}", value)
            })?;
        }
        if let Some(value) = lookup("PROCTOR_CAMERA") {
            self.camera = value.parse().map_err(|e: String| anyhow!(e))?;
        }
        Ok(self)
    }

    /// Reject configurations the session core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.test_id.trim().is_empty() {
            return Err(anyhow!("test_id must not be empty"));
        }
        if self.student_id.trim().is_empty() {
            return Err(anyhow!("student_id must not be empty"));
        }
        if self.duration_seconds == 0 {
            return Err(anyhow!("duration_seconds must be > 0"));
        }
        if self.max_violations == 0 {
            return Err(anyhow!("max_violations must be > 0"));
        }
        if self.capture_interval_ms < 1_000 {
            return Err(anyhow!(
                "capture_interval_ms must be at least 1000 (got {})",
                self.capture_interval_ms
            ));
        }
        if self.frame_buffer_cap == 0 {
            return Err(anyhow!("frame_buffer_cap must be > 0"));
        }
        if self.handoff_poll_interval_secs == 0 {
            return Err(anyhow!("handoff_poll_interval_secs must be > 0"));
        }
        if self.max_pages == 0 {
            return Err(anyhow!("max_pages must be > 0"));
        }
        Ok(())
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn handoff_poll_interval(&self) -> Duration {
        Duration::from_secs(self.handoff_poll_interval_secs)
    }

    /// Get the default state directory (session journal)
    pub fn default_state_dir() -> PathBuf {
        // All platforms: ~/.exam-proctor/ (or /tmp/exam-proctor if home unavailable)
        dirs::home_dir()
            .map(|h| h.join(".exam-proctor"))
            .unwrap_or_else(|| PathBuf::from("/tmp/exam-proctor"))
    }

    /// Directory holding one journal file per attempt
    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir.join("journal")
    }

    /// Ensure the journal directory exists with owner-only permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        let journal_dir = self.journal_dir();
        std::fs::create_dir_all(&journal_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&journal_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }
}
