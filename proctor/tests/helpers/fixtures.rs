use exam_proctor_lib::session::capture::PageBlob;
use exam_proctor_lib::session::clock::SystemClock;
use exam_proctor_lib::session::config::{CameraRequirement, ExamConfig};
use exam_proctor_lib::session::memory::InMemoryBackend;
use exam_proctor_lib::session::persistence::SessionJournal;
use exam_proctor_lib::session::SessionController;
use std::path::Path;
use std::sync::Arc;

pub const TEST_ID: &str = "algebra-midterm";
pub const STUDENT_ID: &str = "student-42";

/// One hour exam, optional camera, fullscreen required
pub fn exam_config() -> ExamConfig {
    let mut config = ExamConfig::new(TEST_ID, STUDENT_ID, 3600);
    config.camera = CameraRequirement::Optional;
    config.fullscreen_required = true;
    config
}

pub struct Exam {
    pub controller: Arc<SessionController>,
    pub backend: InMemoryBackend,
}

impl Exam {
    pub fn new(config: ExamConfig) -> Self {
        let backend = InMemoryBackend::new();
        let controller = SessionController::new(config, backend.collaborators());
        Self {
            controller,
            backend,
        }
    }

    /// Controller backed by a journal in `dir`, sharing an existing backend
    pub fn with_journal(config: ExamConfig, backend: InMemoryBackend, dir: &Path) -> Self {
        let controller = SessionController::with_parts(
            config,
            backend.collaborators(),
            Arc::new(SystemClock::new()),
            Some(SessionJournal::new(dir)),
        );
        Self {
            controller,
            backend,
        }
    }
}

pub fn page(name: &str) -> PageBlob {
    PageBlob::jpeg(format!("scan of {}", name).into_bytes()).named(name)
}
