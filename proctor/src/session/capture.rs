//! Document capture pipeline: collects answer pages and turns them into one artifact.
//!
//! Pages arrive through the local file picker or the rear document camera.
//! Display order is insertion order (`order_index`); removing a page never
//! renumbers the others. `finalize` locks the set until `reset`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::camera::{CameraArbiter, StreamHandle};
use crate::session::collaborators::{ArtifactApi, CameraFacing, MediaDevices};
use crate::session::config::{DEFAULT_MAX_PAGES, DEFAULT_MAX_PAGE_BYTES};
use crate::session::error::{ProctorError, ProctorResult};
use crate::session::protocol::ArtifactRef;

pub const MEDIA_TYPE_PDF: &str = "application/pdf";
pub const MEDIA_TYPE_JPEG: &str = "image/jpeg";

/// Stable page identifier; never reused within a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw page content as handed over by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBlob {
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub name: Option<String>,
}

impl PageBlob {
    pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            bytes,
            name: None,
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new(MEDIA_TYPE_JPEG, bytes)
    }

    pub fn pdf(bytes: Vec<u8>) -> Self {
        Self::new(MEDIA_TYPE_PDF, bytes)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Already a finished document, no assembly needed
    pub fn is_document(&self) -> bool {
        self.media_type.eq_ignore_ascii_case(MEDIA_TYPE_PDF)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: PageId,
    pub source: PageBlob,
    pub order_index: u64,
    /// Taken with the document camera rather than picked from disk
    pub is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub max_pages: usize,
    pub max_page_bytes: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            max_page_bytes: DEFAULT_MAX_PAGE_BYTES,
        }
    }
}

/// Camera claimed for a rear stream that is still being acquired.
///
/// If the open is abandoned mid-acquire the camera goes back to monitoring.
struct CaptureClaim {
    arbiter: Option<Arc<CameraArbiter>>,
}

impl CaptureClaim {
    fn new(arbiter: Arc<CameraArbiter>) -> Self {
        Self {
            arbiter: Some(arbiter),
        }
    }

    /// The caller owns the outcome from here on
    fn settle(mut self) {
        self.arbiter = None;
    }
}

impl Drop for CaptureClaim {
    fn drop(&mut self) {
        let Some(arbiter) = self.arbiter.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            warn!("document camera open abandoned, returning camera to monitoring");
            runtime.spawn(async move { arbiter.release_capture().await });
        }
    }
}

pub struct DocumentCapture {
    arbiter: Arc<CameraArbiter>,
    media: Arc<dyn MediaDevices>,
    artifacts: Arc<dyn ArtifactApi>,
    limits: PageLimits,
    pages: Vec<Page>,
    next_id: u64,
    next_order: u64,
    locked: bool,
    artifact: Option<ArtifactRef>,
    camera: Option<StreamHandle>,
}

impl DocumentCapture {
    pub fn new(
        arbiter: Arc<CameraArbiter>,
        media: Arc<dyn MediaDevices>,
        artifacts: Arc<dyn ArtifactApi>,
        limits: PageLimits,
    ) -> Self {
        Self {
            arbiter,
            media,
            artifacts,
            limits,
            pages: Vec::new(),
            next_id: 1,
            next_order: 0,
            locked: false,
            artifact: None,
            camera: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn is_camera_open(&self) -> bool {
        self.camera.is_some()
    }

    /// Pages in display order
    pub fn ordered_pages(&self) -> Vec<&Page> {
        let mut pages: Vec<&Page> = self.pages.iter().collect();
        pages.sort_by_key(|p| p.order_index);
        pages
    }

    pub fn add_page(&mut self, blob: PageBlob) -> ProctorResult<PageId> {
        self.push_page(blob, false)
    }

    /// Local file-picker channel; every selected file becomes one page.
    ///
    /// The batch is checked up front so a rejected file adds nothing.
    pub fn add_files(&mut self, files: Vec<PageBlob>) -> ProctorResult<Vec<PageId>> {
        self.ensure_unlocked()?;
        if self.pages.len() + files.len() > self.limits.max_pages {
            return Err(ProctorError::PageRejected(format!(
                "at most {} pages allowed",
                self.limits.max_pages
            )));
        }
        for file in &files {
            self.check_blob(file)?;
        }

        files
            .into_iter()
            .map(|file| self.push_page(file, false))
            .collect()
    }

    pub fn remove_page(&mut self, id: PageId) -> ProctorResult<()> {
        self.ensure_unlocked()?;
        let position = self
            .pages
            .iter()
            .position(|p| p.id == id)
            .ok_or(ProctorError::PageNotFound(id))?;
        self.pages.remove(position);
        debug!(page = %id, "page removed");
        Ok(())
    }

    /// Claim the camera and open the rear-facing stream
    pub async fn open_camera(&mut self) -> ProctorResult<()> {
        self.ensure_unlocked()?;
        if self.camera.is_some() {
            return Ok(());
        }

        self.arbiter.claim_capture().await?;
        let claim = CaptureClaim::new(Arc::clone(&self.arbiter));
        match self.media.acquire(CameraFacing::Environment).await {
            Ok(stream) => {
                claim.settle();
                self.camera = Some(StreamHandle::new(stream));
                debug!("document camera open");
                Ok(())
            }
            Err(e) => {
                claim.settle();
                self.arbiter.release_capture().await;
                Err(ProctorError::CameraUnavailable(e.to_string()))
            }
        }
    }

    /// Photograph one page with the open document camera
    pub async fn snap(&mut self) -> ProctorResult<PageId> {
        self.ensure_unlocked()?;
        self.check_capacity()?;
        let stream = self
            .camera
            .as_mut()
            .ok_or_else(|| ProctorError::CameraUnavailable("document camera is not open".into()))?;
        let bytes = stream
            .grab_frame()
            .await
            .map_err(|e| ProctorError::CameraUnavailable(e.to_string()))?;
        self.push_page(PageBlob::jpeg(bytes), true)
    }

    /// Release the rear stream, then hand the camera back to monitoring
    pub async fn close_camera(&mut self) {
        if let Some(mut stream) = self.camera.take() {
            stream.release();
            self.arbiter.release_capture().await;
            debug!("document camera closed");
        }
    }

    /// Open, take `shots` pictures, and close the camera whatever happens
    pub async fn capture_via_device_camera(&mut self, shots: usize) -> ProctorResult<Vec<PageId>> {
        self.open_camera().await?;

        let mut taken = Vec::with_capacity(shots);
        let mut failure = None;
        for _ in 0..shots {
            match self.snap().await {
                Ok(id) => taken.push(id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.close_camera().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(taken),
        }
    }

    /// Turn the page set into one uploaded artifact and lock the set.
    ///
    /// Calling again after success returns the same reference.
    pub async fn finalize(&mut self) -> ProctorResult<ArtifactRef> {
        if let (true, Some(artifact)) = (self.locked, self.artifact.as_ref()) {
            return Ok(artifact.clone());
        }
        if self.pages.is_empty() {
            return Err(ProctorError::EmptyArtifact);
        }
        self.close_camera().await;

        let ordered: Vec<PageBlob> = self
            .ordered_pages()
            .into_iter()
            .map(|p| p.source.clone())
            .collect();

        let result = if ordered.len() == 1 && ordered[0].is_document() {
            self.artifacts.upload_single(&ordered[0]).await
        } else {
            self.artifacts.assemble_and_upload(&ordered).await
        };

        match result {
            Ok(artifact) => {
                info!(pages = ordered.len(), artifact = %artifact, "answer artifact uploaded");
                self.locked = true;
                self.artifact = Some(artifact.clone());
                Ok(artifact)
            }
            Err(e) => {
                warn!(error = %e, "answer artifact upload failed");
                Err(ProctorError::UploadFailed(e.to_string()))
            }
        }
    }

    /// Drop every page and unlock
    pub async fn reset(&mut self) {
        self.close_camera().await;
        self.pages.clear();
        self.locked = false;
        self.artifact = None;
    }

    fn push_page(&mut self, blob: PageBlob, is_captured: bool) -> ProctorResult<PageId> {
        self.ensure_unlocked()?;
        self.check_capacity()?;
        self.check_blob(&blob)?;

        let id = PageId(self.next_id);
        self.next_id += 1;
        let order_index = self.next_order;
        self.next_order += 1;

        self.pages.push(Page {
            id,
            source: blob,
            order_index,
            is_captured,
        });
        debug!(page = %id, order_index, is_captured, "page added");
        Ok(id)
    }

    fn ensure_unlocked(&self) -> ProctorResult<()> {
        if self.locked {
            Err(ProctorError::PipelineLocked)
        } else {
            Ok(())
        }
    }

    fn check_capacity(&self) -> ProctorResult<()> {
        if self.pages.len() >= self.limits.max_pages {
            return Err(ProctorError::PageRejected(format!(
                "at most {} pages allowed",
                self.limits.max_pages
            )));
        }
        Ok(())
    }

    fn check_blob(&self, blob: &PageBlob) -> ProctorResult<()> {
        if blob.is_empty() {
            return Err(ProctorError::PageRejected("page is empty".into()));
        }
        if blob.len() > self.limits.max_page_bytes {
            return Err(ProctorError::PageRejected(format!(
                "page is {} bytes, limit is {}",
                blob.len(),
                self.limits.max_page_bytes
            )));
        }
        Ok(())
    }
}
