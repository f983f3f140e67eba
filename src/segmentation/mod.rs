// ============================================================================
// SEGMENTATION SESSION: points in, mask buffers out
// ============================================================================
//
// State machine:
//   NoImage -> EmbeddingPending -> EmbeddingReady
//            -> (no points: MaskAbsent | points: SegmentingPending -> MaskReady)
//
// Embedding and segmentation run as background jobs. Every job carries the
// identity of the base image it was started for, plus (for segmentation) the
// point-set generation. Results are checked against the live values in one
// place, `is_current`, and dropped when they no longer match.

pub mod mask;
pub mod precomputed;
pub mod service;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::geometry::RelPoint;
use crate::tasks::TaskRunner;

use self::mask::{MaskBuffers, build_mask_buffers};
use self::service::{EmbeddingOutput, PointLabel, PromptPoint, SegmentationService};

pub type PointId = u64;

/// A user click, relative to the base image's own pixel grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

/// Identity of one base-image lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId(Uuid);

impl ImageId {
    fn fresh() -> Self {
        ImageId(Uuid::new_v4())
    }
}

/// The picture being segmented.
#[derive(Clone, Debug)]
pub struct BaseImage {
    pub id: ImageId,
    pub pixels: Arc<RgbaImage>,
    /// MIME type of the original upload, when known. Used for export.
    pub mime: Option<String>,
}

impl BaseImage {
    #[cfg(test)]
    pub(crate) fn for_tests(pixels: RgbaImage) -> Self {
        Self {
            id: ImageId::fresh(),
            pixels: Arc::new(pixels),
            mime: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[derive(Clone, Debug)]
enum EmbeddingState {
    Absent,
    Computing,
    Failed,
    Ready(EmbeddingOutput),
}

/// Externally visible phase of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NoImage,
    /// Waiting for a backend or for the embedding job.
    EmbeddingPending,
    /// Embedding failed. The base image stays displayed; `retry_embedding`
    /// starts over.
    EmbeddingFailed,
    EmbeddingReady,
    MaskAbsent,
    SegmentingPending,
    MaskReady,
}

enum SessionEvent {
    Embedded {
        image: ImageId,
        result: Result<EmbeddingOutput, EngineError>,
    },
    Segmented {
        image: ImageId,
        generation: u64,
        result: Result<MaskBuffers, EngineError>,
    },
}

pub struct SegmentationSession {
    service: Option<Arc<dyn SegmentationService>>,
    runner: TaskRunner,
    accent: Rgba<u8>,

    image: Option<BaseImage>,
    embedding: EmbeddingState,
    points: Vec<Point>,
    next_point_id: PointId,
    /// Bumped on every point mutation.
    points_generation: u64,
    mask: Option<MaskBuffers>,
    clip_globally: bool,
    state: SessionState,

    embed_in_flight: Option<ImageId>,
    segment_in_flight: Option<(ImageId, u64)>,

    status: String,
    sender: Sender<SessionEvent>,
    receiver: Receiver<SessionEvent>,
}

impl SegmentationSession {
    pub fn new(runner: TaskRunner, accent: Rgba<u8>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            service: None,
            runner,
            accent,
            image: None,
            embedding: EmbeddingState::Absent,
            points: Vec::new(),
            next_point_id: 1,
            points_generation: 0,
            mask: None,
            clip_globally: false,
            state: SessionState::NoImage,
            embed_in_flight: None,
            segment_in_flight: None,
            status: "Load an image to start".to_string(),
            sender,
            receiver,
        }
    }

    // ---- accessors ----------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn image(&self) -> Option<&BaseImage> {
        self.image.as_ref()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn mask(&self) -> Option<&MaskBuffers> {
        self.mask.as_ref()
    }

    pub fn clip_globally(&self) -> bool {
        self.clip_globally
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn has_service(&self) -> bool {
        self.service.is_some()
    }

    pub fn embedding_ready(&self) -> bool {
        matches!(self.embedding, EmbeddingState::Ready(_))
    }

    /// True while an embedding or segmentation job is outstanding.
    pub fn is_busy(&self) -> bool {
        self.embed_in_flight.is_some() || self.segment_in_flight.is_some()
    }

    // ---- service / image lifecycle -----------------------------------------

    /// Hand over a negotiated segmentation service. A waiting image starts
    /// embedding immediately.
    pub fn attach_service(&mut self, service: Arc<dyn SegmentationService>) {
        self.service = Some(service);
        if self.image.is_some() && matches!(self.embedding, EmbeddingState::Absent) {
            self.request_embedding();
        }
    }

    /// Replace the base image. Points, mask and clip toggle are dropped;
    /// anything still running for the old image will be discarded on arrival.
    pub fn set_image(&mut self, pixels: Arc<RgbaImage>, mime: Option<String>) -> ImageId {
        let id = ImageId::fresh();
        log_info!(
            "Segmentation: new base image {}x{} ({:?})",
            pixels.width(),
            pixels.height(),
            id
        );
        self.image = Some(BaseImage { id, pixels, mime });
        self.reset_for_new_image();
        self.state = SessionState::EmbeddingPending;
        self.request_embedding();
        id
    }

    /// Drop the base image entirely.
    pub fn clear_image(&mut self) {
        self.image = None;
        self.reset_for_new_image();
        self.state = SessionState::NoImage;
        self.status = "Load an image to start".to_string();
    }

    fn reset_for_new_image(&mut self) {
        self.embedding = EmbeddingState::Absent;
        self.points.clear();
        self.points_generation += 1;
        self.mask = None;
        self.clip_globally = false;
        self.embed_in_flight = None;
        self.segment_in_flight = None;
    }

    /// Start embedding again after a failure.
    pub fn retry_embedding(&mut self) {
        if self.state == SessionState::EmbeddingFailed {
            self.embedding = EmbeddingState::Absent;
            self.state = SessionState::EmbeddingPending;
            self.request_embedding();
        }
    }

    fn request_embedding(&mut self) {
        let Some(image) = self.image.as_ref() else { return };
        let Some(service) = self.service.clone() else {
            self.status = "Waiting for segmentation backend…".to_string();
            return;
        };
        if self.embed_in_flight == Some(image.id) {
            return;
        }
        let id = image.id;
        let pixels = Arc::clone(&image.pixels);
        let tx = self.sender.clone();
        self.embedding = EmbeddingState::Computing;
        self.embed_in_flight = Some(id);
        self.state = SessionState::EmbeddingPending;
        self.status = "Computing image embedding…".to_string();
        log_info!("Segmentation: embedding requested for {:?}", id);
        self.runner.spawn(move || {
            let result = service.embed(&pixels);
            let _ = tx.send(SessionEvent::Embedded { image: id, result });
        });
    }

    // ---- points -------------------------------------------------------------

    /// Add a click at an image-relative position. Coordinates are clamped.
    pub fn add_point(&mut self, at: RelPoint, label: PointLabel) -> Result<PointId, EngineError> {
        if self.image.is_none() {
            return Err(EngineError::InvalidInput("no base image loaded".to_string()));
        }
        let at = RelPoint::new(at.x, at.y);
        let id = self.next_point_id;
        self.next_point_id += 1;
        self.points.push(Point { id, x: at.x, y: at.y, label });
        self.points_changed();
        Ok(id)
    }

    pub fn remove_point(&mut self, id: PointId) -> bool {
        let before = self.points.len();
        self.points.retain(|p| p.id != id);
        if self.points.len() == before {
            return false;
        }
        self.points_changed();
        true
    }

    pub fn clear_points(&mut self) {
        if self.points.is_empty() && self.mask.is_none() {
            return;
        }
        self.points.clear();
        self.points_changed();
    }

    fn points_changed(&mut self) {
        self.points_generation += 1;
        self.recompute();
    }

    /// Bring the mask in line with the current point set. Level-triggered:
    /// while a job is running nothing new is started, and the completion
    /// handler calls back in here if the point set moved on meanwhile.
    fn recompute(&mut self) {
        let EmbeddingState::Ready(ref output) = self.embedding else {
            return;
        };
        if self.points.is_empty() {
            if self.mask.is_some() {
                log_info!("Segmentation: points cleared, mask discarded");
            }
            self.mask = None;
            self.clip_globally = false;
            // A result still in flight is dropped by its generation check.
            self.state = SessionState::MaskAbsent;
            self.status = "Click on the image to add points".to_string();
            return;
        }
        if self.segment_in_flight.is_some() {
            // The newer generation is requested once the current one lands.
            self.state = SessionState::SegmentingPending;
            return;
        }
        let (Some(image), Some(service)) = (self.image.as_ref(), self.service.clone()) else {
            return;
        };

        let meta = output.meta;
        let embedding = output.embedding.clone();
        let (rw, rh) = meta.reshaped_size;
        let prompts: Vec<PromptPoint> = self
            .points
            .iter()
            .map(|p| PromptPoint {
                x: p.x * rw as f32,
                y: p.y * rh as f32,
                label: p.label,
            })
            .collect();

        let id = image.id;
        let generation = self.points_generation;
        let base = Arc::clone(&image.pixels);
        let accent = self.accent;
        let tx = self.sender.clone();
        self.segment_in_flight = Some((id, generation));
        self.state = SessionState::SegmentingPending;
        self.status = format!("Segmenting ({} points)…", prompts.len());
        log_info!(
            "Segmentation: request gen {} with {} points",
            generation,
            prompts.len()
        );
        self.runner.spawn(move || {
            let result = service
                .segment(&embedding, &prompts)
                .and_then(|prediction| {
                    build_mask_buffers(service.as_ref(), &prediction, &meta, &base, accent)
                });
            let _ = tx.send(SessionEvent::Segmented { image: id, generation, result });
        });
    }

    // ---- clip toggle --------------------------------------------------------

    /// Enable or disable the global clip overlay. Enabling needs a mask.
    pub fn set_clip_globally(&mut self, on: bool) -> bool {
        if on && self.mask.is_none() {
            return false;
        }
        self.clip_globally = on;
        true
    }

    // ---- completion handling -----------------------------------------------

    fn is_current(&self, image: ImageId) -> bool {
        self.image.as_ref().is_some_and(|i| i.id == image)
    }

    /// Apply finished jobs. Returns true if anything changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.receiver.try_recv() {
            self.handle(event);
            changed = true;
        }
        changed
    }

    /// Block until no job is outstanding or `timeout` elapses.
    /// Returns true when the session went idle.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.poll();
        while self.is_busy() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Embedded { image, result } => {
                if self.embed_in_flight == Some(image) {
                    self.embed_in_flight = None;
                }
                if !self.is_current(image) {
                    log_info!("Segmentation: stale embedding for {:?} discarded", image);
                    return;
                }
                match result {
                    Ok(output) => {
                        log_info!(
                            "Segmentation: embedding ready (reshaped {}x{})",
                            output.meta.reshaped_size.0,
                            output.meta.reshaped_size.1
                        );
                        self.embedding = EmbeddingState::Ready(output);
                        self.state = SessionState::EmbeddingReady;
                        self.status = "Click on the image to add points".to_string();
                        if !self.points.is_empty() {
                            self.recompute();
                        }
                    }
                    Err(e) => {
                        log_err!("Segmentation: embedding failed: {}", e);
                        self.embedding = EmbeddingState::Failed;
                        self.state = SessionState::EmbeddingFailed;
                        self.status = format!("Embedding failed: {}", e);
                    }
                }
            }
            SessionEvent::Segmented { image, generation, result } => {
                if self.segment_in_flight == Some((image, generation)) {
                    self.segment_in_flight = None;
                }
                if !self.is_current(image) {
                    log_info!("Segmentation: stale mask for {:?} discarded", image);
                    return;
                }
                if generation != self.points_generation {
                    log_info!(
                        "Segmentation: mask gen {} superseded by gen {}",
                        generation,
                        self.points_generation
                    );
                    self.recompute();
                    return;
                }
                match result {
                    Ok(buffers) => {
                        log_info!(
                            "Segmentation: mask ready (candidate {}, score {:.3})",
                            buffers.candidate,
                            buffers.score
                        );
                        self.mask = Some(buffers);
                        self.state = SessionState::MaskReady;
                        self.status = "Mask ready".to_string();
                    }
                    Err(e) => {
                        log_err!("Segmentation: mask failed: {}", e);
                        self.mask = None;
                        self.clip_globally = false;
                        self.state = SessionState::MaskAbsent;
                        self.status = format!("Segmentation failed: {}", e);
                    }
                }
            }
        }
    }
}
