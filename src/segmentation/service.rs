// ============================================================================
// INFERENCE SERVICE CONTRACTS
// ============================================================================
//
// The neural networks live outside the engine. These traits are everything
// the engine needs from them; implementations are chosen by the backend
// negotiator and attached once ready.

use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Foreground/background intent of a prompt point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointLabel {
    Negative,
    Positive,
}

/// A prompt point already scaled into the service's reshaped input space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PromptPoint {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

/// Opaque per-image representation. The engine only stores and hands it back.
#[derive(Clone, Debug)]
pub struct Embedding {
    pub data: Arc<[f32]>,
    pub shape: Vec<usize>,
}

/// How the service resized the image before embedding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreprocessMeta {
    /// (width, height) of the image handed to `embed`.
    pub original_size: (u32, u32),
    /// (width, height) the service resized it to internally.
    pub reshaped_size: (u32, u32),
}

#[derive(Clone, Debug)]
pub struct EmbeddingOutput {
    pub embedding: Embedding,
    pub meta: PreprocessMeta,
}

/// Raw segmentation output: `candidates` low-resolution mask planes stored
/// back to back plus one confidence score per plane.
#[derive(Clone, Debug)]
pub struct MaskPrediction {
    pub masks: Vec<f32>,
    pub candidates: usize,
    pub width: u32,
    pub height: u32,
    pub scores: Vec<f32>,
}

/// Binary masks (0 or 1 per pixel) after the service's own post-processing.
/// Planes are stored back to back; plane `i` starts at `i * width * height`.
#[derive(Clone, Debug)]
pub struct PixelMasks {
    pub data: Vec<u8>,
    pub candidates: usize,
    pub width: u32,
    pub height: u32,
}

impl PixelMasks {
    pub fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Point-prompted segmentation model.
pub trait SegmentationService: Send + Sync {
    /// Compute the reusable embedding for one image.
    fn embed(&self, image: &RgbaImage) -> Result<EmbeddingOutput, EngineError>;

    /// Predict mask candidates for the full point list.
    fn segment(
        &self,
        embedding: &Embedding,
        points: &[PromptPoint],
    ) -> Result<MaskPrediction, EngineError>;

    /// Undo the service's padding/resizing and binarise the candidates.
    fn post_process_masks(
        &self,
        prediction: &MaskPrediction,
        meta: &PreprocessMeta,
    ) -> Result<PixelMasks, EngineError>;
}

/// Per-pixel foreground estimate from a background-removal model. Values are
/// either probabilities in [0, 1] or raw logits; the consumer decides.
#[derive(Clone, Debug)]
pub struct AlphaMatte {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// Background-removal model.
pub trait BackgroundRemovalService: Send + Sync {
    fn run(&self, image: &RgbaImage) -> Result<AlphaMatte, EngineError>;
}
