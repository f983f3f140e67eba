// ============================================================================
// PRECOMPUTED SERVICES: file-backed stand-ins for the inference models
// ============================================================================
//
// `PrecomputedMaskService` answers segmentation queries from a mask image made
// ahead of time. It proposes two candidates, the mask and its inverse, and
// scores them by how well they agree with the prompt points, so positive and
// negative clicks still decide which side is the subject.
//
// `PrecomputedMatteService` returns a grayscale image as the alpha matte.

use std::path::Path;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};

use crate::error::EngineError;
use crate::segmentation::service::{
    AlphaMatte, BackgroundRemovalService, Embedding, EmbeddingOutput, MaskPrediction, PixelMasks,
    PointLabel, PreprocessMeta, PromptPoint, SegmentationService,
};

pub struct PrecomputedMaskService {
    /// 0 or 1 per pixel.
    plane: GrayImage,
}

impl PrecomputedMaskService {
    /// Luma >= 128 counts as covered.
    pub fn from_luma(mask: &GrayImage) -> Result<Self, EngineError> {
        if mask.width() == 0 || mask.height() == 0 {
            return Err(EngineError::InvalidInput("mask image is empty".to_string()));
        }
        let plane = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            image::Luma([u8::from(mask.get_pixel(x, y)[0] >= 128)])
        });
        Ok(Self { plane })
    }

    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let decoded = crate::io::load_file(path)?;
        let luma = image::DynamicImage::ImageRgba8(decoded.pixels).to_luma8();
        Self::from_luma(&luma)
    }

    fn covered(&self, x: f32, y: f32) -> bool {
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return false;
        }
        let (w, h) = self.plane.dimensions();
        let (xi, yi) = (x as u32, y as u32);
        xi < w && yi < h && self.plane.get_pixel(xi, yi)[0] == 1
    }

    /// Agreement in [0, 1] between a candidate and the prompt points.
    fn agreement(&self, points: &[PromptPoint], inverted: bool) -> f32 {
        if points.is_empty() {
            return 0.0;
        }
        let agree = points
            .iter()
            .filter(|p| {
                let inside = self.covered(p.x, p.y) != inverted;
                inside == (p.label == PointLabel::Positive)
            })
            .count();
        agree as f32 / points.len() as f32
    }
}

impl SegmentationService for PrecomputedMaskService {
    fn embed(&self, image: &RgbaImage) -> Result<EmbeddingOutput, EngineError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EngineError::Inference("cannot embed an empty image".to_string()));
        }
        Ok(EmbeddingOutput {
            embedding: Embedding {
                data: Arc::from(Vec::<f32>::new()),
                shape: vec![0],
            },
            meta: PreprocessMeta {
                original_size: image.dimensions(),
                reshaped_size: self.plane.dimensions(),
            },
        })
    }

    fn segment(&self, _embedding: &Embedding, points: &[PromptPoint]) -> Result<MaskPrediction, EngineError> {
        let (w, h) = self.plane.dimensions();
        let mut masks = Vec::with_capacity(w as usize * h as usize * 2);
        // Logit-like values: positive inside.
        masks.extend(self.plane.as_raw().iter().map(|&v| if v == 1 { 1.0 } else { -1.0 }));
        masks.extend(self.plane.as_raw().iter().map(|&v| if v == 1 { -1.0 } else { 1.0 }));
        Ok(MaskPrediction {
            masks,
            candidates: 2,
            width: w,
            height: h,
            scores: vec![self.agreement(points, false), self.agreement(points, true)],
        })
    }

    fn post_process_masks(&self, prediction: &MaskPrediction, meta: &PreprocessMeta) -> Result<PixelMasks, EngineError> {
        let (pw, ph) = (prediction.width, prediction.height);
        let plane = pw as usize * ph as usize;
        if plane == 0 || prediction.masks.len() != plane * prediction.candidates {
            return Err(EngineError::Inference("prediction shape mismatch".to_string()));
        }
        let (ow, oh) = meta.original_size;
        let mut data = Vec::with_capacity(ow as usize * oh as usize * prediction.candidates);
        for chunk in prediction.masks.chunks_exact(plane) {
            let bits: Vec<u8> = chunk.iter().map(|&v| u8::from(v > 0.0)).collect();
            let small = GrayImage::from_raw(pw, ph, bits)
                .ok_or_else(|| EngineError::Inference("mask plane size mismatch".to_string()))?;
            let full = if (pw, ph) == (ow, oh) {
                small
            } else {
                imageops::resize(&small, ow, oh, FilterType::Nearest)
            };
            data.extend_from_slice(full.as_raw());
        }
        Ok(PixelMasks {
            data,
            candidates: prediction.candidates,
            width: ow,
            height: oh,
        })
    }
}

pub struct PrecomputedMatteService {
    matte: AlphaMatte,
}

impl PrecomputedMatteService {
    pub fn from_luma(luma: &GrayImage) -> Result<Self, EngineError> {
        if luma.width() == 0 || luma.height() == 0 {
            return Err(EngineError::InvalidInput("matte image is empty".to_string()));
        }
        Ok(Self {
            matte: AlphaMatte {
                data: luma.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
                width: luma.width(),
                height: luma.height(),
            },
        })
    }

    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let decoded = crate::io::load_file(path)?;
        let luma = image::DynamicImage::ImageRgba8(decoded.pixels).to_luma8();
        Self::from_luma(&luma)
    }
}

impl BackgroundRemovalService for PrecomputedMatteService {
    fn run(&self, _image: &RgbaImage) -> Result<AlphaMatte, EngineError> {
        Ok(self.matte.clone())
    }
}
