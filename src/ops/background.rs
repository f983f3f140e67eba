// ============================================================================
// BACKGROUND REMOVAL: apply a model's alpha matte to a layer
// ============================================================================

use image::{GrayImage, RgbaImage};
use rayon::prelude::*;

use crate::error::EngineError;
use crate::segmentation::service::AlphaMatte;

/// How the matte is turned into alpha.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatteSettings {
    /// Foreground probability threshold (0.0–1.0).
    pub threshold: f32,
    /// Steep sigmoid around the threshold instead of a hard cut.
    pub smooth_edges: bool,
}

impl Default for MatteSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            smooth_edges: true,
        }
    }
}

/// Whether matte values already look like probabilities (U²-Net, IS-Net)
/// rather than raw logits (BiRefNet).
fn is_probability_space(data: &[f32]) -> bool {
    if data.is_empty() {
        return false;
    }
    let step = (data.len() / 10000).max(1);
    let mut min_val = f32::MAX;
    let mut max_val = f32::MIN;
    for i in (0..data.len()).step_by(step) {
        min_val = min_val.min(data[i]);
        max_val = max_val.max(data[i]);
    }
    min_val >= -0.05 && max_val <= 1.05
}

#[inline]
fn to_probability(v: f32, already_prob: bool) -> f32 {
    if already_prob {
        v.clamp(0.0, 1.0)
    } else {
        1.0 / (1.0 + (-v).exp())
    }
}

/// Matte -> 8-bit mask at the matte's own resolution.
pub fn matte_to_mask(matte: &AlphaMatte, settings: &MatteSettings) -> Result<GrayImage, EngineError> {
    let expected = matte.width as usize * matte.height as usize;
    if expected == 0 || matte.data.len() != expected {
        return Err(EngineError::Inference(format!(
            "matte is {}x{} but carries {} values",
            matte.width,
            matte.height,
            matte.data.len()
        )));
    }
    let is_prob = is_probability_space(&matte.data);
    let pixels: Vec<u8> = matte
        .data
        .par_iter()
        .map(|&v| {
            let prob = to_probability(v, is_prob);
            if settings.smooth_edges {
                let steepness = 12.0;
                let remapped = 1.0 / (1.0 + (-(prob - settings.threshold) * steepness).exp());
                (remapped * 255.0).clamp(0.0, 255.0) as u8
            } else if prob >= settings.threshold {
                255u8
            } else {
                0u8
            }
        })
        .collect();
    GrayImage::from_raw(matte.width, matte.height, pixels)
        .ok_or_else(|| EngineError::Inference("matte buffer size mismatch".to_string()))
}

/// Multiply the matte into the image's alpha. The result has the input's
/// dimensions; the matte is resized when the model ran at another resolution.
pub fn apply_alpha_matte(
    input: &RgbaImage,
    matte: &AlphaMatte,
    settings: &MatteSettings,
) -> Result<RgbaImage, EngineError> {
    let (w, h) = input.dimensions();
    if w == 0 || h == 0 {
        return Err(EngineError::InvalidInput("layer has no pixels".to_string()));
    }
    let mask = matte_to_mask(matte, settings)?;
    let mask = if mask.dimensions() != (w, h) {
        image::imageops::resize(&mask, w, h, image::imageops::FilterType::Triangle)
    } else {
        mask
    };

    let mut output = input.clone();
    let mask_raw = mask.as_raw();
    output
        .par_chunks_mut(w as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let mrow = &mask_raw[y * w as usize..(y + 1) * w as usize];
            for (x, &m) in mrow.iter().enumerate() {
                let orig_alpha = row[x * 4 + 3] as f32 / 255.0;
                let mask_alpha = m as f32 / 255.0;
                row[x * 4 + 3] = (orig_alpha * mask_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        });
    Ok(output)
}
