// ============================================================================
// MASK BUFFERS: highlight and clip rasters from segmentation output
// ============================================================================

use std::sync::Arc;

use image::{GrayImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::error::EngineError;
use crate::segmentation::service::{MaskPrediction, PixelMasks, PreprocessMeta, SegmentationService};

/// Renderable products of one segmentation query. Built whole, never patched.
#[derive(Clone, Debug)]
pub struct MaskBuffers {
    /// Accent colour where the mask is 1, transparent elsewhere.
    pub highlight: Arc<RgbaImage>,
    /// The base image with alpha forced to 0 where the mask is 1.
    pub clip: Arc<RgbaImage>,
    /// The winning binary plane (0 or 1 per pixel).
    pub mask: Arc<GrayImage>,
    /// Confidence score of the winning candidate.
    pub score: f32,
    /// Index of the winning candidate in service output order.
    pub candidate: usize,
}

impl MaskBuffers {
    pub fn width(&self) -> u32 {
        self.mask.width()
    }

    pub fn height(&self) -> u32 {
        self.mask.height()
    }

    /// Mask value at a relative position of the mask plane.
    pub fn covers_relative(&self, rx: f32, ry: f32) -> bool {
        mask_at_relative(&self.mask, rx, ry)
    }
}

/// Nearest-neighbour mask lookup at a relative position. Outside [0, 1) is
/// never covered.
pub fn mask_at_relative(mask: &GrayImage, rx: f32, ry: f32) -> bool {
    if !(0.0..1.0).contains(&rx) || !(0.0..1.0).contains(&ry) {
        return false;
    }
    let x = ((rx * mask.width() as f32) as u32).min(mask.width().saturating_sub(1));
    let y = ((ry * mask.height() as f32) as u32).min(mask.height().saturating_sub(1));
    mask.get_pixel(x, y)[0] == 1
}

/// Index of the highest score; the first one wins ties. NaN scores never win.
pub fn select_best_candidate(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// Slice the winning plane out of the post-processed masks.
pub fn extract_plane(masks: &PixelMasks, candidate: usize) -> Result<GrayImage, EngineError> {
    let plane = masks.plane_len();
    if plane == 0 {
        return Err(EngineError::Inference("mask has zero area".to_string()));
    }
    let start = candidate * plane;
    let end = start + plane;
    if candidate >= masks.candidates || end > masks.data.len() {
        return Err(EngineError::Inference(format!(
            "mask plane {} out of range ({} candidates, {} values)",
            candidate,
            masks.candidates,
            masks.data.len()
        )));
    }
    let bits: Vec<u8> = masks.data[start..end].iter().map(|&v| u8::from(v != 0)).collect();
    GrayImage::from_raw(masks.width, masks.height, bits)
        .ok_or_else(|| EngineError::Inference("mask plane size mismatch".to_string()))
}

/// Accent colour on every covered pixel, fully transparent elsewhere.
pub fn build_highlight(mask: &GrayImage, accent: Rgba<u8>) -> RgbaImage {
    let (w, h) = mask.dimensions();
    let src = mask.as_raw();
    let mut raw = vec![0u8; w as usize * h as usize * 4];
    raw.par_chunks_mut(w as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let mrow = &src[y * w as usize..(y + 1) * w as usize];
            for (x, &m) in mrow.iter().enumerate() {
                if m == 1 {
                    row[x * 4..x * 4 + 4].copy_from_slice(&accent.0);
                }
            }
        });
    RgbaImage::from_raw(w, h, raw).unwrap_or_else(|| RgbaImage::new(w, h))
}

/// The base image at mask resolution, transparent exactly where the mask is 1
/// and opaque everywhere else, whatever alpha the base carried.
/// Drawn above the layer stack it shows the original picture outside the
/// subject and lets whatever is underneath show through inside it.
pub fn build_clip(base: &RgbaImage, mask: &GrayImage) -> RgbaImage {
    let (w, h) = mask.dimensions();
    let mut clip = if base.dimensions() == (w, h) {
        base.clone()
    } else {
        image::imageops::resize(base, w, h, image::imageops::FilterType::Triangle)
    };
    let src = mask.as_raw();
    clip.par_chunks_mut(w as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let mrow = &src[y * w as usize..(y + 1) * w as usize];
            for (x, &m) in mrow.iter().enumerate() {
                row[x * 4 + 3] = if m == 1 { 0 } else { 255 };
            }
        });
    clip
}

/// Turn raw service output into mask buffers:
/// pick the best candidate, let the service post-process, slice the plane,
/// then rasterise highlight and clip.
pub fn build_mask_buffers(
    service: &dyn SegmentationService,
    prediction: &MaskPrediction,
    meta: &PreprocessMeta,
    base: &RgbaImage,
    accent: Rgba<u8>,
) -> Result<MaskBuffers, EngineError> {
    let candidate = select_best_candidate(&prediction.scores)
        .ok_or_else(|| EngineError::Inference("segmentation returned no scored candidates".to_string()))?;
    let masks = service.post_process_masks(prediction, meta)?;
    let mask = extract_plane(&masks, candidate)?;
    let highlight = build_highlight(&mask, accent);
    let clip = build_clip(base, &mask);
    Ok(MaskBuffers {
        highlight: Arc::new(highlight),
        clip: Arc::new(clip),
        mask: Arc::new(mask),
        score: prediction.scores[candidate],
        candidate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker_mask(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| image::Luma([((x + y) % 2) as u8]))
    }

    #[test]
    fn first_maximal_score_wins_ties() {
        assert_eq!(select_best_candidate(&[0.4, 0.9, 0.9, 0.1]), Some(1));
        assert_eq!(select_best_candidate(&[0.7, 0.7, 0.7]), Some(0));
        assert_eq!(select_best_candidate(&[f32::NAN, 0.2]), Some(1));
        assert_eq!(select_best_candidate(&[]), None);
    }

    #[test]
    fn plane_extraction_uses_linear_offset() {
        let masks = PixelMasks {
            data: vec![0, 0, 0, 0, 1, 0, 0, 1],
            candidates: 2,
            width: 2,
            height: 2,
        };
        let plane = extract_plane(&masks, 1).unwrap();
        assert_eq!(plane.as_raw(), &vec![1, 0, 0, 1]);
        assert!(extract_plane(&masks, 2).is_err());
    }

    #[test]
    fn clip_alpha_is_zero_exactly_where_mask_is_set() {
        let base = RgbaImage::from_pixel(6, 4, Rgba([10, 20, 30, 255]));
        let mask = checker_mask(6, 4);
        let clip = build_clip(&base, &mask);
        for (x, y, p) in clip.enumerate_pixels() {
            let covered = mask.get_pixel(x, y)[0] == 1;
            assert_eq!(p[3] == 0, covered, "pixel ({}, {})", x, y);
        }
    }

    #[test]
    fn clip_is_rasterised_at_mask_resolution() {
        let base = RgbaImage::from_pixel(40, 20, Rgba([200, 0, 0, 255]));
        let mask = GrayImage::new(8, 4);
        let clip = build_clip(&base, &mask);
        assert_eq!(clip.dimensions(), (8, 4));
        assert!(clip.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn clip_is_opaque_outside_mask_even_over_transparent_base() {
        let base = RgbaImage::from_fn(4, 1, |x, _| Rgba([10, 20, 30, if x % 2 == 0 { 0 } else { 90 }]));
        let mask = GrayImage::from_fn(4, 1, |x, _| image::Luma([u8::from(x >= 2)]));
        let clip = build_clip(&base, &mask);
        let alphas: Vec<u8> = clip.pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![255, 255, 0, 0]);
        assert_eq!(&clip.get_pixel(0, 0).0[..3], &[10, 20, 30]);
    }

    #[test]
    fn highlight_is_transparent_outside_mask() {
        let accent = Rgba([1, 2, 3, 128]);
        let mask = checker_mask(3, 3);
        let hl = build_highlight(&mask, accent);
        for (x, y, p) in hl.enumerate_pixels() {
            if mask.get_pixel(x, y)[0] == 1 {
                assert_eq!(*p, accent);
            } else {
                assert_eq!(p[3], 0);
            }
        }
    }

    #[test]
    fn relative_lookup_rejects_out_of_range() {
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(3, 3, image::Luma([1]));
        assert!(mask_at_relative(&mask, 0.9, 0.9));
        assert!(!mask_at_relative(&mask, 0.1, 0.1));
        assert!(!mask_at_relative(&mask, 1.0, 0.9));
        assert!(!mask_at_relative(&mask, -0.1, 0.9));
    }
}
