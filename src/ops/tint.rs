// ============================================================================
// TINT: colorize a layer toward a target colour
// ============================================================================

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::error::EngineError;

/// Hue and saturation come from `color`, lightness stays per pixel.
/// `strength` (0..1) blends between the original and the colorized pixel.
/// Alpha is never touched.
pub fn tint(input: &RgbaImage, color: Rgba<u8>, strength: f32) -> Result<RgbaImage, EngineError> {
    let (w, h) = input.dimensions();
    if w == 0 || h == 0 {
        return Err(EngineError::InvalidInput("layer has no pixels".to_string()));
    }
    if !strength.is_finite() {
        return Err(EngineError::InvalidInput("tint strength is not a number".to_string()));
    }
    let strength = strength.clamp(0.0, 1.0);
    let (th, ts, _) = rgb_to_hsl(
        color[0] as f32 / 255.0,
        color[1] as f32 / 255.0,
        color[2] as f32 / 255.0,
    );

    let mut output = input.clone();
    output
        .par_chunks_mut(w as usize * 4)
        .for_each(|row| {
            for px in row.chunks_exact_mut(4) {
                if px[3] == 0 {
                    continue;
                }
                let r = px[0] as f32 / 255.0;
                let g = px[1] as f32 / 255.0;
                let b = px[2] as f32 / 255.0;
                let (_, _, l) = rgb_to_hsl(r, g, b);
                let (nr, ng, nb) = hsl_to_rgb(th, ts, l);
                px[0] = ((r + (nr - r) * strength) * 255.0).round().clamp(0.0, 255.0) as u8;
                px[1] = ((g + (ng - g) * strength) * 255.0).round().clamp(0.0, 255.0) as u8;
                px[2] = ((b + (nb - b) * strength) * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        });
    Ok(output)
}

/// RGB (0..1) → HSL (H: 0..1, S: 0..1, L: 0..1)
pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };

    let h = if (max - r).abs() < 1e-6 {
        let mut h = (g - b) / d;
        if h < 0.0 { h += 6.0; }
        h / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };

    (h, s, l)
}

/// HSL (H: 0..1, S: 0..1, L: 0..1) → RGB (0..1)
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 { return p + (q - p) * 6.0 * t; }
    if t < 1.0 / 2.0 { return q; }
    if t < 2.0 / 3.0 { return p + (q - p) * (2.0 / 3.0 - t) * 6.0; }
    p
}
