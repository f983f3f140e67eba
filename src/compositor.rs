// ============================================================================
// COMPOSITOR: per-frame draw list and CPU rasterisation
// ============================================================================
//
// Z-order is fixed:
//   base image -> layers (store order) -> clip overlay -> highlight -> affordances
//
// `build_draw_list` is pure: it reads relative state, resolves it through the
// viewport geometry and returns what to draw. Minimum on-screen sizes are
// applied here and never written back.

use std::collections::HashSet;
use std::sync::Arc;

use image::{GrayImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::geometry::{PixelRect, ViewportGeometry};
use crate::layers::{Layer, LayerId};
use crate::segmentation::mask::{MaskBuffers, mask_at_relative};
use crate::segmentation::service::PointLabel;
use crate::segmentation::{BaseImage, Point, PointId};

/// Marker colours for prompt points.
pub const POSITIVE_MARKER: Rgba<u8> = Rgba([46, 204, 64, 255]);
pub const NEGATIVE_MARKER: Rgba<u8> = Rgba([255, 65, 54, 255]);
/// Outline colour for selected layers.
pub const SELECTION_OUTLINE: Rgba<u8> = Rgba([0, 120, 215, 255]);
/// Fill of a layer that is still decoding.
pub const PLACEHOLDER_FILL: Rgba<u8> = Rgba([128, 128, 128, 96]);

#[derive(Clone, Debug)]
pub enum DrawOp {
    BaseImage {
        image: Arc<RgbaImage>,
        dest: PixelRect,
    },
    Layer {
        id: LayerId,
        image: Arc<RgbaImage>,
        dest: PixelRect,
        rotation_degrees: f32,
        /// Present when the layer is clipped to the mask; sampled in viewport
        /// relative coordinates.
        clip: Option<Arc<GrayImage>>,
    },
    /// Layer without pixels: still decoding, or its decode failed.
    Placeholder {
        id: LayerId,
        dest: PixelRect,
        rotation_degrees: f32,
    },
    ClipOverlay {
        image: Arc<RgbaImage>,
        dest: PixelRect,
    },
    Highlight {
        image: Arc<RgbaImage>,
        dest: PixelRect,
    },
    SelectionBox {
        id: LayerId,
        dest: PixelRect,
        rotation_degrees: f32,
    },
    PointMarker {
        id: PointId,
        center: (f32, f32),
        radius: f32,
        label: PointLabel,
    },
}

impl DrawOp {
    pub fn is_affordance(&self) -> bool {
        matches!(
            self,
            DrawOp::Placeholder { .. } | DrawOp::SelectionBox { .. } | DrawOp::PointMarker { .. }
        )
    }
}

/// Everything a frame depends on.
#[derive(Clone, Copy)]
pub struct FrameInput<'a> {
    pub geometry: ViewportGeometry,
    pub base: Option<&'a BaseImage>,
    pub mask: Option<&'a MaskBuffers>,
    pub highlight_visible: bool,
    pub clip_globally: bool,
    pub layers: &'a [Layer],
    pub selection: &'a HashSet<LayerId>,
    pub points: &'a [Point],
    pub show_points: bool,
    pub show_selection: bool,
    pub show_placeholders: bool,
    pub min_layer_px: f32,
    pub min_marker_px: f32,
}

pub fn marker_radius(geometry: &ViewportGeometry, min_marker_px: f32) -> f32 {
    (geometry.pixel_width.min(geometry.pixel_height) * 0.01).max(min_marker_px * 0.5)
}

pub fn build_draw_list(input: &FrameInput<'_>) -> Vec<DrawOp> {
    let geometry = input.geometry;
    let full = geometry.bounds();
    let mut ops = Vec::with_capacity(input.layers.len() * 2 + input.points.len() + 3);

    if let Some(base) = input.base {
        ops.push(DrawOp::BaseImage {
            image: Arc::clone(&base.pixels),
            dest: full,
        });
    }

    let clip_plane = input.mask.map(|m| Arc::clone(&m.mask));
    for layer in input.layers {
        let dest = layer.pixel_rect(&geometry).with_min_size(input.min_layer_px);
        let rotation_degrees = layer.transform.rotation_degrees;
        match &layer.current_pixels {
            Some(image) if !layer.flags.loading => ops.push(DrawOp::Layer {
                id: layer.id,
                image: Arc::clone(image),
                dest,
                rotation_degrees,
                clip: if layer.clip_to_mask { clip_plane.clone() } else { None },
            }),
            _ if input.show_placeholders => ops.push(DrawOp::Placeholder {
                id: layer.id,
                dest,
                rotation_degrees,
            }),
            _ => {}
        }
    }

    if let Some(mask) = input.mask {
        if input.clip_globally {
            ops.push(DrawOp::ClipOverlay {
                image: Arc::clone(&mask.clip),
                dest: full,
            });
        }
        if input.highlight_visible {
            ops.push(DrawOp::Highlight {
                image: Arc::clone(&mask.highlight),
                dest: full,
            });
        }
    }

    if input.show_selection {
        for layer in input.layers.iter().filter(|l| input.selection.contains(&l.id)) {
            ops.push(DrawOp::SelectionBox {
                id: layer.id,
                dest: layer.pixel_rect(&geometry).with_min_size(input.min_layer_px),
                rotation_degrees: layer.transform.rotation_degrees,
            });
        }
    }

    if input.show_points && input.base.is_some() {
        let radius = marker_radius(&geometry, input.min_marker_px);
        for p in input.points {
            ops.push(DrawOp::PointMarker {
                id: p.id,
                center: (p.x * geometry.pixel_width, p.y * geometry.pixel_height),
                radius,
                label: p.label,
            });
        }
    }

    ops
}

// ============================================================================
// RASTERISATION
// ============================================================================

/// Source-over blend of straight-alpha pixels.
#[inline]
pub fn blend_normal(base: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
    if top[3] == 0 {
        return base;
    }
    if top[3] == 255 {
        return top;
    }
    let base_a = base[3] as f32 / 255.0;
    let top_a = top[3] as f32 / 255.0;
    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mix = |t: u8, b: u8| {
        let c = (t as f32 / 255.0 * top_a + b as f32 / 255.0 * base_a * (1.0 - top_a)) / out_a;
        (c * 255.0).round().clamp(0.0, 255.0) as u8
    };
    Rgba([
        mix(top[0], base[0]),
        mix(top[1], base[1]),
        mix(top[2], base[2]),
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

/// Maps a canvas pixel centre into a (possibly rotated) destination rectangle.
#[derive(Clone, Copy)]
struct Placement {
    cx: f32,
    cy: f32,
    half_w: f32,
    half_h: f32,
    sin: f32,
    cos: f32,
}

impl Placement {
    fn new(dest: &PixelRect, rotation_degrees: f32) -> Self {
        let (cx, cy) = dest.center();
        let rot = if rotation_degrees.is_finite() { rotation_degrees } else { 0.0 };
        let (sin, cos) = (-rot).to_radians().sin_cos();
        Self {
            cx,
            cy,
            half_w: dest.width * 0.5,
            half_h: dest.height * 0.5,
            sin,
            cos,
        }
    }

    /// Local coordinates relative to the rectangle centre (unrotated frame).
    #[inline]
    fn local(&self, px: f32, py: f32) -> (f32, f32) {
        let dx = px - self.cx;
        let dy = py - self.cy;
        (dx * self.cos - dy * self.sin, dx * self.sin + dy * self.cos)
    }

    /// Normalised (u, v) in [0, 1) if the point lies inside.
    #[inline]
    fn uv(&self, px: f32, py: f32) -> Option<(f32, f32)> {
        if self.half_w <= 0.0 || self.half_h <= 0.0 {
            return None;
        }
        let (lx, ly) = self.local(px, py);
        let u = (lx + self.half_w) / (self.half_w * 2.0);
        let v = (ly + self.half_h) / (self.half_h * 2.0);
        if (0.0..1.0).contains(&u) && (0.0..1.0).contains(&v) {
            Some((u, v))
        } else {
            None
        }
    }
}

/// Canvas rows touched by `bounds`, clamped to the canvas.
fn row_span(bounds: &PixelRect, height: u32) -> (usize, usize) {
    let y0 = bounds.y.floor().max(0.0) as usize;
    let y1 = (bounds.bottom().ceil().max(0.0) as usize).min(height as usize);
    (y0.min(y1), y1)
}

fn col_span(bounds: &PixelRect, width: u32) -> (usize, usize) {
    let x0 = bounds.x.floor().max(0.0) as usize;
    let x1 = (bounds.right().ceil().max(0.0) as usize).min(width as usize);
    (x0.min(x1), x1)
}

/// Run `shade` for every canvas pixel inside `bounds`, in parallel by row.
/// `shade` receives the pixel centre in canvas coordinates and returns the
/// colour to composite, if any.
fn paint<F>(canvas: &mut RgbaImage, bounds: &PixelRect, shade: F)
where
    F: Fn(f32, f32) -> Option<Rgba<u8>> + Sync,
{
    let (w, h) = canvas.dimensions();
    let (y0, y1) = row_span(bounds, h);
    let (x0, x1) = col_span(bounds, w);
    if y0 >= y1 || x0 >= x1 {
        return;
    }
    let stride = w as usize * 4;
    canvas
        .par_chunks_mut(stride)
        .enumerate()
        .skip(y0)
        .take(y1 - y0)
        .for_each(|(y, row)| {
            let py = y as f32 + 0.5;
            for x in x0..x1 {
                let Some(top) = shade(x as f32 + 0.5, py) else { continue };
                let i = x * 4;
                let base = Rgba([row[i], row[i + 1], row[i + 2], row[i + 3]]);
                row[i..i + 4].copy_from_slice(&blend_normal(base, top).0);
            }
        });
}

fn draw_image(
    canvas: &mut RgbaImage,
    image: &RgbaImage,
    dest: &PixelRect,
    rotation_degrees: f32,
    clip: Option<&GrayImage>,
) {
    let (iw, ih) = image.dimensions();
    if iw == 0 || ih == 0 {
        return;
    }
    let (cw, ch) = (canvas.width() as f32, canvas.height() as f32);
    let placement = Placement::new(dest, rotation_degrees);
    let bounds = dest.rotated_bounds(rotation_degrees);
    paint(canvas, &bounds, |px, py| {
        let (u, v) = placement.uv(px, py)?;
        if let Some(mask) = clip
            && !mask_at_relative(mask, px / cw, py / ch)
        {
            return None;
        }
        let sx = ((u * iw as f32) as u32).min(iw - 1);
        let sy = ((v * ih as f32) as u32).min(ih - 1);
        Some(*image.get_pixel(sx, sy))
    });
}

fn fill_rect(canvas: &mut RgbaImage, dest: &PixelRect, rotation_degrees: f32, color: Rgba<u8>) {
    let placement = Placement::new(dest, rotation_degrees);
    paint(canvas, &dest.rotated_bounds(rotation_degrees), |px, py| {
        placement.uv(px, py).map(|_| color)
    });
}

fn outline_rect(canvas: &mut RgbaImage, dest: &PixelRect, rotation_degrees: f32, thickness: f32, color: Rgba<u8>) {
    let placement = Placement::new(dest, rotation_degrees);
    let bounds = dest.rotated_bounds(rotation_degrees);
    let grown = PixelRect::new(
        bounds.x - thickness,
        bounds.y - thickness,
        bounds.width + thickness * 2.0,
        bounds.height + thickness * 2.0,
    );
    paint(canvas, &grown, |px, py| {
        let (lx, ly) = placement.local(px, py);
        let ex = lx.abs() - placement.half_w;
        let ey = ly.abs() - placement.half_h;
        let inside_outer = ex <= thickness * 0.5 && ey <= thickness * 0.5;
        let inside_inner = ex < -thickness * 0.5 && ey < -thickness * 0.5;
        (inside_outer && !inside_inner).then_some(color)
    });
}

fn fill_disc(canvas: &mut RgbaImage, center: (f32, f32), radius: f32, color: Rgba<u8>) {
    let r = radius.max(0.5);
    let bounds = PixelRect::new(center.0 - r, center.1 - r, r * 2.0, r * 2.0);
    paint(canvas, &bounds, |px, py| {
        let dx = px - center.0;
        let dy = py - center.1;
        (dx * dx + dy * dy <= r * r).then_some(color)
    });
}

/// Composite a draw list onto a transparent canvas the size of `geometry`.
pub fn rasterize(ops: &[DrawOp], geometry: &ViewportGeometry) -> RgbaImage {
    let (w, h) = geometry.pixel_size();
    let mut canvas = RgbaImage::new(w, h);
    for op in ops {
        match op {
            DrawOp::BaseImage { image, dest }
            | DrawOp::ClipOverlay { image, dest }
            | DrawOp::Highlight { image, dest } => draw_image(&mut canvas, image, dest, 0.0, None),
            DrawOp::Layer {
                image,
                dest,
                rotation_degrees,
                clip,
                ..
            } => draw_image(&mut canvas, image, dest, *rotation_degrees, clip.as_deref()),
            DrawOp::Placeholder {
                dest, rotation_degrees, ..
            } => fill_rect(&mut canvas, dest, *rotation_degrees, PLACEHOLDER_FILL),
            DrawOp::SelectionBox {
                dest, rotation_degrees, ..
            } => outline_rect(&mut canvas, dest, *rotation_degrees, 2.0, SELECTION_OUTLINE),
            DrawOp::PointMarker {
                center, radius, label, ..
            } => {
                let color = match label {
                    PointLabel::Positive => POSITIVE_MARKER,
                    PointLabel::Negative => NEGATIVE_MARKER,
                };
                fill_disc(&mut canvas, *center, *radius, color);
            }
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{LayerStore, Placement as LayerPlacement, TransformPatch};
    use crate::ops::background::MatteSettings;
    use crate::tasks::TaskRunner;

    fn mask_buffers(w: u32, h: u32, covered: impl Fn(u32, u32) -> bool) -> MaskBuffers {
        let mask = GrayImage::from_fn(w, h, |x, y| image::Luma([u8::from(covered(x, y))]));
        let base = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255]));
        MaskBuffers {
            highlight: Arc::new(crate::segmentation::mask::build_highlight(&mask, Rgba([0, 0, 255, 128]))),
            clip: Arc::new(crate::segmentation::mask::build_clip(&base, &mask)),
            mask: Arc::new(mask),
            score: 1.0,
            candidate: 0,
        }
    }

    fn input<'a>(
        geometry: ViewportGeometry,
        layers: &'a [Layer],
        selection: &'a HashSet<LayerId>,
        mask: Option<&'a MaskBuffers>,
    ) -> FrameInput<'a> {
        FrameInput {
            geometry,
            base: None,
            mask,
            highlight_visible: false,
            clip_globally: false,
            layers,
            selection,
            points: &[],
            show_points: true,
            show_selection: true,
            show_placeholders: true,
            min_layer_px: 8.0,
            min_marker_px: 6.0,
        }
    }

    fn kind(op: &DrawOp) -> &'static str {
        match op {
            DrawOp::BaseImage { .. } => "base",
            DrawOp::Layer { .. } => "layer",
            DrawOp::Placeholder { .. } => "placeholder",
            DrawOp::ClipOverlay { .. } => "clip",
            DrawOp::Highlight { .. } => "highlight",
            DrawOp::SelectionBox { .. } => "selection",
            DrawOp::PointMarker { .. } => "point",
        }
    }

    #[test]
    fn z_order_is_fixed() {
        let g = ViewportGeometry::new(100.0, 100.0);
        let mut store = LayerStore::new(TaskRunner::Inline, LayerPlacement::default(), MatteSettings::default());
        let a = store.add_image(RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255])), "a", &g);
        store.add_image(RgbaImage::from_pixel(4, 4, Rgba([0, 255, 0, 255])), "b", &g);
        store.select_single(a);
        let mask = mask_buffers(10, 10, |x, _| x < 5);

        let mut frame = input(g, store.layers(), store.selection(), Some(&mask));
        frame.clip_globally = true;
        frame.highlight_visible = true;
        let kinds: Vec<_> = build_draw_list(&frame).iter().map(kind).collect();
        assert_eq!(kinds, vec!["layer", "layer", "clip", "highlight", "selection"]);

        frame.clip_globally = false;
        let kinds: Vec<_> = build_draw_list(&frame).iter().map(kind).collect();
        assert_eq!(kinds, vec!["layer", "layer", "highlight", "selection"]);

        frame.highlight_visible = false;
        frame.mask = None;
        frame.clip_globally = true;
        let kinds: Vec<_> = build_draw_list(&frame).iter().map(kind).collect();
        assert_eq!(kinds, vec!["layer", "layer", "selection"]);
    }

    #[test]
    fn placeholders_are_affordances() {
        let g = ViewportGeometry::new(100.0, 100.0);
        let mut store = LayerStore::new(TaskRunner::Inline, LayerPlacement::default(), MatteSettings::default());
        store.add(vec![0, 1, 2], "junk", &g);
        store.poll(&g);
        let selection = HashSet::new();

        let mut frame = input(g, store.layers(), &selection, None);
        let ops = build_draw_list(&frame);
        assert_eq!(ops.iter().map(kind).collect::<Vec<_>>(), vec!["placeholder"]);
        assert!(ops[0].is_affordance());

        frame.show_placeholders = false;
        assert!(build_draw_list(&frame).is_empty());
    }

    #[test]
    fn minimum_size_is_applied_at_draw_time_only() {
        let g = ViewportGeometry::new(100.0, 100.0);
        let mut store = LayerStore::new(TaskRunner::Inline, LayerPlacement::default(), MatteSettings::default());
        let id = store.add_image(RgbaImage::new(4, 4), "tiny", &g);
        store.update_transform(id, &TransformPatch { rel_width: Some(0.01), rel_height: Some(0.01), ..Default::default() });
        let selection = HashSet::new();
        let ops = build_draw_list(&input(g, store.layers(), &selection, None));
        let DrawOp::Layer { dest, .. } = &ops[0] else { panic!("expected a layer op") };
        assert_eq!((dest.width, dest.height), (8.0, 8.0));
        assert_eq!(store.get(id).unwrap().transform.rel_width, 0.01);
    }

    #[test]
    fn blend_normal_is_source_over() {
        let base = Rgba([0, 0, 0, 255]);
        assert_eq!(blend_normal(base, Rgba([255, 255, 255, 0])), base);
        assert_eq!(blend_normal(base, Rgba([10, 20, 30, 255])), Rgba([10, 20, 30, 255]));
        let half = blend_normal(base, Rgba([255, 255, 255, 128]));
        assert!((127..=129).contains(&half[0]));
        assert_eq!(half[3], 255);
        assert_eq!(blend_normal(Rgba([0, 0, 0, 0]), Rgba([200, 0, 0, 128])), Rgba([200, 0, 0, 128]));
    }

    #[test]
    fn rotated_layer_is_sampled_through_inverse_rotation() {
        let g = ViewportGeometry::new(20.0, 20.0);
        let img = Arc::new(RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255])));
        let op = DrawOp::Layer {
            id: LayerId::fresh(),
            image: img,
            dest: PixelRect::new(5.0, 8.0, 10.0, 4.0),
            rotation_degrees: 90.0,
            clip: None,
        };
        let out = rasterize(&[op], &g);
        // Rotated 90 degrees the 10x4 strip stands upright around (10, 10).
        assert_eq!(out.get_pixel(10, 6)[3], 255);
        assert_eq!(out.get_pixel(6, 10)[3], 0);
    }

    #[test]
    fn per_layer_clip_keeps_only_masked_region() {
        let g = ViewportGeometry::new(10.0, 10.0);
        let mask = mask_buffers(10, 10, |x, _| x < 5);
        let op = DrawOp::Layer {
            id: LayerId::fresh(),
            image: Arc::new(RgbaImage::from_pixel(1, 1, Rgba([0, 255, 0, 255]))),
            dest: g.bounds(),
            rotation_degrees: 0.0,
            clip: Some(Arc::clone(&mask.mask)),
        };
        let out = rasterize(&[op], &g);
        assert_eq!(out.get_pixel(2, 5)[3], 255);
        assert_eq!(out.get_pixel(7, 5)[3], 0);
    }

    #[test]
    fn markers_are_hidden_when_suppressed() {
        let g = ViewportGeometry::new(50.0, 50.0);
        let base = BaseImage::for_tests(RgbaImage::new(5, 5));
        let points = [Point { id: 1, x: 0.5, y: 0.5, label: PointLabel::Positive }];
        let selection = HashSet::new();
        let mut frame = input(g, &[], &selection, None);
        frame.base = Some(&base);
        frame.points = &points;
        let ops = build_draw_list(&frame);
        assert!(ops.iter().any(|op| matches!(op, DrawOp::PointMarker { radius, .. } if *radius >= 3.0)));
        frame.show_points = false;
        assert!(!build_draw_list(&frame).iter().any(DrawOp::is_affordance));
    }
}
