// ============================================================================
// COORDINATE MAPPER: relative unit square <-> viewport pixels
// ============================================================================
//
// Points and layers are stored in relative units (0..1 of the current
// viewport). Only this module knows how big the viewport is in pixels, so a
// resize is a geometry recompute and nothing else.

use serde::{Deserialize, Serialize};

/// Smallest extent a viewport axis may have. Keeps divisions finite.
const MIN_EXTENT: f32 = 1.0;

/// Clamp into [0, 1]. NaN maps to 0.
#[inline]
pub fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Relative value -> pixel offset along an axis of `extent` pixels.
/// Out-of-range input is clamped first.
#[inline]
pub fn to_absolute(rel: f32, extent: f32) -> f32 {
    clamp_unit(rel) * extent.max(MIN_EXTENT)
}

/// Pixel offset -> relative value along an axis of `extent` pixels, clamped.
#[inline]
pub fn to_relative(px: f32, extent: f32) -> f32 {
    if px.is_nan() {
        return 0.0;
    }
    clamp_unit(px / extent.max(MIN_EXTENT))
}

/// A position in the unit square.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct RelPoint {
    pub x: f32,
    pub y: f32,
}

impl RelPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x: clamp_unit(x), y: clamp_unit(y) }
    }
}

/// Axis-aligned rectangle in viewport pixels.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from two corners in any order.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x: x0.min(x1),
            y: y0.min(y1),
            width: (x1 - x0).abs(),
            height: (y1 - y0).abs(),
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Closed-interval overlap test (touching edges count).
    pub fn intersects(&self, other: &PixelRect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x && px <= self.right() && py >= self.y && py <= self.bottom()
    }

    /// Grow width/height to at least `min_px`, keeping the centre fixed.
    pub fn with_min_size(&self, min_px: f32) -> PixelRect {
        let (cx, cy) = self.center();
        let w = self.width.max(min_px);
        let h = self.height.max(min_px);
        PixelRect::new(cx - w * 0.5, cy - h * 0.5, w, h)
    }

    /// Axis-aligned bounds of this rectangle rotated about its centre.
    pub fn rotated_bounds(&self, rotation_degrees: f32) -> PixelRect {
        if rotation_degrees == 0.0 || !rotation_degrees.is_finite() {
            return *self;
        }
        let (cx, cy) = self.center();
        let (sin, cos) = rotation_degrees.to_radians().sin_cos();
        let hw = self.width * 0.5;
        let hh = self.height * 0.5;
        let ex = (hw * cos).abs() + (hh * sin).abs();
        let ey = (hw * sin).abs() + (hh * cos).abs();
        PixelRect::new(cx - ex, cy - ey, ex * 2.0, ey * 2.0)
    }

    /// Multiply every component by `factor` (export at a pixel ratio).
    pub fn scaled(&self, factor: f32) -> PixelRect {
        PixelRect::new(self.x * factor, self.y * factor, self.width * factor, self.height * factor)
    }
}

/// Current pixel size of the interaction surface. Single source of truth for
/// every relative <-> absolute conversion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportGeometry {
    pub pixel_width: f32,
    pub pixel_height: f32,
}

impl Default for ViewportGeometry {
    fn default() -> Self {
        Self { pixel_width: MIN_EXTENT, pixel_height: MIN_EXTENT }
    }
}

impl ViewportGeometry {
    /// Non-finite or sub-pixel extents collapse to 1px.
    pub fn new(pixel_width: f32, pixel_height: f32) -> Self {
        let sane = |v: f32| if v.is_finite() { v.max(MIN_EXTENT) } else { MIN_EXTENT };
        Self {
            pixel_width: sane(pixel_width),
            pixel_height: sane(pixel_height),
        }
    }

    /// Derive the geometry for a container. With an image, fit it inside the
    /// container preserving aspect ratio; without one, fill the container.
    pub fn fit(container_width: f32, container_height: f32, image_size: Option<(u32, u32)>) -> Self {
        let container = Self::new(container_width, container_height);
        let Some((iw, ih)) = image_size else {
            return container;
        };
        if iw == 0 || ih == 0 {
            return container;
        }
        let scale = (container.pixel_width / iw as f32).min(container.pixel_height / ih as f32);
        Self::new(iw as f32 * scale, ih as f32 * scale)
    }

    /// Rounded pixel dimensions for rasterisation (at least 1x1).
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            (self.pixel_width.round() as u32).max(1),
            (self.pixel_height.round() as u32).max(1),
        )
    }

    /// Same viewport at `factor` times the resolution.
    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(self.pixel_width * factor, self.pixel_height * factor)
    }

    pub fn to_absolute(&self, p: RelPoint) -> (f32, f32) {
        (to_absolute(p.x, self.pixel_width), to_absolute(p.y, self.pixel_height))
    }

    pub fn to_relative(&self, px: f32, py: f32) -> RelPoint {
        RelPoint {
            x: to_relative(px, self.pixel_width),
            y: to_relative(py, self.pixel_height),
        }
    }

    /// Resolve a relative rectangle (x, y, w, h) to pixels. Position and size
    /// are not clamped: layers may hang off the edge or exceed the viewport.
    pub fn rect_to_absolute(&self, x: f32, y: f32, w: f32, h: f32) -> PixelRect {
        PixelRect::new(
            x * self.pixel_width,
            y * self.pixel_height,
            w * self.pixel_width,
            h * self.pixel_height,
        )
    }

    /// Inverse of `rect_to_absolute`.
    pub fn rect_to_relative(&self, rect: &PixelRect) -> (f32, f32, f32, f32) {
        (
            rect.x / self.pixel_width,
            rect.y / self.pixel_height,
            rect.width / self.pixel_width,
            rect.height / self.pixel_height,
        )
    }

    /// The whole viewport as a pixel rectangle.
    pub fn bounds(&self) -> PixelRect {
        PixelRect::new(0.0, 0.0, self.pixel_width, self.pixel_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn round_trip_holds_across_geometries() {
        let geometries = [
            ViewportGeometry::new(1.0, 1.0),
            ViewportGeometry::new(3.0, 7.0),
            ViewportGeometry::new(500.0, 500.0),
            ViewportGeometry::new(1920.0, 1080.0),
        ];
        for g in geometries {
            for i in 0..=20 {
                let r = i as f32 / 20.0;
                let p = RelPoint::new(r, 1.0 - r);
                let (ax, ay) = g.to_absolute(p);
                let back = g.to_relative(ax, ay);
                assert!((back.x - p.x).abs() < EPS, "{:?} x {}", g, r);
                assert!((back.y - p.y).abs() < EPS, "{:?} y {}", g, r);
            }
        }
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        assert_eq!(to_absolute(1.5, 200.0), 200.0);
        assert_eq!(to_absolute(-0.2, 200.0), 0.0);
        assert_eq!(to_relative(-10.0, 200.0), 0.0);
        assert_eq!(to_relative(900.0, 200.0), 1.0);
        assert_eq!(to_relative(f32::NAN, 200.0), 0.0);
        assert_eq!(RelPoint::new(f32::NAN, 2.0), RelPoint { x: 0.0, y: 1.0 });
    }

    #[test]
    fn degenerate_extents_stay_finite() {
        let g = ViewportGeometry::new(0.0, f32::NAN);
        assert_eq!(g.pixel_width, 1.0);
        assert_eq!(g.pixel_height, 1.0);
        let r = to_relative(0.5, 0.0);
        assert!(r.is_finite());
    }

    #[test]
    fn fit_preserves_aspect_ratio() {
        let g = ViewportGeometry::fit(800.0, 800.0, Some((1000, 800)));
        assert!((g.pixel_width - 800.0).abs() < EPS);
        assert!((g.pixel_height - 640.0).abs() < EPS);

        let tall = ViewportGeometry::fit(800.0, 400.0, Some((100, 400)));
        assert!((tall.pixel_width - 100.0).abs() < EPS);
        assert!((tall.pixel_height - 400.0).abs() < EPS);
    }

    #[test]
    fn fit_without_image_fills_container() {
        let g = ViewportGeometry::fit(640.0, 480.0, None);
        assert_eq!(g, ViewportGeometry::new(640.0, 480.0));
    }

    #[test]
    fn rotated_bounds_of_quarter_turn_swaps_axes() {
        let r = PixelRect::new(0.0, 0.0, 100.0, 20.0);
        let b = r.rotated_bounds(90.0);
        assert!((b.width - 20.0).abs() < 1e-3);
        assert!((b.height - 100.0).abs() < 1e-3);
        assert_eq!(b.center(), r.center());
    }

    #[test]
    fn intersection_counts_touching_edges() {
        let a = PixelRect::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&PixelRect::new(10.0, 10.0, 5.0, 5.0)));
        assert!(!a.intersects(&PixelRect::new(10.5, 0.0, 5.0, 5.0)));
    }
}
