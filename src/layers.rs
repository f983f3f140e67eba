// ============================================================================
// LAYER STORE: ordered overlay layers with relative transforms
// ============================================================================
//
// Geometry is stored relative to the viewport and resolved to pixels only at
// render/interaction time. Pixel buffers are never edited in place: decode,
// background removal and tinting build a new buffer off-thread and swap it in
// whole on completion.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::geometry::{PixelRect, ViewportGeometry};
use crate::ops::background::{MatteSettings, apply_alpha_matte};
use crate::segmentation::service::BackgroundRemovalService;
use crate::tasks::TaskRunner;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(Uuid);

impl LayerId {
    pub(crate) fn fresh() -> Self {
        LayerId(Uuid::new_v4())
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position (top-left), size and rotation as fractions of the viewport.
/// Rotation is in degrees, clockwise, about the layer's centre.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelTransform {
    pub rel_x: f32,
    pub rel_y: f32,
    pub rel_width: f32,
    pub rel_height: f32,
    pub rotation_degrees: f32,
}

impl RelTransform {
    pub fn to_pixels(&self, geometry: &ViewportGeometry) -> PixelRect {
        geometry.rect_to_absolute(self.rel_x, self.rel_y, self.rel_width, self.rel_height)
    }
}

/// Partial transform update. Absent fields are left alone; invalid ones are
/// dropped without touching the layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPatch {
    pub rel_x: Option<f32>,
    pub rel_y: Option<f32>,
    pub rel_width: Option<f32>,
    pub rel_height: Option<f32>,
    pub rotation_degrees: Option<f32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskFlags {
    pub removing_background: bool,
    pub tinting: bool,
    pub loading: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskFlag {
    RemovingBackground,
    Tinting,
    Loading,
}

impl TaskFlags {
    fn slot(&mut self, flag: TaskFlag) -> &mut bool {
        match flag {
            TaskFlag::RemovingBackground => &mut self.removing_background,
            TaskFlag::Tinting => &mut self.tinting,
            TaskFlag::Loading => &mut self.loading,
        }
    }

    pub fn get(&self, flag: TaskFlag) -> bool {
        match flag {
            TaskFlag::RemovingBackground => self.removing_background,
            TaskFlag::Tinting => self.tinting,
            TaskFlag::Loading => self.loading,
        }
    }

    /// A pixel-replacing task is in flight.
    pub fn pixel_task_running(&self) -> bool {
        self.removing_background || self.tinting
    }
}

pub struct Layer {
    pub id: LayerId,
    pub name: String,
    /// Pixels as decoded from the upload. `None` until decode finishes.
    pub source_pixels: Option<Arc<RgbaImage>>,
    /// Pixels currently displayed.
    pub current_pixels: Option<Arc<RgbaImage>>,
    pub transform: RelTransform,
    /// Render only where the segmentation mask is set.
    pub clip_to_mask: bool,
    pub flags: TaskFlags,
}

impl Layer {
    pub fn is_ready(&self) -> bool {
        self.current_pixels.is_some() && !self.flags.loading
    }

    pub fn pixel_rect(&self, geometry: &ViewportGeometry) -> PixelRect {
        self.transform.to_pixels(geometry)
    }

    /// Axis-aligned bounds including rotation.
    pub fn bounding_box(&self, geometry: &ViewportGeometry) -> PixelRect {
        self.pixel_rect(geometry).rotated_bounds(self.transform.rotation_degrees)
    }

    /// Whether a viewport pixel falls on the (rotated) layer rectangle.
    pub fn contains(&self, px: f32, py: f32, geometry: &ViewportGeometry) -> bool {
        let rect = self.pixel_rect(geometry);
        let (cx, cy) = rect.center();
        let (sin, cos) = (-self.transform.rotation_degrees).to_radians().sin_cos();
        let dx = px - cx;
        let dy = py - cy;
        let lx = dx * cos - dy * sin;
        let ly = dx * sin + dy * cos;
        lx.abs() <= rect.width * 0.5 && ly.abs() <= rect.height * 0.5
    }
}

/// Which whole-replacement task produced a new buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerTask {
    RemoveBackground,
    Tint,
}

impl LayerTask {
    fn flag(self) -> TaskFlag {
        match self {
            LayerTask::RemoveBackground => TaskFlag::RemovingBackground,
            LayerTask::Tint => TaskFlag::Tinting,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LayerTask::RemoveBackground => "Background removal",
            LayerTask::Tint => "Tint",
        }
    }
}

/// Initial sizing rules for new layers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    /// Fraction of the viewport the image's longer side occupies.
    pub target_fraction: f32,
    /// Floor on either absolute side, in pixels.
    pub min_px: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self { target_fraction: 0.2, min_px: 8.0 }
    }
}

/// Centred placement for an image of `size` pixels in `geometry`.
pub fn initial_transform(size: (u32, u32), geometry: &ViewportGeometry, placement: &Placement) -> RelTransform {
    let (vw, vh) = (geometry.pixel_width, geometry.pixel_height);
    let iw = size.0.max(1) as f32;
    let ih = size.1.max(1) as f32;
    let fraction = if placement.target_fraction.is_finite() && placement.target_fraction > 0.0 {
        placement.target_fraction
    } else {
        Placement::default().target_fraction
    };
    let (aw, ah) = if iw >= ih {
        let aw = fraction * vw;
        (aw, aw * ih / iw)
    } else {
        let ah = fraction * vh;
        (ah * iw / ih, ah)
    };
    let aw = aw.max(placement.min_px);
    let ah = ah.max(placement.min_px);
    let rel_width = aw / vw;
    let rel_height = ah / vh;
    RelTransform {
        rel_x: (1.0 - rel_width) * 0.5,
        rel_y: (1.0 - rel_height) * 0.5,
        rel_width,
        rel_height,
        rotation_degrees: 0.0,
    }
}

enum LayerEvent {
    Decoded {
        id: LayerId,
        result: Result<RgbaImage, EngineError>,
    },
    Replaced {
        id: LayerId,
        task: LayerTask,
        result: Result<RgbaImage, EngineError>,
    },
}

pub struct LayerStore {
    layers: Vec<Layer>,
    selection: HashSet<LayerId>,
    bg_service: Option<Arc<dyn BackgroundRemovalService>>,
    runner: TaskRunner,
    placement: Placement,
    matte: MatteSettings,
    in_flight: usize,
    status: String,
    sender: Sender<LayerEvent>,
    receiver: Receiver<LayerEvent>,
}

impl LayerStore {
    pub fn new(runner: TaskRunner, placement: Placement, matte: MatteSettings) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            layers: Vec::new(),
            selection: HashSet::new(),
            bg_service: None,
            runner,
            placement,
            matte,
            in_flight: 0,
            status: String::new(),
            sender,
            receiver,
        }
    }

    // ---- accessors ----------------------------------------------------------

    /// Layers in draw order (first is bottom-most).
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight > 0
    }

    pub fn attach_background_service(&mut self, service: Arc<dyn BackgroundRemovalService>) {
        self.bg_service = Some(service);
    }

    // ---- add / remove -------------------------------------------------------

    /// Insert a loading placeholder and decode `bytes` off-thread. The
    /// placeholder is a centred square sized for `geometry`; the layer gets
    /// its real size on the `poll` that sees the decode finish.
    pub fn add(&mut self, bytes: Vec<u8>, name: &str, geometry: &ViewportGeometry) -> LayerId {
        let id = LayerId::fresh();
        self.layers.push(Layer {
            id,
            name: name.to_string(),
            source_pixels: None,
            current_pixels: None,
            transform: initial_transform((1, 1), geometry, &self.placement),
            clip_to_mask: false,
            flags: TaskFlags { loading: true, ..TaskFlags::default() },
        });
        log_info!("Layers: '{}' added as {} (decoding {} bytes)", name, id, bytes.len());
        let tx = self.sender.clone();
        self.in_flight += 1;
        self.runner.spawn(move || {
            let result = crate::io::decode_image(&bytes).map(|d| d.pixels);
            let _ = tx.send(LayerEvent::Decoded { id, result });
        });
        id
    }

    /// Insert an already decoded image, placed immediately.
    pub fn add_image(&mut self, pixels: RgbaImage, name: &str, geometry: &ViewportGeometry) -> LayerId {
        let id = LayerId::fresh();
        let transform = initial_transform(pixels.dimensions(), geometry, &self.placement);
        let pixels = Arc::new(pixels);
        self.layers.push(Layer {
            id,
            name: name.to_string(),
            source_pixels: Some(Arc::clone(&pixels)),
            current_pixels: Some(pixels),
            transform,
            clip_to_mask: false,
            flags: TaskFlags::default(),
        });
        id
    }

    pub fn remove(&mut self, id: LayerId) -> bool {
        let Some(idx) = self.index_of(id) else { return false };
        let layer = self.layers.remove(idx);
        self.selection.remove(&id);
        log_info!("Layers: '{}' removed", layer.name);
        true
    }

    // ---- transform / order --------------------------------------------------

    /// Apply the valid fields of `patch`. Returns true if any field changed.
    pub fn update_transform(&mut self, id: LayerId, patch: &TransformPatch) -> bool {
        let Some(layer) = self.get_mut(id) else { return false };
        let before = layer.transform;
        let t = &mut layer.transform;
        if let Some(v) = patch.rel_x.filter(|v| v.is_finite()) {
            t.rel_x = v;
        }
        if let Some(v) = patch.rel_y.filter(|v| v.is_finite()) {
            t.rel_y = v;
        }
        if let Some(v) = patch.rel_width.filter(|v| v.is_finite() && *v > 0.0) {
            t.rel_width = v;
        }
        if let Some(v) = patch.rel_height.filter(|v| v.is_finite() && *v > 0.0) {
            t.rel_height = v;
        }
        if let Some(v) = patch.rotation_degrees.filter(|v| v.is_finite()) {
            t.rotation_degrees = v;
        }
        layer.transform != before
    }

    /// Set a layer's placement from an absolute rectangle (drag / resize end).
    pub fn set_pixel_rect(&mut self, id: LayerId, rect: &PixelRect, geometry: &ViewportGeometry) -> bool {
        let (x, y, w, h) = geometry.rect_to_relative(rect);
        self.update_transform(
            id,
            &TransformPatch {
                rel_x: Some(x),
                rel_y: Some(y),
                rel_width: Some(w),
                rel_height: Some(h),
                rotation_degrees: None,
            },
        )
    }

    /// Move `dragged` to `target`'s slot; everything else keeps its relative
    /// order. No-op if the ids match or either is unknown.
    pub fn reorder(&mut self, dragged: LayerId, target: LayerId) -> bool {
        if dragged == target {
            return false;
        }
        let (Some(from), Some(to)) = (self.index_of(dragged), self.index_of(target)) else {
            return false;
        };
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        true
    }

    pub fn set_task_flag(&mut self, id: LayerId, flag: TaskFlag, value: bool) -> bool {
        let Some(layer) = self.get_mut(id) else { return false };
        *layer.flags.slot(flag) = value;
        true
    }

    pub fn set_clip_to_mask(&mut self, id: LayerId, on: bool) -> bool {
        let Some(layer) = self.get_mut(id) else { return false };
        layer.clip_to_mask = on;
        true
    }

    /// Topmost layer under a viewport pixel.
    pub fn hit_test(&self, px: f32, py: f32, geometry: &ViewportGeometry) -> Option<LayerId> {
        self.layers
            .iter()
            .rev()
            .find(|l| l.current_pixels.is_some() && l.contains(px, py, geometry))
            .map(|l| l.id)
    }

    // ---- selection ----------------------------------------------------------

    pub fn selection(&self) -> &HashSet<LayerId> {
        &self.selection
    }

    pub fn is_selected(&self, id: LayerId) -> bool {
        self.selection.contains(&id)
    }

    pub fn select_single(&mut self, id: LayerId) -> bool {
        if self.index_of(id).is_none() {
            return false;
        }
        self.selection.clear();
        self.selection.insert(id);
        true
    }

    /// Modifier-click: add if absent, remove if present.
    pub fn toggle_selection(&mut self, id: LayerId) -> bool {
        if self.index_of(id).is_none() {
            return false;
        }
        if !self.selection.remove(&id) {
            self.selection.insert(id);
        }
        true
    }

    /// Replace the selection with every layer whose bounding box meets `rect`.
    pub fn box_select(&mut self, rect: &PixelRect, geometry: &ViewportGeometry) -> usize {
        self.selection = self
            .layers
            .iter()
            .filter(|l| l.bounding_box(geometry).intersects(rect))
            .map(|l| l.id)
            .collect();
        self.selection.len()
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    // ---- pixel tasks --------------------------------------------------------

    /// Start background removal. `Ok(false)` means the layer already has a
    /// pixel task running and the request was ignored.
    pub fn request_background_removal(&mut self, id: LayerId) -> Result<bool, EngineError> {
        let Some(service) = self.bg_service.clone() else {
            return Err(EngineError::BackendUnavailable(
                "background removal is not ready".to_string(),
            ));
        };
        let matte = self.matte;
        self.start_task(id, LayerTask::RemoveBackground, move |pixels| {
            let alpha = service.run(pixels)?;
            apply_alpha_matte(pixels, &alpha, &matte)
        })
    }

    /// Start a tint toward `color`. `Ok(false)` if a pixel task is already running.
    pub fn request_tint(&mut self, id: LayerId, color: Rgba<u8>, strength: f32) -> Result<bool, EngineError> {
        self.start_task(id, LayerTask::Tint, move |pixels| {
            crate::ops::tint::tint(pixels, color, strength)
        })
    }

    fn start_task<F>(&mut self, id: LayerId, task: LayerTask, job: F) -> Result<bool, EngineError>
    where
        F: FnOnce(&RgbaImage) -> Result<RgbaImage, EngineError> + Send + 'static,
    {
        let Some(layer) = self.get_mut(id) else {
            return Err(EngineError::InvalidInput(format!("no layer {}", id)));
        };
        // Both tasks read and replace the whole buffer, so they never overlap.
        if layer.flags.pixel_task_running() {
            log_info!("Layers: '{}' is busy, {} ignored", layer.name, task.label());
            return Ok(false);
        }
        let Some(pixels) = layer.current_pixels.clone() else {
            return Err(EngineError::InvalidInput(format!("layer '{}' is still loading", layer.name)));
        };
        *layer.flags.slot(task.flag()) = true;
        log_info!("Layers: {} started on '{}'", task.label(), layer.name);
        let tx = self.sender.clone();
        self.in_flight += 1;
        self.runner.spawn(move || {
            let result = job(&pixels);
            let _ = tx.send(LayerEvent::Replaced { id, task, result });
        });
        Ok(true)
    }

    /// Show the originally uploaded pixels again.
    pub fn revert_pixels(&mut self, id: LayerId) -> bool {
        let Some(layer) = self.get_mut(id) else { return false };
        let Some(source) = layer.source_pixels.clone() else { return false };
        layer.current_pixels = Some(source);
        true
    }

    // ---- completion handling -----------------------------------------------

    /// Apply finished jobs. `geometry` sizes layers whose decode just finished.
    pub fn poll(&mut self, geometry: &ViewportGeometry) -> bool {
        let mut changed = false;
        while let Ok(event) = self.receiver.try_recv() {
            self.handle(event, geometry);
            changed = true;
        }
        changed
    }

    pub fn wait_until_idle(&mut self, geometry: &ViewportGeometry, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.poll(geometry);
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(event) => self.handle(event, geometry),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    fn handle(&mut self, event: LayerEvent, geometry: &ViewportGeometry) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let placement = self.placement;
        match event {
            LayerEvent::Decoded { id, result } => {
                let Some(layer) = self.get_mut(id) else {
                    log_info!("Layers: decode for removed layer {} discarded", id);
                    return;
                };
                layer.flags.loading = false;
                match result {
                    Ok(img) => {
                        layer.transform = initial_transform(img.dimensions(), geometry, &placement);
                        let pixels = Arc::new(img);
                        layer.source_pixels = Some(Arc::clone(&pixels));
                        layer.current_pixels = Some(pixels);
                        log_info!("Layers: '{}' decoded", layer.name);
                    }
                    Err(e) => {
                        log_warn!("Layers: '{}' failed to decode: {}", layer.name, e);
                        let msg = format!("'{}': {}", layer.name, e);
                        self.status = msg;
                    }
                }
            }
            LayerEvent::Replaced { id, task, result } => {
                let Some(layer) = self.get_mut(id) else {
                    log_info!("Layers: {} result for removed layer {} discarded", task.label(), id);
                    return;
                };
                *layer.flags.slot(task.flag()) = false;
                match result {
                    Ok(img) => {
                        layer.current_pixels = Some(Arc::new(img));
                        log_info!("Layers: {} finished on '{}'", task.label(), layer.name);
                        let msg = format!("{} finished", task.label());
                        self.status = msg;
                    }
                    Err(e) => {
                        log_err!("Layers: {} failed on '{}': {}", task.label(), layer.name, e);
                        let msg = format!("{} failed: {}", task.label(), e);
                        self.status = msg;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::service::AlphaMatte;

    fn store() -> LayerStore {
        LayerStore::new(TaskRunner::Inline, Placement::default(), MatteSettings::default())
    }

    fn solid(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([200, 100, 50, 255]))
    }

    fn ids(s: &LayerStore) -> Vec<LayerId> {
        s.layers().iter().map(|l| l.id).collect()
    }

    struct KeepLeftHalf;

    impl BackgroundRemovalService for KeepLeftHalf {
        fn run(&self, image: &RgbaImage) -> Result<AlphaMatte, EngineError> {
            let (w, h) = image.dimensions();
            let mut data = Vec::new();
            for _ in 0..h {
                for x in 0..w {
                    data.push(if x < w / 2 { 1.0 } else { 0.0 });
                }
            }
            Ok(AlphaMatte { data, width: w, height: h })
        }
    }

    struct Broken;

    impl BackgroundRemovalService for Broken {
        fn run(&self, _: &RgbaImage) -> Result<AlphaMatte, EngineError> {
            Err(EngineError::Inference("model crashed".into()))
        }
    }

    #[test]
    fn initial_placement_uses_longer_side() {
        let g = ViewportGeometry::new(1000.0, 500.0);
        let t = initial_transform((400, 200), &g, &Placement::default());
        assert!((t.rel_width - 0.2).abs() < 1e-6);
        // 200px wide -> 100px tall -> 0.2 of 500
        assert!((t.rel_height - 0.2).abs() < 1e-6);
        assert!((t.rel_x - 0.4).abs() < 1e-6);

        let tall = initial_transform((100, 400), &g, &Placement::default());
        assert!((tall.rel_height - 0.2).abs() < 1e-6);
        assert!((tall.rel_width - 0.025).abs() < 1e-6);
    }

    #[test]
    fn initial_placement_respects_pixel_floor() {
        let g = ViewportGeometry::new(100.0, 100.0);
        let t = initial_transform((1000, 10), &g, &Placement { target_fraction: 0.2, min_px: 8.0 });
        assert!((t.rel_height * 100.0 - 8.0).abs() < 1e-4);
    }

    #[test]
    fn invalid_patch_fields_are_dropped() {
        let mut s = store();
        let g = ViewportGeometry::new(500.0, 500.0);
        let id = s.add_image(solid(10, 10), "a", &g);
        let before = s.get(id).unwrap().transform;
        s.update_transform(
            id,
            &TransformPatch {
                rel_x: Some(f32::NAN),
                rel_width: Some(-0.3),
                rel_height: Some(0.0),
                rotation_degrees: Some(f32::INFINITY),
                rel_y: Some(0.7),
            },
        );
        let after = s.get(id).unwrap().transform;
        assert_eq!(after.rel_x, before.rel_x);
        assert_eq!(after.rel_width, before.rel_width);
        assert_eq!(after.rel_height, before.rel_height);
        assert_eq!(after.rotation_degrees, before.rotation_degrees);
        assert_eq!(after.rel_y, 0.7);
    }

    #[test]
    fn reorder_onto_self_is_noop() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let a = s.add_image(solid(4, 4), "a", &g);
        let _b = s.add_image(solid(4, 4), "b", &g);
        let order = ids(&s);
        assert!(!s.reorder(a, a));
        assert_eq!(ids(&s), order);
    }

    #[test]
    fn reorder_keeps_untouched_layers_in_order() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let v: Vec<LayerId> = (0..5).map(|i| s.add_image(solid(4, 4), &i.to_string(), &g)).collect();

        assert!(s.reorder(v[0], v[3]));
        assert_eq!(ids(&s), vec![v[1], v[2], v[3], v[0], v[4]]);

        assert!(s.reorder(v[4], v[1]));
        assert_eq!(ids(&s), vec![v[4], v[1], v[2], v[3], v[0]]);

        let unknown = LayerId::fresh();
        assert!(!s.reorder(unknown, v[1]));
        assert_eq!(ids(&s), vec![v[4], v[1], v[2], v[3], v[0]]);
    }

    #[test]
    fn decode_promotes_placeholder() {
        let mut s = store();
        let g = ViewportGeometry::new(500.0, 500.0);
        let png = crate::io::encode_image(&solid(50, 25), crate::io::ExportFormat::Png).unwrap();
        let id = s.add(png, "sticker", &g);
        assert!(s.get(id).unwrap().flags.loading);
        s.poll(&g);
        let layer = s.get(id).unwrap();
        assert!(layer.is_ready());
        assert!((layer.transform.rel_width - 0.2).abs() < 1e-6);
        assert!((layer.transform.rel_height - 0.1).abs() < 1e-6);
    }

    #[test]
    fn failed_decode_keeps_placeholder() {
        let mut s = store();
        let g = ViewportGeometry::new(500.0, 500.0);
        let id = s.add(vec![1, 2, 3, 4], "junk", &g);
        let placeholder = s.get(id).unwrap().pixel_rect(&g);
        let expected = [200.0, 200.0, 100.0, 100.0];
        let got = [placeholder.x, placeholder.y, placeholder.width, placeholder.height];
        for (a, b) in got.iter().zip(expected) {
            assert!((a - b).abs() < 1e-3, "{:?}", placeholder);
        }
        s.poll(&g);
        let layer = s.get(id).unwrap();
        assert_eq!(layer.pixel_rect(&g), placeholder);
        assert!(!layer.flags.loading);
        assert!(layer.current_pixels.is_none());
        assert!(s.status().contains("junk"));
    }

    #[test]
    fn duplicate_background_removal_is_ignored() {
        let mut s = store();
        s.attach_background_service(Arc::new(KeepLeftHalf));
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(8, 8), "a", &g);
        assert_eq!(s.request_background_removal(id), Ok(true));
        assert!(s.get(id).unwrap().flags.removing_background);
        assert_eq!(s.request_background_removal(id), Ok(false));
        s.poll(&g);
        assert!(!s.get(id).unwrap().flags.removing_background);
    }

    #[test]
    fn second_task_waits_for_the_first_to_land() {
        let mut s = store();
        s.attach_background_service(Arc::new(KeepLeftHalf));
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(8, 8), "a", &g);
        assert_eq!(s.request_background_removal(id), Ok(true));
        assert_eq!(s.request_tint(id, Rgba([0, 0, 255, 255]), 1.0), Ok(false));
        assert!(!s.get(id).unwrap().flags.tinting);
        s.poll(&g);

        // Started from the cut-out, so the removed half stays removed.
        assert_eq!(s.request_tint(id, Rgba([0, 0, 255, 255]), 1.0), Ok(true));
        s.poll(&g);
        let layer = s.get(id).unwrap();
        assert!(!layer.flags.pixel_task_running());
        let px = layer.current_pixels.as_ref().unwrap();
        assert!(px.get_pixel(7, 0)[3] < 50);
        assert!(px.get_pixel(0, 0)[3] > 200);
        assert!(px.get_pixel(0, 0)[2] > px.get_pixel(0, 0)[0]);
    }

    #[test]
    fn background_removal_swaps_pixels_and_keeps_transform() {
        let mut s = store();
        s.attach_background_service(Arc::new(KeepLeftHalf));
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(8, 8), "a", &g);
        s.update_transform(id, &TransformPatch { rotation_degrees: Some(30.0), ..Default::default() });
        let before = s.get(id).unwrap().transform;
        s.request_background_removal(id).unwrap();
        s.poll(&g);
        let layer = s.get(id).unwrap();
        let px = layer.current_pixels.as_ref().unwrap();
        assert!(px.get_pixel(0, 0)[3] > 200);
        assert!(px.get_pixel(7, 0)[3] < 50);
        assert_eq!(layer.transform, before);
        assert_eq!(layer.source_pixels.as_ref().unwrap().get_pixel(7, 0)[3], 255);
    }

    #[test]
    fn failed_task_keeps_previous_pixels() {
        let mut s = store();
        s.attach_background_service(Arc::new(Broken));
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(4, 4), "a", &g);
        let before = s.get(id).unwrap().current_pixels.clone().unwrap();
        s.request_background_removal(id).unwrap();
        s.poll(&g);
        let layer = s.get(id).unwrap();
        assert!(!layer.flags.removing_background);
        assert!(Arc::ptr_eq(layer.current_pixels.as_ref().unwrap(), &before));
        assert!(s.status().contains("model crashed"));
    }

    #[test]
    fn task_result_for_removed_layer_is_dropped() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(4, 4), "a", &g);
        s.request_tint(id, Rgba([255, 0, 0, 255]), 1.0).unwrap();
        assert!(s.remove(id));
        s.poll(&g);
        assert!(s.is_empty());
        assert!(!s.is_busy());
    }

    #[test]
    fn background_removal_needs_service() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(4, 4), "a", &g);
        assert!(matches!(
            s.request_background_removal(id),
            Err(EngineError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn selection_operations() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let a = s.add_image(solid(4, 4), "a", &g);
        let b = s.add_image(solid(4, 4), "b", &g);
        s.update_transform(a, &TransformPatch { rel_x: Some(0.0), rel_y: Some(0.0), ..Default::default() });
        s.update_transform(b, &TransformPatch { rel_x: Some(0.7), rel_y: Some(0.7), ..Default::default() });

        s.select_single(a);
        s.toggle_selection(b);
        assert_eq!(s.selection().len(), 2);
        s.toggle_selection(a);
        assert!(!s.is_selected(a) && s.is_selected(b));

        let n = s.box_select(&PixelRect::from_corners(0.0, 0.0, 10.0, 10.0), &g);
        assert_eq!(n, 1);
        assert!(s.is_selected(a) && !s.is_selected(b));

        s.remove(a);
        assert!(s.selection().is_empty());
    }

    #[test]
    fn hit_test_prefers_topmost() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let a = s.add_image(solid(4, 4), "a", &g);
        let b = s.add_image(solid(4, 4), "b", &g);
        assert_eq!(s.hit_test(50.0, 50.0, &g), Some(b));
        s.reorder(b, a);
        assert_eq!(s.hit_test(50.0, 50.0, &g), Some(a));
        assert_eq!(s.hit_test(1.0, 1.0, &g), None);
    }

    #[test]
    fn revert_restores_source() {
        let mut s = store();
        let g = ViewportGeometry::new(100.0, 100.0);
        let id = s.add_image(solid(4, 4), "a", &g);
        s.request_tint(id, Rgba([0, 255, 0, 255]), 1.0).unwrap();
        s.poll(&g);
        assert!(s.revert_pixels(id));
        let layer = s.get(id).unwrap();
        assert!(Arc::ptr_eq(
            layer.current_pixels.as_ref().unwrap(),
            layer.source_pixels.as_ref().unwrap()
        ));
    }
}
