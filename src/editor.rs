// ============================================================================
// EDITOR: the presentation boundary
// ============================================================================
//
// Owns the viewport geometry, the segmentation session, the layer store and
// backend negotiation. A presentation layer sends discrete intents here, calls
// `poll()` once per tick and renders `frame()`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};

use crate::backend::{NegotiatedService, Negotiator, ServiceKind};
use crate::backend::ExecutionBackend;
use crate::compositor::{DrawOp, FrameInput, build_draw_list, rasterize};
use crate::error::EngineError;
use crate::geometry::{PixelRect, RelPoint, ViewportGeometry};
use crate::io::ExportFormat;
use crate::layers::{LayerId, LayerStore, TransformPatch};
use crate::segmentation::service::{BackgroundRemovalService, PointLabel, SegmentationService};
use crate::segmentation::{ImageId, PointId, SegmentationSession};
use crate::settings::EngineSettings;
use crate::tasks::TaskRunner;

/// What clicks act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EditMode {
    /// Clicks add prompt points.
    #[default]
    Points,
    /// Clicks select and move layers.
    Layers,
}

/// One render tick's worth of output.
#[derive(Clone, Debug)]
pub struct Frame {
    pub geometry: ViewportGeometry,
    pub ops: Vec<DrawOp>,
    pub status: Vec<String>,
}

/// An encoded export.
#[derive(Clone, Debug)]
pub struct Export {
    pub bytes: Vec<u8>,
    pub format: ExportFormat,
    pub width: u32,
    pub height: u32,
}

pub struct Editor {
    settings: EngineSettings,
    container: (f32, f32),
    geometry: ViewportGeometry,
    session: SegmentationSession,
    layers: LayerStore,
    negotiator: Negotiator,
    mode: EditMode,
    highlight_visible: bool,
    show_points: bool,
    show_selection: bool,
    show_placeholders: bool,
    status: String,
}

impl Editor {
    pub fn new(settings: EngineSettings, runner: TaskRunner) -> Self {
        let session = SegmentationSession::new(runner, settings.highlight_color);
        let layers = LayerStore::new(runner, settings.placement(), settings.matte());
        let negotiator = Negotiator::new(runner, settings.backend_order.clone());
        Self {
            settings,
            container: (1.0, 1.0),
            geometry: ViewportGeometry::default(),
            session,
            layers,
            negotiator,
            mode: EditMode::Points,
            highlight_visible: true,
            show_points: true,
            show_selection: true,
            show_placeholders: true,
            status: String::new(),
        }
    }

    // ---- accessors ----------------------------------------------------------

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn geometry(&self) -> ViewportGeometry {
        self.geometry
    }

    pub fn session(&self) -> &SegmentationSession {
        &self.session
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn mode(&self) -> EditMode {
        self.mode
    }

    pub fn highlight_visible(&self) -> bool {
        self.highlight_visible
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_busy() || self.layers.is_busy() || self.negotiator.is_pending()
    }

    // ---- viewport -----------------------------------------------------------

    /// The container changed size. Only the geometry is recomputed; stored
    /// points and layers are relative and stay as they are.
    pub fn resize(&mut self, container_width: f32, container_height: f32) {
        self.container = (container_width, container_height);
        self.refit();
    }

    fn refit(&mut self) {
        let image_size = self.session.image().map(|b| (b.width(), b.height()));
        self.geometry = ViewportGeometry::fit(self.container.0, self.container.1, image_size);
    }

    // ---- services -----------------------------------------------------------

    pub fn negotiate_segmentation<F>(&mut self, init: F) -> bool
    where
        F: Fn(ExecutionBackend) -> Result<Arc<dyn SegmentationService>, EngineError> + Send + 'static,
    {
        self.negotiator.start_segmentation(init)
    }

    pub fn negotiate_background_removal<F>(&mut self, init: F) -> bool
    where
        F: Fn(ExecutionBackend) -> Result<Arc<dyn BackgroundRemovalService>, EngineError>
            + Send
            + 'static,
    {
        self.negotiator.start_background_removal(init)
    }

    pub fn attach_segmentation_service(&mut self, service: Arc<dyn SegmentationService>) {
        self.session.attach_service(service);
    }

    pub fn attach_background_service(&mut self, service: Arc<dyn BackgroundRemovalService>) {
        self.layers.attach_background_service(service);
    }

    fn attach(&mut self, service: NegotiatedService) {
        match service {
            NegotiatedService::Segmentation(s) => self.session.attach_service(s),
            NegotiatedService::BackgroundRemoval(s) => self.layers.attach_background_service(s),
        }
    }

    // ---- base image ---------------------------------------------------------

    /// Decode and install a new base image.
    pub fn load_base_image(&mut self, bytes: &[u8]) -> Result<ImageId, EngineError> {
        let decoded = crate::io::decode_image(bytes).inspect_err(|e| {
            log_warn!("Editor: base image rejected: {}", e);
        })?;
        Ok(self.set_base_image(decoded.pixels, decoded.mime.map(str::to_string)))
    }

    /// Install an already decoded base image. Points, mask, clip toggle and
    /// selection are reset.
    pub fn set_base_image(&mut self, pixels: RgbaImage, mime: Option<String>) -> ImageId {
        let id = self.session.set_image(Arc::new(pixels), mime);
        self.layers.clear_selection();
        self.refit();
        id
    }

    pub fn clear_base_image(&mut self) {
        self.session.clear_image();
        self.layers.clear_selection();
        self.refit();
    }

    pub fn retry_embedding(&mut self) {
        self.session.retry_embedding();
    }

    // ---- points -------------------------------------------------------------

    pub fn add_point(&mut self, at: RelPoint, label: PointLabel) -> Result<PointId, EngineError> {
        self.session.add_point(at, label)
    }

    /// Add a point from a click on the viewport.
    pub fn add_point_at_pixel(&mut self, px: f32, py: f32, label: PointLabel) -> Result<PointId, EngineError> {
        let at = self.geometry.to_relative(px, py);
        self.session.add_point(at, label)
    }

    pub fn remove_point(&mut self, id: PointId) -> bool {
        self.session.remove_point(id)
    }

    pub fn clear_points(&mut self) {
        self.session.clear_points();
    }

    // ---- overlays -----------------------------------------------------------

    pub fn set_clip_globally(&mut self, on: bool) -> bool {
        self.session.set_clip_globally(on)
    }

    pub fn set_highlight_visible(&mut self, on: bool) {
        self.highlight_visible = on;
    }

    // ---- mode / selection ---------------------------------------------------

    /// Switching mode always clears the selection.
    pub fn set_mode(&mut self, mode: EditMode) {
        if self.mode != mode {
            log_info!("Editor: mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
        self.layers.clear_selection();
    }

    /// Select a layer. With `toggle` the layer is added to or removed from
    /// the selection. Ignored outside layer mode.
    pub fn select_layer(&mut self, id: LayerId, toggle: bool) -> bool {
        if self.mode != EditMode::Layers {
            return false;
        }
        if toggle {
            self.layers.toggle_selection(id)
        } else {
            self.layers.select_single(id)
        }
    }

    /// Click in layer mode. Empty space clears the selection unless toggling.
    pub fn click_select(&mut self, px: f32, py: f32, toggle: bool) -> Option<LayerId> {
        if self.mode != EditMode::Layers {
            return None;
        }
        match self.layers.hit_test(px, py, &self.geometry) {
            Some(id) => {
                self.select_layer(id, toggle);
                Some(id)
            }
            None => {
                if !toggle {
                    self.layers.clear_selection();
                }
                None
            }
        }
    }

    pub fn box_select(&mut self, rect: &PixelRect) -> usize {
        if self.mode != EditMode::Layers {
            return 0;
        }
        self.layers.box_select(rect, &self.geometry)
    }

    pub fn clear_selection(&mut self) {
        self.layers.clear_selection();
    }

    // ---- layers -------------------------------------------------------------

    pub fn add_layer(&mut self, bytes: Vec<u8>, name: &str) -> LayerId {
        self.layers.add(bytes, name, &self.geometry)
    }

    pub fn add_layer_image(&mut self, pixels: RgbaImage, name: &str) -> LayerId {
        self.layers.add_image(pixels, name, &self.geometry)
    }

    pub fn remove_layer(&mut self, id: LayerId) -> bool {
        self.layers.remove(id)
    }

    pub fn update_layer_transform(&mut self, id: LayerId, patch: &TransformPatch) -> bool {
        self.layers.update_transform(id, patch)
    }

    pub fn set_layer_pixel_rect(&mut self, id: LayerId, rect: &PixelRect) -> bool {
        self.layers.set_pixel_rect(id, rect, &self.geometry)
    }

    pub fn reorder_layers(&mut self, dragged: LayerId, target: LayerId) -> bool {
        self.layers.reorder(dragged, target)
    }

    pub fn set_layer_clip(&mut self, id: LayerId, on: bool) -> bool {
        self.layers.set_clip_to_mask(id, on)
    }

    pub fn remove_background(&mut self, id: LayerId) -> Result<bool, EngineError> {
        self.layers.request_background_removal(id)
    }

    pub fn tint_layer(&mut self, id: LayerId, color: Rgba<u8>) -> Result<bool, EngineError> {
        let strength = self.settings.tint_strength;
        self.layers.request_tint(id, color, strength)
    }

    pub fn revert_layer(&mut self, id: LayerId) -> bool {
        self.layers.revert_pixels(id)
    }

    // ---- ticking ------------------------------------------------------------

    /// Apply every finished background job. Returns true if anything changed.
    pub fn poll(&mut self) -> bool {
        let ready = self.negotiator.poll();
        let mut changed = !ready.is_empty();
        for service in ready {
            self.attach(service);
        }
        changed |= self.session.poll();
        changed |= self.layers.poll(&self.geometry);
        changed
    }

    /// Block until no job is outstanding anywhere. Returns false on timeout.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            for service in self.negotiator.wait_until_idle(remaining) {
                self.attach(service);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.session.wait_until_idle(remaining);
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.layers.wait_until_idle(&self.geometry, remaining);
            // A finished negotiation can start an embedding, which can start a
            // segmentation, so go round until everything is quiet.
            if !self.is_busy() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![
            self.negotiator.status_line(ServiceKind::Segmentation),
            self.negotiator.status_line(ServiceKind::BackgroundRemoval),
        ];
        for s in [self.session.status(), self.layers.status(), self.status.as_str()] {
            if !s.is_empty() {
                lines.push(s.to_string());
            }
        }
        lines
    }

    fn frame_input(&self, geometry: ViewportGeometry) -> FrameInput<'_> {
        FrameInput {
            geometry,
            base: self.session.image(),
            mask: self.session.mask(),
            highlight_visible: self.highlight_visible,
            clip_globally: self.session.clip_globally(),
            layers: self.layers.layers(),
            selection: self.layers.selection(),
            points: self.session.points(),
            show_points: self.show_points,
            show_selection: self.show_selection && self.mode == EditMode::Layers,
            show_placeholders: self.show_placeholders,
            min_layer_px: self.settings.min_layer_px,
            min_marker_px: self.settings.min_marker_px,
        }
    }

    pub fn frame(&self) -> Frame {
        Frame {
            geometry: self.geometry,
            ops: build_draw_list(&self.frame_input(self.geometry)),
            status: self.status_lines(),
        }
    }

    /// Rasterise the current frame at viewport resolution.
    pub fn render(&self) -> RgbaImage {
        rasterize(&build_draw_list(&self.frame_input(self.geometry)), &self.geometry)
    }

    // ---- export -------------------------------------------------------------

    fn export_format(&self, mime: Option<&str>) -> Result<ExportFormat, EngineError> {
        if let Some(mime) = mime {
            return ExportFormat::from_mime(mime)
                .ok_or_else(|| EngineError::InvalidInput(format!("cannot export as {}", mime)));
        }
        let from_upload = self
            .session
            .image()
            .and_then(|b| b.mime.as_deref())
            .and_then(ExportFormat::from_mime);
        Ok(from_upload
            .or_else(|| ExportFormat::from_mime(&self.settings.default_export_mime))
            .unwrap_or_default())
    }

    /// Viewport-to-source scale: base width over viewport width, or 1.
    pub fn source_pixel_ratio(&self) -> f32 {
        match self.session.image() {
            Some(base) => base.width() as f32 / self.geometry.pixel_width,
            None => 1.0,
        }
    }

    /// Composite and encode. Point markers, selection boxes, layer placeholders
    /// and the highlight are hidden for the capture and restored afterwards.
    pub fn export(&mut self, mime: Option<&str>, pixel_ratio: Option<f32>) -> Result<Export, EngineError> {
        self.export_with(mime, pixel_ratio, false)
    }

    /// `export`, optionally keeping the highlight overlay in the capture.
    pub fn export_with(
        &mut self,
        mime: Option<&str>,
        pixel_ratio: Option<f32>,
        keep_highlight: bool,
    ) -> Result<Export, EngineError> {
        let format = self.export_format(mime)?;
        let ratio = pixel_ratio.unwrap_or_else(|| self.source_pixel_ratio());
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(EngineError::InvalidInput(format!("bad pixel ratio {}", ratio)));
        }

        let saved = (
            self.show_points,
            self.show_selection,
            self.show_placeholders,
            self.highlight_visible,
        );
        self.show_points = false;
        self.show_selection = false;
        self.show_placeholders = false;
        self.highlight_visible = keep_highlight && saved.3;

        let geometry = self.geometry.scaled(ratio);
        let ops = build_draw_list(&self.frame_input(geometry));
        let pixels = rasterize(&ops, &geometry);

        (
            self.show_points,
            self.show_selection,
            self.show_placeholders,
            self.highlight_visible,
        ) = saved;

        let (width, height) = pixels.dimensions();
        let bytes = crate::io::encode_image(&pixels, format)?;
        log_info!(
            "Editor: exported {}x{} {} ({} bytes)",
            width,
            height,
            format.mime(),
            bytes.len()
        );
        self.status = format!("Exported {}x{} {}", width, height, format.extension().to_uppercase());
        Ok(Export { bytes, format, width, height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::service::{
        Embedding, EmbeddingOutput, MaskPrediction, PixelMasks, PreprocessMeta, PromptPoint,
    };

    /// Mask covers the left half of the image.
    struct LeftHalf;

    impl SegmentationService for LeftHalf {
        fn embed(&self, image: &RgbaImage) -> Result<EmbeddingOutput, EngineError> {
            Ok(EmbeddingOutput {
                embedding: Embedding { data: Arc::from(vec![0.0f32; 4]), shape: vec![1, 4] },
                meta: PreprocessMeta {
                    original_size: image.dimensions(),
                    reshaped_size: image.dimensions(),
                },
            })
        }

        fn segment(&self, _: &Embedding, _: &[PromptPoint]) -> Result<MaskPrediction, EngineError> {
            Ok(MaskPrediction { masks: vec![1.0, 0.0], candidates: 1, width: 2, height: 1, scores: vec![0.9] })
        }

        fn post_process_masks(&self, _: &MaskPrediction, meta: &PreprocessMeta) -> Result<PixelMasks, EngineError> {
            let (w, h) = meta.original_size;
            let data = (0..h).flat_map(|_| (0..w).map(move |x| u8::from(x < w / 2))).collect();
            Ok(PixelMasks { data, candidates: 1, width: w, height: h })
        }
    }

    fn editor() -> Editor {
        let mut e = Editor::new(EngineSettings::default(), TaskRunner::Inline);
        e.resize(200.0, 100.0);
        e
    }

    #[test]
    fn geometry_fits_base_image() {
        let mut e = editor();
        e.set_base_image(RgbaImage::new(400, 400), None);
        assert_eq!(e.geometry(), ViewportGeometry::new(100.0, 100.0));
        e.clear_base_image();
        assert_eq!(e.geometry(), ViewportGeometry::new(200.0, 100.0));
    }

    #[test]
    fn mode_switch_clears_selection() {
        let mut e = editor();
        let id = e.add_layer_image(RgbaImage::new(4, 4), "a");
        assert!(!e.select_layer(id, false));
        e.set_mode(EditMode::Layers);
        assert!(e.select_layer(id, false));
        e.set_mode(EditMode::Points);
        assert!(e.layers().selection().is_empty());
    }

    #[test]
    fn new_base_image_clears_selection() {
        let mut e = editor();
        e.set_mode(EditMode::Layers);
        let id = e.add_layer_image(RgbaImage::new(4, 4), "a");
        e.select_layer(id, false);
        e.set_base_image(RgbaImage::new(10, 10), None);
        assert!(e.layers().selection().is_empty());
    }

    #[test]
    fn export_hides_overlays_and_restores_them() {
        let mut e = editor();
        e.attach_segmentation_service(Arc::new(LeftHalf));
        e.set_base_image(RgbaImage::from_pixel(400, 200, Rgba([0, 0, 0, 255])), Some("image/bmp".into()));
        e.poll();
        e.add_point(RelPoint::new(0.25, 0.5), PointLabel::Positive).unwrap();
        e.poll();
        assert!(e.session().mask().is_some());
        e.set_mode(EditMode::Layers);

        let export = e.export(None, None).unwrap();
        assert_eq!(export.format, ExportFormat::Bmp);
        assert_eq!((export.width, export.height), (400, 200));
        let img = crate::io::decode_image(&export.bytes).unwrap().pixels;
        // No highlight or point marker in the capture.
        assert_eq!(*img.get_pixel(100, 100), Rgba([0, 0, 0, 255]));

        assert!(e.highlight_visible());
        let ops = e.frame().ops;
        assert!(ops.iter().any(|op| matches!(op, DrawOp::Highlight { .. })));
        assert!(ops.iter().any(|op| matches!(op, DrawOp::PointMarker { .. })));
    }

    #[test]
    fn export_mime_resolution() {
        let mut e = editor();
        e.set_base_image(RgbaImage::new(20, 10), Some("image/gif".into()));
        assert_eq!(e.export(None, Some(1.0)).unwrap().format, ExportFormat::Png);
        assert_eq!(e.export(Some("image/jpeg"), Some(1.0)).unwrap().format, ExportFormat::Jpeg);
        assert!(matches!(e.export(Some("image/tiff"), None), Err(EngineError::InvalidInput(_))));
        assert!(matches!(e.export(None, Some(0.0)), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn click_point_maps_through_viewport() {
        let mut e = editor();
        e.set_base_image(RgbaImage::new(200, 100), None);
        let id = e.add_point_at_pixel(50.0, 25.0, PointLabel::Negative).unwrap();
        let p = e.session().points().iter().find(|p| p.id == id).copied().unwrap();
        assert!((p.x - 0.25).abs() < 1e-6 && (p.y - 0.25).abs() < 1e-6);
    }

    #[test]
    fn negotiated_services_are_attached_on_poll() {
        let mut e = editor();
        e.set_base_image(RgbaImage::new(8, 8), None);
        e.negotiate_segmentation(|b| match b {
            ExecutionBackend::Software => Ok(Arc::new(LeftHalf) as Arc<dyn SegmentationService>),
            _ => Err(EngineError::BackendUnavailable("nope".into())),
        });
        assert!(e.wait_until_idle(Duration::from_secs(5)));
        assert!(e.session().has_service());
        assert!(e.session().embedding_ready());
    }
}
