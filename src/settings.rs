// ============================================================================
// ENGINE SETTINGS: key=value config file
// ============================================================================

use std::path::{Path, PathBuf};

use image::Rgba;

use crate::backend::ExecutionBackend;
use crate::error::EngineError;
use crate::layers::Placement;
use crate::ops::background::MatteSettings;

const SETTINGS_FILE: &str = "maskfe_settings.cfg";

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Fraction of the viewport a new layer's longer side occupies.
    pub layer_target_fraction: f32,
    /// Minimum rendered layer side, in pixels.
    pub min_layer_px: f32,
    /// Minimum rendered point marker diameter, in pixels.
    pub min_marker_px: f32,
    pub highlight_color: Rgba<u8>,
    pub backend_order: Vec<ExecutionBackend>,
    pub onnx_runtime_path: String,
    pub segmentation_model_path: String,
    pub background_model_path: String,
    pub bg_threshold: f32,
    pub bg_smooth_edges: bool,
    pub tint_strength: f32,
    pub default_export_mime: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            layer_target_fraction: 0.2,
            min_layer_px: 8.0,
            min_marker_px: 6.0,
            highlight_color: Rgba([30, 144, 255, 128]),
            backend_order: ExecutionBackend::all().to_vec(),
            onnx_runtime_path: String::new(),
            segmentation_model_path: String::new(),
            background_model_path: String::new(),
            bg_threshold: 0.5,
            bg_smooth_edges: true,
            tint_strength: 1.0,
            default_export_mime: "image/png".to_string(),
        }
    }
}

/// Serialize a colour as "r,g,b,a"
fn color_to_str(c: Rgba<u8>) -> String {
    format!("{},{},{},{}", c[0], c[1], c[2], c[3])
}

/// Parse a colour from "r,g,b,a"
pub fn str_to_color(s: &str) -> Option<Rgba<u8>> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() == 4 {
        let r = parts[0].trim().parse::<u8>().ok()?;
        let g = parts[1].trim().parse::<u8>().ok()?;
        let b = parts[2].trim().parse::<u8>().ok()?;
        let a = parts[3].trim().parse::<u8>().ok()?;
        Some(Rgba([r, g, b, a]))
    } else {
        None
    }
}

/// Parse a finite float inside `range`.
fn parse_in_range(val: &str, range: std::ops::RangeInclusive<f32>) -> Option<f32> {
    val.parse::<f32>()
        .ok()
        .filter(|v| v.is_finite() && range.contains(v))
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/maskfe/maskfe_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\MaskFE\maskfe_settings.cfg
    /// On macOS:   ~/Library/Application Support/MaskFE/maskfe_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("maskfe");
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("MaskFE").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("MaskFE")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            return std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join(SETTINGS_FILE)));
        }
    }

    pub fn placement(&self) -> Placement {
        Placement {
            target_fraction: self.layer_target_fraction,
            min_px: self.min_layer_px,
        }
    }

    pub fn matte(&self) -> MatteSettings {
        MatteSettings {
            threshold: self.bg_threshold,
            smooth_edges: self.bg_smooth_edges,
        }
    }

    fn optional_path(s: &str) -> Option<&Path> {
        let s = s.trim();
        (!s.is_empty()).then(|| Path::new(s))
    }

    pub fn onnx_runtime(&self) -> Option<&Path> {
        Self::optional_path(&self.onnx_runtime_path)
    }

    pub fn segmentation_model(&self) -> Option<&Path> {
        Self::optional_path(&self.segmentation_model_path)
    }

    pub fn background_model(&self) -> Option<&Path> {
        Self::optional_path(&self.background_model_path)
    }

    pub fn to_config_string(&self) -> String {
        let order = self
            .backend_order
            .iter()
            .map(|b| b.name())
            .collect::<Vec<_>>()
            .join(",");
        let lines = [
            format!("layer_target_fraction={}", self.layer_target_fraction),
            format!("min_layer_px={}", self.min_layer_px),
            format!("min_marker_px={}", self.min_marker_px),
            format!("highlight_color={}", color_to_str(self.highlight_color)),
            format!("backend_order={}", order),
            format!("onnx_runtime_path={}", self.onnx_runtime_path),
            format!("segmentation_model_path={}", self.segmentation_model_path),
            format!("background_model_path={}", self.background_model_path),
            format!("bg_threshold={}", self.bg_threshold),
            format!("bg_smooth_edges={}", self.bg_smooth_edges),
            format!("tint_strength={}", self.tint_strength),
            format!("default_export_mime={}", self.default_export_mime),
        ];
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Parse config text. Unknown keys and bad values keep their defaults.
    pub fn from_config_str(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "layer_target_fraction" => {
                    if let Some(v) = parse_in_range(val, 0.01..=1.0) {
                        s.layer_target_fraction = v;
                    }
                }
                "min_layer_px" => {
                    if let Some(v) = parse_in_range(val, 1.0..=512.0) {
                        s.min_layer_px = v;
                    }
                }
                "min_marker_px" => {
                    if let Some(v) = parse_in_range(val, 1.0..=128.0) {
                        s.min_marker_px = v;
                    }
                }
                "highlight_color" => {
                    if let Some(c) = str_to_color(val) {
                        s.highlight_color = c;
                    }
                }
                "backend_order" => {
                    let order = ExecutionBackend::parse_list(val);
                    if !order.is_empty() {
                        s.backend_order = order;
                    }
                }
                "onnx_runtime_path" => s.onnx_runtime_path = val.to_string(),
                "segmentation_model_path" => s.segmentation_model_path = val.to_string(),
                "background_model_path" => s.background_model_path = val.to_string(),
                "bg_threshold" => {
                    if let Some(v) = parse_in_range(val, 0.0..=1.0) {
                        s.bg_threshold = v;
                    }
                }
                "bg_smooth_edges" => s.bg_smooth_edges = val == "true",
                "tint_strength" => {
                    if let Some(v) = parse_in_range(val, 0.0..=1.0) {
                        s.tint_strength = v;
                    }
                }
                "default_export_mime" => {
                    if crate::io::ExportFormat::from_mime(val).is_some() {
                        s.default_export_mime = val.to_ascii_lowercase();
                    }
                }
                _ => {}
            }
        }
        s
    }

    pub fn save_to(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }

    /// Missing or unreadable files give the defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_config_str(&content),
            Err(_) => Self::default(),
        }
    }

    /// Save to the platform settings path.
    pub fn save(&self) -> Result<(), EngineError> {
        let Some(path) = Self::settings_path() else {
            return Err(EngineError::Io("no settings directory on this platform".to_string()));
        };
        self.save_to(&path)
    }

    /// Load from the platform settings path (default if missing or corrupt).
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        Self::load_from(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = EngineSettings {
            layer_target_fraction: 0.35,
            highlight_color: Rgba([1, 2, 3, 4]),
            backend_order: vec![ExecutionBackend::Cpu, ExecutionBackend::Software],
            onnx_runtime_path: "/opt/ort/libonnxruntime.so".to_string(),
            bg_smooth_edges: false,
            default_export_mime: "image/webp".to_string(),
            ..EngineSettings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(EngineSettings::load_from(&path), settings);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let s = EngineSettings::from_config_str(
            "layer_target_fraction=NaN\n\
             min_layer_px=-4\n\
             highlight_color=1,2,3\n\
             backend_order=quantum\n\
             default_export_mime=image/gif\n\
             mystery_key=1\n\
             no equals sign here\n\
             tint_strength=0.25\n",
        );
        let d = EngineSettings::default();
        assert_eq!(s.layer_target_fraction, d.layer_target_fraction);
        assert_eq!(s.min_layer_px, d.min_layer_px);
        assert_eq!(s.highlight_color, d.highlight_color);
        assert_eq!(s.backend_order, d.backend_order);
        assert_eq!(s.default_export_mime, "image/png");
        assert_eq!(s.tint_strength, 0.25);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            EngineSettings::load_from(&dir.path().join("absent.cfg")),
            EngineSettings::default()
        );
    }

    #[test]
    fn empty_paths_are_none() {
        let s = EngineSettings::default();
        assert!(s.onnx_runtime().is_none());
        let s = EngineSettings { onnx_runtime_path: "/x/libonnxruntime.so".into(), ..s };
        assert_eq!(s.onnx_runtime(), Some(Path::new("/x/libonnxruntime.so")));
    }
}
