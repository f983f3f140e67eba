// ============================================================================
// MaskFE CLI: headless compositing and backend probing
// ============================================================================
//
// Usage examples:
//   maskfe compose --base photo.jpg --mask photo_mask.png --point 0.5,0.5 \
//                  --layer "stickers/*.png" --clip --output out.png
//   maskfe compose -b photo.png -l sky.png --place 0,0,1,0.5 --tint 255,128,0 -o out.webp
//   maskfe probe --runtime /opt/onnxruntime/lib/libonnxruntime.so
//
// Everything runs through the same editor the interactive front end uses; the
// CLI just waits for background jobs instead of rendering frames meanwhile.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use image::Rgba;

use crate::backend::{ExecutionBackend, try_in_order};
use crate::editor::Editor;
use crate::error::EngineError;
use crate::geometry::RelPoint;
use crate::io::ExportFormat;
use crate::layers::TransformPatch;
use crate::segmentation::SessionState;
use crate::segmentation::precomputed::{PrecomputedMaskService, PrecomputedMatteService};
use crate::segmentation::service::{BackgroundRemovalService, PointLabel, SegmentationService};
use crate::settings::EngineSettings;
use crate::tasks::TaskRunner;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// MaskFE headless compositor.
#[derive(Parser, Debug)]
#[command(
    name = "maskfe",
    about = "Mask-driven image compositor",
    long_about = "Segment a subject with prompt points, stack overlay layers, clip them\n\
                  to the mask and export at source resolution, without a GUI.\n\n\
                  Example:\n  \
                  maskfe compose -b photo.jpg -m mask.png -p 0.5,0.5 -l 'fx/*.png' --clip -o out.png"
)]
pub struct CliArgs {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Print progress and timing information.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Composite layers over a base image and write the result.
    Compose(ComposeArgs),
    /// Try every configured execution backend and report the outcome.
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct ComposeArgs {
    /// Base image.
    #[arg(short, long, value_name = "FILE")]
    pub base: PathBuf,

    /// Precomputed subject mask (white = subject). Enables points and clipping.
    #[arg(short, long, value_name = "FILE")]
    pub mask: Option<PathBuf>,

    /// Positive prompt point, image-relative "x,y". Repeatable.
    #[arg(short, long = "point", value_name = "X,Y")]
    pub points: Vec<String>,

    /// Negative prompt point, image-relative "x,y". Repeatable.
    #[arg(short, long = "negative", value_name = "X,Y")]
    pub negatives: Vec<String>,

    /// Layer file(s), bottom first. Glob patterns accepted.
    #[arg(short, long = "layer", value_name = "PATTERN")]
    pub layers: Vec<String>,

    /// Placement for the n-th layer, viewport-relative "x,y,w,h[,degrees]".
    #[arg(long = "place", value_name = "X,Y,W,H[,DEG]")]
    pub places: Vec<String>,

    /// Draw the global clip overlay above the layers.
    #[arg(long)]
    pub clip: bool,

    /// Clip every layer to the mask individually.
    #[arg(long)]
    pub clip_layers: bool,

    /// Keep the mask highlight in the output.
    #[arg(long)]
    pub highlight: bool,

    /// Tint every layer toward "r,g,b".
    #[arg(long, value_name = "R,G,B")]
    pub tint: Option<String>,

    /// Precomputed alpha matte applied to every layer as background removal.
    #[arg(long, value_name = "FILE")]
    pub remove_bg: Option<PathBuf>,

    /// Output file. The format follows --format, then the extension.
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Output format: png, jpeg, webp, bmp.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Export pixel ratio. Defaults to the base image's own resolution.
    #[arg(long, value_name = "RATIO")]
    pub ratio: Option<f32>,

    /// Viewport size "w,h" the relative layout is resolved against.
    #[arg(long, value_name = "W,H")]
    pub viewport: Option<String>,

    /// Give up waiting for background jobs after this many seconds.
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    pub timeout: u64,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// ONNX Runtime shared library. Defaults to the configured one.
    #[arg(short, long, value_name = "FILE")]
    pub runtime: Option<PathBuf>,

    /// Comma separated backend order, e.g. "cuda,cpu,software".
    #[arg(long, value_name = "LIST")]
    pub backends: Option<String>,
}

// ============================================================================
// Public entry point
// ============================================================================

pub fn run(args: CliArgs) -> ExitCode {
    let settings = match &args.settings {
        Some(path) => EngineSettings::load_from(path),
        None => EngineSettings::load(),
    };
    let result = match args.command {
        Command::Compose(compose) => run_compose(&compose, settings, args.verbose),
        Command::Probe(probe) => run_probe(&probe, &settings),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_err!("CLI: {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// compose
// ============================================================================

fn run_compose(args: &ComposeArgs, settings: EngineSettings, verbose: bool) -> Result<(), EngineError> {
    let start = Instant::now();
    let timeout = Duration::from_secs(args.timeout.max(1));

    let format = parse_format(args.format.as_deref(), &args.output)?;
    let tint = args.tint.as_deref().map(parse_rgb).transpose()?;
    let points = args
        .points
        .iter()
        .map(|p| parse_pair(p).map(|(x, y)| (x, y, PointLabel::Positive)))
        .chain(
            args.negatives
                .iter()
                .map(|p| parse_pair(p).map(|(x, y)| (x, y, PointLabel::Negative))),
        )
        .collect::<Result<Vec<_>, _>>()?;
    if !points.is_empty() && args.mask.is_none() {
        return Err(EngineError::InvalidInput("--point/--negative need --mask".to_string()));
    }
    let places = args
        .places
        .iter()
        .map(|p| parse_place(p))
        .collect::<Result<Vec<_>, _>>()?;

    let layer_files = resolve_inputs(&args.layers);
    if !args.layers.is_empty() && layer_files.is_empty() {
        return Err(EngineError::InvalidInput("no layer files matched".to_string()));
    }

    let runtime = settings.onnx_runtime().map(Path::to_path_buf);
    let mut editor = Editor::new(settings, TaskRunner::Pool);

    // -- Step 1: backends ----------------------------------------------------
    if let Some(mask_path) = args.mask.clone() {
        let service = Arc::new(PrecomputedMaskService::open(&mask_path)?);
        let runtime = runtime.clone();
        editor.negotiate_segmentation(move |backend| {
            crate::onnx::probe_backend(runtime.as_deref(), backend)?;
            Ok(Arc::clone(&service) as Arc<dyn SegmentationService>)
        });
    }
    if let Some(matte_path) = args.remove_bg.clone() {
        let service = Arc::new(PrecomputedMatteService::open(&matte_path)?);
        let runtime = runtime.clone();
        editor.negotiate_background_removal(move |backend| {
            crate::onnx::probe_backend(runtime.as_deref(), backend)?;
            Ok(Arc::clone(&service) as Arc<dyn BackgroundRemovalService>)
        });
    }

    // -- Step 2: base image and viewport ------------------------------------
    let base = crate::io::load_file(&args.base)?;
    let (bw, bh) = base.pixels.dimensions();
    let (vw, vh) = match args.viewport.as_deref() {
        Some(v) => parse_pair(v)?,
        None => (bw as f32, bh as f32),
    };
    editor.resize(vw, vh);
    editor.set_base_image(base.pixels, base.mime.map(str::to_string));
    if verbose {
        println!("base {}x{} from {}", bw, bh, args.base.display());
    }

    // -- Step 3: layers -------------------------------------------------------
    let mut layer_ids = Vec::with_capacity(layer_files.len());
    for path in &layer_files {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("layer")
            .to_string();
        layer_ids.push(editor.add_layer(bytes, &name));
    }
    wait(&mut editor, timeout)?;

    for (idx, id) in layer_ids.iter().enumerate() {
        let Some(layer) = editor.layers().get(*id) else { continue };
        if layer.current_pixels.is_none() {
            return Err(EngineError::Decode(format!(
                "layer '{}' could not be decoded",
                layer_files[idx].display()
            )));
        }
        if let Some(patch) = places.get(idx) {
            editor.update_layer_transform(*id, patch);
        }
        if args.clip_layers {
            editor.set_layer_clip(*id, true);
        }
        if let Some(color) = tint {
            editor.tint_layer(*id, color)?;
        }
    }
    wait(&mut editor, timeout)?;

    if args.remove_bg.is_some() {
        for id in &layer_ids {
            editor.remove_background(*id)?;
        }
        wait(&mut editor, timeout)?;
    }

    // -- Step 4: points -------------------------------------------------------
    for (x, y, label) in &points {
        editor.add_point(RelPoint::new(*x, *y), *label)?;
    }
    wait(&mut editor, timeout)?;
    if !points.is_empty() && editor.session().state() != SessionState::MaskReady {
        return Err(EngineError::Inference(format!(
            "no mask produced: {}",
            editor.status_lines().join(" | ")
        )));
    }
    if args.clip && !editor.set_clip_globally(true) {
        log_warn!("CLI: --clip ignored, no mask");
        eprintln!("warning: --clip ignored because no mask was produced.");
    }
    editor.set_highlight_visible(args.highlight);

    // -- Step 5: export -------------------------------------------------------
    let export = editor.export_with(Some(format.mime()), args.ratio, args.highlight)?;
    crate::io::write_file(&export.bytes, &args.output)?;

    if verbose {
        for line in editor.status_lines() {
            println!("  {}", line);
        }
        println!(
            "→ {} {}x{} ({:.0}ms)",
            args.output.display(),
            export.width,
            export.height,
            start.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

fn wait(editor: &mut Editor, timeout: Duration) -> Result<(), EngineError> {
    if editor.wait_until_idle(timeout) {
        Ok(())
    } else {
        Err(EngineError::Inference(format!(
            "timed out waiting for background jobs: {}",
            editor.status_lines().join(" | ")
        )))
    }
}

// ============================================================================
// probe
// ============================================================================

/// One report line for a configured model path.
fn model_line(label: &str, path: Option<&Path>) -> String {
    match path {
        None => format!("{}: (not configured)", label),
        Some(p) => match crate::onnx::check_model(p) {
            Ok(()) => format!("{}: {} ok", label, p.display()),
            Err(e) => {
                log_warn!("CLI: {} unusable: {}", label, e);
                format!("{}: {} ({})", label, p.display(), e)
            }
        },
    }
}

fn run_probe(args: &ProbeArgs, settings: &EngineSettings) -> Result<(), EngineError> {
    let runtime = args
        .runtime
        .clone()
        .or_else(|| settings.onnx_runtime().map(Path::to_path_buf));
    let order = match args.backends.as_deref() {
        Some(list) => {
            let order = ExecutionBackend::parse_list(list);
            if order.is_empty() {
                return Err(EngineError::InvalidInput(format!("no known backends in '{}'", list)));
            }
            order
        }
        None => settings.backend_order.clone(),
    };

    match &runtime {
        Some(path) => println!("runtime: {}", path.display()),
        None => println!("runtime: (not configured)"),
    }
    println!("{}", model_line("segmentation model", settings.segmentation_model()));
    println!("{}", model_line("background model", settings.background_model()));

    let outcome = try_in_order(order.iter().copied(), |backend| {
        crate::onnx::probe_backend(runtime.as_deref(), backend)
    });
    match outcome {
        Ok((backend, probe)) => {
            // Report what was skipped on the way.
            for b in order.iter().take_while(|b| **b != backend) {
                println!("  {:<9} unavailable", b.name());
            }
            let version = probe.runtime_version.as_deref().unwrap_or("n/a");
            println!("  {:<9} ok (runtime {})", backend.name(), version);
            if let Some(p) = &probe.provider_path {
                println!("            provider {}", p.display());
            }
            log_info!("CLI: probe selected {}", backend);
            Ok(())
        }
        Err(attempts) => {
            for a in &attempts {
                println!("  {:<9} {}", a.backend.name(), a.error);
            }
            Err(EngineError::BackendUnavailable(
                "no execution backend could be initialised".to_string(),
            ))
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// `--format` first, then the output extension, then PNG.
fn parse_format(format_arg: Option<&str>, output: &Path) -> Result<ExportFormat, EngineError> {
    if let Some(f) = format_arg {
        return ExportFormat::from_extension(f)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown format '{}'", f)));
    }
    Ok(output
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ExportFormat::from_extension)
        .unwrap_or_default())
}

fn parse_floats(s: &str) -> Result<Vec<f32>, EngineError> {
    s.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| EngineError::InvalidInput(format!("bad number '{}' in '{}'", part.trim(), s)))
        })
        .collect()
}

fn parse_pair(s: &str) -> Result<(f32, f32), EngineError> {
    match parse_floats(s)?.as_slice() {
        [x, y] => Ok((*x, *y)),
        _ => Err(EngineError::InvalidInput(format!("expected 'x,y', got '{}'", s))),
    }
}

fn parse_place(s: &str) -> Result<TransformPatch, EngineError> {
    let v = parse_floats(s)?;
    if v.len() != 4 && v.len() != 5 {
        return Err(EngineError::InvalidInput(format!("expected 'x,y,w,h[,deg]', got '{}'", s)));
    }
    Ok(TransformPatch {
        rel_x: Some(v[0]),
        rel_y: Some(v[1]),
        rel_width: Some(v[2]),
        rel_height: Some(v[3]),
        rotation_degrees: v.get(4).copied(),
    })
}

fn parse_rgb(s: &str) -> Result<Rgba<u8>, EngineError> {
    let parts: Vec<&str> = s.split(',').collect();
    let [r, g, b] = parts.as_slice() else {
        return Err(EngineError::InvalidInput(format!("expected 'r,g,b', got '{}'", s)));
    };
    let channel = |c: &str| {
        c.trim()
            .parse::<u8>()
            .map_err(|_| EngineError::InvalidInput(format!("bad colour channel '{}'", c.trim())))
    };
    Ok(Rgba([channel(r)?, channel(g)?, channel(b)?, 255]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_points_and_places() {
        assert_eq!(parse_pair("0.5, 0.25").unwrap(), (0.5, 0.25));
        assert!(parse_pair("0.5").is_err());
        assert!(parse_pair("a,b").is_err());
        let patch = parse_place("0,0.5,0.2,0.2,45").unwrap();
        assert_eq!(patch.rotation_degrees, Some(45.0));
        assert!(parse_place("1,2,3").is_err());
    }

    #[test]
    fn parses_colour() {
        assert_eq!(parse_rgb("255,128,0").unwrap(), Rgba([255, 128, 0, 255]));
        assert!(parse_rgb("255,128").is_err());
        assert!(parse_rgb("300,0,0").is_err());
    }

    #[test]
    fn format_falls_back_to_extension_then_png() {
        assert_eq!(parse_format(Some("jpeg"), Path::new("x.png")).unwrap(), ExportFormat::Jpeg);
        assert_eq!(parse_format(None, Path::new("x.webp")).unwrap(), ExportFormat::Webp);
        assert_eq!(parse_format(None, Path::new("x")).unwrap(), ExportFormat::Png);
        assert!(parse_format(Some("tga"), Path::new("x.png")).is_err());
    }

    #[test]
    fn configured_models_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("matte.onnx");
        std::fs::write(&model, b"onnx").unwrap();

        let mut settings = EngineSettings::default();
        assert_eq!(
            model_line("background model", settings.background_model()),
            "background model: (not configured)"
        );
        settings.background_model_path = model.display().to_string();
        assert!(model_line("background model", settings.background_model()).ends_with(" ok"));
        settings.segmentation_model_path = dir.path().join("missing.onnx").display().to_string();
        assert!(model_line("segmentation model", settings.segmentation_model()).contains("not found"));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }

    #[test]
    fn compose_arguments_parse() {
        let args = CliArgs::try_parse_from([
            "maskfe", "compose", "-b", "a.png", "-m", "m.png", "-p", "0.5,0.5", "-n", "0.1,0.1",
            "-l", "x/*.png", "--clip", "-o", "out.png",
        ])
        .unwrap();
        let Command::Compose(c) = args.command else { panic!("expected compose") };
        assert_eq!(c.points, vec!["0.5,0.5"]);
        assert_eq!(c.negatives, vec!["0.1,0.1"]);
        assert!(c.clip && !c.clip_layers);
    }
}
