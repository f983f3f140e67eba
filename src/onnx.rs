// ============================================================================
// ONNX RUNTIME PROBE: can a backend actually be initialised here?
// ============================================================================
//
// Uses `libloading` to open onnxruntime.dll / libonnxruntime.so at runtime, so
// the binary has no compile-time dependency on ONNX Runtime. This is the
// backend check the negotiator runs before a service is constructed.

use std::path::{Component, Path, PathBuf};

use crate::backend::ExecutionBackend;
use crate::error::EngineError;

/// Requested OrtApi version. 18 matches ONNX Runtime 1.18.
const ORT_API_VERSION: u32 = 18;
/// Older builds have incompatible vtable layouts.
const ORT_MIN_VERSION: (u32, u32) = (1, 16);

/// OrtApiBase: the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const std::ffi::c_void,
    get_version_string: unsafe extern "C" fn() -> *const std::ffi::c_char,
}

/// Reject paths that should never be handed to the dynamic loader:
/// relative paths, `..` components, or the wrong file extension.
pub fn validate_path(path: &Path, for_library: bool) -> Result<(), EngineError> {
    if path.as_os_str().is_empty() {
        return Err(EngineError::BackendUnavailable("path is empty".to_string()));
    }
    if !path.is_absolute() {
        return Err(EngineError::BackendUnavailable(format!(
            "{} is not an absolute path",
            path.display()
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(EngineError::BackendUnavailable(format!(
            "{} must not contain '..' components",
            path.display()
        )));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if for_library {
        if !["dll", "so", "dylib"].contains(&ext.as_str()) {
            return Err(EngineError::BackendUnavailable(format!(
                "expected a .dll/.so/.dylib file, got '.{}'",
                ext
            )));
        }
    } else if ext != "onnx" {
        return Err(EngineError::BackendUnavailable(format!(
            "expected a .onnx model file, got '.{}'",
            ext
        )));
    }
    Ok(())
}

/// A configured model file must be a safe `.onnx` path that exists.
pub fn check_model(path: &Path) -> Result<(), EngineError> {
    validate_path(path, false)?;
    if !path.is_file() {
        return Err(EngineError::BackendUnavailable(format!(
            "{} not found",
            path.display()
        )));
    }
    Ok(())
}

/// "1.18.0" -> (1, 18)
pub fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

fn version_supported(version: &str) -> bool {
    match parse_ort_version(version) {
        Some((major, minor)) => {
            let (min_major, min_minor) = ORT_MIN_VERSION;
            major > min_major || (major == min_major && minor >= min_minor)
        }
        // Unknown format: let the API call decide
        None => true,
    }
}

/// Load the runtime and return its version string. Enforces >= 1.16.
pub fn probe_runtime(library: &Path) -> Result<String, EngineError> {
    validate_path(library, true)?;
    if !library.exists() {
        return Err(EngineError::BackendUnavailable(format!(
            "{} not found",
            library.display()
        )));
    }

    unsafe {
        let lib = libloading::Library::new(library)
            .map_err(|e| EngineError::BackendUnavailable(format!("failed to load runtime: {}", e)))?;

        let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> =
            lib.get(b"OrtGetApiBase").map_err(|e| {
                EngineError::BackendUnavailable(format!("symbol OrtGetApiBase not found: {}", e))
            })?;

        let api_base = get_api_base();
        if api_base.is_null() {
            return Err(EngineError::BackendUnavailable(
                "OrtGetApiBase returned null".to_string(),
            ));
        }

        let version_ptr = ((*api_base).get_version_string)();
        let version = if version_ptr.is_null() {
            "unknown".to_string()
        } else {
            std::ffi::CStr::from_ptr(version_ptr)
                .to_string_lossy()
                .into_owned()
        };

        if !version_supported(&version) {
            let (min_major, min_minor) = ORT_MIN_VERSION;
            return Err(EngineError::BackendUnavailable(format!(
                "ONNX Runtime {} is too old, need {}.{} or newer",
                version, min_major, min_minor
            )));
        }

        let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
        if api_ptr.is_null() {
            return Err(EngineError::BackendUnavailable(format!(
                "OrtGetApi({}) returned null for runtime {}",
                ORT_API_VERSION, version
            )));
        }

        Ok(version)
    }
}

/// Platform file name of a shared library stem.
fn shared_library_name(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.dll", stem)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", stem)
    } else {
        format!("lib{}.so", stem)
    }
}

/// Extra library an execution provider needs next to the runtime, if any.
pub fn provider_library(backend: ExecutionBackend) -> Option<String> {
    match backend {
        ExecutionBackend::Cuda => Some(shared_library_name("onnxruntime_providers_cuda")),
        ExecutionBackend::DirectMl => Some("DirectML.dll".to_string()),
        ExecutionBackend::CoreMl | ExecutionBackend::Cpu | ExecutionBackend::Software => None,
    }
}

fn platform_supports(backend: ExecutionBackend) -> bool {
    match backend {
        ExecutionBackend::DirectMl => cfg!(target_os = "windows"),
        ExecutionBackend::CoreMl => cfg!(target_os = "macos"),
        ExecutionBackend::Cuda => cfg!(any(target_os = "windows", target_os = "linux")),
        ExecutionBackend::Cpu | ExecutionBackend::Software => true,
    }
}

/// Result of a successful backend check.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendProbe {
    pub backend: ExecutionBackend,
    /// Runtime version, or `None` for the software backend.
    pub runtime_version: Option<String>,
    pub provider_path: Option<PathBuf>,
}

/// Check whether `backend` can be initialised with the runtime at `runtime`.
/// The software backend always succeeds and needs no runtime.
pub fn probe_backend(runtime: Option<&Path>, backend: ExecutionBackend) -> Result<BackendProbe, EngineError> {
    if backend == ExecutionBackend::Software {
        return Ok(BackendProbe {
            backend,
            runtime_version: None,
            provider_path: None,
        });
    }
    if !platform_supports(backend) {
        return Err(EngineError::BackendUnavailable(format!(
            "{} is not available on this platform",
            backend
        )));
    }
    let Some(runtime) = runtime else {
        return Err(EngineError::BackendUnavailable(
            "no ONNX Runtime library configured".to_string(),
        ));
    };
    let version = probe_runtime(runtime)?;
    let provider_path = match provider_library(backend) {
        Some(name) => {
            let dir = runtime.parent().unwrap_or_else(|| Path::new("."));
            let path = dir.join(&name);
            if !path.exists() {
                return Err(EngineError::BackendUnavailable(format!(
                    "{} provider library {} not found next to the runtime",
                    backend, name
                )));
            }
            Some(path)
        }
        None => None,
    };
    Ok(BackendProbe {
        backend,
        runtime_version: Some(version),
        provider_path,
    })
}
