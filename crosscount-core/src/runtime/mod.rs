//! runtime — locate the ONNX Runtime shared library
//!
//! `ort` loads ONNX Runtime dynamically from `ORT_DYLIB_PATH`. When that is
//! unset or stale, look next to the working directory and the executable
//! before falling back to the usual system locations.

use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const LIB_NAME: &str = "libonnxruntime.so";

/// Ancestors of the executable that are searched, nearest first.
const EXE_ANCESTORS: usize = 7;

/// Resolve and set `ORT_DYLIB_PATH` when it is missing or points nowhere.
/// Returns the path in effect, if any.
///
/// Must run before the first ONNX session is created.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing = PathBuf::from(existing);
        if existing.is_file() {
            tracing::info!(path = %existing.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing);
        }
        tracing::warn!(
            path = %existing.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let found = ort_candidates(&search_roots()).into_iter().find(|c| c.is_file());
    match &found {
        Some(candidate) => {
            // SAFETY: called once from the main thread before any ORT session
            // exists, so nothing reads the environment concurrently.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
        }
        None => tracing::warn!(
            "could not locate {LIB_NAME}; set ORT_DYLIB_PATH to an ONNX Runtime build"
        ),
    }
    found
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe() {
        roots.extend(exe.ancestors().skip(1).take(EXE_ANCESTORS).map(Path::to_path_buf));
    }
    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(LIB_NAME));
        candidates.push(root.join("models").join(LIB_NAME));
        candidates.push(root.join("lib").join(LIB_NAME));
    }
    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/opt/homebrew/lib").join(LIB_NAME));
    }
    if cfg!(unix) {
        candidates.push(PathBuf::from("/usr/local/lib").join(LIB_NAME));
        candidates.push(PathBuf::from("/usr/lib").join(LIB_NAME));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_search_roots_in_order() {
        let roots = [PathBuf::from("/a"), PathBuf::from("/b")];
        let candidates = ort_candidates(&roots);
        assert_eq!(candidates[0], Path::new("/a/models/onnxruntime/lib").join(LIB_NAME));
        assert_eq!(candidates[3], Path::new("/b/models/onnxruntime/lib").join(LIB_NAME));
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join(LIB_NAME), b"").unwrap();

        let found = ort_candidates(&[dir.path().to_path_buf()])
            .into_iter()
            .find(|c| c.is_file());
        assert_eq!(found, Some(models.join(LIB_NAME)));
    }

    #[test]
    fn ort_is_built_to_load_the_library_at_runtime() {
        // `init_from` only exists when ort resolves ONNX Runtime from a path
        // instead of linking its own copy.
        let _from_path = |path: &str| {
            let _ = ort::init_from(path);
        };
    }
}
