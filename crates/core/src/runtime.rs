//! ONNX Runtime and GPU library discovery.
//!
//! `ort` is built with `load-dynamic`, so the shared library is located at
//! startup and advertised through `ORT_DYLIB_PATH`. CUDA, cuDNN and TensorRT
//! libraries shipped next to the binary are preloaded so the accelerated
//! execution providers can resolve them.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const LIB_DIR_ENV: &str = "TILESCALE_LIB_DIR";
const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub searched: Vec<PathBuf>,
    pub ort_dylib: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// `$TILESCALE_LIB_DIR`, then `lib/` beside and above the executable, then
/// `./lib`, then the usual system locations.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(dir) = env::var_os(LIB_DIR_ENV) {
        push(PathBuf::from(dir));
    }
    if let Some(exe_dir) = env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        #[cfg(windows)]
        push(exe_dir.clone());
        push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load order tier: CUDA runtime, then cuDNN, then TensorRT. ORT's own
/// provider libraries are left for `ort` to open after the core library.
fn load_tier(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    const CUDA: [&str; 5] = ["cudart", "cublaslt", "cublas", "cufft", "curand"];

    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

fn is_shared_library(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if cfg!(windows) {
        name.to_ascii_lowercase().ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// Preload candidates ordered by tier then name; the first directory that
/// holds a given file name wins.
fn collect_preload_candidates(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: Vec<(u8, String, PathBuf)> = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|e| e.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(tier) = load_tier(&name) else {
                continue;
            };
            if found.iter().any(|(_, seen, _)| *seen == name) {
                continue;
            }
            found.push((tier, name, path));
        }
    }
    found.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    found.into_iter().map(|(_, _, path)| path).collect()
}

/// Opens `path` process-wide and leaks the handle so its symbols stay
/// resolvable for later `dlopen` calls made by ORT.
#[cfg(unix)]
fn preload(path: &Path) -> bool {
    // SAFETY: only CUDA/cuDNN/TensorRT libraries are opened here; their
    // initializers have no preconditions on our side.
    let opened = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    match opened {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn preload(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Must run before the first ORT call and before any extra threads exist,
/// since it mutates the process environment.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let searched = candidate_lib_dirs();

    let ort_dylib = match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => Some(PathBuf::from(existing)),
        None => {
            let found = find_ort_dylib(&searched);
            if let Some(path) = &found {
                env::set_var(ORT_DYLIB_ENV, path);
            }
            found
        }
    };

    let preloaded = collect_preload_candidates(&searched)
        .into_iter()
        .filter(|path| preload(path))
        .collect();

    RuntimeLibReport {
        searched,
        ort_dylib,
        preloaded,
    }
}

pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => info!(path = %path.display(), "ONNX Runtime library"),
        Some(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points to a missing file"
        ),
        None => warn!(
            searched = report.searched.len(),
            "ONNX Runtime library not found; neural models will fall back to classical resampling"
        ),
    }
    for path in &report.preloaded {
        debug!(path = %path.display(), "Preloaded GPU runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn system_lib_dirs_are_searched_last() {
        let dirs = candidate_lib_dirs();
        assert_eq!(dirs.last(), Some(&PathBuf::from("/usr/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
    }

    #[test]
    fn load_tiers_order_cuda_cudnn_tensorrt() {
        assert_eq!(load_tier("libcudart.so.12"), Some(0));
        assert_eq!(load_tier("cublasLt64_12.dll"), Some(0));
        assert_eq!(load_tier("libcudnn_ops.so.9"), Some(1));
        assert_eq!(load_tier("libnvinfer.so.10"), Some(2));
        assert_eq!(load_tier("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_tier("libpng16.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_candidates_are_tiered_and_deduplicated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");
        for name in ["libnvinfer.so.10", "libcudart.so.12", "libunrelated.so"] {
            std::fs::write(first.join(name), b"").expect("write lib");
        }
        std::fs::write(second.join("libcudart.so.12"), b"").expect("write dup");
        std::fs::write(second.join("libcudnn.so.9"), b"").expect("write cudnn");

        let found = collect_preload_candidates(&[first.clone(), second.clone()]);
        assert_eq!(
            found,
            vec![
                first.join("libcudart.so.12"),
                second.join("libcudnn.so.9"),
                first.join("libnvinfer.so.10"),
            ]
        );
    }

    #[test]
    fn ort_dylib_lookup_uses_first_hit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let empty = temp.path().join("empty");
        let hit = temp.path().join("hit");
        std::fs::create_dir_all(&empty).expect("empty dir");
        std::fs::create_dir_all(&hit).expect("hit dir");
        std::fs::write(hit.join(ORT_LIB_NAME), b"").expect("write ort");

        assert_eq!(
            find_ort_dylib(&[empty.clone(), hit.clone()]),
            Some(hit.join(ORT_LIB_NAME))
        );
        assert_eq!(find_ort_dylib(&[empty]), None);
    }
}
