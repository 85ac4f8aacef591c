use crate::error::{SandboxError, SandboxResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::{DirEntry, WalkDir};

/// Everything one sandboxed execution needs: the generated files that go
/// into the context archive plus the command and environment the unit runs.
///
/// The caller decides policy (which runner, which bootstrap); this crate
/// only packages and executes it.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Archive-relative path of the test source, e.g. "tests/test_login.py"
    pub test_path: String,
    /// The generated test source text
    pub test_source: String,
    /// Archive-relative path of the entrypoint script
    pub entrypoint_path: String,
    /// Entrypoint script performing ecosystem bootstrap before the runner
    pub entrypoint: String,
    /// Archive-relative path of the dependency manifest
    pub manifest_path: String,
    /// Dependency manifest content
    pub manifest: String,
    /// Command the unit executes, e.g. ["python", "/app/run_tests.py"]
    pub command: Vec<String>,
    /// Environment variables pinned inside the unit
    pub env: Vec<(String, String)>,
}

/// Directories never shipped into the sandbox
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".tox",
    "venv",
    ".venv",
    "env",
    "node_modules",
    ".testforge",
];

/// Bytecode artifacts never shipped into the sandbox
const EXCLUDED_EXTENSIONS: &[&str] = &["pyc", "pyo", "pyd"];

fn is_shippable(entry: &DirEntry) -> bool {
    // The project root itself is always traversed, whatever it is named.
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !(entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()))
}

fn has_excluded_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXCLUDED_EXTENSIONS.contains(&ext))
}

fn append_generated(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    content: &str,
    mode: u32,
) -> SandboxResult<()> {
    let bytes = content.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(mode);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    header.set_cksum();
    builder
        .append_data(&mut header, Path::new("app").join(path), bytes)
        .map_err(|e| SandboxError::ArchiveFailed {
            reason: format!("failed to add '{}': {}", path, e),
        })
}

/// Build the uncompressed context tar injected into the unit.
///
/// Entries are rooted under `app/` so injection at `/` lands the test
/// source, entrypoint, manifest, and the filtered project snapshot in the
/// unit's working directory.
pub fn build_context_tar(project: &Path, plan: &ExecutionPlan) -> SandboxResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    append_generated(&mut builder, &plan.test_path, &plan.test_source, 0o644)?;
    append_generated(&mut builder, &plan.entrypoint_path, &plan.entrypoint, 0o755)?;
    append_generated(&mut builder, &plan.manifest_path, &plan.manifest, 0o644)?;

    for entry in WalkDir::new(project).into_iter().filter_entry(is_shippable) {
        let entry = entry.map_err(|e| SandboxError::ArchiveFailed {
            reason: format!("failed to walk project tree: {}", e),
        })?;
        if !entry.file_type().is_file() || has_excluded_extension(entry.path()) {
            continue;
        }
        // Unreadable files are skipped rather than failing the whole
        // snapshot, matching how partial project trees are tolerated.
        let relative = match entry.path().strip_prefix(project) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if let Err(e) = builder.append_path_with_name(entry.path(), Path::new("app").join(relative))
        {
            tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable project file");
        }
    }

    builder
        .into_inner()
        .map_err(|e| SandboxError::ArchiveFailed {
            reason: e.to_string(),
        })
}

/// Gzip a tar archive for on-disk inspection
pub fn compress_archive(tar_bytes: &[u8]) -> SandboxResult<Vec<u8>> {
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(tar_bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| SandboxError::ArchiveFailed {
            reason: e.to_string(),
        })
}
