//! Project-root path constraints and program resolution

use std::path::{Component, Path, PathBuf};

use crate::{DapError, Result};

/// Directory every debugger-visible path must live under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoot {
    root: PathBuf,
}

impl ProjectRoot {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            DapError::InvalidArgument(format!("project root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the root and reject anything outside it
    ///
    /// Relative paths are taken relative to the root. `..` components and
    /// symlinks in the existing part of the path are resolved before the
    /// check, so neither can escape the root. The path itself need not exist.
    pub fn constrain(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = canonicalize_existing(&normalize(&joined));

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            log::warn!("Rejected path outside project root: {}", path.display());
            Err(DapError::PathConstraintViolation {
                path: path.to_path_buf(),
                root: self.root.clone(),
            })
        }
    }
}

/// Remove `.` and `..` components without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Canonicalize the longest existing ancestor and re-attach the rest
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn contains_file_with_extension(dir: &Path, extensions: &[&str]) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.contains(&e))
            .unwrap_or(false)
    })
}

/// Nearest ancestor of `start` that looks like a .NET project root
///
/// Solution files win over project files, project files over a git checkout.
/// Falls back to `start` itself.
pub fn find_project_root(start: &Path) -> PathBuf {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());

    if let Some(found) = start
        .ancestors()
        .find(|dir| contains_file_with_extension(dir, &["sln"]))
    {
        return found.to_path_buf();
    }
    if let Some(found) = start
        .ancestors()
        .find(|dir| contains_file_with_extension(dir, &["csproj", "vbproj", "fsproj"]))
    {
        return found.to_path_buf();
    }
    if let Some(found) = start.ancestors().find(|dir| dir.join(".git").exists()) {
        return found.to_path_buf();
    }
    start
}

/// `<base>.runtimeconfig.json` next to a program
pub fn runtime_config_path(program: &Path) -> PathBuf {
    program.with_extension("runtimeconfig.json")
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Swap a native apphost launcher for its managed `.dll`
///
/// Debugging the apphost makes the runtime load the app twice, so when
/// `<base>.dll` and `<base>.runtimeconfig.json` both sit next to an `.exe`
/// (or extension-less) launcher, the `.dll` is used instead.
pub fn resolve_managed_module(program: &Path) -> PathBuf {
    let is_launcher = program.extension().is_none() || has_extension(program, "exe");
    if !is_launcher {
        return program.to_path_buf();
    }

    let dll = program.with_extension("dll");
    if dll.is_file() && runtime_config_path(program).is_file() {
        log::info!(
            "Resolved launcher {} to managed module {}",
            program.display(),
            dll.display()
        );
        return dll;
    }
    program.to_path_buf()
}

/// Check that a resolved program exists and is a .NET assembly
pub fn validate_program(program: &Path) -> Result<()> {
    if !program.is_file() {
        return Err(DapError::ProgramNotFound(program.to_path_buf()));
    }
    if has_extension(program, "dll") || has_extension(program, "exe") {
        return Ok(());
    }
    Err(DapError::InvalidArgument(format!(
        "Program must be a .NET assembly (.dll or .exe), or a launcher with a matching .dll: {}",
        program.display()
    )))
}
