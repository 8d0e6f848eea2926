//! Runtime / dbgshim version compatibility
//!
//! The adapter loads `dbgshim` from its own directory. When its major version
//! differs from the runtime the debuggee targets, stack walking fails inside
//! the runtime (`E_NOINTERFACE`), so a mismatch is reported up front as an
//! advisory next to the launch result.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::paths::runtime_config_path;

pub const DBGSHIM_VERSION_MISMATCH: &str = "dbgshim_version_mismatch";

const DBGSHIM_NAMES: [&str; 3] = ["dbgshim.dll", "libdbgshim.so", "libdbgshim.dylib"];
const NETCORE_APP: &str = "Microsoft.NETCore.App";

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:\.(\d+))?").expect("must compile"))
}

fn marker_regex() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| BytesRegex::new(r"@\(#\)Version (\d+\.\d+\.\d+(?:\.\d+)?)").expect("must compile"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<u32>,
}

impl VersionInfo {
    /// Parse `major.minor.patch[.build]` at the start of `text`
    pub fn parse(text: &str) -> Option<Self> {
        let captures = version_regex().captures(text.trim())?;
        let number = |i: usize| captures.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        Some(VersionInfo {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            build: number(4),
        })
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = self.build {
            write!(f, ".{}", build)?;
        }
        Ok(())
    }
}

/// Advisory attached to a successful launch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompatibilityAdvisory {
    pub kind: String,
    pub expected: String,
    pub found: String,
    pub hint: String,
}

/// Runtime version the program was built against, from its runtimeconfig
pub fn target_runtime_version(program: &Path) -> Option<VersionInfo> {
    let config_path = runtime_config_path(program);
    let text = match std::fs::read_to_string(&config_path) {
        Ok(text) => text,
        Err(_) => {
            log::debug!("No runtimeconfig found at {}", config_path.display());
            return None;
        }
    };
    let config: Value = match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Failed to parse {}: {}", config_path.display(), e);
            return None;
        }
    };

    let options = config.get("runtimeOptions")?;
    let single = options
        .pointer("/framework/version")
        .and_then(Value::as_str);
    let version = single.or_else(|| {
        let frameworks = options.get("frameworks")?.as_array()?;
        frameworks
            .iter()
            .find(|fw| fw.get("name").and_then(Value::as_str) == Some(NETCORE_APP))
            .or_else(|| frameworks.first())
            .and_then(|fw| fw.get("version"))
            .and_then(Value::as_str)
    })?;

    let parsed = VersionInfo::parse(version);
    log::debug!("Target runtime version: {:?}", parsed);
    parsed
}

/// Adapter executable as launched: a bare name is looked up on `PATH`
///
/// Symlinks are followed, since dbgshim sits next to the real binary.
pub fn resolve_adapter(adapter_path: &Path) -> Option<PathBuf> {
    locate_adapter(adapter_path, std::env::var_os("PATH"))
}

fn locate_adapter(adapter_path: &Path, search_path: Option<OsString>) -> Option<PathBuf> {
    let found = if adapter_path.exists() {
        adapter_path.to_path_buf()
    } else {
        let cwd = std::env::current_dir().ok()?;
        match which::which_in(adapter_path, search_path, cwd) {
            Ok(found) => found,
            Err(e) => {
                log::debug!("Adapter {} not found on PATH: {}", adapter_path.display(), e);
                return None;
            }
        }
    };
    Some(found.canonicalize().unwrap_or(found))
}

/// `dbgshim` library shipped next to the adapter executable
pub fn dbgshim_path(adapter_path: &Path) -> Option<PathBuf> {
    let dir = adapter_path.parent()?;
    DBGSHIM_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Version of an auxiliary runtime library
///
/// Reads the `@(#)Version` marker the runtime build embeds in its binaries,
/// then falls back to the nearest version-looking path component
/// (e.g. `shared/Microsoft.NETCore.App/6.0.36/libdbgshim.so`).
pub fn aux_library_version(path: &Path) -> Option<VersionInfo> {
    if let Ok(bytes) = std::fs::read(path) {
        let embedded = marker_regex()
            .captures(&bytes)
            .and_then(|c| c.get(1))
            .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
            .and_then(VersionInfo::parse);
        if embedded.is_some() {
            return embedded;
        }
    }

    path.components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(VersionInfo::parse)
}

/// Compare major versions; no advisory when they match
pub fn check_compatibility(aux: &VersionInfo, target: &VersionInfo) -> Option<CompatibilityAdvisory> {
    if aux.major == target.major {
        return None;
    }
    Some(CompatibilityAdvisory {
        kind: DBGSHIM_VERSION_MISMATCH.to_string(),
        expected: format!("{}.x", target.major),
        found: aux.to_string(),
        hint: format!(
            "dbgshim is v{}.x but the program targets .NET {}; stack traces may fail with \
             E_NOINTERFACE (0x80004002). Copy dbgshim from the .NET {} runtime \
             (shared/{}/{}.x.x) next to the debug adapter.",
            aux.major, target.major, target.major, NETCORE_APP, target.major
        ),
    })
}

/// Full check for a program about to be launched with `adapter_path`
///
/// Missing information on either side yields no advisory.
pub fn check_program(adapter_path: &Path, program: &Path) -> Option<CompatibilityAdvisory> {
    let target = target_runtime_version(program)?;
    let shim = dbgshim_path(&resolve_adapter(adapter_path)?)?;
    let aux = aux_library_version(&shim)?;
    let advisory = check_compatibility(&aux, &target);
    if let Some(advisory) = &advisory {
        log::warn!("{}", advisory.hint);
    }
    advisory
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_versions() {
        assert_eq!(
            VersionInfo::parse("6.0.36"),
            Some(VersionInfo { major: 6, minor: 0, patch: 36, build: None })
        );
        assert_eq!(VersionInfo::parse("9.0.13.2701").unwrap().build, Some(2701));
        assert_eq!(VersionInfo::parse("8.0.0-preview.1").unwrap().major, 8);
        assert_eq!(VersionInfo::parse("net8.0"), None);
        assert_eq!(VersionInfo::parse(""), None);
    }

    #[test]
    fn test_target_version_single_framework() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("App.runtimeconfig.json"),
            r#"{"runtimeOptions":{"tfm":"net8.0","framework":{"name":"Microsoft.NETCore.App","version":"8.0.2"}}}"#,
        )
        .unwrap();

        let version = target_runtime_version(&dir.path().join("App.dll")).unwrap();
        assert_eq!(version.to_string(), "8.0.2");
    }

    #[test]
    fn test_target_version_prefers_netcore_framework() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("App.runtimeconfig.json"),
            r#"{"runtimeOptions":{"frameworks":[
                {"name":"Microsoft.WindowsDesktop.App","version":"7.0.1"},
                {"name":"Microsoft.NETCore.App","version":"6.0.5"}
            ]}}"#,
        )
        .unwrap();

        let version = target_runtime_version(&dir.path().join("App.dll")).unwrap();
        assert_eq!(version.major, 6);
    }

    #[test]
    fn test_target_version_missing_config() {
        let dir = TempDir::new().unwrap();
        assert_eq!(target_runtime_version(&dir.path().join("App.dll")), None);
    }

    #[test]
    fn test_aux_version_from_embedded_marker() {
        let dir = TempDir::new().unwrap();
        let shim = dir.path().join("libdbgshim.so");
        let mut bytes = vec![0u8; 64];
        bytes.extend_from_slice(b"@(#)Version 7.0.1423.51910 @Commit: abc");
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&shim, bytes).unwrap();

        let version = aux_library_version(&shim).unwrap();
        assert_eq!(version.major, 7);
        assert_eq!(version.build, Some(51910));
    }

    #[test]
    fn test_aux_version_from_path() {
        let dir = TempDir::new().unwrap();
        let versioned = dir.path().join("Microsoft.NETCore.App").join("6.0.36");
        fs::create_dir_all(&versioned).unwrap();
        let shim = versioned.join("dbgshim.dll");
        fs::write(&shim, b"no marker").unwrap();

        assert_eq!(aux_library_version(&shim).unwrap().to_string(), "6.0.36");
    }

    #[test]
    fn test_mismatch_produces_advisory() {
        let aux = VersionInfo::parse("6.0.36").unwrap();
        let target = VersionInfo::parse("8.0.2").unwrap();

        let advisory = check_compatibility(&aux, &target).unwrap();
        assert_eq!(advisory.kind, DBGSHIM_VERSION_MISMATCH);
        assert_eq!(advisory.expected, "8.x");
        assert_eq!(advisory.found, "6.0.36");

        let same = VersionInfo::parse("8.0.11").unwrap();
        assert_eq!(check_compatibility(&same, &target), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_bare_adapter_name_resolved_on_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let adapter = dir.path().join("netcoredbg-under-test");
        fs::write(&adapter, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&adapter, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("libdbgshim.so"), b"@(#)Version 6.0.1.2 ").unwrap();

        let found = locate_adapter(
            Path::new("netcoredbg-under-test"),
            Some(dir.path().as_os_str().to_owned()),
        )
        .unwrap();
        assert_eq!(found, adapter.canonicalize().unwrap());
        assert_eq!(
            dbgshim_path(&found),
            Some(found.parent().unwrap().join("libdbgshim.so"))
        );

        let elsewhere = TempDir::new().unwrap();
        assert_eq!(
            locate_adapter(
                Path::new("netcoredbg-under-test"),
                Some(elsewhere.path().as_os_str().to_owned())
            ),
            None
        );
    }

    #[test]
    fn test_check_program_end_to_end() {
        let dir = TempDir::new().unwrap();
        let adapter = dir.path().join("netcoredbg");
        fs::write(&adapter, b"").unwrap();
        fs::write(dir.path().join("libdbgshim.so"), b"@(#)Version 6.0.1.2 ").unwrap();
        fs::write(
            dir.path().join("App.runtimeconfig.json"),
            r#"{"runtimeOptions":{"framework":{"version":"9.0.0"}}}"#,
        )
        .unwrap();

        let advisory = check_program(&adapter, &dir.path().join("App.dll")).unwrap();
        assert_eq!(advisory.expected, "9.x");
        assert!(check_program(&adapter, &dir.path().join("Other.dll")).is_none());
    }
}
