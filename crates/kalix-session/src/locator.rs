//! Finds the engine executable.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::SessionError;

#[cfg(windows)]
pub const ENGINE_BINARY_NAME: &str = "kalixcli.exe";
#[cfg(not(windows))]
pub const ENGINE_BINARY_NAME: &str = "kalixcli";

/// Resolves the engine from `override_path` or, when unset, from `PATH`.
pub fn locate_engine(override_path: Option<&Path>) -> Result<PathBuf, SessionError> {
    let search_path = std::env::var_os("PATH");
    locate_engine_in(override_path, search_path.as_deref())
}

/// A configured override is used exclusively; a bad override never falls
/// back to the search path.
pub fn locate_engine_in(
    override_path: Option<&Path>,
    search_path: Option<&OsStr>,
) -> Result<PathBuf, SessionError> {
    if let Some(path) = override_path {
        if !path.exists() {
            return Err(SessionError::EngineNotFound(format!(
                "configured engine path {} does not exist",
                path.display()
            )));
        }
        if !is_executable(path) {
            return Err(SessionError::EngineNotFound(format!(
                "configured engine path {} is not an executable file",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }

    let Some(search_path) = search_path else {
        return Err(SessionError::EngineNotFound(format!(
            "{ENGINE_BINARY_NAME} not found: PATH is not set"
        )));
    };
    let mut searched = 0usize;
    for directory in std::env::split_paths(search_path) {
        if directory.as_os_str().is_empty() {
            continue;
        }
        searched += 1;
        let candidate = directory.join(ENGINE_BINARY_NAME);
        if is_executable(&candidate) {
            tracing::debug!(engine = %candidate.display(), "located engine on PATH");
            return Ok(candidate);
        }
    }
    Err(SessionError::EngineNotFound(format!(
        "{ENGINE_BINARY_NAME} not found in {searched} PATH director{}",
        if searched == 1 { "y" } else { "ies" }
    )))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
