//! Names shown for the origin of a series.

use std::path::{Path, PathBuf};

/// Anything a series can come from.
pub trait DataSource {
    fn display_name(&self) -> String;
}

/// A model run on an engine session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSource {
    pub session_key: String,
    pub run_name: Option<String>,
}

impl RunSource {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            run_name: None,
        }
    }

    pub fn named(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }
}

impl DataSource for RunSource {
    fn display_name(&self) -> String {
        match self.run_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.session_key.clone(),
        }
    }
}

/// A series loaded from a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for FileSource {
    fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// `"<series> (<source>)"`, the label used when listing fetched series.
pub fn series_label(source: &dyn DataSource, series_name: &str) -> String {
    format!("{series_name} ({})", source.display_name())
}
