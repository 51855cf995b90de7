//! Resolution of authorization policy path patterns.
//!
//! A pattern is `dir/regex`: the last path segment is a regular expression
//! matched against whole file names in `dir`. A pattern that names an
//! existing file is taken as is.

use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to list policies in {dir}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Policy files handed to the authorization engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    /// Files on disk, in pattern order and sorted within a pattern.
    pub files: Vec<PathBuf>,
    /// Patterns whose directory does not exist. The engine may still know
    /// them by name.
    pub unresolved: Vec<String>,
}

impl PolicySet {
    pub fn resolve(patterns: &[String]) -> Result<Self, PolicyError> {
        let mut set = Self::default();
        for pattern in patterns {
            set.resolve_one(pattern)?;
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.unresolved.is_empty()
    }

    fn resolve_one(&mut self, pattern: &str) -> Result<(), PolicyError> {
        let as_path = Path::new(pattern);
        if as_path.is_file() {
            self.push(as_path.to_path_buf());
            return Ok(());
        }

        let (dir, file_pattern) = match pattern.rsplit_once('/') {
            Some((dir, file)) => (PathBuf::from(if dir.is_empty() { "/" } else { dir }), file),
            None => (PathBuf::from("."), pattern),
        };
        let matcher = Regex::new(&format!("^(?:{file_pattern})$")).map_err(|source| {
            PolicyError::Pattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;

        if !dir.is_dir() {
            tracing::warn!(pattern = %pattern, dir = %dir.display(), "Policy directory not found");
            self.unresolved.push(pattern.to_string());
            return Ok(());
        }

        let entries = std::fs::read_dir(&dir).map_err(|source| PolicyError::Io {
            dir: dir.clone(),
            source,
        })?;
        let mut matched = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PolicyError::Io {
                dir: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let name = entry.file_name();
            if path.is_file() && matcher.is_match(&name.to_string_lossy()) {
                matched.push(path);
            }
        }
        matched.sort();

        if matched.is_empty() {
            tracing::debug!(pattern = %pattern, "Policy pattern matched no files");
        }
        for path in matched {
            self.push(path);
        }
        Ok(())
    }

    fn push(&mut self, path: PathBuf) {
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }
}
