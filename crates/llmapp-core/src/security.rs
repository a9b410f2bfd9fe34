//! Secret handling and filesystem path safety.
//!
//! Provides a [`SecretString`] wrapper for access tokens and database URIs
//! that zeroizes memory on drop, and the path checks applied to file names
//! received from the hub before anything is written to disk.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use zeroize::Zeroize;

/// A string that zeroizes its contents when dropped.
///
/// Used for hub tokens, catalog tokens and database URIs (which carry
/// passwords). Never prints the secret in Debug/Display.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Expose the secret value. Only for transmitting it to the service it
    /// belongs to.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        constant_time_compare(&self.0, &other.0)
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl serde::Serialize for SecretString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for SecretString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString)
    }
}

/// Constant-time string comparison.
///
/// Iterates over the longer input even when lengths differ so the expected
/// length does not leak through timing.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let len = a.len().max(b.len());
    let mut result = (a.len() != b.len()) as u8;

    for i in 0..len {
        let x = if i < a.len() { a[i] } else { 0 };
        let y = if i < b.len() { b[i] } else { 0 };
        result |= x ^ y;
    }

    result == 0
}

/// Error types for path validation
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityError {
    /// Path would escape the directory it is resolved against
    PathTraversal { path: String },
    /// Working directory could not be created or resolved
    InvalidWorkdir { path: String, reason: String },
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::PathTraversal { path } => {
                write!(f, "Refusing unsafe file path '{}'", path)
            }
            SecurityError::InvalidWorkdir { path, reason } => {
                write!(f, "Invalid workdir '{}': {}", path, reason)
            }
        }
    }
}

impl std::error::Error for SecurityError {}

pub type SecurityResult<T> = Result<T, SecurityError>;

/// Check whether a repository-relative file name is unsafe to write locally.
///
/// Rejects empty names, absolute paths, `..` components, Windows prefixes
/// and NUL bytes.
pub fn is_suspicious_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') || path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Join a repository-relative file name onto `dir`, refusing traversal.
pub fn resolve_in_dir(dir: &Path, relative: &str) -> SecurityResult<PathBuf> {
    if is_suspicious_path(relative) {
        return Err(SecurityError::PathTraversal {
            path: relative.to_string(),
        });
    }
    Ok(dir.join(relative))
}

/// Create (if needed) and canonicalize a working directory.
pub fn prepare_workdir(path: &Path) -> SecurityResult<PathBuf> {
    std::fs::create_dir_all(path).map_err(|e| SecurityError::InvalidWorkdir {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    path.canonicalize()
        .map_err(|e| SecurityError::InvalidWorkdir {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
