//! Charm bundles: gzip-compressed tar archives of the charm tree.

use std::io::Read;
use std::path::{Component, Path};

use sha2::{Digest, Sha256};

use crate::error::{CharmError, Result};
use crate::VERSION_CONTROL_DIR;

/// A regular file read from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    /// Path relative to the charm root, `/`-separated.
    pub path: String,
    /// Whether any execute bit is set.
    pub executable: bool,
    /// File contents.
    pub data: Vec<u8>,
}

/// Read every regular file from a `.tar.gz` bundle.
///
/// Directory entries are implied by file paths and skipped. Links and other
/// special entries are skipped with a warning.
///
/// # Errors
///
/// Returns `CharmError::InvalidBundle` if the archive is malformed or an
/// entry escapes the charm root.
pub fn read_bundle(bytes: &[u8]) -> Result<Vec<BundleFile>> {
    let invalid = |e: std::io::Error| CharmError::InvalidBundle(e.to_string());

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
    let mut files = Vec::new();
    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }
        let raw_path = entry.path().map_err(invalid)?.into_owned();
        if !entry_type.is_file() {
            tracing::warn!(path = %raw_path.display(), "Skipping non-regular bundle entry");
            continue;
        }
        let path = normalize(&raw_path)?;
        let executable = entry.header().mode().map_err(invalid)? & 0o111 != 0;
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(invalid)?;
        files.push(BundleFile {
            path,
            executable,
            data,
        });
    }
    Ok(files)
}

fn normalize(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    CharmError::InvalidBundle(format!("non-UTF-8 path {}", path.display()))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(CharmError::InvalidBundle(format!(
                    "path {} escapes the charm root",
                    path.display()
                )))
            }
        }
    }
    match parts.first() {
        None => Err(CharmError::InvalidBundle("empty path".into())),
        Some(&first) if first == VERSION_CONTROL_DIR => Err(CharmError::InvalidBundle(format!(
            "path {} is reserved",
            path.display()
        ))),
        Some(_) => Ok(parts.join("/")),
    }
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check `bytes` against the published digest.
///
/// # Errors
///
/// Returns `CharmError::HashMismatch` if the digests differ.
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CharmError::HashMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Builds `.tar.gz` bundles in memory.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default, Clone)]
pub struct BundleBuilder {
    files: Vec<BundleFile>,
}

#[cfg(any(test, feature = "test-utils"))]
impl BundleBuilder {
    /// Start an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular file.
    #[must_use]
    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push(BundleFile {
            path: path.to_string(),
            executable: false,
            data: data.into(),
        });
        self
    }

    /// Add an executable file.
    #[must_use]
    pub fn executable(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push(BundleFile {
            path: path.to_string(),
            executable: true,
            data: data.into(),
        });
        self
    }

    /// Encode the bundle.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory archive cannot be written.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            for file in &self.files {
                let mut header = tar::Header::new_gnu();
                header.set_size(file.data.len() as u64);
                header.set_mode(if file.executable { 0o755 } else { 0o644 });
                header.set_cksum();
                builder
                    .append_data(&mut header, &file.path, file.data.as_slice())
                    .expect("append bundle entry");
            }
            builder.finish().expect("finish bundle");
        }
        encoder.finish().expect("finish gzip")
    }
}
