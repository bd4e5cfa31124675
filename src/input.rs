//! Loading a document from disk.
//!
//! The pipeline works on byte buffers; this is the only place that touches
//! the file system. No content check happens here: a file that is not a PDF
//! is reported by the engine as `PdfFormat` when it is opened.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A file read into memory.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    /// Final path component, used to label logs and error records.
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub async fn read_file(path: impl AsRef<Path>) -> Result<LoadedFile, InputError> {
    let path = path.as_ref().to_path_buf();
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => InputError::NotFound { path: path.clone() },
        std::io::ErrorKind::PermissionDenied => InputError::PermissionDenied { path: path.clone() },
        _ => InputError::Read {
            path: path.clone(),
            source: e,
        },
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    debug!("Read {} ({} bytes)", path.display(), bytes.len());

    Ok(LoadedFile {
        path,
        file_name,
        bytes,
    })
}
