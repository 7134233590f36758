//! File transfer building blocks: offer validation and the receive sink.
//!
//! The chunking send loop lives in the channel (it needs the sealed
//! writer); this module owns everything filesystem-facing.

use crate::error::{Error, Result};
use crate::protocol::FileMetadata;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Fixed chunk size for file content frames (4 KiB).
pub const CHUNK_SIZE: usize = 4 * 1024;

/// Validate a file for offering and build its metadata.
///
/// Fails with [`Error::OfferFailed`] when the file is unreadable, not a
/// regular file, or larger than `max_file_bytes`.
pub async fn prepare_offer(path: &Path, max_file_bytes: u64) -> Result<FileMetadata> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::OfferFailed(format!("could not open file: {e}")))?;

    if !meta.is_file() {
        return Err(Error::OfferFailed("not a regular file".into()));
    }

    if meta.len() > max_file_bytes {
        return Err(Error::OfferFailed(format!(
            "file size ({:.2} MB) exceeds the limit ({:.2} MB)",
            meta.len() as f64 / 1024.0 / 1024.0,
            max_file_bytes as f64 / 1024.0 / 1024.0,
        )));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::OfferFailed("path has no file name".into()))?;

    Ok(FileMetadata {
        file_name,
        file_size: meta.len() as i64,
        original_path: Some(path.to_string_lossy().into_owned()),
        sender_id: None,
    })
}

/// Reduce a peer-supplied file name to a bare base name.
///
/// Embedded separators and parent references never reach the filesystem;
/// a name that reduces to nothing becomes `download`.
pub fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| n != "..")
        .unwrap_or_else(|| "download".to_string())
}

/// An open receive sink for one incoming file.
pub struct IncomingFile {
    file: File,
    /// Where the file is being written.
    pub path: PathBuf,
    /// Bytes appended so far.
    pub received: u64,
    /// Expected total from the offer metadata.
    pub total: u64,
}

impl IncomingFile {
    /// Create the destination file under `download_dir` at the sanitized
    /// base name of the offered file.
    pub async fn create(download_dir: &Path, metadata: &FileMetadata) -> Result<Self> {
        let path = download_dir.join(sanitize_file_name(&metadata.file_name));
        let file = File::create(&path)
            .await
            .map_err(|e| Error::OfferFailed(format!("could not create file: {e}")))?;

        Ok(Self {
            file,
            path,
            received: 0,
            total: metadata.file_size.max(0) as u64,
        })
    }

    /// Append one chunk.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.received += chunk.len() as u64;
        Ok(())
    }

    /// Fraction received in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.received as f64 / self.total as f64).min(1.0)
        }
    }

    /// Flush and close the sink.
    pub async fn finish(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        Ok(self.path)
    }
}
