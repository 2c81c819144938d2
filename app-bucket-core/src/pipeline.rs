//! # pipeline: content steps shared by the artifact and ingestion reconcilers
//!
//! - [`download_to_scratch`] streams an object into a scratch file while
//!   hashing it, one chunk at a time, checking for cancellation in between.
//! - [`publish_icons`] uploads normalized icons under deterministic keys.
//! - [`finalize_icons`] deletes the icon objects an artifact owns.
//!
//! Scratch files are [`tempfile`] handles owned by the caller and removed when
//! dropped, on success, error and cancellation alike.

use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::put_object;
use crate::contract::ObjectStore;
use crate::error::StoreError;
use crate::icons::{icon_key, NormalizedIcon};
use crate::records::{ArtifactRecord, IconEntry};

const CHUNK: usize = 64 * 1024;

/// A failed download step. `reason` becomes the Condition reason.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("{reason}: {message}")]
    Step {
        reason: &'static str,
        message: String,
    },
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    fn step(reason: &'static str, e: impl std::fmt::Display) -> Self {
        DownloadError::Step {
            reason,
            message: e.to_string(),
        }
    }
}

/// A downloaded object and its content digest. The file is deleted on drop.
#[derive(Debug)]
pub struct ScratchCopy {
    file: NamedTempFile,
    /// `sha256:<hex>` of the downloaded bytes.
    pub digest: String,
    pub size: u64,
}

impl ScratchCopy {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Streams `key` into a new file under `scratch_dir`, hashing as it goes.
pub async fn download_to_scratch(
    store: &dyn ObjectStore,
    key: &str,
    scratch_dir: &Path,
    extension: &str,
    cancel: &CancellationToken,
) -> Result<ScratchCopy, DownloadError> {
    let mut reader = store
        .read(key)
        .await
        .map_err(|e| DownloadError::step("ReadObject", e))?;

    tokio::fs::create_dir_all(scratch_dir)
        .await
        .map_err(|e| DownloadError::step("CreateTemp", e))?;
    let file = tempfile::Builder::new()
        .prefix("download-")
        .suffix(&format!(".{extension}"))
        .tempfile_in(scratch_dir)
        .map_err(|e| DownloadError::step("CreateTemp", e))?;
    let handle = file
        .reopen()
        .map_err(|e| DownloadError::step("CreateTemp", e))?;
    let mut out = tokio::fs::File::from_std(handle);

    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DownloadError::step("CopyObject", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])
            .await
            .map_err(|e| DownloadError::step("WriteTemp", e))?;
        size += n as u64;
    }
    drop(reader);

    out.flush()
        .await
        .map_err(|e| DownloadError::step("CloseTemp", e))?;
    out.sync_all()
        .await
        .map_err(|e| DownloadError::step("CloseTemp", e))?;

    let on_disk = out
        .metadata()
        .await
        .map_err(|e| DownloadError::step("SumTemp", e))?
        .len();
    if on_disk != size {
        return Err(DownloadError::step(
            "SumTemp",
            format!("hashed {size} bytes but scratch file holds {on_disk}"),
        ));
    }

    let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
    debug!(key = %key, digest = %digest, size, "downloaded to scratch");
    Ok(ScratchCopy { file, digest, size })
}

/// Uploads `icons` for `artifact` and returns one entry per icon, in order.
pub async fn publish_icons(
    store: &dyn ObjectStore,
    artifact: &ArtifactRecord,
    icons: &[NormalizedIcon],
) -> Result<Vec<IconEntry>, StoreError> {
    let mut entries = Vec::with_capacity(icons.len());
    for icon in icons {
        let key = icon_key(&artifact.spec.key, &artifact.metadata, &icon.source, icon.size);
        put_object(store, &key, "image/png", &icon.png).await?;
        debug!(key = %key, size = icon.size, "icon published");
        entries.push(IconEntry {
            key,
            size: icon.size,
            display: false,
            full_size: false,
        });
    }
    Ok(entries)
}

/// Deletes every icon object the artifact owns. Override objects belong to
/// whoever supplied them and are left alone. Already-absent objects count as
/// deleted; the first other failure stops the pass.
pub async fn finalize_icons(store: &dyn ObjectStore, artifact: &ArtifactRecord) -> Result<(), StoreError> {
    for entry in &artifact.status.icons {
        if artifact.spec.icons.contains_key(&entry.key) {
            continue;
        }
        match store.delete(&entry.key).await {
            Ok(()) => info!(key = %entry.key, "icon deleted"),
            Err(e) if e.is_not_found() => debug!(key = %entry.key, "icon already absent"),
            Err(e) => {
                warn!(key = %entry.key, error = ?e, "icon delete failed");
                return Err(e);
            }
        }
    }
    Ok(())
}
