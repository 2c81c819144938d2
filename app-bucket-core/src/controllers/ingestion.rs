//! Explodes an uploaded gzip-tar bundle into artifact records.
//!
//! `.apk` and `.ipa` entries are copied verbatim into the bucket and each gets
//! a child artifact owned by the ingestion. PNG entries whose names contain
//! `full` or `display` are re-encoded and handed to every child as icon
//! overrides, so the children never auto-select those roles.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Action, Reconcile, Settings};
use crate::blob::put_object;
use crate::conditions::set_condition;
use crate::contract::{create_or_patch, ObjectStore, Records};
use crate::error::{ReconcileError, StoreError};
use crate::gateway::StorageGateway;
use crate::icons::reencode_png;
use crate::pipeline::{download_to_scratch, DownloadError};
use crate::records::{
    ArtifactRecord, ArtifactSpec, ArtifactStatus, BucketRecord, IconOverrides, IconRef,
    IngestionRecord, ObjectKey, ObjectMeta, OwnerRef, PackageKind, Phase, Record,
};

pub const CONDITION_INGESTED: &str = "Ingested";

pub struct IngestionReconciler {
    ingestions: Arc<dyn Records<IngestionRecord>>,
    artifacts: Arc<dyn Records<ArtifactRecord>>,
    buckets: Arc<dyn Records<BucketRecord>>,
    gateway: Arc<StorageGateway>,
    settings: Settings,
}

impl IngestionReconciler {
    pub fn new(
        ingestions: Arc<dyn Records<IngestionRecord>>,
        artifacts: Arc<dyn Records<ArtifactRecord>>,
        buckets: Arc<dyn Records<BucketRecord>>,
        gateway: Arc<StorageGateway>,
        settings: Settings,
    ) -> Self {
        Self {
            ingestions,
            artifacts,
            buckets,
            gateway,
            settings,
        }
    }

    async fn fail(
        &self,
        mut ingestion: IngestionRecord,
        reason: &str,
        message: String,
    ) -> Result<Action, ReconcileError> {
        error!(
            ingestion = %ingestion.key(),
            reason = %reason,
            message = %message,
            "[INGEST][ERROR] bundle rejected"
        );
        let mut changed = set_condition(&mut ingestion, CONDITION_INGESTED, false, reason, message);
        if ingestion.status.phase != Phase::Failed {
            ingestion.status.phase = Phase::Failed;
            changed = true;
        }
        if changed {
            self.ingestions.update_status(&ingestion).await?;
        }
        Ok(Action::await_change())
    }
}

/// A package found in the bundle, spooled to local disk.
#[derive(Debug)]
struct BundledPackage {
    kind: PackageKind,
    /// Path inside the bundle, see [`bundle_path`].
    entry: String,
    path: PathBuf,
}

/// A re-encoded override image.
#[derive(Debug)]
struct BundledImage {
    entry: String,
    size: u32,
    png: Vec<u8>,
}

#[derive(Debug, Default)]
struct Bundle {
    packages: Vec<BundledPackage>,
    display: Option<BundledImage>,
    full_size: Option<BundledImage>,
}

#[derive(Debug, thiserror::Error)]
enum BundleError {
    #[error("read bundle: {0}")]
    Read(#[from] io::Error),
    #[error("decode {name}: {source}")]
    Image {
        name: String,
        #[source]
        source: image::ImageError,
    },
}

impl BundleError {
    fn reason(&self) -> &'static str {
        match self {
            BundleError::Read(_) => "ReadBundle",
            BundleError::Image { .. } => "DecodeImage",
        }
    }
}

/// Hidden files and resource forks, including anything under `__MACOSX`.
fn is_hidden(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.starts_with('.') || part == "__MACOSX"
        }
        _ => false,
    })
}

/// `path` with only its normal components, the file name lower-cased.
/// `..`, `.` and root components are dropped so a key never escapes the
/// ingestion's prefix.
fn bundle_path(path: &Path, file_name: &str) -> String {
    let mut parts: Vec<String> = path
        .parent()
        .into_iter()
        .flat_map(|p| p.components())
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.push(file_name.to_string());
    parts.join("/")
}

/// Classifies every entry of the gzip-tar at `bundle`, spooling packages into `spool`.
fn read_bundle(bundle: &Path, spool: &Path) -> Result<Bundle, BundleError> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(bundle)?));
    let mut out = Bundle::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        if is_hidden(&path) {
            debug!(entry = %path.display(), "skipping hidden bundle entry");
            continue;
        }
        let Some(file_name) = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
        else {
            continue;
        };
        let ext = Path::new(&file_name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        let entry_path = bundle_path(&path, &file_name);

        if let Some(kind) = PackageKind::from_extension(&ext) {
            if out.packages.iter().any(|p| p.entry == entry_path) {
                warn!(entry = %entry_path, "skipping repeated bundle entry");
                continue;
            }
            let spooled = spool.join(format!("{}-{}", out.packages.len(), file_name));
            let mut file = File::create(&spooled)?;
            io::copy(&mut entry, &mut file)?;
            out.packages.push(BundledPackage {
                kind,
                entry: entry_path,
                path: spooled,
            });
        } else if ext == "png" && (file_name.contains("full") || file_name.contains("display")) {
            let mut bytes = Vec::new();
            io::Read::read_to_end(&mut entry, &mut bytes)?;
            let (_, height, png) = reencode_png(&bytes).map_err(|source| BundleError::Image {
                name: file_name.clone(),
                source,
            })?;
            let image = BundledImage {
                entry: entry_path,
                size: height,
                png,
            };
            if file_name.contains("full") {
                out.full_size = Some(image);
            } else {
                out.display = Some(image);
            }
        } else {
            debug!(entry = %path.display(), "ignoring unrecognised bundle entry");
        }
    }
    Ok(out)
}

/// `<dir of bundle key>/<ingestion name>/<path inside the bundle>`.
fn entry_key(bundle_key: &str, ingestion: &str, entry: &str) -> String {
    match bundle_key.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => format!("{dir}/{ingestion}/{entry}"),
        _ => format!("{ingestion}/{entry}"),
    }
}

/// Child names: `<ingestion>-apk`, `<ingestion>-ipa`, then `-2`, `-3`, ... for
/// further packages of the same kind.
fn child_names(ingestion: &str, kinds: &[PackageKind]) -> Vec<String> {
    let mut seen: Vec<(PackageKind, usize)> = Vec::new();
    kinds
        .iter()
        .map(|kind| {
            let n = match seen.iter_mut().find(|(k, _)| k == kind) {
                Some((_, n)) => {
                    *n += 1;
                    *n
                }
                None => {
                    seen.push((*kind, 1));
                    1
                }
            };
            let base = format!("{ingestion}-{}", kind.extension());
            if n == 1 {
                base
            } else {
                format!("{base}-{n}")
            }
        })
        .collect()
}

async fn upload_file(
    store: &dyn ObjectStore,
    key: &str,
    content_type: &str,
    path: &Path,
) -> Result<(), StoreError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StoreError::io(path.display().to_string(), e))?;
    let mut writer = store.write(key, content_type).await?;
    tokio::io::copy(&mut file, &mut writer)
        .await
        .map_err(|e| StoreError::io(key, e))?;
    writer.shutdown().await.map_err(|e| StoreError::io(key, e))
}

#[async_trait]
impl Reconcile for IngestionReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let mut ingestion = match self.ingestions.get(key).await {
            Ok(ingestion) => ingestion,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };
        if ingestion.metadata.deletion_requested {
            return Ok(Action::await_change());
        }

        let bucket_key = ObjectKey::new(&key.namespace, &ingestion.spec.bucket);
        let bucket = match self.buckets.get(&bucket_key).await {
            Ok(bucket) if bucket.status.phase == Phase::Ready => bucket,
            Ok(_) => {
                return Err(ReconcileError::TransientDependency(format!(
                    "bucket {bucket_key} not ready"
                )))
            }
            Err(e) if e.is_not_found() => {
                return Err(ReconcileError::TransientDependency(format!(
                    "bucket {bucket_key} not found"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let store = self
            .gateway
            .resolve(&bucket)
            .await
            .map_err(|e| ReconcileError::TransientStorage(e.to_string()))?;

        let scratch = match download_to_scratch(
            store.as_ref(),
            &ingestion.spec.key,
            &self.settings.scratch_dir,
            "tgz",
            cancel,
        )
        .await
        {
            Ok(scratch) => scratch,
            Err(DownloadError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(DownloadError::Step { reason, message }) => {
                return self.fail(ingestion, reason, message).await
            }
        };

        if ingestion.status.phase == Phase::Ready && ingestion.status.digest == scratch.digest {
            debug!(ingestion = %key, "[INGEST] bundle unchanged");
            return Ok(Action::await_change());
        }

        let spool = tempfile::Builder::new()
            .prefix("bundle-")
            .tempdir_in(&self.settings.scratch_dir)
            .map_err(|e| ReconcileError::TransientStorage(format!("create spool dir: {e}")))?;
        let bundle_path = scratch.path().to_path_buf();
        let spool_path = spool.path().to_path_buf();
        let bundle = match tokio::task::spawn_blocking(move || read_bundle(&bundle_path, &spool_path)).await {
            Ok(Ok(bundle)) => bundle,
            Ok(Err(e)) => return self.fail(ingestion, e.reason(), e.to_string()).await,
            Err(e) => return self.fail(ingestion, "ReadBundle", e.to_string()).await,
        };
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        if bundle.packages.is_empty() {
            warn!(ingestion = %key, "[INGEST] bundle contains no packages");
        }

        let mut overrides = IconOverrides::default();
        for (image, slot) in [
            (&bundle.display, &mut overrides.display),
            (&bundle.full_size, &mut overrides.full_size),
        ] {
            if let Some(image) = image {
                let image_key = entry_key(&ingestion.spec.key, &ingestion.metadata.name, &image.entry);
                put_object(store.as_ref(), &image_key, "image/png", &image.png)
                    .await
                    .map_err(|e| ReconcileError::TransientStorage(e.to_string()))?;
                *slot = Some(IconRef {
                    key: image_key,
                    size: image.size,
                });
            }
        }

        let kinds: Vec<PackageKind> = bundle.packages.iter().map(|p| p.kind).collect();
        let names = child_names(&ingestion.metadata.name, &kinds);
        let mut children = Vec::with_capacity(names.len());
        for (package, name) in bundle.packages.iter().zip(names) {
            let object_key = entry_key(&ingestion.spec.key, &ingestion.metadata.name, &package.entry);
            upload_file(store.as_ref(), &object_key, package.kind.content_type(), &package.path)
                .await
                .map_err(|e| ReconcileError::TransientStorage(e.to_string()))?;

            let mut metadata = ObjectMeta::new(&key.namespace, &name);
            metadata.labels = ingestion.metadata.labels.clone();
            metadata.owner = Some(OwnerRef {
                kind: IngestionRecord::KIND.to_string(),
                name: ingestion.metadata.name.clone(),
            });
            let child = ArtifactRecord {
                metadata,
                kind: package.kind,
                spec: ArtifactSpec {
                    bucket: ingestion.spec.bucket.clone(),
                    key: object_key,
                    icons: overrides.clone(),
                },
                status: ArtifactStatus::default(),
            };
            create_or_patch(self.artifacts.as_ref(), child).await?;
            info!(ingestion = %key, artifact = %name, kind = %package.kind, "[INGEST] artifact registered");
            children.push(name);
        }
        drop(spool);

        ingestion.status.artifacts = children;
        ingestion.status.digest = scratch.digest.clone();
        ingestion.status.phase = Phase::Ready;
        set_condition(&mut ingestion, CONDITION_INGESTED, true, "Ingested", "");
        self.ingestions.update_status(&ingestion).await?;

        info!(
            ingestion = %key,
            artifacts = ingestion.status.artifacts.len(),
            "[INGEST] bundle ingested"
        );
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_entries_are_detected() {
        assert!(is_hidden(Path::new("._app.apk")));
        assert!(is_hidden(Path::new("__MACOSX/app.apk")));
        assert!(is_hidden(Path::new("bundle/.DS_Store")));
        assert!(!is_hidden(Path::new("bundle/app.apk")));
    }

    #[test]
    fn entry_keys_sit_next_to_the_bundle() {
        assert_eq!(entry_key("uploads/b.tgz", "ing", "app.apk"), "uploads/ing/app.apk");
        assert_eq!(entry_key("b.tgz", "ing", "app.apk"), "ing/app.apk");
        assert_eq!(
            entry_key("uploads/b.tgz", "ing", "v2/app.apk"),
            "uploads/ing/v2/app.apk"
        );
    }

    #[test]
    fn bundle_paths_keep_directories_and_drop_traversal() {
        assert_eq!(bundle_path(Path::new("App.APK"), "app.apk"), "app.apk");
        assert_eq!(bundle_path(Path::new("v1/App.apk"), "app.apk"), "v1/app.apk");
        assert_eq!(
            bundle_path(Path::new("./v1/../../etc/app.apk"), "app.apk"),
            "v1/etc/app.apk"
        );
        assert_eq!(bundle_path(Path::new("/abs/app.apk"), "app.apk"), "abs/app.apk");
    }

    #[test]
    fn duplicate_kinds_get_numbered_names() {
        let names = child_names(
            "ing",
            &[PackageKind::Android, PackageKind::Apple, PackageKind::Android],
        );
        assert_eq!(names, vec!["ing-apk", "ing-ipa", "ing-apk-2"]);
    }
}
