//! # artifact: the content pipeline for one package kind
//!
//! One [`ArtifactReconciler`] runs per [`PackageKind`], each owning the
//! artifact records of its kind. A reconcile pass:
//!
//! 1. Waits for the referenced bucket to be Ready and opens it.
//! 2. Finalizes instead when deletion was requested: icon objects are deleted,
//!    then the finalizer is released.
//! 3. Downloads the package to scratch while hashing it. An unchanged digest
//!    ends the pass without further writes, unless force-unpack is set or the
//!    spec changed since the last unpack.
//! 4. Decodes the package, records its metadata and attaches the finalizer.
//! 5. Extracts, publishes and role-marks icons, then records the digest.
//!
//! Terminal failures are written as `Get<Kind>` / `Unpack<Kind>` conditions
//! with phase Failed and are retried on resync or the next change.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Action, Reconcile, Settings};
use crate::conditions::{find_condition, set_condition};
use crate::contract::{ObjectStore, Records};
use crate::decode::PackageDecoder;
use crate::error::ReconcileError;
use crate::gateway::StorageGateway;
use crate::icons::{assign_roles, normalize_all};
use crate::pipeline::{download_to_scratch, finalize_icons, publish_icons, DownloadError};
use crate::records::{
    ArtifactRecord, BucketRecord, IconEntry, ObjectKey, PackageKind, Phase, Record,
    ANNOTATION_FORCE_UNPACK, FINALIZER,
};

pub struct ArtifactReconciler {
    decoder: PackageDecoder,
    artifacts: Arc<dyn Records<ArtifactRecord>>,
    buckets: Arc<dyn Records<BucketRecord>>,
    gateway: Arc<StorageGateway>,
    settings: Settings,
}

impl ArtifactReconciler {
    pub fn new(
        decoder: PackageDecoder,
        artifacts: Arc<dyn Records<ArtifactRecord>>,
        buckets: Arc<dyn Records<BucketRecord>>,
        gateway: Arc<StorageGateway>,
        settings: Settings,
    ) -> Self {
        Self {
            decoder,
            artifacts,
            buckets,
            gateway,
            settings,
        }
    }

    pub fn kind(&self) -> PackageKind {
        self.decoder.kind()
    }

    fn resync(&self) -> Action {
        Action::requeue(self.settings.resync_interval)
    }

    /// Marks the artifact Failed with `condition` and persists if anything changed.
    async fn fail(
        &self,
        mut artifact: ArtifactRecord,
        condition: String,
        reason: &str,
        message: String,
    ) -> Result<Action, ReconcileError> {
        error!(
            artifact = %artifact.key(),
            kind = %self.kind(),
            condition = %condition,
            reason = %reason,
            message = %message,
            "[ARTIFACT][ERROR] pipeline step failed"
        );
        let mut changed = set_condition(&mut artifact, condition, false, reason, message);
        if artifact.status.phase != Phase::Failed {
            artifact.status.phase = Phase::Failed;
            changed = true;
        }
        if changed {
            self.artifacts.update_status(&artifact).await?;
        }
        Ok(self.resync())
    }

    async fn finalize(
        &self,
        mut artifact: ArtifactRecord,
        store: &dyn ObjectStore,
    ) -> Result<Action, ReconcileError> {
        if !artifact.metadata.has_finalizer(FINALIZER) {
            return Ok(Action::await_change());
        }

        finalize_icons(store, &artifact).await.map_err(|e| {
            ReconcileError::TransientStorage(format!(
                "delete icons of {}: {e}",
                artifact.key()
            ))
        })?;

        artifact.metadata.remove_finalizer(FINALIZER);
        match self.artifacts.update(&artifact).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(artifact = %artifact.key(), kind = %self.kind(), "[ARTIFACT] finalized");
        Ok(Action::await_change())
    }

    /// Deletes icons from a previous pass that the new pass no longer produced.
    async fn prune_icons(&self, store: &dyn ObjectStore, previous: &[IconEntry], artifact: &ArtifactRecord) {
        for stale in previous {
            let still_used = artifact.status.icons.iter().any(|e| e.key == stale.key)
                || artifact.spec.icons.contains_key(&stale.key);
            if still_used {
                continue;
            }
            match store.delete(&stale.key).await {
                Ok(()) => debug!(key = %stale.key, "stale icon deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(key = %stale.key, error = ?e, "stale icon delete failed"),
            }
        }
    }
}

fn force_unpack(artifact: &ArtifactRecord) -> bool {
    artifact
        .metadata
        .annotations
        .get(ANNOTATION_FORCE_UNPACK)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
}

/// The other kind, when `key`'s extension names it.
fn mismatched_kind(key: &str, kind: PackageKind) -> Option<PackageKind> {
    Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(PackageKind::from_extension)
        .filter(|k| *k != kind)
}

#[async_trait]
impl Reconcile for ArtifactReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let kind = self.kind();
        let mut artifact = match self.artifacts.get(key).await {
            Ok(artifact) if artifact.kind == kind => artifact,
            Ok(_) => return Ok(Action::await_change()),
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };

        let bucket_key = ObjectKey::new(&key.namespace, &artifact.spec.bucket);
        let bucket = match self.buckets.get(&bucket_key).await {
            Ok(bucket) => bucket,
            Err(e) if e.is_not_found() => {
                return Err(ReconcileError::TransientDependency(format!(
                    "bucket {bucket_key} not found"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if bucket.status.phase != Phase::Ready {
            return Err(ReconcileError::TransientDependency(format!(
                "bucket {bucket_key} not ready"
            )));
        }
        let store = self
            .gateway
            .resolve(&bucket)
            .await
            .map_err(|e| ReconcileError::TransientStorage(e.to_string()))?;

        if artifact.metadata.deletion_requested {
            return self.finalize(artifact, store.as_ref()).await;
        }

        if let Some(other) = mismatched_kind(&artifact.spec.key, kind) {
            let message = format!(
                "key {} names a {} package, expected {}",
                artifact.spec.key, other, kind
            );
            return self
                .fail(artifact, kind.get_condition(), "ValidateKey", message)
                .await;
        }

        info!(artifact = %key, kind = %kind, object = %artifact.spec.key, "[ARTIFACT] downloading");
        let scratch = match download_to_scratch(
            store.as_ref(),
            &artifact.spec.key,
            &self.settings.scratch_dir,
            kind.extension(),
            cancel,
        )
        .await
        {
            Ok(scratch) => scratch,
            Err(DownloadError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(DownloadError::Step { reason, message }) => {
                return self
                    .fail(artifact, kind.get_condition(), reason, message)
                    .await;
            }
        };

        let mut changed = set_condition(&mut artifact, kind.get_condition(), true, "Downloaded", "");
        let forced = force_unpack(&artifact);
        // A failed unpack or a spec change since the last clean unpack reopens the gate.
        let unpacked_current = find_condition(&artifact.status.conditions, &kind.unpack_condition())
            .is_some_and(|c| c.status && c.observed_generation == artifact.metadata.generation);
        if !forced && unpacked_current && scratch.digest == artifact.status.digest {
            if artifact.status.phase != Phase::Ready {
                artifact.status.phase = Phase::Ready;
                changed = true;
            }
            if changed {
                self.artifacts.update_status(&artifact).await?;
            }
            debug!(artifact = %key, digest = %scratch.digest, "[ARTIFACT] digest unchanged");
            return Ok(self.resync());
        }

        artifact.status.phase = Phase::Pending;
        artifact = self.artifacts.update_status(&artifact).await?;

        let decoded = match self
            .decoder
            .decode(scratch.path(), &self.settings.scratch_dir, cancel)
            .await
        {
            Ok(decoded) => decoded,
            Err(_) if cancel.is_cancelled() => return Err(ReconcileError::Cancelled),
            Err(e) => {
                return self
                    .fail(artifact, kind.unpack_condition(), e.step, e.message)
                    .await;
            }
        };

        artifact.status.version = decoded.version.clone();
        artifact.status.identifier = decoded.identifier.clone();
        artifact.status.fingerprint = decoded.fingerprint.clone();
        artifact.status.bundle_name = decoded.bundle_name.clone();
        artifact = self.artifacts.update_status(&artifact).await?;
        if artifact.metadata.add_finalizer(FINALIZER) {
            artifact = self.artifacts.update(&artifact).await?;
        }

        let overrides = artifact.spec.icons.clone();
        let icons = if overrides.is_complete() {
            debug!(artifact = %key, "[ARTIFACT] all icon roles overridden, skipping extraction");
            Vec::new()
        } else {
            let candidates = decoded.icons;
            match tokio::task::spawn_blocking(move || normalize_all(candidates)).await {
                Ok(Ok(icons)) => icons,
                Ok(Err(e)) => {
                    return self
                        .fail(artifact, kind.unpack_condition(), "Icons", e.message)
                        .await;
                }
                Err(e) => {
                    return self
                        .fail(artifact, kind.unpack_condition(), "Icons", e.to_string())
                        .await;
                }
            }
        };

        let published = publish_icons(store.as_ref(), &artifact, &icons)
            .await
            .map_err(|e| ReconcileError::TransientStorage(e.to_string()))?;

        let previous = std::mem::take(&mut artifact.status.icons);
        artifact.status.icons = assign_roles(published, &overrides);
        artifact.status.digest = scratch.digest.clone();
        artifact.status.phase = Phase::Ready;
        set_condition(&mut artifact, kind.unpack_condition(), true, "Unpacked", "");
        artifact = self.artifacts.update_status(&artifact).await?;
        self.prune_icons(store.as_ref(), &previous, &artifact).await;

        if forced {
            artifact.metadata.annotations.remove(ANNOTATION_FORCE_UNPACK);
            self.artifacts.update(&artifact).await?;
        }

        info!(
            artifact = %key,
            kind = %kind,
            version = %artifact.status.version,
            identifier = %artifact.status.identifier,
            icons = artifact.status.icons.len(),
            digest = %artifact.status.digest,
            "[ARTIFACT] unpacked"
        );
        Ok(self.resync())
    }
}

/// Artifacts of `kind` that reference `bucket`.
pub async fn artifacts_for_bucket(
    artifacts: &dyn Records<ArtifactRecord>,
    kind: PackageKind,
    bucket: &BucketRecord,
) -> Vec<ObjectKey> {
    match artifacts.list(&bucket.metadata.namespace).await {
        Ok(all) => all
            .into_iter()
            .filter(|a| a.kind == kind && a.spec.bucket == bucket.metadata.name)
            .map(|a| a.key())
            .collect(),
        Err(e) => {
            error!(error = ?e, "[ARTIFACT][ERROR] failed to list artifacts for watch");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_extension_of_other_kind_is_rejected() {
        assert_eq!(
            mismatched_kind("uploads/app.ipa", PackageKind::Android),
            Some(PackageKind::Apple)
        );
        assert_eq!(mismatched_kind("uploads/app.APK", PackageKind::Android), None);
        assert_eq!(mismatched_kind("uploads/app", PackageKind::Apple), None);
    }
}
