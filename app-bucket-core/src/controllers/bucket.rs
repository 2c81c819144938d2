//! Bucket liveness: a bucket is Ready iff its last open attempt succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Action, Reconcile, Settings};
use crate::conditions::set_condition;
use crate::contract::Records;
use crate::error::ReconcileError;
use crate::gateway::StorageGateway;
use crate::records::{
    BucketRecord, ConfigMap, KeyRef, ObjectKey, ObjectMeta, Phase, Record, Secret,
};

pub const CONDITION_OPENED: &str = "Opened";

pub struct BucketReconciler {
    buckets: Arc<dyn Records<BucketRecord>>,
    gateway: Arc<StorageGateway>,
    settings: Settings,
}

impl BucketReconciler {
    pub fn new(
        buckets: Arc<dyn Records<BucketRecord>>,
        gateway: Arc<StorageGateway>,
        settings: Settings,
    ) -> Self {
        Self {
            buckets,
            gateway,
            settings,
        }
    }
}

#[async_trait]
impl Reconcile for BucketReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let mut bucket = match self.buckets.get(key).await {
            Ok(bucket) => bucket,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };
        if bucket.metadata.deletion_requested {
            return Ok(Action::await_change());
        }

        let changed = match self.gateway.resolve(&bucket).await {
            Ok(_) => {
                let mut changed =
                    set_condition(&mut bucket, CONDITION_OPENED, true, "BucketOpened", "");
                if bucket.status.phase != Phase::Ready {
                    info!(bucket = %key, "[BUCKET] opened");
                    bucket.status.phase = Phase::Ready;
                    changed = true;
                }
                changed
            }
            Err(e) if e.is_reference_not_found() => {
                debug!(bucket = %key, error = %e, "[BUCKET] waiting on credential source");
                return Err(ReconcileError::TransientDependency(e.to_string()));
            }
            Err(e) => {
                error!(bucket = %key, error = ?e, "[BUCKET][ERROR] failed to open");
                let mut changed =
                    set_condition(&mut bucket, CONDITION_OPENED, false, "FailedToOpen", e.to_string());
                if bucket.status.phase != Phase::Failed {
                    bucket.status.phase = Phase::Failed;
                    changed = true;
                }
                changed
            }
        };

        if changed {
            self.buckets.update_status(&bucket).await?;
        }
        Ok(Action::requeue(self.settings.resync_interval))
    }
}

fn references(key_ref: Option<&KeyRef>, meta: &ObjectMeta, bucket: &BucketRecord) -> bool {
    bucket.metadata.namespace == meta.namespace && key_ref.is_some_and(|r| r.name == meta.name)
}

/// Buckets whose URL is read from `secret`.
pub async fn buckets_for_secret(
    buckets: &dyn Records<BucketRecord>,
    secret: &Secret,
) -> Vec<ObjectKey> {
    buckets_matching(buckets, &secret.metadata, |b| {
        b.spec
            .url_from
            .as_ref()
            .and_then(|s| s.secret_key_ref.as_ref())
    })
    .await
}

/// Buckets whose URL is read from `config_map`.
pub async fn buckets_for_config_map(
    buckets: &dyn Records<BucketRecord>,
    config_map: &ConfigMap,
) -> Vec<ObjectKey> {
    buckets_matching(buckets, &config_map.metadata, |b| {
        b.spec
            .url_from
            .as_ref()
            .and_then(|s| s.config_map_key_ref.as_ref())
    })
    .await
}

async fn buckets_matching(
    buckets: &dyn Records<BucketRecord>,
    source: &ObjectMeta,
    key_ref: impl Fn(&BucketRecord) -> Option<&KeyRef>,
) -> Vec<ObjectKey> {
    match buckets.list(&source.namespace).await {
        Ok(all) => all
            .iter()
            .filter(|b| references(key_ref(b), source, b))
            .map(|b| b.key())
            .collect(),
        Err(e) => {
            error!(error = ?e, "[BUCKET][ERROR] failed to list buckets for watch");
            Vec::new()
        }
    }
}
