//! # app: aggregates Ready artifacts into per-app release listings
//!
//! Status is recomputed from scratch on every pass: Ready artifacts matching
//! the selector are projected into releases per kind, the highest semantic
//! version of each kind is marked latest, and the identifiers needed for
//! universal links are collected. When the app configures universal links the
//! rendered association documents are handed to the [`DeliveryProvisioner`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Action, Reconcile, Settings};
use crate::association::AssociationDocuments;
use crate::conditions::set_condition;
use crate::contract::{DeliveryProvisioner, Records};
use crate::decode::parse_version;
use crate::error::ReconcileError;
use crate::records::{
    AppRecord, ArtifactRecord, IssuerRef, ObjectKey, PackageKind, Phase, Record, Release,
};

pub const CONDITION_UNIVERSAL_LINKS: &str = "UniversalLinks";

pub struct AppReconciler {
    apps: Arc<dyn Records<AppRecord>>,
    artifacts: Arc<dyn Records<ArtifactRecord>>,
    provisioner: Arc<dyn DeliveryProvisioner>,
    settings: Settings,
}

impl AppReconciler {
    pub fn new(
        apps: Arc<dyn Records<AppRecord>>,
        artifacts: Arc<dyn Records<ArtifactRecord>>,
        provisioner: Arc<dyn DeliveryProvisioner>,
        settings: Settings,
    ) -> Self {
        Self {
            apps,
            artifacts,
            provisioner,
            settings,
        }
    }
}

/// Releases of one kind, sorted by name, with at most one marked latest.
pub fn releases(artifacts: &[&ArtifactRecord]) -> Vec<Release> {
    let mut out: Vec<Release> = artifacts
        .iter()
        .map(|a| Release {
            name: a.metadata.name.clone(),
            bucket: a.spec.bucket.clone(),
            key: a.spec.key.clone(),
            version: a.status.version.clone(),
            latest: false,
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));

    // Names are sorted, so keeping the first maximum settles ties on the smallest name.
    let mut best: Option<(usize, semver::Version)> = None;
    for (i, release) in out.iter().enumerate() {
        let Some(version) = parse_version(&release.version) else {
            continue;
        };
        if best.as_ref().map_or(true, |(_, b)| version > *b) {
            best = Some((i, version));
        }
    }
    if let Some((i, _)) = best {
        out[i].latest = true;
    }
    out
}

/// Package identifier to the set of signing fingerprints seen for it.
pub fn asset_link_targets(android: &[&ArtifactRecord]) -> BTreeMap<String, BTreeSet<String>> {
    let mut targets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for artifact in android {
        let Some(fingerprint) = artifact.status.fingerprint.as_ref() else {
            continue;
        };
        if artifact.status.identifier.is_empty() {
            continue;
        }
        targets
            .entry(artifact.status.identifier.clone())
            .or_default()
            .insert(fingerprint.clone());
    }
    targets
}

pub fn bundle_identifiers(apple: &[&ArtifactRecord]) -> BTreeSet<String> {
    apple
        .iter()
        .map(|a| a.status.identifier.clone())
        .filter(|id| !id.is_empty())
        .collect()
}

#[async_trait]
impl Reconcile for AppReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let mut app = match self.apps.get(key).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        };
        if app.metadata.deletion_requested {
            return Ok(Action::await_change());
        }

        let artifacts = self.artifacts.list(&key.namespace).await?;
        let matching: Vec<&ArtifactRecord> = artifacts
            .iter()
            .filter(|a| {
                a.status.phase == Phase::Ready
                    && !a.metadata.deletion_requested
                    && app.spec.selector.matches(&a.metadata.labels)
            })
            .collect();
        let (android, apple): (Vec<&ArtifactRecord>, Vec<&ArtifactRecord>) = matching
            .into_iter()
            .partition(|a| a.kind == PackageKind::Android);

        let before = app.status.clone();
        app.status.android = releases(&android);
        app.status.apple = releases(&apple);
        app.status.asset_link_targets = asset_link_targets(&android);
        app.status.bundle_identifiers = bundle_identifiers(&apple);
        app.status.phase = Phase::Ready;

        match app.spec.universal_links.clone() {
            Some(links) => {
                let provisioned = match AssociationDocuments::render(
                    &app.status.asset_link_targets,
                    &app.status.bundle_identifiers,
                ) {
                    Ok(documents) => self
                        .provisioner
                        .provision(&app, &links, &documents)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match provisioned {
                    Ok(()) => {
                        set_condition(&mut app, CONDITION_UNIVERSAL_LINKS, true, "Provisioned", "");
                    }
                    Err(message) => {
                        error!(app = %key, host = %links.host, error = %message, "[APP][ERROR] universal links not provisioned");
                        set_condition(
                            &mut app,
                            CONDITION_UNIVERSAL_LINKS,
                            false,
                            "ProvisionFailed",
                            message,
                        );
                    }
                }
            }
            None => {
                if let Err(e) = self.provisioner.withdraw(&app).await {
                    error!(app = %key, error = ?e, "[APP][ERROR] failed to withdraw universal links");
                }
                app.status
                    .conditions
                    .retain(|c| c.type_ != CONDITION_UNIVERSAL_LINKS);
            }
        }

        if app.status == before {
            debug!(app = %key, "[APP] status unchanged");
        } else {
            self.apps.update_status(&app).await?;
            info!(
                app = %key,
                android = app.status.android.len(),
                apple = app.status.apple.len(),
                "[APP] releases updated"
            );
        }
        Ok(Action::requeue(self.settings.resync_interval))
    }
}

/// Apps whose selector matches the artifact's labels, plus apps that still
/// list it as a release (the artifact was relabelled or removed).
pub async fn apps_for_artifact(
    apps: &dyn Records<AppRecord>,
    artifact: &ArtifactRecord,
) -> Vec<ObjectKey> {
    let name = &artifact.metadata.name;
    match apps.list(&artifact.metadata.namespace).await {
        Ok(all) => all
            .iter()
            .filter(|app| {
                app.spec.selector.matches(&artifact.metadata.labels)
                    || app
                        .status
                        .android
                        .iter()
                        .chain(&app.status.apple)
                        .any(|r| &r.name == name)
            })
            .map(|app| app.key())
            .collect(),
        Err(e) => {
            error!(error = ?e, "[APP][ERROR] failed to list apps for watch");
            Vec::new()
        }
    }
}

/// Apps in `namespace` whose universal links use `issuer`.
pub async fn apps_for_issuer(
    apps: &dyn Records<AppRecord>,
    namespace: &str,
    issuer: &IssuerRef,
) -> Vec<ObjectKey> {
    match apps.list(namespace).await {
        Ok(all) => all
            .iter()
            .filter(|app| {
                app.spec
                    .universal_links
                    .as_ref()
                    .and_then(|l| l.issuer.as_ref())
                    .is_some_and(|i| i == issuer)
            })
            .map(|app| app.key())
            .collect(),
        Err(e) => {
            error!(error = ?e, "[APP][ERROR] failed to list apps for watch");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ArtifactSpec, ArtifactStatus, ObjectMeta};

    fn artifact(name: &str, kind: PackageKind, version: &str) -> ArtifactRecord {
        ArtifactRecord {
            metadata: ObjectMeta::new("default", name),
            kind,
            spec: ArtifactSpec {
                bucket: "b".into(),
                key: format!("{name}.{}", kind.extension()),
                icons: Default::default(),
            },
            status: ArtifactStatus {
                phase: Phase::Ready,
                version: version.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn only_highest_version_is_latest() {
        let a = artifact("c", PackageKind::Android, "v1.0.0");
        let b = artifact("a", PackageKind::Android, "v1.2.0");
        let c = artifact("b", PackageKind::Android, "v1.1.0");
        let out = releases(&[&a, &b, &c]);
        let latest: Vec<_> = out.iter().filter(|r| r.latest).map(|r| r.version.as_str()).collect();
        assert_eq!(latest, vec!["v1.2.0"]);
        assert_eq!(
            out.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn equal_versions_prefer_smallest_name() {
        let a = artifact("zeta", PackageKind::Apple, "v2.0.0");
        let b = artifact("alpha", PackageKind::Apple, "v2.0.0");
        let out = releases(&[&a, &b]);
        assert!(out.iter().find(|r| r.name == "alpha").unwrap().latest);
        assert!(!out.iter().find(|r| r.name == "zeta").unwrap().latest);
    }

    #[test]
    fn unparseable_versions_are_never_latest() {
        let a = artifact("a", PackageKind::Android, "nightly");
        let out = releases(&[&a]);
        assert!(!out[0].latest);
    }

    #[test]
    fn fingerprints_are_merged_per_package() {
        let mut a = artifact("a", PackageKind::Android, "v1.0.0");
        a.status.identifier = "com.x".into();
        a.status.fingerprint = Some("F2".into());
        let mut b = artifact("b", PackageKind::Android, "v1.1.0");
        b.status.identifier = "com.x".into();
        b.status.fingerprint = Some("F1".into());
        let mut c = b.clone();
        c.metadata.name = "c".into();

        let targets = asset_link_targets(&[&a, &b, &c]);
        assert_eq!(targets.len(), 1);
        assert_eq!(
            targets["com.x"].iter().cloned().collect::<Vec<_>>(),
            vec!["F1".to_string(), "F2".to_string()]
        );
    }
}
