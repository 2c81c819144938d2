mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use app_bucket_core::association::{
    WellKnownProvisioner, APPLE_APP_SITE_ASSOCIATION_FILE, ASSET_LINKS_FILE,
};
use app_bucket_core::contract::{MockDeliveryProvisioner, Records};
use app_bucket_core::controllers::app::{
    apps_for_artifact, apps_for_issuer, CONDITION_UNIVERSAL_LINKS,
};
use app_bucket_core::controllers::{AppReconciler, Reconcile};
use app_bucket_core::error::RecordError;
use app_bucket_core::records::{
    AppRecord, AppSpec, AppStatus, ArtifactRecord, ConfigMap, IssuerRef, LabelSelector,
    ObjectKey, ObjectMeta, PackageKind, Phase, UniversalLinks, WellKnownRoute,
};
use app_bucket_core::substrate::MemoryRecords;

use common::{artifact, Harness, NS};

fn labelled(name: &str, kind: PackageKind, app: &str, version: &str) -> ArtifactRecord {
    let mut a = artifact(name, kind, &format!("uploads/{name}.{}", kind.extension()));
    a.metadata.labels.insert("app".into(), app.into());
    a.status.phase = Phase::Ready;
    a.status.version = version.into();
    a
}

fn android(name: &str, version: &str, package: &str, fingerprint: &str) -> ArtifactRecord {
    let mut a = labelled(name, PackageKind::Android, "demo", version);
    a.status.identifier = package.into();
    a.status.fingerprint = Some(fingerprint.into());
    a
}

fn apple(name: &str, version: &str, bundle: &str) -> ArtifactRecord {
    let mut a = labelled(name, PackageKind::Apple, "demo", version);
    a.status.identifier = bundle.into();
    a
}

fn app(links: Option<UniversalLinks>) -> AppRecord {
    AppRecord {
        metadata: ObjectMeta::new(NS, "demo"),
        spec: AppSpec {
            selector: LabelSelector(BTreeMap::from([("app".to_string(), "demo".to_string())])),
            universal_links: links,
        },
        status: AppStatus::default(),
    }
}

/// Stores records as given, status included.
async fn seed(artifacts: &MemoryRecords<ArtifactRecord>, records: Vec<ArtifactRecord>) {
    for record in records {
        let status = record.status.clone();
        let mut created = artifacts.create(record).await.unwrap();
        created.status = status;
        artifacts.update_status(&created).await.unwrap();
    }
}

#[tokio::test]
async fn releases_and_universal_links_are_aggregated() {
    let h = Harness::new().await;
    let mut failed = android("broken", "v9.0.0", "com.x", "F9");
    failed.status.phase = Phase::Failed;
    seed(
        &h.artifacts,
        vec![
            android("demo-a", "v1.1.0", "com.x", "F2"),
            android("demo-b", "v1.2.0", "com.x", "F1"),
            android("demo-c", "v1.0.0", "com.x", "F1"),
            apple("demo-ios-1", "v1.0.0", "TEAM.com.x"),
            apple("demo-ios-2", "v1.0.1", "TEAM.com.x"),
            labelled("other", PackageKind::Android, "other", "v5.0.0"),
            failed,
        ],
    )
    .await;

    let apps = Arc::new(MemoryRecords::<AppRecord>::new());
    let config_maps = Arc::new(MemoryRecords::<ConfigMap>::new());
    let routes = Arc::new(MemoryRecords::<WellKnownRoute>::new());
    apps.create(app(Some(UniversalLinks {
        host: "links.example.com".into(),
        issuer: None,
    })))
    .await
    .unwrap();

    let reconciler = AppReconciler::new(
        apps.clone(),
        h.artifacts.clone(),
        Arc::new(WellKnownProvisioner::new(config_maps.clone(), routes.clone())),
        h.settings.clone(),
    );
    let key = ObjectKey::new(NS, "demo");
    reconciler.reconcile(&key, &CancellationToken::new()).await.unwrap();
    let stored = apps.get(&key).await.unwrap();

    let names: Vec<_> = stored.status.android.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["demo-a", "demo-b", "demo-c"]);
    let latest: Vec<_> = stored
        .status
        .android
        .iter()
        .filter(|r| r.latest)
        .map(|r| r.version.as_str())
        .collect();
    assert_eq!(latest, vec!["v1.2.0"]);
    assert_eq!(stored.status.apple.iter().filter(|r| r.latest).count(), 1);
    assert!(stored.status.apple.iter().any(|r| r.latest && r.version == "v1.0.1"));

    assert_eq!(stored.status.asset_link_targets.len(), 1);
    assert_eq!(
        stored.status.asset_link_targets["com.x"]
            .iter()
            .cloned()
            .collect::<Vec<_>>(),
        vec!["F1".to_string(), "F2".to_string()]
    );
    assert_eq!(
        stored.status.bundle_identifiers.iter().cloned().collect::<Vec<_>>(),
        vec!["TEAM.com.x".to_string()]
    );

    let condition = stored
        .status
        .conditions
        .iter()
        .find(|c| c.type_ == CONDITION_UNIVERSAL_LINKS)
        .unwrap();
    assert!(condition.status);
    assert_eq!(condition.reason, "Provisioned");

    let served = config_maps
        .get(&ObjectKey::new(NS, "demo-well-known"))
        .await
        .unwrap();
    let links: serde_json::Value = serde_json::from_str(&served.data[ASSET_LINKS_FILE]).unwrap();
    assert_eq!(
        links[0]["target"]["sha256_cert_fingerprints"],
        serde_json::json!(["F1", "F2"])
    );
    let aasa: serde_json::Value =
        serde_json::from_str(&served.data[APPLE_APP_SITE_ASSOCIATION_FILE]).unwrap();
    assert_eq!(
        aasa["applinks"]["details"][0]["appIDs"],
        serde_json::json!(["TEAM.com.x"])
    );

    let route = routes
        .get(&ObjectKey::new(NS, "demo-well-known"))
        .await
        .unwrap();
    assert_eq!(route.spec.host, "links.example.com");
    assert!(route.metadata.is_owned_by("App", "demo"));

    // Recomputing an unchanged world writes nothing.
    let version = stored.metadata.resource_version;
    reconciler.reconcile(&key, &CancellationToken::new()).await.unwrap();
    assert_eq!(apps.get(&key).await.unwrap().metadata.resource_version, version);
}

#[tokio::test]
async fn provisioning_failure_is_reported_as_condition() {
    let h = Harness::new().await;
    seed(&h.artifacts, vec![android("demo-a", "v1.0.0", "com.x", "F1")]).await;
    let apps = Arc::new(MemoryRecords::<AppRecord>::new());
    apps.create(app(Some(UniversalLinks {
        host: "links.example.com".into(),
        issuer: None,
    })))
    .await
    .unwrap();

    let mut provisioner = MockDeliveryProvisioner::new();
    provisioner
        .expect_provision()
        .times(1)
        .returning(|_, _, _| Err(RecordError::Backend("route store unavailable".into())));
    let reconciler = AppReconciler::new(
        apps.clone(),
        h.artifacts.clone(),
        Arc::new(provisioner),
        h.settings.clone(),
    );
    let key = ObjectKey::new(NS, "demo");
    reconciler.reconcile(&key, &CancellationToken::new()).await.unwrap();

    let stored = apps.get(&key).await.unwrap();
    let condition = &stored.status.conditions[0];
    assert_eq!(condition.type_, CONDITION_UNIVERSAL_LINKS);
    assert!(!condition.status);
    assert_eq!(condition.reason, "ProvisionFailed");
    assert_eq!(stored.status.android.len(), 1);
}

#[tokio::test]
async fn apps_without_universal_links_withdraw_delivery() {
    let h = Harness::new().await;
    let apps = Arc::new(MemoryRecords::<AppRecord>::new());
    apps.create(app(None)).await.unwrap();

    let mut provisioner = MockDeliveryProvisioner::new();
    provisioner.expect_provision().never();
    provisioner.expect_withdraw().times(1).returning(|_| Ok(()));
    let reconciler = AppReconciler::new(
        apps.clone(),
        h.artifacts.clone(),
        Arc::new(provisioner),
        h.settings.clone(),
    );
    let key = ObjectKey::new(NS, "demo");
    reconciler.reconcile(&key, &CancellationToken::new()).await.unwrap();

    let stored = apps.get(&key).await.unwrap();
    assert_eq!(stored.status.phase, Phase::Ready);
    assert!(stored.status.android.is_empty());
    assert!(stored.status.conditions.is_empty());
}

#[tokio::test]
async fn artifact_changes_map_to_matching_apps() {
    let apps = MemoryRecords::<AppRecord>::new();
    apps.create(app(None)).await.unwrap();

    let matching = labelled("demo-a", PackageKind::Android, "demo", "v1.0.0");
    let unrelated = labelled("x", PackageKind::Android, "other", "v1.0.0");
    assert_eq!(
        apps_for_artifact(&apps, &matching).await,
        vec![ObjectKey::new(NS, "demo")]
    );
    assert!(apps_for_artifact(&apps, &unrelated).await.is_empty());
}

#[tokio::test]
async fn artifact_relabelled_out_of_selector_requeues_the_app_it_left() {
    let h = Harness::new().await;
    seed(&h.artifacts, vec![android("demo-a", "v1.0.0", "com.x", "F1")]).await;
    let apps = Arc::new(MemoryRecords::<AppRecord>::new());
    apps.create(app(None)).await.unwrap();

    let mut provisioner = MockDeliveryProvisioner::new();
    provisioner.expect_withdraw().returning(|_| Ok(()));
    let reconciler = AppReconciler::new(
        apps.clone(),
        h.artifacts.clone(),
        Arc::new(provisioner),
        h.settings.clone(),
    );
    let key = ObjectKey::new(NS, "demo");
    reconciler.reconcile(&key, &CancellationToken::new()).await.unwrap();
    assert_eq!(apps.get(&key).await.unwrap().status.android.len(), 1);

    let artifact_key = ObjectKey::new(NS, "demo-a");
    let mut moved = h.artifacts.get(&artifact_key).await.unwrap();
    moved.metadata.labels.insert("app".into(), "other".into());
    let moved = h.artifacts.update(&moved).await.unwrap();

    assert_eq!(apps_for_artifact(apps.as_ref(), &moved).await, vec![key.clone()]);

    reconciler.reconcile(&key, &CancellationToken::new()).await.unwrap();
    assert!(apps.get(&key).await.unwrap().status.android.is_empty());
    assert!(apps_for_artifact(apps.as_ref(), &moved).await.is_empty());
}

#[tokio::test]
async fn issuer_changes_map_only_to_apps_using_that_issuer() {
    let apps = MemoryRecords::<AppRecord>::new();
    let issuer = IssuerRef {
        kind: "ClusterIssuer".into(),
        name: "letsencrypt".into(),
    };
    apps.create(app(Some(UniversalLinks {
        host: "links.example.com".into(),
        issuer: Some(issuer.clone()),
    })))
    .await
    .unwrap();
    let mut staging = app(Some(UniversalLinks {
        host: "staging.example.com".into(),
        issuer: Some(IssuerRef {
            kind: "ClusterIssuer".into(),
            name: "staging".into(),
        }),
    }));
    staging.metadata.name = "staging".into();
    apps.create(staging).await.unwrap();
    let mut plain = app(None);
    plain.metadata.name = "plain".into();
    apps.create(plain).await.unwrap();

    assert_eq!(
        apps_for_issuer(&apps, NS, &issuer).await,
        vec![ObjectKey::new(NS, "demo")]
    );
    assert!(apps_for_issuer(&apps, "elsewhere", &issuer).await.is_empty());
}
