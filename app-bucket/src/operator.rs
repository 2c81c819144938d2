//! Wires the core reconcilers to the in-process substrate and real tools.

use std::sync::Arc;

use anyhow::{Context, Result};
use app_bucket_core::association::WellKnownProvisioner;
use app_bucket_core::blob::UrlOpener;
use app_bucket_core::contract::{Records, WatchEvent};
use app_bucket_core::controllers::app::apps_for_artifact;
use app_bucket_core::controllers::artifact::artifacts_for_bucket;
use app_bucket_core::controllers::bucket::{buckets_for_config_map, buckets_for_secret};
use app_bucket_core::controllers::{
    AppReconciler, ArtifactReconciler, BucketReconciler, IngestionReconciler, Settings,
};
use app_bucket_core::decode::{AndroidDecoder, AppleDecoder, PackageDecoder};
use app_bucket_core::gateway::StorageGateway;
use app_bucket_core::records::{
    AppRecord, ArtifactRecord, BucketRecord, ConfigMap, IngestionRecord, ObjectKey, PackageKind,
    Record, Secret, WellKnownRoute,
};
use app_bucket_core::runtime::Controller;
use app_bucket_core::substrate::MemoryRecords;
use app_bucket_core::tools::{ApktoolCommand, KeytoolCommand};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::load_config::{OperatorConfig, RecordsSection};

/// Every record store the operator runs against.
#[derive(Clone, Default)]
pub struct Substrate {
    pub secrets: Arc<MemoryRecords<Secret>>,
    pub config_maps: Arc<MemoryRecords<ConfigMap>>,
    pub buckets: Arc<MemoryRecords<BucketRecord>>,
    pub artifacts: Arc<MemoryRecords<ArtifactRecord>>,
    pub apps: Arc<MemoryRecords<AppRecord>>,
    pub ingestions: Arc<MemoryRecords<IngestionRecord>>,
    pub routes: Arc<MemoryRecords<WellKnownRoute>>,
}

/// Observed state of every record, printed by `reconcile`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub buckets: Vec<BucketRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub apps: Vec<AppRecord>,
    pub ingestions: Vec<IngestionRecord>,
    pub routes: Vec<WellKnownRoute>,
}

async fn create_all<R: Record>(records: &MemoryRecords<R>, seeds: Vec<R>) -> Result<()> {
    for seed in seeds {
        let key = seed.key();
        records
            .create(seed)
            .await
            .with_context(|| format!("Failed to seed {} {key}", R::KIND))?;
    }
    Ok(())
}

impl Substrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: RecordsSection) -> Result<()> {
        create_all(
            &self.secrets,
            records.secrets.into_iter().map(Secret::from).collect(),
        )
        .await?;
        create_all(&self.config_maps, records.config_maps).await?;
        create_all(&self.buckets, records.buckets).await?;
        create_all(&self.artifacts, records.artifacts).await?;
        create_all(&self.apps, records.apps).await?;
        create_all(&self.ingestions, records.ingestions).await?;
        info!(
            buckets = self.buckets.snapshot().len(),
            artifacts = self.artifacts.snapshot().len(),
            apps = self.apps.snapshot().len(),
            ingestions = self.ingestions.snapshot().len(),
            "Substrate seeded"
        );
        Ok(())
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            buckets: self.buckets.snapshot(),
            artifacts: self.artifacts.snapshot(),
            apps: self.apps.snapshot(),
            ingestions: self.ingestions.snapshot(),
            routes: self.routes.snapshot(),
        }
    }
}

fn keys<R: Record>(records: &MemoryRecords<R>) -> Vec<ObjectKey> {
    records.snapshot().iter().map(Record::key).collect()
}

/// Adapts an async lookup over a shared store into a watch mapper.
fn mapper<T, E, F, Fut>(target: Arc<T>, lookup: F) -> impl Fn(E) -> Fut + Send + Sync + 'static
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, E) -> Fut + Send + Sync + 'static,
{
    move |event| lookup(target.clone(), event)
}

/// Builds one controller per reconciler, each seeded with the keys it owns.
pub fn controllers(substrate: &Substrate, config: &OperatorConfig) -> Vec<Controller> {
    let settings = Settings {
        scratch_dir: config.scratch_dir.clone(),
        resync_interval: config.resync_interval(),
    };
    let resync = settings.resync_interval;
    let workers = config.workers;
    let gateway = Arc::new(StorageGateway::new(
        substrate.secrets.clone(),
        substrate.config_maps.clone(),
        Arc::new(UrlOpener::new()),
    ));

    let bucket = Controller::new(
        "bucket",
        Arc::new(BucketReconciler::new(
            substrate.buckets.clone(),
            gateway.clone(),
            settings.clone(),
        )),
        workers,
        resync,
    )
    .owns(substrate.buckets.watch())
    .watches(
        substrate.secrets.watch(),
        mapper(substrate.buckets.clone(), |buckets, event: WatchEvent<Secret>| async move {
            buckets_for_secret(buckets.as_ref(), event.record()).await
        }),
    )
    .watches(
        substrate.config_maps.watch(),
        mapper(substrate.buckets.clone(), |buckets, event: WatchEvent<ConfigMap>| async move {
            buckets_for_config_map(buckets.as_ref(), event.record()).await
        }),
    );
    bucket.seed(keys(&substrate.buckets));

    let mut out = vec![bucket];

    let tools = &config.tools;
    for kind in [PackageKind::Android, PackageKind::Apple] {
        let decoder = match kind {
            PackageKind::Android => PackageDecoder::Android(AndroidDecoder::new(
                Arc::new(ApktoolCommand::new(tools.apktool.clone())),
                Arc::new(KeytoolCommand::new(tools.keytool.clone())),
            )),
            PackageKind::Apple => PackageDecoder::Apple(AppleDecoder::new()),
        };
        let controller = Controller::new(
            format!("artifact-{}", kind.extension()),
            Arc::new(ArtifactReconciler::new(
                decoder,
                substrate.artifacts.clone(),
                substrate.buckets.clone(),
                gateway.clone(),
                settings.clone(),
            )),
            workers,
            resync,
        )
        .watches(substrate.artifacts.watch(), move |event: WatchEvent<ArtifactRecord>| async move {
            let artifact = event.record();
            if artifact.kind == kind {
                vec![artifact.key()]
            } else {
                Vec::new()
            }
        })
        .watches(
            substrate.buckets.watch(),
            mapper(substrate.artifacts.clone(), move |artifacts, event: WatchEvent<BucketRecord>| async move {
                artifacts_for_bucket(artifacts.as_ref(), kind, event.record()).await
            }),
        );
        controller.seed(
            substrate
                .artifacts
                .snapshot()
                .iter()
                .filter(|a| a.kind == kind)
                .map(Record::key),
        );
        out.push(controller);
    }

    let provisioner = Arc::new(WellKnownProvisioner::new(
        substrate.config_maps.clone(),
        substrate.routes.clone(),
    ));
    let app = Controller::new(
        "app",
        Arc::new(AppReconciler::new(
            substrate.apps.clone(),
            substrate.artifacts.clone(),
            provisioner,
            settings.clone(),
        )),
        workers,
        resync,
    )
    .owns(substrate.apps.watch())
    .watches(
        substrate.artifacts.watch(),
        mapper(substrate.apps.clone(), |apps, event: WatchEvent<ArtifactRecord>| async move {
            apps_for_artifact(apps.as_ref(), event.record()).await
        }),
    )
    // A route removed behind the operator's back is restored by its app.
    .watches(substrate.routes.watch(), |event: WatchEvent<WellKnownRoute>| async move {
        let meta = event.record().meta();
        match &meta.owner {
            Some(owner) if owner.kind == AppRecord::KIND => {
                vec![ObjectKey::new(&meta.namespace, &owner.name)]
            }
            _ => Vec::new(),
        }
    });
    app.seed(keys(&substrate.apps));
    out.push(app);

    let ingestion = Controller::new(
        "ingestion",
        Arc::new(IngestionReconciler::new(
            substrate.ingestions.clone(),
            substrate.artifacts.clone(),
            substrate.buckets.clone(),
            gateway,
            settings,
        )),
        workers,
        resync,
    )
    .owns(substrate.ingestions.watch())
    .watches(
        substrate.buckets.watch(),
        mapper(substrate.ingestions.clone(), |ingestions, event: WatchEvent<BucketRecord>| async move {
            let bucket = event.record();
            match ingestions.list(&bucket.metadata.namespace).await {
                Ok(all) => all
                    .into_iter()
                    .filter(|i| i.spec.bucket == bucket.metadata.name)
                    .map(|i| i.key())
                    .collect(),
                Err(e) => {
                    error!(error = ?e, "[INGEST][ERROR] failed to list ingestions for watch");
                    Vec::new()
                }
            }
        }),
    );
    ingestion.seed(keys(&substrate.ingestions));
    out.push(ingestion);

    out
}

/// Runs every controller until `cancel` fires.
pub async fn run_controllers(controllers: Vec<Controller>, cancel: CancellationToken) {
    let mut running = JoinSet::new();
    for controller in controllers {
        running.spawn(controller.run(cancel.clone()));
    }
    while running.join_next().await.is_some() {}
}
