/// `load_config` module: reads the operator's YAML config and applies environment overrides.
///
/// This is the only place where user-supplied YAML is parsed. The result is an
/// [`OperatorConfig`]: scheduler and scratch settings, the external tool
/// programs, and the records seeded into the in-process substrate on startup.
///
/// # Environment
/// - `APP_BUCKET_APKTOOL` / `APP_BUCKET_KEYTOOL` override the tool programs.
/// - `APP_BUCKET_SCRATCH_DIR` overrides the scratch directory.
///
/// # Errors
/// Every failure is an `anyhow::Error` carrying the config path, surfaced at the CLI boundary.
use anyhow::{Context, Result};
use app_bucket_core::records::{
    AppRecord, ArtifactRecord, BucketRecord, ConfigMap, IngestionRecord, ObjectMeta, Record,
    Secret,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

pub const ENV_APKTOOL: &str = "APP_BUCKET_APKTOOL";
pub const ENV_KEYTOOL: &str = "APP_BUCKET_KEYTOOL";
pub const ENV_SCRATCH_DIR: &str = "APP_BUCKET_SCRATCH_DIR";

/// Namespace given to seeded records that do not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub records: RecordsSection,
}

impl OperatorConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_apktool")]
    pub apktool: String,
    #[serde(default = "default_keytool")]
    pub keytool: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            apktool: default_apktool(),
            keytool: default_keytool(),
        }
    }
}

/// Secrets are written with string values in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSecret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
}

impl From<SeedSecret> for Secret {
    fn from(seed: SeedSecret) -> Self {
        Secret {
            metadata: seed.metadata,
            data: seed
                .string_data
                .into_iter()
                .map(|(k, v)| (k, v.into_bytes()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordsSection {
    #[serde(default)]
    pub secrets: Vec<SeedSecret>,
    #[serde(default)]
    pub config_maps: Vec<ConfigMap>,
    #[serde(default)]
    pub buckets: Vec<BucketRecord>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub apps: Vec<AppRecord>,
    #[serde(default)]
    pub ingestions: Vec<IngestionRecord>,
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("app-bucket")
}

fn default_resync_interval_secs() -> u64 {
    app_bucket_core::controllers::DEFAULT_RESYNC.as_secs()
}

fn default_workers() -> usize {
    4
}

fn default_apktool() -> String {
    "apktool".to_string()
}

fn default_keytool() -> String {
    "keytool".to_string()
}

fn default_namespace<R: Record>(records: &mut [R]) {
    for record in records {
        let meta = record.meta_mut();
        if meta.namespace.is_empty() {
            meta.namespace = DEFAULT_NAMESPACE.to_string();
        }
    }
}

/// Loads the operator config from `path`, then applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OperatorConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = fs::read_to_string(path_ref)
        .inspect_err(|e| error!(error = ?e, config_path = ?path_ref, "Failed to read config file"))
        .with_context(|| format!("Failed to read config file {path_ref:?}"))?;

    let mut config: OperatorConfig = serde_yaml::from_str(&config_content)
        .inspect_err(|e| error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML"))
        .with_context(|| format!("Failed to parse config YAML {path_ref:?}"))?;
    info!(config_path = ?path_ref, "Parsed config YAML successfully");

    if let Ok(apktool) = std::env::var(ENV_APKTOOL) {
        info!(apktool = %apktool, "apktool overridden from environment");
        config.tools.apktool = apktool;
    }
    if let Ok(keytool) = std::env::var(ENV_KEYTOOL) {
        info!(keytool = %keytool, "keytool overridden from environment");
        config.tools.keytool = keytool;
    }
    if let Ok(dir) = std::env::var(ENV_SCRATCH_DIR) {
        info!(scratch_dir = %dir, "scratch directory overridden from environment");
        config.scratch_dir = PathBuf::from(dir);
    }

    if config.workers == 0 {
        anyhow::bail!("workers must be at least 1 in {path_ref:?}");
    }

    let records = &mut config.records;
    for secret in &mut records.secrets {
        if secret.metadata.namespace.is_empty() {
            secret.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }
    }
    default_namespace(&mut records.config_maps);
    default_namespace(&mut records.buckets);
    default_namespace(&mut records.artifacts);
    default_namespace(&mut records.apps);
    default_namespace(&mut records.ingestions);

    Ok(config)
}
