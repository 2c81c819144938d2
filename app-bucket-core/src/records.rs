//! Declarative records reconciled by the controllers.
//!
//! Every record is metadata + spec + status. Spec is written by users (or by the
//! ingestion reconciler for the artifacts it owns); status is written only by the
//! record's own reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Finalizer token placed on artifacts that own derived icon objects.
pub const FINALIZER: &str = "app-bucket.dev/icons";

/// Annotation that bypasses the digest gate for one pass.
pub const ANNOTATION_FORCE_UNPACK: &str = "app-bucket.dev/force-unpack";

/// Namespace + name identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_owned_by(&self, kind: &str, name: &str) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.kind == kind && o.name == name)
    }
}

/// Coarse lifecycle summary of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    pub observed_generation: i64,
}

/// Equality-based label selector. An empty selector matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Shape shared by every record kind the substrate stores.
pub trait Record: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    /// True if the user-owned part of the record is equal.
    fn same_spec(&self, other: &Self) -> bool;
    /// Copies the observed-state part of `other` into `self`.
    fn take_status_from(&mut self, other: &Self);

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

macro_rules! record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn same_spec(&self, other: &Self) -> bool {
                self.spec == other.spec
            }

            fn take_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        }
    };
}

// ---- Bucket ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

/// Indirect source of a bucket URL. Exactly one reference must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_from: Option<UrlSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub metadata: ObjectMeta,
    pub spec: BucketSpec,
    #[serde(default)]
    pub status: BucketStatus,
}

record!(BucketRecord, "Bucket");

// ---- Artifacts ----

/// The two package formats the system distributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Android,
    Apple,
}

impl PackageKind {
    /// Short upper-case label used in condition types, e.g. `GetAPK`.
    pub fn label(self) -> &'static str {
        match self {
            PackageKind::Android => "APK",
            PackageKind::Apple => "IPA",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            PackageKind::Android => "apk",
            PackageKind::Apple => "ipa",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            PackageKind::Android => "application/vnd.android.package-archive",
            PackageKind::Apple => "application/octet-stream",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        if ext.eq_ignore_ascii_case("apk") {
            Some(PackageKind::Android)
        } else if ext.eq_ignore_ascii_case("ipa") {
            Some(PackageKind::Apple)
        } else {
            None
        }
    }

    pub fn get_condition(self) -> String {
        format!("Get{}", self.label())
    }

    pub fn unpack_condition(self) -> String {
        format!("Unpack{}", self.label())
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconRef {
    pub key: String,
    pub size: u32,
}

/// Icons supplied up front. An override always wins over best-fit selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<IconRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_size: Option<IconRef>,
}

impl IconOverrides {
    pub fn is_empty(&self) -> bool {
        self.display.is_none() && self.full_size.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.display.is_some() && self.full_size.is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        [&self.display, &self.full_size]
            .into_iter()
            .flatten()
            .any(|r| r.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    /// Name of a bucket record in the same namespace.
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "IconOverrides::is_empty")]
    pub icons: IconOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconEntry {
    pub key: String,
    pub size: u32,
    #[serde(default)]
    pub display: bool,
    #[serde(default)]
    pub full_size: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Package name (Android) or bundle identifier (Apple).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identifier: String,
    /// SHA-256 signing certificate fingerprint, Android only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Bundle display name, Apple only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<IconEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub metadata: ObjectMeta,
    pub kind: PackageKind,
    pub spec: ArtifactSpec,
    #[serde(default)]
    pub status: ArtifactStatus,
}

impl Record for ArtifactRecord {
    const KIND: &'static str = "Artifact";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.kind == other.kind && self.spec == other.spec
    }

    fn take_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

// ---- Aggregator ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniversalLinks {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<IssuerRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal_links: Option<UniversalLinks>,
}

/// Projection of one Ready artifact into its aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub latest: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub android: Vec<Release>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apple: Vec<Release>,
    /// Package name to the set of signing fingerprints seen for it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub asset_link_targets: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub bundle_identifiers: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub metadata: ObjectMeta,
    pub spec: AppSpec,
    #[serde(default)]
    pub status: AppStatus,
}

record!(AppRecord, "App");

// ---- Ingestion ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSpec {
    pub bucket: String,
    /// Key of a gzip-compressed tar bundle.
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Digest of the last bundle that was fully ingested.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub metadata: ObjectMeta,
    pub spec: IngestionSpec,
    #[serde(default)]
    pub status: IngestionStatus,
}

record!(IngestionRecord, "Ingestion");

// ---- Credential sources ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

macro_rules! data_record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn same_spec(&self, other: &Self) -> bool {
                self.data == other.data
            }

            fn take_status_from(&mut self, _other: &Self) {}
        }
    };
}

data_record!(Secret, "Secret");
data_record!(ConfigMap, "ConfigMap");

// ---- Delivery ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub host: String,
    /// Config map holding the rendered documents.
    pub config_map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<IssuerRef>,
    pub paths: Vec<String>,
}

/// Static serving + routing of the well-known association documents for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellKnownRoute {
    pub metadata: ObjectMeta,
    pub spec: RouteSpec,
}

impl Record for WellKnownRoute {
    const KIND: &'static str = "WellKnownRoute";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn take_status_from(&mut self, _other: &Self) {}
}
