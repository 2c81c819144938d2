use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{canonical_version, is_raster, DecodedPackage, IconCandidate};
use crate::contract::{CertInspector, UnpackTool};
use crate::error::DecodeError;
use crate::tools::parse_sha256_fingerprint;

const MANIFEST: &str = "AndroidManifest.xml";
const METADATA: &str = "apktool.yml";
const DEFAULT_ICON: &str = "ic_launcher";

/// Decodes Android packages with an external unpack tool and certificate
/// inspector.
pub struct AndroidDecoder {
    unpack: Arc<dyn UnpackTool>,
    certs: Arc<dyn CertInspector>,
}

impl AndroidDecoder {
    pub fn new(unpack: Arc<dyn UnpackTool>, certs: Arc<dyn CertInspector>) -> Self {
        Self { unpack, certs }
    }

    pub(super) async fn decode(
        &self,
        package: &Path,
        scratch_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<DecodedPackage, DecodeError> {
        let unpacked = tempfile::Builder::new()
            .prefix("apk-")
            .tempdir_in(scratch_dir)
            .map_err(|e| DecodeError::new("CreateTemp", e))?;

        self.unpack
            .unpack(package, unpacked.path(), cancel)
            .await
            .map_err(|e| DecodeError::new("Apktool", e))?;
        debug!(dir = %unpacked.path().display(), "[APK] unpacked");

        let manifest = tokio::fs::read_to_string(unpacked.path().join(MANIFEST))
            .await
            .map_err(|e| DecodeError::new("ReadManifest", e))?;
        let manifest = parse_manifest(&manifest)?;

        let metadata = tokio::fs::read_to_string(unpacked.path().join(METADATA))
            .await
            .map_err(|e| DecodeError::new("ReadMetadata", e))?;
        let version = parse_version_info(&metadata)?;

        let report = self
            .certs
            .inspect(package, cancel)
            .await
            .map_err(|e| DecodeError::new("Keytool", e))?;
        let fingerprint = parse_sha256_fingerprint(&report).ok_or_else(|| {
            DecodeError::new("Keytool", "sha256 cert fingerprint not found")
        })?;

        let root = unpacked.path().to_path_buf();
        let icon_names = manifest.icon_names.clone();
        let paths = tokio::task::spawn_blocking(move || find_icons(&root, &icon_names))
            .await
            .map_err(|e| DecodeError::new("Icons", e))?
            .map_err(|e| DecodeError::new("Icons", e))?;

        info!(
            package = %manifest.package,
            version = %version,
            icons = paths.len(),
            "[APK] decoded"
        );

        Ok(DecodedPackage {
            version,
            identifier: manifest.package,
            fingerprint: Some(fingerprint),
            bundle_name: None,
            icons: Box::new(UnpackedIcons {
                dir: unpacked,
                paths: paths.into_iter(),
            }),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Manifest {
    package: String,
    /// Leaf names of the application's `icon` and `roundIcon` resources.
    icon_names: BTreeSet<String>,
}

fn parse_manifest(xml: &str) -> Result<Manifest, DecodeError> {
    let step = "ReadManifest";
    let mut reader = Reader::from_str(xml);
    let mut package = None;
    let mut icon_names = BTreeSet::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"manifest" => {
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| DecodeError::new(step, e))?;
                        if attr.key.local_name().as_ref() == b"package" {
                            let value = attr.unescape_value().map_err(|e| DecodeError::new(step, e))?;
                            package = Some(value.into_owned());
                        }
                    }
                }
                b"application" => {
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| DecodeError::new(step, e))?;
                        let local = attr.key.local_name();
                        if local.as_ref() == b"icon" || local.as_ref() == b"roundIcon" {
                            let value = attr.unescape_value().map_err(|e| DecodeError::new(step, e))?;
                            let leaf = value.rsplit('/').next().unwrap_or_default();
                            if !leaf.is_empty() {
                                icon_names.insert(leaf.to_string());
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(DecodeError::new(step, e)),
        }
    }

    let package = package
        .filter(|p| !p.is_empty())
        .ok_or_else(|| DecodeError::new(step, "manifest declares no package"))?;
    if icon_names.is_empty() {
        icon_names.insert(DEFAULT_ICON.to_string());
    }
    Ok(Manifest {
        package,
        icon_names,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApktoolMetadata {
    #[serde(default)]
    version_info: Option<VersionInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    #[serde(default)]
    version_code: Option<serde_yaml::Value>,
    #[serde(default)]
    version_name: Option<serde_yaml::Value>,
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    let s = match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(s).filter(|s| !s.trim().is_empty())
}

/// Version name from `apktool.yml`, falling back to the version code.
fn parse_version_info(yaml: &str) -> Result<String, DecodeError> {
    let step = "ReadMetadata";
    // apktool prefixes the document with a Java class tag.
    let body: String = yaml
        .lines()
        .filter(|l| !l.trim_start().starts_with("!!"))
        .collect::<Vec<_>>()
        .join("\n");
    let metadata: ApktoolMetadata =
        serde_yaml::from_str(&body).map_err(|e| DecodeError::new(step, e))?;

    let info = metadata.version_info.unwrap_or_default();
    let raw = info
        .version_name
        .as_ref()
        .and_then(scalar)
        .or_else(|| info.version_code.as_ref().and_then(scalar))
        .ok_or_else(|| DecodeError::new(step, "no versionName or versionCode"))?;
    Ok(canonical_version(&raw))
}

fn find_icons(root: &Path, names: &BTreeSet<String>) -> io::Result<Vec<PathBuf>> {
    fn visit_dir(dir: &Path, names: &BTreeSet<String>, out: &mut Vec<PathBuf>) -> io::Result<()> {
        let mut entries = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        for path in entries {
            if path.is_dir() {
                visit_dir(&path, names, out)?;
            } else if path.to_str().is_some_and(is_raster)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| names.contains(stem))
            {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit_dir(root, names, &mut out)?;
    Ok(out)
}

/// Icon files read lazily from the unpacked tree, which is removed on drop.
struct UnpackedIcons {
    dir: TempDir,
    paths: std::vec::IntoIter<PathBuf>,
}

impl Iterator for UnpackedIcons {
    type Item = io::Result<IconCandidate>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        let name = path
            .strip_prefix(self.dir.path())
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        Some(std::fs::read(&path).map(|bytes| IconCandidate { name, bytes }))
    }
}
