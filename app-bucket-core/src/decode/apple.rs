use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zip::ZipArchive;

use super::{canonical_version, is_raster, DecodedPackage, IconCandidate};
use crate::error::DecodeError;

const INFO_PLIST: &str = "Info.plist";

/// Upper bounds on bytes read from one archive entry, whatever its header claims.
const MAX_PLIST_BYTES: u64 = 4 * 1024 * 1024;
const MAX_ICON_BYTES: u64 = 32 * 1024 * 1024;

/// Decodes Apple packages by reading the zip archive in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppleDecoder;

impl AppleDecoder {
    pub fn new() -> Self {
        Self
    }

    pub(super) async fn decode(
        &self,
        package: &Path,
        cancel: &CancellationToken,
    ) -> Result<DecodedPackage, DecodeError> {
        if cancel.is_cancelled() {
            return Err(DecodeError::new("OpenArchive", "cancelled"));
        }
        let package = package.to_path_buf();
        let decoded = tokio::task::spawn_blocking(move || decode_blocking(&package))
            .await
            .map_err(|e| DecodeError::new("OpenArchive", e))??;

        info!(
            bundle = %decoded.identifier,
            version = %decoded.version,
            "[IPA] decoded"
        );
        Ok(decoded)
    }
}

#[derive(Debug, Default, Deserialize)]
struct InfoPlist {
    #[serde(rename = "CFBundleIdentifier", default)]
    bundle_identifier: Option<String>,
    #[serde(rename = "CFBundleDisplayName", default)]
    bundle_display_name: Option<String>,
    #[serde(rename = "CFBundleName", default)]
    bundle_name: Option<String>,
    #[serde(rename = "CFBundleShortVersionString", default)]
    short_version: Option<String>,
    #[serde(rename = "CFBundleVersion", default)]
    bundle_version: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn decode_blocking(package: &Path) -> Result<DecodedPackage, DecodeError> {
    let file = File::open(package).map_err(|e| DecodeError::new("OpenArchive", e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| DecodeError::new("OpenArchive", e))?;

    let names: Vec<Option<String>> = (0..archive.len())
        .map(|i| archive.by_index_raw(i).ok().map(|e| e.name().to_string()))
        .collect();

    let plist_index = names
        .iter()
        .position(|n| n.as_deref().is_some_and(is_bundle_info_plist))
        .ok_or_else(|| DecodeError::new("InfoPlist", "Info.plist not found in .ipa"))?;

    let entry = archive
        .by_index(plist_index)
        .map_err(|e| DecodeError::new("InfoPlist", e))?;
    let bytes = read_capped(entry, MAX_PLIST_BYTES).map_err(|e| DecodeError::new("InfoPlist", e))?;
    let info: InfoPlist = plist::from_bytes(&bytes).map_err(|e| DecodeError::new("InfoPlist", e))?;

    let identifier = non_empty(info.bundle_identifier)
        .ok_or_else(|| DecodeError::new("InfoPlist", "missing CFBundleIdentifier"))?;
    let version = non_empty(info.short_version)
        .or(non_empty(info.bundle_version))
        .map(|v| canonical_version(&v))
        .ok_or_else(|| DecodeError::new("InfoPlist", "missing CFBundleShortVersionString"))?;
    let bundle_name = non_empty(info.bundle_display_name).or(non_empty(info.bundle_name));

    let indices: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| {
            n.as_deref()
                .is_some_and(|name| !name.ends_with('/') && is_raster(name))
        })
        .map(|(i, _)| i)
        .collect();

    Ok(DecodedPackage {
        version,
        identifier,
        fingerprint: None,
        bundle_name,
        icons: Box::new(ArchiveIcons {
            archive,
            indices: indices.into_iter(),
        }),
    })
}

/// `Payload/<Name>.app/Info.plist`, matched case-insensitively.
fn is_bundle_info_plist(name: &str) -> bool {
    let parts: Vec<&str> = name.split('/').collect();
    matches!(
        parts.as_slice(),
        [payload, bundle, file]
            if payload.eq_ignore_ascii_case("Payload")
                && bundle.to_ascii_lowercase().ends_with(".app")
                && file.eq_ignore_ascii_case(INFO_PLIST)
    )
}

/// Raster entries of the archive in index order.
struct ArchiveIcons {
    archive: ZipArchive<File>,
    indices: std::vec::IntoIter<usize>,
}

impl Iterator for ArchiveIcons {
    type Item = io::Result<IconCandidate>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.indices.next()?;
        Some(read_entry(&mut self.archive, index))
    }
}

fn read_entry(archive: &mut ZipArchive<File>, index: usize) -> io::Result<IconCandidate> {
    let entry = archive.by_index(index).map_err(io::Error::other)?;
    let name = entry.name().to_string();
    let bytes = read_capped(entry, MAX_ICON_BYTES)
        .map_err(|e| io::Error::new(e.kind(), format!("{name}: {e}")))?;
    Ok(IconCandidate { name, bytes })
}

/// Reads at most `limit` bytes, failing if the reader holds more.
fn read_capped(reader: impl Read, limit: u64) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.take(limit + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("entry exceeds {limit} bytes"),
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_top_level_bundle_plists_match() {
        assert!(is_bundle_info_plist("Payload/Example.app/Info.plist"));
        assert!(is_bundle_info_plist("Payload/Example.app/info.PLIST"));
        assert!(!is_bundle_info_plist(
            "Payload/Example.app/Frameworks/Kit.framework/Info.plist"
        ));
        assert!(!is_bundle_info_plist("Info.plist"));
    }

    #[test]
    fn oversized_entries_are_rejected() {
        assert_eq!(read_capped(&b"12345"[..], 5).unwrap(), b"12345");
        let err = read_capped(&b"123456"[..], 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
