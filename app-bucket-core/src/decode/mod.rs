//! Format decoders for the two package kinds.
//!
//! A decoder reads a local copy of a package and returns its metadata plus a
//! lazy, ordered sequence of candidate icon images. The kind set is closed, so
//! dispatch goes through the [`PackageDecoder`] enum rather than a trait object.

mod android;
mod apple;

use std::io;
use std::path::Path;

use tokio_util::sync::CancellationToken;

pub use android::AndroidDecoder;
pub use apple::AppleDecoder;

use crate::error::DecodeError;
use crate::records::PackageKind;

/// One raster image found inside a package.
#[derive(Debug, Clone)]
pub struct IconCandidate {
    /// Path of the image inside the package.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Candidates in decoder order. The iterator owns whatever scratch state it
/// reads from and may block, so drain it on a blocking thread.
pub type IconCandidates = Box<dyn Iterator<Item = io::Result<IconCandidate>> + Send>;

pub struct DecodedPackage {
    pub version: String,
    /// Package name (Android) or bundle identifier (Apple).
    pub identifier: String,
    pub fingerprint: Option<String>,
    pub bundle_name: Option<String>,
    pub icons: IconCandidates,
}

impl std::fmt::Debug for DecodedPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedPackage")
            .field("version", &self.version)
            .field("identifier", &self.identifier)
            .field("fingerprint", &self.fingerprint)
            .field("bundle_name", &self.bundle_name)
            .finish_non_exhaustive()
    }
}

pub enum PackageDecoder {
    Android(AndroidDecoder),
    Apple(AppleDecoder),
}

impl PackageDecoder {
    pub fn kind(&self) -> PackageKind {
        match self {
            PackageDecoder::Android(_) => PackageKind::Android,
            PackageDecoder::Apple(_) => PackageKind::Apple,
        }
    }

    /// Decodes the package at `package`. Unpacked state lives under
    /// `scratch_dir` and is removed once the returned icons are dropped.
    pub async fn decode(
        &self,
        package: &Path,
        scratch_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<DecodedPackage, DecodeError> {
        match self {
            PackageDecoder::Android(d) => d.decode(package, scratch_dir, cancel).await,
            PackageDecoder::Apple(d) => d.decode(package, cancel).await,
        }
    }
}

/// Normalizes a version string to canonical `vMAJOR.MINOR.PATCH[-PRE]` form.
///
/// Missing minor and patch components become `0` and build metadata is
/// dropped. Strings that are not versions are returned unchanged.
pub fn canonical_version(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
    let body = body.split_once('+').map_or(body, |(v, _)| v);
    let (core, pre) = match body.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (body, None),
    };

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return raw.to_string();
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    let mut candidate = parts.join(".");
    if let Some(pre) = pre {
        candidate.push('-');
        candidate.push_str(pre);
    }

    match semver::Version::parse(&candidate) {
        Ok(v) => format!("v{v}"),
        Err(_) => raw.to_string(),
    }
}

/// Parses a canonical version for ordering. Non-canonical strings yield `None`.
pub fn parse_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(version.strip_prefix('v')?).ok()
}

fn is_raster(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ["png", "jpg", "jpeg"].iter().any(|x| e.eq_ignore_ascii_case(x)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_versions() {
        assert_eq!(canonical_version("1.2"), "v1.2.0");
        assert_eq!(canonical_version("3"), "v3.0.0");
        assert_eq!(canonical_version("v1.2.3"), "v1.2.3");
        assert_eq!(canonical_version("1.0.0-rc.1+abc"), "v1.0.0-rc.1");
        assert_eq!(canonical_version(" V2.1 "), "v2.1.0");
    }

    #[test]
    fn keeps_unparseable_versions_verbatim() {
        assert_eq!(canonical_version("nightly"), "nightly");
        assert_eq!(canonical_version("1.2.3.4"), "1.2.3.4");
        assert_eq!(parse_version("nightly"), None);
        assert_eq!(parse_version("v1.2.0"), Some(semver::Version::new(1, 2, 0)));
    }

    #[test]
    fn raster_extensions_are_case_insensitive() {
        assert!(is_raster("res/mipmap-hdpi/ic_launcher.PNG"));
        assert!(is_raster("a.jpeg"));
        assert!(!is_raster("res/mipmap-anydpi-v26/ic_launcher.xml"));
    }
}
