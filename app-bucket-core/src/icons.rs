//! Icon normalization and best-fit role selection.

use std::io::Cursor;
use std::path::Path;

use image::ImageFormat;
use tracing::{debug, warn};

use crate::decode::IconCandidates;
use crate::error::DecodeError;
use crate::records::{IconEntry, IconOverrides, ObjectMeta};

/// Target edge length for the display role.
pub const DISPLAY_PX: u32 = 57;

/// Target edge length for the full-size role.
pub const FULL_SIZE_PX: u32 = 512;

/// A square candidate re-encoded as PNG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIcon {
    pub source: String,
    pub size: u32,
    pub png: Vec<u8>,
}

/// Decodes `bytes` and re-encodes it as PNG, returning `(width, height, png)`.
pub fn reencode_png(bytes: &[u8]) -> Result<(u32, u32, Vec<u8>), image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok((img.width(), img.height(), png))
}

/// Like [`reencode_png`], but non-square images yield `None`.
pub fn normalize(bytes: &[u8]) -> Result<Option<(u32, Vec<u8>)>, image::ImageError> {
    let (width, height, png) = reencode_png(bytes)?;
    if width != height {
        return Ok(None);
    }
    Ok(Some((height, png)))
}

/// Drains the decoder's candidates in order, keeping square decodable images.
///
/// Candidates that are not decodable images are skipped; a failure reading the
/// candidate sequence itself fails the whole extraction.
pub fn normalize_all(candidates: IconCandidates) -> Result<Vec<NormalizedIcon>, DecodeError> {
    let mut icons = Vec::new();
    for candidate in candidates {
        let candidate = candidate.map_err(|e| DecodeError::new("Icons", e))?;
        match normalize(&candidate.bytes) {
            Ok(Some((size, png))) => icons.push(NormalizedIcon {
                source: candidate.name,
                size,
                png,
            }),
            Ok(None) => debug!(source = %candidate.name, "skipping non-square icon"),
            Err(e) => warn!(source = %candidate.name, error = %e, "skipping undecodable icon"),
        }
    }
    Ok(icons)
}

/// Storage key of an icon derivative:
/// `<dir of artifact key>/<namespace>/<name>/<source stem>-<h>x<w>.png`.
pub fn icon_key(artifact_key: &str, meta: &ObjectMeta, source: &str, size: u32) -> String {
    let stem = Path::new(source)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "icon".to_string());
    let file = format!("{stem}-{size}x{size}.png");

    let dir = artifact_key.rsplit_once('/').map(|(dir, _)| dir);
    [dir, Some(meta.namespace.as_str()), Some(meta.name.as_str()), Some(file.as_str())]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Index of the entry whose size is closest to `target`. On equal distance
/// the earlier entry wins.
pub fn select_best_fit(entries: &[IconEntry], target: u32) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (i, entry) in entries.iter().enumerate() {
        let margin = entry.size.abs_diff(target);
        if best.map_or(true, |(_, m)| margin < m) {
            best = Some((i, margin));
        }
    }
    best.map(|(i, _)| i)
}

/// Marks best-fit roles on extracted entries and appends override entries.
/// A role carried by an override is never best-fit selected.
pub fn assign_roles(mut entries: Vec<IconEntry>, overrides: &IconOverrides) -> Vec<IconEntry> {
    if overrides.display.is_none() {
        if let Some(i) = select_best_fit(&entries, DISPLAY_PX) {
            entries[i].display = true;
        }
    }
    if overrides.full_size.is_none() {
        if let Some(i) = select_best_fit(&entries, FULL_SIZE_PX) {
            entries[i].full_size = true;
        }
    }

    if let Some(display) = &overrides.display {
        entries.push(IconEntry {
            key: display.key.clone(),
            size: display.size,
            display: true,
            full_size: false,
        });
    }
    if let Some(full_size) = &overrides.full_size {
        match entries.iter_mut().find(|e| e.key == full_size.key) {
            Some(entry) => entry.full_size = true,
            None => entries.push(IconEntry {
                key: full_size.key.clone(),
                size: full_size.size,
                display: false,
                full_size: true,
            }),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::IconRef;
    use image::{DynamicImage, RgbaImage};

    fn entries(sizes: &[u32]) -> Vec<IconEntry> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| IconEntry {
                key: format!("icon-{i}"),
                size,
                ..Default::default()
            })
            .collect()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn best_fit_picks_smallest_margin() {
        let icons = entries(&[16, 32, 48, 64, 128, 512]);
        assert_eq!(icons[select_best_fit(&icons, DISPLAY_PX).unwrap()].size, 64);
        assert_eq!(icons[select_best_fit(&icons, FULL_SIZE_PX).unwrap()].size, 512);
    }

    #[test]
    fn best_fit_keeps_first_on_tie() {
        let icons = entries(&[60, 60]);
        assert_eq!(select_best_fit(&icons, DISPLAY_PX), Some(0));

        let marked = assign_roles(icons, &IconOverrides::default());
        assert!(marked[0].display);
        assert!(!marked[1].display);
    }

    #[test]
    fn best_fit_of_nothing_marks_nothing() {
        assert_eq!(select_best_fit(&[], DISPLAY_PX), None);
        assert!(assign_roles(Vec::new(), &IconOverrides::default()).is_empty());
    }

    #[test]
    fn overridden_role_is_not_selected() {
        let overrides = IconOverrides {
            display: Some(IconRef {
                key: "uploads/display.png".to_string(),
                size: 57,
            }),
            full_size: None,
        };
        let marked = assign_roles(entries(&[57, 512]), &overrides);

        assert!(!marked[0].display);
        assert!(marked[1].full_size);
        let display: Vec<_> = marked.iter().filter(|e| e.display).collect();
        assert_eq!(display.len(), 1);
        assert_eq!(display[0].key, "uploads/display.png");
    }

    #[test]
    fn non_square_candidates_are_dropped() {
        assert!(normalize(&png(57, 114)).unwrap().is_none());
        let (size, bytes) = normalize(&png(64, 64)).unwrap().unwrap();
        assert_eq!(size, 64);
        assert!(bytes.starts_with(b"\x89PNG"));
    }

    #[test]
    fn icon_keys_are_derived_from_record_and_source() {
        let meta = ObjectMeta::new("default", "my-app");
        assert_eq!(
            icon_key("apps/v1/app.apk", &meta, "res/mipmap-hdpi/IC_Launcher.png", 72),
            "apps/v1/default/my-app/ic_launcher-72x72.png"
        );
        assert_eq!(
            icon_key("app.ipa", &meta, "AppIcon60x60@2x.png", 120),
            "default/my-app/appicon60x60@2x-120x120.png"
        );
    }
}
