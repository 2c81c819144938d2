#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use app_bucket_core::blob::{MemoryStore, UrlOpener};
use app_bucket_core::contract::{MockCertInspector, MockUnpackTool, Records};
use app_bucket_core::controllers::Settings;
use app_bucket_core::gateway::StorageGateway;
use app_bucket_core::records::{
    ArtifactRecord, ArtifactSpec, ArtifactStatus, BucketRecord, BucketSpec, BucketStatus,
    ConfigMap, ObjectMeta, PackageKind, Phase, Secret,
};
use app_bucket_core::substrate::MemoryRecords;

pub const NS: &str = "default";
pub const STORE: &str = "apps";

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

pub const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>com.example.demo</string>
    <key>CFBundleName</key>
    <string>Demo</string>
    <key>CFBundleShortVersionString</key>
    <string>1.2</string>
    <key>CFBundleVersion</key>
    <string>42</string>
</dict>
</plist>
"#;

/// A zip archive with the given entries, in order.
pub fn zip_of(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// An IPA with an Info.plist, two square icons and one non-square image.
pub fn ipa() -> Vec<u8> {
    zip_of(&[
        ("Payload/Demo.app/Info.plist", INFO_PLIST.as_bytes().to_vec()),
        ("Payload/Demo.app/AppIcon64.png", png(64, 64)),
        ("Payload/Demo.app/Launch.png", png(57, 114)),
        ("Payload/Demo.app/AppIcon512.png", png(512, 512)),
    ])
}

/// A gzip-compressed tar with the given entries, in order.
pub fn tgz_of(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, path, bytes.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn ready_bucket(name: &str) -> BucketRecord {
    BucketRecord {
        metadata: ObjectMeta::new(NS, name),
        spec: BucketSpec {
            url: Some(format!("mem://{STORE}")),
            url_from: None,
        },
        status: BucketStatus {
            phase: Phase::Ready,
            conditions: Vec::new(),
        },
    }
}

pub fn artifact(name: &str, kind: PackageKind, key: &str) -> ArtifactRecord {
    ArtifactRecord {
        metadata: ObjectMeta::new(NS, name),
        kind,
        spec: ArtifactSpec {
            bucket: "bucket".into(),
            key: key.into(),
            icons: Default::default(),
        },
        status: ArtifactStatus::default(),
    }
}

/// Record stores, an opener with a shared `mem://apps` store and a gateway over them.
pub struct Harness {
    pub secrets: Arc<MemoryRecords<Secret>>,
    pub config_maps: Arc<MemoryRecords<ConfigMap>>,
    pub buckets: Arc<MemoryRecords<BucketRecord>>,
    pub artifacts: Arc<MemoryRecords<ArtifactRecord>>,
    pub opener: UrlOpener,
    pub gateway: Arc<StorageGateway>,
    pub settings: Settings,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let secrets = Arc::new(MemoryRecords::new());
        let config_maps = Arc::new(MemoryRecords::new());
        let buckets = Arc::new(MemoryRecords::new());
        let artifacts = Arc::new(MemoryRecords::new());
        let opener = UrlOpener::new();
        let gateway = Arc::new(StorageGateway::new(
            secrets.clone(),
            config_maps.clone(),
            Arc::new(opener.clone()),
        ));
        let scratch = tempfile::tempdir().unwrap();
        let settings = Settings {
            scratch_dir: scratch.path().to_path_buf(),
            resync_interval: Duration::from_secs(60),
        };
        buckets.create(ready_bucket("bucket")).await.unwrap();
        Self {
            secrets,
            config_maps,
            buckets,
            artifacts,
            opener,
            gateway,
            settings,
            scratch,
        }
    }

    pub fn store(&self) -> MemoryStore {
        self.opener.memory(STORE)
    }

    /// Entries left in the scratch directory.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch.path()).unwrap().count()
    }
}

pub const APKTOOL_YML: &str = "!!brut.androlib.meta.MetaInfo\nversion: 2.9.3\nversionInfo:\n  versionCode: '12'\n  versionName: 3.1\n";
pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.demo">
    <application android:icon="@mipmap/ic_launcher"/>
</manifest>"#;
pub const KEYTOOL_REPORT: &str = "Signer #1:\n\nCertificate fingerprints:\n\t SHA1: AA:BB\n\t SHA256: 12:34:56:78:9A\nSignature algorithm name: SHA256withRSA\n";

/// An unpack tool that lays out a minimal apktool tree with two launcher icons.
pub fn unpack_tool() -> MockUnpackTool {
    let mut unpack = MockUnpackTool::new();
    unpack.expect_unpack().returning(|_, out, _| {
        std::fs::write(out.join("AndroidManifest.xml"), MANIFEST).unwrap();
        std::fs::write(out.join("apktool.yml"), APKTOOL_YML).unwrap();
        for (dir, size) in [("mipmap-hdpi", 72), ("mipmap-xxxhdpi", 192)] {
            let dir = out.join("res").join(dir);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("ic_launcher.png"), png(size, size)).unwrap();
        }
        Ok(())
    });
    unpack
}

pub fn cert_inspector() -> MockCertInspector {
    let mut certs = MockCertInspector::new();
    certs
        .expect_inspect()
        .returning(|_, _| Ok(KEYTOOL_REPORT.to_string()));
    certs
}
