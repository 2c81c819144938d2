use app_bucket::load_config::{
    load_config, DEFAULT_NAMESPACE, ENV_APKTOOL, ENV_KEYTOOL, ENV_SCRATCH_DIR,
};
use app_bucket_core::records::PackageKind;
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn clear_overrides() {
    env::remove_var(ENV_APKTOOL);
    env::remove_var(ENV_KEYTOOL);
    env::remove_var(ENV_SCRATCH_DIR);
}

fn config_file(yaml: &str) -> NamedTempFile {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), yaml).unwrap();
    config_file
}

/// An empty document yields every default.
#[tokio::test]
#[serial]
async fn test_load_config_defaults() {
    clear_overrides();
    let config_file = config_file("{}\n");

    let config = load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.workers, 4);
    assert_eq!(config.tools.apktool, "apktool");
    assert_eq!(config.tools.keytool, "keytool");
    assert_eq!(config.scratch_dir, env::temp_dir().join("app-bucket"));
    assert_eq!(
        config.resync_interval(),
        app_bucket_core::controllers::DEFAULT_RESYNC
    );
    assert!(config.records.buckets.is_empty());
}

#[tokio::test]
#[serial]
async fn test_load_config_env_overrides_file() {
    let config_file = config_file(
        r#"
scratch_dir: /var/lib/app-bucket
resync_interval_secs: 30
tools:
  apktool: /opt/apktool/bin/apktool
"#,
    );
    env::set_var(ENV_KEYTOOL, "/usr/lib/jvm/bin/keytool");
    env::set_var(ENV_SCRATCH_DIR, "/tmp/scratch-override");

    let config = load_config(config_file.path()).expect("Config should load");
    clear_overrides();

    assert_eq!(config.tools.apktool, "/opt/apktool/bin/apktool");
    assert_eq!(config.tools.keytool, "/usr/lib/jvm/bin/keytool");
    assert_eq!(config.scratch_dir, PathBuf::from("/tmp/scratch-override"));
    assert_eq!(config.resync_interval(), Duration::from_secs(30));
}

#[tokio::test]
#[serial]
async fn test_load_config_seeds_records_into_default_namespace() {
    clear_overrides();
    let config_file = config_file(
        r#"
records:
  secrets:
    - metadata:
        name: creds
      stringData:
        url: mem://apps
  config_maps:
    - metadata:
        name: settings
        namespace: tenant
      data:
        url: mem://tenant
  buckets:
    - metadata:
        name: bucket
      spec:
        urlFrom:
          secretKeyRef:
            name: creds
            key: url
  artifacts:
    - metadata:
        name: demo-android
        labels:
          app: demo
      kind: android
      spec:
        bucket: bucket
        key: uploads/demo.apk
  apps:
    - metadata:
        name: demo
      spec:
        selector:
          app: demo
        universalLinks:
          host: links.example.com
  ingestions:
    - metadata:
        name: drop
      spec:
        bucket: bucket
        key: uploads/drop.tgz
"#,
    );

    let config = load_config(config_file.path()).expect("Config should load with records");
    let records = &config.records;

    assert_eq!(records.secrets[0].metadata.namespace, DEFAULT_NAMESPACE);
    assert_eq!(records.secrets[0].string_data["url"], "mem://apps");
    assert_eq!(records.config_maps[0].metadata.namespace, "tenant");
    assert_eq!(records.buckets[0].metadata.namespace, DEFAULT_NAMESPACE);
    let secret_ref = records.buckets[0]
        .spec
        .url_from
        .as_ref()
        .and_then(|u| u.secret_key_ref.as_ref())
        .expect("secret reference");
    assert_eq!(secret_ref.name, "creds");
    assert_eq!(records.artifacts[0].kind, PackageKind::Android);
    assert_eq!(records.artifacts[0].spec.key, "uploads/demo.apk");
    assert_eq!(
        records.apps[0]
            .spec
            .universal_links
            .as_ref()
            .map(|l| l.host.as_str()),
        Some("links.example.com")
    );
    assert_eq!(records.ingestions[0].spec.key, "uploads/drop.tgz");
}

#[tokio::test]
#[serial]
async fn test_load_config_rejects_invalid_yaml() {
    clear_overrides();
    let config_file = config_file("workers: [not, a, number\n");

    let err = load_config(config_file.path()).expect_err("Invalid YAML must fail");
    let msg = format!("{err:#}");
    assert!(
        msg.contains("parse") || msg.contains("YAML"),
        "unexpected error: {msg}"
    );
}

#[tokio::test]
#[serial]
async fn test_load_config_rejects_zero_workers() {
    clear_overrides();
    let config_file = config_file("workers: 0\n");

    let err = load_config(config_file.path()).expect_err("Zero workers must fail");
    assert!(err.to_string().contains("workers"));
}

#[tokio::test]
#[serial]
async fn test_load_config_missing_file() {
    clear_overrides();
    let err = load_config("definitely/not/here.yaml").expect_err("Missing file must fail");
    assert!(err.to_string().contains("read"));
}
