use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use tempfile::{NamedTempFile, TempDir};

/// A config seeding one literal in-memory bucket and one referencing a secret.
fn create_minimal_config(scratch: &TempDir) -> NamedTempFile {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    let yaml = format!(
        r#"scratch_dir: {scratch}
workers: 2
records:
  secrets:
    - metadata:
        name: store-credentials
      stringData:
        url: mem://from-secret
  buckets:
    - metadata:
        name: literal
      spec:
        url: mem://apps
    - metadata:
        name: from-secret
      spec:
        urlFrom:
          secretKeyRef:
            name: store-credentials
            key: url
"#,
        scratch = scratch.path().display()
    );
    write(config.path(), yaml).expect("Writing temp config failed");
    config
}

#[test]
fn reconcile_cli_reports_ready_buckets() {
    let scratch = TempDir::new().expect("temp scratch dir");
    let config = create_minimal_config(&scratch);
    let mut cmd = Command::cargo_bin("app-bucket").expect("Binary exists");

    cmd.arg("reconcile")
        .arg("--config")
        .arg(config.path())
        .arg("--settle-secs")
        .arg("1")
        .env("RUST_LOG", "warn");

    cmd.assert()
        .success()
        .stdout(
            predicate::str::contains("buckets:")
                .and(predicate::str::contains("name: literal"))
                .and(predicate::str::contains("name: from-secret"))
                .and(predicate::str::contains("phase: Ready"))
                .and(predicate::str::contains("phase: Failed").not()),
        );
}

#[test]
fn reconcile_cli_fails_on_missing_config() {
    let mut cmd = Command::cargo_bin("app-bucket").expect("Binary exists");
    cmd.arg("reconcile")
        .arg("--config")
        .arg("does-not-exist.yaml")
        .env("RUST_LOG", "off");

    cmd.assert().failure();
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        use std::fmt::Write as FmtWrite;
        let mut msg = String::new();
        let _ = write!(&mut msg, "{:?}", event);
        self.events.lock().unwrap().push(msg);
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use app_bucket::cli::{run, Cli, Commands};

    // The config path does not exist; the event fires before it is read.
    let cli = Cli {
        verbose: 0,
        command: Commands::Reconcile {
            config: std::path::PathBuf::from("dummy.yaml"),
            settle_secs: 0,
        },
    };

    let result = run(cli).await;
    assert!(result.is_err());

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
