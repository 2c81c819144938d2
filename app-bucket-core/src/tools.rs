//! External command-line tools used by the Android decoder.
//!
//! [`ApktoolCommand`] unpacks resources and the manifest without decompiling
//! sources. [`KeytoolCommand`] prints the signing certificate of a package.
//! Both are spawned with `kill_on_drop` and raced against the reconcile's
//! cancellation token.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::contract::{CertInspector, UnpackTool};
use crate::error::ToolError;

/// Path to an `apktool` executable.
#[derive(Debug, Clone)]
pub struct ApktoolCommand {
    program: String,
}

impl ApktoolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ApktoolCommand {
    fn default() -> Self {
        Self::new("apktool")
    }
}

#[async_trait]
impl UnpackTool for ApktoolCommand {
    async fn unpack(
        &self,
        package: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("decode")
            .arg("--force")
            .arg("--no-src")
            .arg("--output")
            .arg(output_dir)
            .arg(package);
        run(&self.program, cmd, cancel).await.map(|_| ())
    }
}

/// Path to a `keytool` executable.
#[derive(Debug, Clone)]
pub struct KeytoolCommand {
    program: String,
}

impl KeytoolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for KeytoolCommand {
    fn default() -> Self {
        Self::new("keytool")
    }
}

#[async_trait]
impl CertInspector for KeytoolCommand {
    async fn inspect(&self, package: &Path, cancel: &CancellationToken) -> Result<String, ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-printcert").arg("-jarfile").arg(package);
        run(&self.program, cmd, cancel).await
    }
}

async fn run(program: &str, mut cmd: Command, cancel: &CancellationToken) -> Result<String, ToolError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program, command = ?cmd.as_std(), "spawning tool");
    let child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?,
        _ = cancel.cancelled() => {
            return Err(ToolError::Cancelled { program: program.to_string() });
        }
    };

    if !output.status.success() {
        return Err(ToolError::Exit {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First `SHA256:` fingerprint in a keytool report.
pub fn parse_sha256_fingerprint(report: &str) -> Option<String> {
    static FIELD: OnceLock<Option<Regex>> = OnceLock::new();
    let re = FIELD
        .get_or_init(|| Regex::new(r"SHA256:\s*([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2})+)").ok())
        .as_ref()?;
    re.captures(report).map(|c| c[1].to_string())
}
