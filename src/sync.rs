use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::BootstrapError;
use crate::fsutil::write_atomic_text_file;
use crate::lock::RuntimeLock;
use crate::platform::{render_command, CommandRunner};
use crate::venv::IsolatedRuntimeRecord;

pub const STAMP_FILE: &str = ".chatti-deps.json";

/// Memo entry: key is the manifest content hash, value is the install outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyManifestStamp {
    pub hash: String,
    pub installed: bool,
    #[serde(default)]
    pub entries: usize,
    #[serde(default)]
    pub recorded_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StampStore {
    path: PathBuf,
}

impl StampStore {
    pub fn beside(runtime_root: &Path) -> Self {
        StampStore {
            path: runtime_root.join(STAMP_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable stamp reads as "never installed".
    pub fn load(&self) -> Option<DependencyManifestStamp> {
        let text = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn is_current(&self, hash: &str) -> bool {
        self.load()
            .map(|stamp| stamp.installed && stamp.hash == hash)
            .unwrap_or(false)
    }

    pub fn record(&self, stamp: &DependencyManifestStamp) -> Result<(), BootstrapError> {
        let body = serde_json::to_string_pretty(stamp)?;
        write_atomic_text_file(&self.path, &format!("{body}\n"), None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Installed { hash: String, entries: usize },
    UpToDate { hash: String },
}

pub fn manifest_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn manifest_entries(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}

/// Installs `manifest` into the runtime unless its bytes match the last
/// successful install. The stamp only moves forward after pip succeeds.
pub fn sync<R: CommandRunner>(
    manifest: &Path,
    record: &IsolatedRuntimeRecord,
    runner: &R,
    lock: &RuntimeLock<'_>,
) -> Result<SyncOutcome, BootstrapError> {
    lock.guards(&record.root)?;
    let bytes = fs::read(manifest).map_err(|err| BootstrapError::DependencyInstallFailed {
        manifest: manifest.to_path_buf(),
        message: format!("cannot read manifest: {err}"),
    })?;
    let hash = manifest_hash(&bytes);
    let store = StampStore::beside(&record.root);
    if store.is_current(&hash) {
        debug!(manifest = %manifest.display(), %hash, "dependencies up to date");
        return Ok(SyncOutcome::UpToDate { hash });
    }

    let entries = manifest_entries(&String::from_utf8_lossy(&bytes));
    info!(manifest = %manifest.display(), entries, "installing dependencies");
    let args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "--disable-pip-version-check".to_string(),
        "-r".to_string(),
        manifest.to_string_lossy().to_string(),
    ];
    let command = render_command(&record.interpreter, &args);
    let output = runner
        .run(&record.interpreter, &args, false)
        .map_err(|err| BootstrapError::DependencyInstallFailed {
            manifest: manifest.to_path_buf(),
            message: format!("failed to run `{command}`: {err}"),
        })?;
    if !output.success() {
        let stderr = output.stderr_text();
        let mut message = format!("`{command}` exited with status {}", output.status_code);
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        return Err(BootstrapError::DependencyInstallFailed {
            manifest: manifest.to_path_buf(),
            message,
        });
    }

    store.record(&DependencyManifestStamp {
        hash: hash.clone(),
        installed: true,
        entries,
        recorded_at: Some(Utc::now().to_rfc3339()),
    })?;
    Ok(SyncOutcome::Installed { hash, entries })
}
