use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no usable Python interpreter found (tried: {tried})")]
    InterpreterNotFound { tried: String },
    #[error("interpreter override {path} is not usable: {reason}")]
    InterpreterInvalid { path: PathBuf, reason: String },
    #[error("interpreter {path} reports Python {found}, but {required} or newer is required")]
    VersionTooLow {
        path: PathBuf,
        found: String,
        required: String,
    },
    #[error("failed to create isolated runtime at {root}: {message}")]
    RuntimeCreationFailed { root: PathBuf, message: String },
    #[error("dependency install failed for {manifest}: {message}")]
    DependencyInstallFailed { manifest: PathBuf, message: String },
    #[error("package install failed for {target}: {message}")]
    PackageInstallFailed { target: String, message: String },
    #[error("no distributable package found: {0}")]
    MissingPackage(String),
    #[error("runtime lock {} is held by {}", .path.display(), holder_label(.pid))]
    LockHeld { path: PathBuf, pid: Option<u32> },
    #[error("integration step failed: {0}")]
    Integration(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

fn holder_label(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("process {pid}"),
        None => "another process".to_string(),
    }
}

impl BootstrapError {
    /// Process exit code for a fatal error. 127 is reserved for "no interpreter at all".
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::InterpreterNotFound { .. } => 127,
            _ => 1,
        }
    }

    pub fn remediation(&self) -> Option<String> {
        match self {
            BootstrapError::InterpreterNotFound { .. } => Some(
                "Install Python 3 (python.org, Homebrew, or your distribution's package manager) \
                 or point CHATTI_PYTHON at an interpreter."
                    .to_string(),
            ),
            BootstrapError::InterpreterInvalid { .. } => Some(
                "Unset CHATTI_PYTHON or point it at an executable Python interpreter.".to_string(),
            ),
            BootstrapError::VersionTooLow { required, .. } => Some(format!(
                "Install Python {required} or newer and rerun, or set CHATTI_PYTHON to it."
            )),
            BootstrapError::RuntimeCreationFailed { .. } => Some(
                "Make sure the venv module is available (e.g. `apt install python3-venv`) and the package index is reachable, then rerun."
                    .to_string(),
            ),
            BootstrapError::DependencyInstallFailed { .. }
            | BootstrapError::PackageInstallFailed { .. } => Some(
                "Check network access and the package index, then rerun; the install is retried automatically."
                    .to_string(),
            ),
            BootstrapError::MissingPackage(_) => Some(
                "Build a wheel into the dist directory or pass --package <spec>.".to_string(),
            ),
            BootstrapError::LockHeld { .. } => Some(
                "Wait for the other bootstrap run to finish and try again.".to_string(),
            ),
            _ => None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BootstrapError::InterpreterNotFound { .. } => "interpreter_not_found",
            BootstrapError::InterpreterInvalid { .. } => "interpreter_invalid",
            BootstrapError::VersionTooLow { .. } => "version_too_low",
            BootstrapError::RuntimeCreationFailed { .. } => "runtime_creation_failed",
            BootstrapError::DependencyInstallFailed { .. } => "dependency_install_failed",
            BootstrapError::PackageInstallFailed { .. } => "package_install_failed",
            BootstrapError::MissingPackage(_) => "missing_package",
            BootstrapError::LockHeld { .. } => "lock_held",
            BootstrapError::Integration(_) => "integration_failed",
            BootstrapError::Config(_) | BootstrapError::Yaml(_) => "config",
            BootstrapError::Prompt(_) => "prompt",
            BootstrapError::Io(_) | BootstrapError::Json(_) | BootstrapError::Process(_) => {
                "internal"
            }
        }
    }
}
