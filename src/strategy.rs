use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, EnvironmentClassification};
use crate::error::BootstrapError;
use crate::fsutil::write_if_changed;
use crate::interpreter::{resolve, InterpreterHandle, ResolveRequest};
use crate::lock::RuntimeLockFile;
use crate::package::{render_install_manifest, resolve_package_spec, INSTALL_MANIFEST};
use crate::platform::{render_command, CommandRunner, Platform};
use crate::shell::{
    extend_search_path, install_launcher, LauncherOutcome, StartupFileOutcome, StartupFileStatus,
};
use crate::sync::{sync, SyncOutcome};
use crate::venv::{ensure, IsolatedRuntimeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Start,
    ResolveInterpreter,
    ClassifyEnvironment,
    InstallIntoActiveEnv,
    InstallPrivateRuntime,
    InstallUserScoped,
    OptionalIntegration,
    Done,
    Failed,
}

impl InstallState {
    pub fn label(self) -> &'static str {
        match self {
            InstallState::Start => "start",
            InstallState::ResolveInterpreter => "resolve_interpreter",
            InstallState::ClassifyEnvironment => "classify_environment",
            InstallState::InstallIntoActiveEnv => "install_into_active_env",
            InstallState::InstallPrivateRuntime => "install_private_runtime",
            InstallState::InstallUserScoped => "install_user_scoped",
            InstallState::OptionalIntegration => "optional_integration",
            InstallState::Done => "done",
            InstallState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallBranch {
    ActiveEnv,
    PrivateRuntime,
    UserScoped,
}

impl InstallBranch {
    pub fn label(self) -> &'static str {
        match self {
            InstallBranch::ActiveEnv => "active environment",
            InstallBranch::PrivateRuntime => "private runtime",
            InstallBranch::UserScoped => "user site",
        }
    }
}

/// Answers to the two optional integration steps, decided before the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrationChoices {
    pub extend_search_path: bool,
    pub install_launcher: bool,
}

pub struct InstallRequest<'a> {
    pub interpreter: ResolveRequest<'a>,
    /// `--package` value; when absent the newest wheel in `dist_dir` is used.
    pub explicit_package: Option<String>,
    pub dist_dir: PathBuf,
    pub package_name: String,
    pub extra_requirements: Option<PathBuf>,
    pub private_runtime: PathBuf,
    pub entry_point: String,
    pub bin_dir: PathBuf,
    pub launcher_path: PathBuf,
    pub startup_files: Vec<PathBuf>,
    pub integration: IntegrationChoices,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub states: Vec<InstallState>,
    pub interpreter: Option<InterpreterHandle>,
    pub classification: Option<EnvironmentClassification>,
    pub branch: Option<InstallBranch>,
    pub package: Option<String>,
    pub runtime: Option<IsolatedRuntimeRecord>,
    pub sync: Option<SyncOutcome>,
    pub search_path: Vec<StartupFileOutcome>,
    pub launcher: Option<LauncherOutcome>,
    pub warnings: Vec<String>,
}

/// A run that ended in `Failed`, with the states it passed through.
#[derive(Debug)]
pub struct InstallFailure {
    pub report: InstallReport,
    pub error: BootstrapError,
}

pub struct InstallationStrategySelector<'r, R: CommandRunner> {
    platform: Platform,
    runner: &'r R,
}

impl<'r, R: CommandRunner> InstallationStrategySelector<'r, R> {
    pub fn new(platform: Platform, runner: &'r R) -> Self {
        InstallationStrategySelector { platform, runner }
    }

    /// Drives one install run to `Done`. A fatal error inside a branch ends the
    /// run; no other branch is attempted.
    pub fn run(&self, request: &InstallRequest<'_>) -> Result<InstallReport, InstallFailure> {
        let mut report = InstallReport::default();
        let mut state = InstallState::Start;
        loop {
            report.states.push(state);
            info!(state = state.label(), "install state");
            if state == InstallState::Done {
                return Ok(report);
            }
            state = match self.step(state, request, &mut report) {
                Ok(next) => next,
                Err(error) => {
                    report.states.push(InstallState::Failed);
                    error!(state = state.label(), %error, "install failed");
                    return Err(InstallFailure { report, error });
                }
            };
        }
    }

    fn step(
        &self,
        state: InstallState,
        request: &InstallRequest<'_>,
        report: &mut InstallReport,
    ) -> Result<InstallState, BootstrapError> {
        match state {
            InstallState::Start => Ok(InstallState::ResolveInterpreter),
            InstallState::ResolveInterpreter => {
                let handle = resolve(&request.interpreter, self.runner)?;
                info!(
                    interpreter = %handle.path.display(),
                    version = %handle.version,
                    "interpreter selected"
                );
                report.interpreter = Some(handle);
                Ok(InstallState::ClassifyEnvironment)
            }
            InstallState::ClassifyEnvironment => {
                let handle = Self::handle(report)?;
                let classification = classify(&handle, self.runner)?;
                let next = match classification {
                    EnvironmentClassification::ActiveIsolatedEnv { .. } => {
                        InstallState::InstallIntoActiveEnv
                    }
                    EnvironmentClassification::ExternallyManagedBare { .. } => {
                        InstallState::InstallPrivateRuntime
                    }
                    EnvironmentClassification::UnmanagedBare => InstallState::InstallUserScoped,
                };
                info!(classification = classification.label(), "environment classified");
                report.classification = Some(classification);
                Ok(next)
            }
            InstallState::InstallIntoActiveEnv => {
                let handle = Self::handle(report)?;
                report.branch = Some(InstallBranch::ActiveEnv);
                let spec = Self::package_spec(request, report)?;
                self.pip_install(&handle.path, &spec, request, false)?;
                Ok(InstallState::Done)
            }
            InstallState::InstallUserScoped => {
                let handle = Self::handle(report)?;
                report.branch = Some(InstallBranch::UserScoped);
                let spec = Self::package_spec(request, report)?;
                self.pip_install(&handle.path, &spec, request, true)?;
                Ok(InstallState::Done)
            }
            InstallState::InstallPrivateRuntime => {
                let handle = Self::handle(report)?;
                report.branch = Some(InstallBranch::PrivateRuntime);
                let spec = Self::package_spec(request, report)?;
                self.install_private_runtime(&handle, &spec, request, report)?;
                Ok(InstallState::OptionalIntegration)
            }
            InstallState::OptionalIntegration => {
                self.integrate(request, report);
                Ok(InstallState::Done)
            }
            InstallState::Done | InstallState::Failed => Ok(state),
        }
    }

    fn handle(report: &InstallReport) -> Result<InterpreterHandle, BootstrapError> {
        report.interpreter.clone().ok_or_else(|| {
            BootstrapError::Process("install state reached before interpreter resolution".to_string())
        })
    }

    fn package_spec(
        request: &InstallRequest<'_>,
        report: &mut InstallReport,
    ) -> Result<String, BootstrapError> {
        let spec = resolve_package_spec(
            request.explicit_package.as_deref(),
            &request.dist_dir,
            &request.package_name,
        )?;
        info!(package = %spec, "package selected");
        report.package = Some(spec.clone());
        Ok(spec)
    }

    fn pip_install(
        &self,
        interpreter: &Path,
        spec: &str,
        request: &InstallRequest<'_>,
        user_scoped: bool,
    ) -> Result<(), BootstrapError> {
        let mut args: Vec<String> = ["-m", "pip", "install", "--disable-pip-version-check"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if user_scoped {
            args.push("--user".to_string());
        }
        args.push(spec.to_string());
        if let Some(extra) = &request.extra_requirements {
            args.push("-r".to_string());
            args.push(extra.to_string_lossy().to_string());
        }
        let command = render_command(interpreter, &args);
        let output = self.runner.run(interpreter, &args, false).map_err(|err| {
            BootstrapError::PackageInstallFailed {
                target: spec.to_string(),
                message: format!("failed to run `{command}`: {err}"),
            }
        })?;
        if !output.success() {
            let stderr = output.stderr_text();
            let mut message = format!("`{command}` exited with status {}", output.status_code);
            if !stderr.is_empty() {
                message = format!("{message}: {stderr}");
            }
            return Err(BootstrapError::PackageInstallFailed {
                target: spec.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn install_private_runtime(
        &self,
        handle: &InterpreterHandle,
        spec: &str,
        request: &InstallRequest<'_>,
        report: &mut InstallReport,
    ) -> Result<(), BootstrapError> {
        // Render first so a bad requirements file fails before anything is created.
        let (manifest_text, entries) =
            render_install_manifest(spec, request.extra_requirements.as_deref())?;

        let root = &request.private_runtime;
        let mut lock_file = RuntimeLockFile::open(root)?;
        let lock = lock_file.acquire()?;
        let record = ensure(root, handle, self.platform, self.runner, &lock)?;

        let manifest = root.join(INSTALL_MANIFEST);
        if write_if_changed(&manifest, &manifest_text)? {
            debug!(manifest = %manifest.display(), entries, "install manifest updated");
        }
        let outcome = sync(&manifest, &record, self.runner, &lock)?;
        drop(lock);

        report.runtime = Some(record);
        report.sync = Some(outcome);
        Ok(())
    }

    /// Integration never fails the run; problems become report warnings.
    fn integrate(&self, request: &InstallRequest<'_>, report: &mut InstallReport) {
        let choices = request.integration;
        if choices.extend_search_path {
            let outcomes =
                extend_search_path(&request.bin_dir, &request.startup_files, self.platform);
            for outcome in &outcomes {
                if let StartupFileStatus::Failed { error } = &outcome.status {
                    warn!(file = %outcome.path.display(), %error, "could not extend search path");
                    report.warnings.push(format!(
                        "could not update {}: {error}",
                        outcome.path.display()
                    ));
                }
            }
            if outcomes
                .iter()
                .all(|outcome| outcome.status == StartupFileStatus::Missing)
            {
                warn!(dir = %request.bin_dir.display(), "no shell startup file found");
                report.warnings.push(format!(
                    "no shell startup file found; add {} to PATH manually",
                    request.bin_dir.display()
                ));
            }
            report.search_path = outcomes;
        }

        if choices.install_launcher {
            let target = self
                .platform
                .venv_entry_point(&request.private_runtime, &request.entry_point);
            match install_launcher(&target, &request.launcher_path, self.platform) {
                Ok(outcome) => {
                    if outcome.changed {
                        info!(launcher = %outcome.path.display(), target = %target.display(), "launcher written");
                    }
                    report.launcher = Some(outcome);
                }
                Err(err) => {
                    warn!(error = %err, "launcher not installed");
                    report.warnings.push(err.to_string());
                }
            }
        }
    }
}
