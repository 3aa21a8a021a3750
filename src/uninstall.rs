use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::BootstrapError;
use crate::fsutil::{path_exists, prune_empty_dir, remove_path};
use crate::lock::RuntimeLockFile;
use crate::platform::{CommandRunner, Platform};
use crate::shell::{find_marker_lines, is_managed_launcher, removal_advisory, MarkerLine};

/// Only the private-runtime conventions are known here; installs made into an
/// active environment or the user site are not located.
pub struct UninstallRequest {
    pub private_runtime: PathBuf,
    pub package: String,
    pub launcher_path: PathBuf,
    /// Confirmation for deleting the launcher, resolved by the caller.
    pub remove_launcher: bool,
    pub startup_files: Vec<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PackageRemoval {
    Removed,
    Failed { message: String },
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherRemoval {
    Removed,
    Kept,
    NotManaged,
    Absent,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub runtime: PathBuf,
    pub runtime_removed: bool,
    pub package: PackageRemoval,
    pub launcher_path: PathBuf,
    pub launcher: LauncherRemoval,
    pub marker_lines: Vec<MarkerLine>,
    pub advisory: Vec<String>,
    pub dry_run: bool,
}

pub fn uninstall<R: CommandRunner>(
    request: &UninstallRequest,
    platform: Platform,
    runner: &R,
) -> Result<UninstallReport, BootstrapError> {
    let root = &request.private_runtime;
    let runtime_present = path_exists(root);

    let (package, runtime_removed) = if request.dry_run {
        (PackageRemoval::Skipped, runtime_present)
    } else if runtime_present {
        let mut lock_file = RuntimeLockFile::open(root)?;
        let lock = lock_file.acquire()?;
        let package = remove_package(root, &request.package, platform, runner);
        info!(root = %root.display(), "removing private runtime");
        let removed = remove_path(root)?;
        drop(lock);
        // The lock file outlives the runtime, so this only fires when nothing else is left.
        if let Some(parent) = root.parent() {
            prune_empty_dir(parent);
        }
        (package, removed)
    } else {
        debug!(root = %root.display(), "no private runtime to remove");
        (PackageRemoval::Skipped, false)
    };

    let launcher = remove_launcher(request);
    let marker_lines = find_marker_lines(&request.startup_files);
    let advisory = removal_advisory(&marker_lines);
    for line in &advisory {
        info!("{line}");
    }

    Ok(UninstallReport {
        runtime: root.clone(),
        runtime_removed,
        package,
        launcher_path: request.launcher_path.clone(),
        launcher,
        marker_lines,
        advisory,
        dry_run: request.dry_run,
    })
}

/// Best effort: the runtime is deleted whatever pip reports.
fn remove_package<R: CommandRunner>(
    root: &Path,
    package: &str,
    platform: Platform,
    runner: &R,
) -> PackageRemoval {
    let interpreter = platform.venv_interpreter(root);
    if !interpreter.is_file() {
        return PackageRemoval::Skipped;
    }
    let args: Vec<String> = ["-m", "pip", "uninstall", "-y", "--disable-pip-version-check", package]
        .iter()
        .map(|s| s.to_string())
        .collect();
    match runner.run(&interpreter, &args, true) {
        Ok(out) if out.success() => PackageRemoval::Removed,
        Ok(out) => {
            let message = out.stderr_text();
            warn!(status = out.status_code, %message, "package removal failed; removing runtime anyway");
            PackageRemoval::Failed { message }
        }
        Err(err) => {
            warn!(error = %err, "package removal could not start; removing runtime anyway");
            PackageRemoval::Failed {
                message: err.to_string(),
            }
        }
    }
}

fn remove_launcher(request: &UninstallRequest) -> LauncherRemoval {
    let path = &request.launcher_path;
    if !path_exists(path) {
        return LauncherRemoval::Absent;
    }
    if !is_managed_launcher(path) {
        warn!(launcher = %path.display(), "leaving launcher not written by chatti-bootstrap");
        return LauncherRemoval::NotManaged;
    }
    if !request.remove_launcher {
        return LauncherRemoval::Kept;
    }
    if request.dry_run {
        return LauncherRemoval::Removed;
    }
    match remove_path(path) {
        Ok(_) => {
            info!(launcher = %path.display(), "launcher removed");
            LauncherRemoval::Removed
        }
        Err(err) => {
            warn!(launcher = %path.display(), error = %err, "launcher could not be removed");
            LauncherRemoval::Kept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::POLICY_MARKER;
    use crate::interpreter::{ResolveRequest, VersionRequirement};
    use crate::shell::PATH_MARKER;
    use crate::strategy::{InstallRequest, InstallationStrategySelector, IntegrationChoices};
    use crate::testing::{fake_interpreter, FakeRunner};
    use std::fs;
    use tempfile::tempdir;

    struct Installed {
        _dir: tempfile::TempDir,
        home: PathBuf,
        root: PathBuf,
        launcher: PathBuf,
        bashrc: PathBuf,
    }

    fn install_private(runner: &FakeRunner) -> Installed {
        let dir = tempdir().unwrap();
        let python = fake_interpreter(dir.path(), "usr/bin/python3");
        let lib = dir.path().join("usr/lib/python3.12");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join(POLICY_MARKER), "").unwrap();
        runner.set_probe(Path::new("/usr"), Path::new("/usr"), &[("stdlib", &lib)]);

        let home = dir.path().join("home");
        let bashrc = home.join(".bashrc");
        fs::create_dir_all(&home).unwrap();
        fs::write(&bashrc, "").unwrap();
        let root = home.join(".chatti/venv");
        let launcher = home.join(".local/bin/chatti");
        let request = InstallRequest {
            interpreter: ResolveRequest {
                override_path: Some(python.as_path()),
                requirement: VersionRequirement::parse("3.12").unwrap(),
                candidates: &[],
                command_names: &[],
                search_path: None,
            },
            explicit_package: Some("chatti".to_string()),
            dist_dir: dir.path().join("dist"),
            package_name: "chatti".to_string(),
            extra_requirements: None,
            private_runtime: root.clone(),
            entry_point: "chatti".to_string(),
            bin_dir: home.join(".local/bin"),
            launcher_path: launcher.clone(),
            startup_files: vec![bashrc.clone()],
            integration: IntegrationChoices {
                extend_search_path: true,
                install_launcher: true,
            },
        };
        InstallationStrategySelector::new(Platform::current(), runner)
            .run(&request)
            .unwrap();
        assert!(root.is_dir());
        assert!(launcher.is_file());
        Installed {
            _dir: dir,
            home,
            root,
            launcher,
            bashrc,
        }
    }

    fn request_for(installed: &Installed, remove_launcher: bool, dry_run: bool) -> UninstallRequest {
        UninstallRequest {
            private_runtime: installed.root.clone(),
            package: "chatti".to_string(),
            launcher_path: installed.launcher.clone(),
            remove_launcher,
            startup_files: vec![installed.bashrc.clone(), installed.home.join(".zshrc")],
            dry_run,
        }
    }

    #[test]
    fn uninstall_reverses_private_install_and_only_advises_on_markers() {
        let runner = FakeRunner::with_version("3.12");
        let installed = install_private(&runner);
        let bashrc_before = fs::read_to_string(&installed.bashrc).unwrap();

        let report = uninstall(
            &request_for(&installed, true, false),
            Platform::current(),
            &runner,
        )
        .unwrap();
        assert!(report.runtime_removed);
        assert_eq!(report.package, PackageRemoval::Removed);
        assert_eq!(report.launcher, LauncherRemoval::Removed);
        assert!(!installed.root.exists());
        assert!(!installed.launcher.exists());
        let leftovers: Vec<_> = fs::read_dir(installed.home.join(".chatti"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("venv.lock")]);
        assert_eq!(fs::read_to_string(&installed.bashrc).unwrap(), bashrc_before);
        assert!(bashrc_before.contains(PATH_MARKER));
        assert_eq!(report.marker_lines.len(), 2);
        assert!(report.advisory.iter().all(|line| line.contains(".bashrc")));
    }

    #[test]
    fn unconfirmed_launcher_is_kept() {
        let runner = FakeRunner::with_version("3.12");
        let installed = install_private(&runner);
        let report = uninstall(
            &request_for(&installed, false, false),
            Platform::current(),
            &runner,
        )
        .unwrap();
        assert_eq!(report.launcher, LauncherRemoval::Kept);
        assert!(installed.launcher.exists());
        assert!(!installed.root.exists());
    }

    #[test]
    fn failed_package_removal_still_deletes_runtime() {
        let runner = FakeRunner::with_version("3.12");
        let installed = install_private(&runner);
        runner.fail_uninstall(true);
        let report = uninstall(
            &request_for(&installed, true, false),
            Platform::current(),
            &runner,
        )
        .unwrap();
        assert!(matches!(report.package, PackageRemoval::Failed { .. }));
        assert!(!installed.root.exists());
    }

    #[test]
    fn dry_run_changes_nothing() {
        let runner = FakeRunner::with_version("3.12");
        let installed = install_private(&runner);
        runner.clear_calls();
        let report = uninstall(
            &request_for(&installed, true, true),
            Platform::current(),
            &runner,
        )
        .unwrap();
        assert!(report.runtime_removed);
        assert_eq!(report.launcher, LauncherRemoval::Removed);
        assert!(installed.root.is_dir());
        assert!(installed.launcher.is_file());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn foreign_launcher_and_missing_runtime_are_left_alone() {
        let dir = tempdir().unwrap();
        let launcher = dir.path().join("bin/chatti");
        fs::create_dir_all(launcher.parent().unwrap()).unwrap();
        fs::write(&launcher, "#!/bin/sh\necho mine\n").unwrap();
        let runner = FakeRunner::with_version("3.12");
        let report = uninstall(
            &UninstallRequest {
                private_runtime: dir.path().join(".chatti/venv"),
                package: "chatti".to_string(),
                launcher_path: launcher.clone(),
                remove_launcher: true,
                startup_files: Vec::new(),
                dry_run: false,
            },
            Platform::current(),
            &runner,
        )
        .unwrap();
        assert!(!report.runtime_removed);
        assert_eq!(report.package, PackageRemoval::Skipped);
        assert_eq!(report.launcher, LauncherRemoval::NotManaged);
        assert!(launcher.exists());
        assert!(report.advisory.is_empty());
    }
}
