use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::json;

use crate::classify::classify;
use crate::config::{BootstrapPaths, Config};
use crate::error::BootstrapError;
use crate::fsutil::path_exists;
use crate::interpreter::{resolve, InterpreterHandle, ResolveRequest};
use crate::lock::{lock_status, LockStatus};
use crate::package::INSTALL_MANIFEST;
use crate::platform::{CommandRunner, Platform};
use crate::shell::{find_marker_lines, is_managed_launcher};
use crate::sync::{manifest_hash, StampStore};
use crate::venv::runtime_is_healthy;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub id: String,
    pub ok: bool,
    pub severity: String,
    pub strict_fail: bool,
    pub message: String,
    pub remediation: String,
    pub details: serde_json::Value,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    strict_fail: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        strict_fail,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

pub struct DoctorInputs<'a> {
    pub cfg: &'a Config,
    pub paths: &'a BootstrapPaths,
    pub override_path: Option<&'a Path>,
    pub search_path: Option<&'a OsStr>,
}

/// Read-only: nothing on disk is created, repaired or removed.
pub fn collect_doctor_checks<R: CommandRunner>(
    inputs: &DoctorInputs<'_>,
    platform: Platform,
    runner: &R,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    let paths = inputs.paths;

    let handle = match inputs.cfg.requirement() {
        Ok(requirement) => {
            let command_names = platform.interpreter_command_names();
            let request = ResolveRequest {
                override_path: inputs.override_path,
                requirement,
                candidates: &paths.interpreter_candidates,
                command_names: &command_names,
                search_path: inputs.search_path,
            };
            resolve(&request, runner)
        }
        Err(err) => Err(err),
    };
    checks.push(interpreter_check(&handle));

    let handle = handle.ok();
    checks.push(classification_check(handle.as_ref(), runner));
    checks.push(private_runtime_check(paths, platform, runner));
    checks.push(stamp_check(paths));
    checks.push(launcher_check(paths));
    checks.push(search_path_check(paths, inputs.search_path));
    checks.push(lock_check(paths));
    checks
}

fn interpreter_check(
    handle: &Result<InterpreterHandle, BootstrapError>,
) -> DoctorCheck {
    match handle {
        Ok(handle) => doctor_check(
            "interpreter",
            true,
            "error",
            true,
            format!(
                "Python {} at {} satisfies the version floor",
                handle.version,
                handle.path.display()
            ),
            "",
            json!({"path": handle.path, "version": handle.version.to_string(), "source": handle.source}),
        ),
        Err(err) => doctor_check(
            "interpreter",
            false,
            "error",
            true,
            err.to_string(),
            err.remediation().unwrap_or_default(),
            json!({"error_code": err.error_code()}),
        ),
    }
}

fn classification_check<R: CommandRunner>(
    handle: Option<&InterpreterHandle>,
    runner: &R,
) -> DoctorCheck {
    let Some(handle) = handle else {
        return doctor_check(
            "classification",
            false,
            "warn",
            false,
            "skipped: no usable interpreter",
            "Fix the interpreter check first.",
            json!({}),
        );
    };
    match classify(handle, runner) {
        Ok(classification) => doctor_check(
            "classification",
            true,
            "info",
            false,
            format!("environment is {}", classification.label()),
            "",
            json!(classification),
        ),
        Err(err) => doctor_check(
            "classification",
            false,
            "warn",
            true,
            format!("could not classify environment: {err}"),
            "Check that the interpreter runs normally (`python3 -c 'import sysconfig'`).",
            json!({}),
        ),
    }
}

fn private_runtime_check<R: CommandRunner>(
    paths: &BootstrapPaths,
    platform: Platform,
    runner: &R,
) -> DoctorCheck {
    let root = &paths.private_runtime;
    let exists = root.is_dir();
    let healthy = exists && runtime_is_healthy(root, platform, runner);
    doctor_check(
        "private_runtime",
        healthy,
        "warn",
        exists,
        if healthy {
            "private runtime is present and its interpreter runs"
        } else if exists {
            "private runtime exists but its interpreter is missing or broken"
        } else {
            "no private runtime installed"
        },
        if exists {
            "Rerun `chatti-bootstrap install`; a broken runtime is rebuilt from scratch."
        } else {
            "Only needed on externally managed systems; run `chatti-bootstrap install`."
        },
        json!({"root": root, "interpreter": platform.venv_interpreter(root)}),
    )
}

fn stamp_check(paths: &BootstrapPaths) -> DoctorCheck {
    let manifest = paths.private_runtime.join(INSTALL_MANIFEST);
    let stamp = StampStore::beside(&paths.private_runtime).load();
    let manifest_digest = fs::read(&manifest).ok().map(|bytes| manifest_hash(&bytes));
    let (ok, message) = match (&stamp, &manifest_digest) {
        (Some(stamp), Some(digest)) if stamp.installed && &stamp.hash == digest => {
            (true, "dependency stamp matches the install manifest".to_string())
        }
        (Some(_), Some(_)) => (
            false,
            "install manifest changed since the last successful install".to_string(),
        ),
        (None, Some(_)) => (false, "no successful dependency install recorded".to_string()),
        (_, None) => (false, "no install manifest in the private runtime".to_string()),
    };
    doctor_check(
        "stamp",
        ok,
        "warn",
        manifest_digest.is_some(),
        message,
        "Rerun `chatti-bootstrap install` to sync dependencies.",
        json!({
            "stamp": paths.stamp_path,
            "manifest": manifest,
            "recorded": stamp,
        }),
    )
}

fn launcher_check(paths: &BootstrapPaths) -> DoctorCheck {
    let launcher = &paths.launcher_path;
    let target = &paths.runtime_entry_point;
    if !path_exists(launcher) {
        return doctor_check(
            "launcher",
            false,
            "warn",
            false,
            "launcher not installed",
            "Run `chatti-bootstrap install --launcher` to add one.",
            json!({"path": launcher}),
        );
    }
    let managed = is_managed_launcher(launcher);
    let points_at_target = fs::read_to_string(launcher)
        .map(|body| body.contains(&*target.to_string_lossy()))
        .unwrap_or(false);
    let target_exists = target.is_file();
    let ok = managed && points_at_target && target_exists;
    doctor_check(
        "launcher",
        ok,
        "warn",
        true,
        if ok {
            "launcher forwards to the private runtime entry point"
        } else if !managed {
            "a file not written by chatti-bootstrap occupies the launcher path"
        } else if !points_at_target {
            "launcher points at a different entry point"
        } else {
            "launcher target does not exist"
        },
        "Rerun `chatti-bootstrap install --launcher`, or move the foreign file away.",
        json!({
            "path": launcher,
            "target": target,
            "managed": managed,
            "target_exists": target_exists,
        }),
    )
}

fn search_path_check(paths: &BootstrapPaths, search_path: Option<&OsStr>) -> DoctorCheck {
    let on_path = search_path
        .map(|value| env::split_paths(value).any(|dir| dir == paths.bin_dir))
        .unwrap_or(false);
    let markers = find_marker_lines(&paths.startup_files);
    let ok = on_path || !markers.is_empty();
    doctor_check(
        "search_path",
        ok,
        "warn",
        false,
        if on_path {
            "launcher directory is on PATH"
        } else if ok {
            "launcher directory is added by a startup file (open a new shell)"
        } else {
            "launcher directory is not on PATH"
        },
        format!(
            "Run `chatti-bootstrap install --add-to-path` or add {} to PATH manually.",
            paths.bin_dir.display()
        ),
        json!({"bin_dir": paths.bin_dir, "on_path": on_path, "markers": markers}),
    )
}

fn lock_check(paths: &BootstrapPaths) -> DoctorCheck {
    let lock_path = &paths.lock_path;
    let (ok, message, details) = match lock_status(&paths.private_runtime) {
        Ok(LockStatus::Free) => (
            true,
            "no runtime lock held".to_string(),
            json!({"path": lock_path, "held": false}),
        ),
        Ok(LockStatus::Held { pid }) => (
            false,
            match pid {
                Some(pid) => format!("runtime lock held by process {pid}"),
                None => "runtime lock held by another process".to_string(),
            },
            json!({"path": lock_path, "held": true, "pid": pid}),
        ),
        Err(err) => (
            false,
            format!("runtime lock could not be inspected: {err}"),
            json!({"path": lock_path, "error_code": err.error_code()}),
        ),
    };
    doctor_check(
        "lock",
        ok,
        "warn",
        true,
        message,
        "Wait for the running install to finish; the OS releases the lock when its holder exits.",
        details,
    )
}

/// Overall verdict and the message to surface first.
pub fn summarize(checks: &[DoctorCheck], strict: bool) -> (bool, Option<String>) {
    let has_error = checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let has_strict_warning = checks.iter().any(|check| !check.ok && check.strict_fail);
    let ok = !has_error && (!strict || !has_strict_warning);
    let primary = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .or_else(|| {
            checks
                .iter()
                .find(|check| !check.ok && strict && check.strict_fail)
        })
        .map(|check| check.message.clone());
    (ok, if ok { None } else { primary })
}
