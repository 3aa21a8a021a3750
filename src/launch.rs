use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::BootstrapError;

/// Hands control to the application. On Unix the process image is replaced,
/// so this only returns on failure; elsewhere the child's exit code is returned
/// for the caller to exit with.
pub fn exec_entry_point(program: &Path, args: &[OsString]) -> Result<i32, BootstrapError> {
    if !program.is_file() {
        return Err(BootstrapError::Process(format!(
            "entry point {} does not exist",
            program.display()
        )));
    }
    debug!(program = %program.display(), args = args.len(), "handing off to application");
    let mut cmd = Command::new(program);
    cmd.args(args);
    run(cmd, program)
}

#[cfg(unix)]
fn run(mut cmd: Command, program: &Path) -> Result<i32, BootstrapError> {
    use std::os::unix::process::CommandExt;
    let err = cmd.exec();
    Err(BootstrapError::Process(format!(
        "failed to exec {}: {err}",
        program.display()
    )))
}

#[cfg(not(unix))]
fn run(mut cmd: Command, program: &Path) -> Result<i32, BootstrapError> {
    let status = cmd.status().map_err(|err| {
        BootstrapError::Process(format!("failed to run {}: {err}", program.display()))
    })?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_entry_point_is_reported_without_spawning() {
        let dir = tempdir().unwrap();
        let err = exec_entry_point(&dir.path().join("bin/chatti"), &[]).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(err.exit_code(), 1);
    }
}
