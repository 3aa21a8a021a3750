use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

pub const LAUNCHER_MARKER: &str = "chatti-bootstrap launcher";

/// Host family. Everything that differs between the POSIX shells and Windows
/// lives behind this enum so the orchestration logic stays shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Platform {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    pub fn venv_scripts_dir(self, root: &Path) -> PathBuf {
        match self {
            Platform::Unix => root.join("bin"),
            Platform::Windows => root.join("Scripts"),
        }
    }

    pub fn venv_interpreter(self, root: &Path) -> PathBuf {
        match self {
            Platform::Unix => self.venv_scripts_dir(root).join("python"),
            Platform::Windows => self.venv_scripts_dir(root).join("python.exe"),
        }
    }

    pub fn venv_entry_point(self, root: &Path, name: &str) -> PathBuf {
        match self {
            Platform::Unix => self.venv_scripts_dir(root).join(name),
            Platform::Windows => self.venv_scripts_dir(root).join(format!("{name}.exe")),
        }
    }

    pub fn launcher_file_name(self, name: &str) -> String {
        match self {
            Platform::Unix => name.to_string(),
            Platform::Windows => format!("{name}.cmd"),
        }
    }

    pub fn launcher_script(self, target: &Path) -> String {
        let target = target.to_string_lossy();
        match self {
            Platform::Unix => format!(
                "#!/bin/sh\n# {LAUNCHER_MARKER}\nexec {} \"$@\"\n",
                shell_single_quote(&target)
            ),
            Platform::Windows => format!(
                "@echo off\r\nrem {LAUNCHER_MARKER}\r\n\"{target}\" %*\r\nexit /b %ERRORLEVEL%\r\n"
            ),
        }
    }

    pub fn default_interpreter_candidates(self) -> Vec<PathBuf> {
        match self {
            Platform::Unix => [
                "/opt/homebrew/bin/python3",
                "/usr/local/bin/python3",
                "/usr/bin/python3",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            Platform::Windows => {
                let mut out = Vec::new();
                if let Some(local) = dirs::data_local_dir() {
                    for minor in ["313", "312"] {
                        out.push(
                            local
                                .join("Programs")
                                .join("Python")
                                .join(format!("Python{minor}"))
                                .join("python.exe"),
                        );
                    }
                }
                out
            }
        }
    }

    /// Primary command name first, then the secondary alias.
    pub fn interpreter_command_names(self) -> [&'static str; 2] {
        match self {
            Platform::Unix => ["python3", "python"],
            Platform::Windows => ["python", "python3"],
        }
    }

    pub fn default_startup_files(self) -> Vec<&'static str> {
        match self {
            Platform::Unix => vec![
                ".bashrc",
                ".bash_profile",
                ".zshrc",
                ".profile",
                ".config/fish/config.fish",
            ],
            Platform::Windows => vec![
                "Documents/PowerShell/Microsoft.PowerShell_profile.ps1",
                "Documents/WindowsPowerShell/Microsoft.PowerShell_profile.ps1",
            ],
        }
    }

    /// The line that prepends `dir` to the search path, in the dialect of `startup_file`.
    pub fn search_path_line(self, startup_file: &Path, dir: &Path) -> String {
        let dir_text = dir.to_string_lossy();
        let ext = startup_file
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "fish" => format!("set -gx PATH {} $PATH", shell_single_quote(&dir_text)),
            "ps1" => format!(
                "$env:Path = \"{};\" + $env:Path",
                dir_text.replace('"', "`\"")
            ),
            _ => format!("export PATH={}:\"$PATH\"", shell_single_quote(&dir_text)),
        }
    }

    pub fn make_executable(self, path: &Path) -> io::Result<()> {
        match self {
            Platform::Unix => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
                }
                Ok(())
            }
            // .cmd files are runnable by extension.
            Platform::Windows => Ok(()),
        }
    }
}

pub fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Synchronous process execution. No timeout: a hung tool hangs the run.
pub trait CommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct RealCommandRunner {
    /// Forces capture even when the caller asked for passthrough, so child
    /// output cannot interleave with machine-readable stdout.
    pub quiet: bool,
}

impl CommandRunner for RealCommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        debug!(command = %render_command(program, args), "exec");
        let mut cmd = Command::new(program);
        cmd.args(args);
        if capture_output || self.quiet {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

pub fn render_command(program: &Path, args: &[String]) -> String {
    fn quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(quote(&program.to_string_lossy()));
    parts.extend(args.iter().map(|arg| quote(arg)));
    parts.join(" ")
}
