use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::classify::PROBE_SCRIPT;
use crate::interpreter::VERSION_QUERY;
use crate::platform::{CommandOutput, CommandRunner, Platform};
use crate::venv::HEALTH_CHECK;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RecordedCall {
    pub fn is_pip(&self, sub: &str) -> bool {
        self.args.len() >= 3 && self.args[0] == "-m" && self.args[1] == "pip" && self.args[2] == sub
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

/// Simulates an interpreter: answers version and prefix probes, lays out a
/// venv on `-m venv`, and records every pip invocation.
pub struct FakeRunner {
    default_version: String,
    broken: RefCell<BTreeSet<PathBuf>>,
    probe: RefCell<serde_json::Value>,
    venv_failures: RefCell<VecDeque<String>>,
    fail_installs: Cell<bool>,
    fail_uninstall: Cell<bool>,
    fail_toolchain_upgrade: Cell<bool>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl FakeRunner {
    pub fn with_version(version: &str) -> Self {
        FakeRunner {
            default_version: version.to_string(),
            broken: RefCell::new(BTreeSet::new()),
            probe: RefCell::new(json!({
                "prefix": "/usr",
                "base_prefix": "/usr",
                "paths": {}
            })),
            venv_failures: RefCell::new(VecDeque::new()),
            fail_installs: Cell::new(false),
            fail_uninstall: Cell::new(false),
            fail_toolchain_upgrade: Cell::new(false),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn mark_broken(&self, path: &Path) {
        self.broken.borrow_mut().insert(path.to_path_buf());
    }

    pub fn set_probe(&self, prefix: &Path, base_prefix: &Path, paths: &[(&str, &PathBuf)]) {
        let mut map = serde_json::Map::new();
        for (category, path) in paths {
            map.insert(category.to_string(), json!(path));
        }
        *self.probe.borrow_mut() = json!({
            "prefix": prefix,
            "base_prefix": base_prefix,
            "paths": map,
        });
    }

    pub fn push_venv_failure(&self, stderr: &str) {
        self.venv_failures.borrow_mut().push_back(stderr.to_string());
    }

    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs.set(fail);
    }

    pub fn fail_uninstall(&self, fail: bool) {
        self.fail_uninstall.set(fail);
    }

    pub fn fail_toolchain_upgrade(&self, fail: bool) {
        self.fail_toolchain_upgrade.set(fail);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Dependency installs only, excluding the toolchain upgrade.
    pub fn manifest_installs(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.is_pip("install") && call.has_arg("-r"))
            .collect()
    }

    pub fn toolchain_upgrades(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.is_pip("install") && call.has_arg("--upgrade") && call.has_arg("setuptools"))
            .count()
    }

    pub fn venv_creations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.args.len() >= 2 && call.args[0] == "-m" && call.args[1] == "venv")
            .count()
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code: 1,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        _capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        self.calls.borrow_mut().push(RecordedCall {
            program: program.to_path_buf(),
            args: args.to_vec(),
        });
        let broken = self.broken.borrow().contains(program);

        if args.len() >= 2 && args[0] == "-c" {
            if broken {
                return Ok(Self::failed("Illegal instruction"));
            }
            let script = args[1].as_str();
            if script == VERSION_QUERY {
                return Ok(Self::ok(&format!("{}\n", self.default_version)));
            }
            if script == PROBE_SCRIPT {
                return Ok(Self::ok(&self.probe.borrow().to_string()));
            }
            if script == HEALTH_CHECK {
                if program.is_file() {
                    return Ok(Self::ok(""));
                }
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
            }
            return Ok(Self::ok(""));
        }

        if args.len() >= 3 && args[0] == "-m" && args[1] == "venv" {
            if let Some(stderr) = self.venv_failures.borrow_mut().pop_front() {
                return Ok(Self::failed(&stderr));
            }
            let root = PathBuf::from(args.last().cloned().unwrap_or_default());
            let python = Platform::current().venv_interpreter(&root);
            write_executable(&python);
            fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\n")?;
            return Ok(Self::ok(""));
        }

        if args.len() >= 3 && args[0] == "-m" && args[1] == "pip" {
            let upgrade = args.iter().any(|a| a == "--upgrade");
            if args[2] == "install" && upgrade && self.fail_toolchain_upgrade.get() {
                return Ok(Self::failed("ERROR: Could not find a version that satisfies the requirement pip"));
            }
            if args[2] == "install" && self.fail_installs.get() && !upgrade {
                return Ok(Self::failed("ERROR: No matching distribution found"));
            }
            if args[2] == "uninstall" && self.fail_uninstall.get() {
                return Ok(Self::failed("WARNING: Skipping chatti as it is not installed."));
            }
            return Ok(Self::ok(""));
        }

        Ok(Self::ok(""))
    }
}

fn write_executable(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Creates an executable stand-in for an interpreter at `dir/rel`.
pub fn fake_interpreter(dir: &Path, rel: &str) -> PathBuf {
    let path = dir.join(rel);
    write_executable(&path);
    path
}
