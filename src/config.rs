use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs::home_dir;
use serde::{Deserialize, Serialize};

use crate::error::BootstrapError;
use crate::fsutil::expand_home_path;
use crate::interpreter::VersionRequirement;
use crate::lock::lock_path_for;
use crate::platform::Platform;
use crate::shell::startup_files;
use crate::sync::StampStore;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub app: AppConfig,
    pub interpreter: InterpreterConfig,
    pub paths: PathsConfig,
    pub shell: ShellConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub package: String,
    pub entry_point: String,
    pub dev_entry: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct InterpreterConfig {
    pub min_version: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub private_runtime: String,
    pub bin_dir: String,
    pub dist_dir: String,
    pub manifest: String,
    pub dev_runtime: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub startup_files: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: CONFIG_VERSION,
            app: AppConfig::default(),
            interpreter: InterpreterConfig::default(),
            paths: PathsConfig::default(),
            shell: ShellConfig::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            package: "chatti".to_string(),
            entry_point: "chatti".to_string(),
            dev_entry: "scripts/chatti_go.py".to_string(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            min_version: "3.12".to_string(),
            candidates: Vec::new(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            private_runtime: "~/.chatti/venv".to_string(),
            bin_dir: "~/.local/bin".to_string(),
            dist_dir: "dist".to_string(),
            manifest: "requirements.txt".to_string(),
            dev_runtime: ".venv".to_string(),
        }
    }
}

impl Config {
    pub fn requirement(&self) -> Result<VersionRequirement, BootstrapError> {
        VersionRequirement::parse(&self.interpreter.min_version).map_err(|_| {
            BootstrapError::Config(format!(
                "interpreter.min_version must look like MAJOR.MINOR, got '{}'",
                self.interpreter.min_version
            ))
        })
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config, BootstrapError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, BootstrapError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Built-in defaults when no file exists; a present but invalid file is an error.
pub fn load_config_or_default(path: &Path) -> Result<(Config, bool), BootstrapError> {
    if path.exists() {
        Ok((read_config(path)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), BootstrapError> {
    if cfg.version != CONFIG_VERSION {
        return Err(BootstrapError::Config(format!(
            "unsupported config version {}; expected {}",
            cfg.version, CONFIG_VERSION
        )));
    }
    cfg.requirement()?;
    for (field, value) in [
        ("app.package", &cfg.app.package),
        ("app.entry_point", &cfg.app.entry_point),
        ("app.dev_entry", &cfg.app.dev_entry),
        ("paths.private_runtime", &cfg.paths.private_runtime),
        ("paths.bin_dir", &cfg.paths.bin_dir),
        ("paths.manifest", &cfg.paths.manifest),
        ("paths.dev_runtime", &cfg.paths.dev_runtime),
    ] {
        if value.trim().is_empty() {
            return Err(BootstrapError::Config(format!("{field} must be non-empty")));
        }
    }
    if cfg.app.entry_point.contains('/') || cfg.app.entry_point.contains('\\') {
        return Err(BootstrapError::Config(
            "app.entry_point must be a bare command name".to_string(),
        ));
    }
    Ok(())
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("CHATTI_BOOTSTRAP_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("chatti-bootstrap");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CHATTI_BOOTSTRAP_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join("config.yaml")
}

pub fn required_home_dir() -> Result<PathBuf, BootstrapError> {
    let home = home_dir().ok_or_else(|| {
        BootstrapError::Config("unable to resolve $HOME; set HOME to an existing directory".to_string())
    })?;
    if !home.is_absolute() {
        return Err(BootstrapError::Config(format!(
            "resolved HOME path is not absolute: {}",
            home.display()
        )));
    }
    Ok(home)
}

/// Every on-disk location the orchestrator touches, resolved once per run.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapPaths {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub private_runtime: PathBuf,
    pub lock_path: PathBuf,
    pub stamp_path: PathBuf,
    pub runtime_entry_point: PathBuf,
    pub bin_dir: PathBuf,
    pub launcher_path: PathBuf,
    pub startup_files: Vec<PathBuf>,
    pub interpreter_candidates: Vec<PathBuf>,
}

impl BootstrapPaths {
    pub fn resolve(
        cfg: &Config,
        config_path: &Path,
        home: &Path,
        platform: Platform,
    ) -> Result<BootstrapPaths, BootstrapError> {
        let private_runtime =
            expand_home_path(&cfg.paths.private_runtime, home, "paths.private_runtime")?;
        let bin_dir = expand_home_path(&cfg.paths.bin_dir, home, "paths.bin_dir")?;
        let launcher_path = bin_dir.join(platform.launcher_file_name(&cfg.app.entry_point));
        let interpreter_candidates = if cfg.interpreter.candidates.is_empty() {
            platform.default_interpreter_candidates()
        } else {
            cfg.interpreter
                .candidates
                .iter()
                .map(|raw| expand_home_path(raw, home, "interpreter.candidates"))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(BootstrapPaths {
            home: home.to_path_buf(),
            config_path: config_path.to_path_buf(),
            lock_path: lock_path_for(&private_runtime),
            stamp_path: StampStore::beside(&private_runtime).path().to_path_buf(),
            runtime_entry_point: platform
                .venv_entry_point(&private_runtime, &cfg.app.entry_point),
            private_runtime,
            launcher_path,
            bin_dir,
            startup_files: startup_files(home, &cfg.shell.startup_files, platform),
            interpreter_candidates,
        })
    }
}

/// Resolves a project-relative config path (`dist`, `requirements.txt`, `.venv`).
pub fn project_path(project: &Path, raw: &str, home: &Path, field: &str) -> Result<PathBuf, BootstrapError> {
    let expanded = expand_home_path(raw, home, field)?;
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(project.join(expanded))
    }
}
