use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::error::BootstrapError;
use crate::platform::CommandRunner;

pub const VERSION_QUERY: &str = "import sys; print('%d.%d' % sys.version_info[:2])";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PythonVersion {
    type Err = BootstrapError;

    /// Accepts `3.12`, `3.12.1` and `Python 3.12.1`. Components are integers,
    /// so ordering is numeric ("3.9" < "3.12").
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let token = trimmed
            .strip_prefix("Python")
            .map(str::trim)
            .unwrap_or(trimmed);
        let mut parts = token.split('.');
        let major = parts.next().and_then(|p| p.trim().parse::<u32>().ok());
        let minor = parts.next().and_then(|p| p.trim().parse::<u32>().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => Ok(PythonVersion { major, minor }),
            _ => Err(BootstrapError::Config(format!(
                "invalid Python version '{raw}'; expected MAJOR.MINOR"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionRequirement {
    pub min_major: u32,
    pub min_minor: u32,
}

impl VersionRequirement {
    pub fn parse(raw: &str) -> Result<Self, BootstrapError> {
        let floor: PythonVersion = raw.parse()?;
        Ok(VersionRequirement {
            min_major: floor.major,
            min_minor: floor.minor,
        })
    }

    pub fn floor(&self) -> PythonVersion {
        PythonVersion {
            major: self.min_major,
            minor: self.min_minor,
        }
    }

    pub fn is_satisfied_by(&self, version: PythonVersion) -> bool {
        version >= self.floor()
    }
}

impl fmt::Display for VersionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.floor())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterSource {
    Override,
    WellKnown,
    SearchPath,
}

/// The interpreter chosen for this run. Never mutated after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpreterHandle {
    pub path: PathBuf,
    pub version: PythonVersion,
    pub source: InterpreterSource,
}

pub struct ResolveRequest<'a> {
    pub override_path: Option<&'a Path>,
    pub requirement: VersionRequirement,
    pub candidates: &'a [PathBuf],
    pub command_names: &'a [&'a str],
    /// `PATH` value used for command lookup.
    pub search_path: Option<&'a OsStr>,
}

pub fn query_version<R: CommandRunner>(runner: &R, path: &Path) -> Option<PythonVersion> {
    let output = runner
        .run(path, &["-c".to_string(), VERSION_QUERY.to_string()], true)
        .ok()?;
    if !output.success() {
        return None;
    }
    output.stdout_text().parse().ok()
}

pub fn resolve<R: CommandRunner>(
    request: &ResolveRequest<'_>,
    runner: &R,
) -> Result<InterpreterHandle, BootstrapError> {
    if let Some(raw) = request.override_path {
        return resolve_override(raw, request, runner);
    }

    let mut tried: Vec<PathBuf> = Vec::new();
    let mut ordered: Vec<(PathBuf, InterpreterSource)> = request
        .candidates
        .iter()
        .map(|path| (path.clone(), InterpreterSource::WellKnown))
        .collect();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in request.command_names {
        match which::which_in(name, request.search_path, &cwd) {
            Ok(found) => ordered.push((found, InterpreterSource::SearchPath)),
            Err(_) => tried.push(PathBuf::from(name)),
        }
    }

    for (candidate, source) in ordered {
        if tried.contains(&candidate) {
            continue;
        }
        tried.push(candidate.clone());
        if !is_executable::is_executable(&candidate) {
            debug!(candidate = %candidate.display(), "skipping non-executable interpreter candidate");
            continue;
        }
        let Some(version) = query_version(runner, &candidate) else {
            debug!(candidate = %candidate.display(), "skipping interpreter that did not report a version");
            continue;
        };
        return check_floor(candidate, version, source, request.requirement);
    }

    Err(BootstrapError::InterpreterNotFound {
        tried: tried
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn resolve_override<R: CommandRunner>(
    raw: &Path,
    request: &ResolveRequest<'_>,
    runner: &R,
) -> Result<InterpreterHandle, BootstrapError> {
    let path = if raw.components().count() == 1 && !raw.is_absolute() {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        which::which_in(raw, request.search_path, cwd).map_err(|_| {
            BootstrapError::InterpreterInvalid {
                path: raw.to_path_buf(),
                reason: "not found on PATH".to_string(),
            }
        })?
    } else {
        raw.to_path_buf()
    };
    if !path.exists() {
        return Err(BootstrapError::InterpreterInvalid {
            path,
            reason: "file does not exist".to_string(),
        });
    }
    if !is_executable::is_executable(&path) {
        return Err(BootstrapError::InterpreterInvalid {
            path,
            reason: "file is not executable".to_string(),
        });
    }
    let version =
        query_version(runner, &path).ok_or_else(|| BootstrapError::InterpreterInvalid {
            path: path.clone(),
            reason: "did not respond to a version query".to_string(),
        })?;
    check_floor(
        path,
        version,
        InterpreterSource::Override,
        request.requirement,
    )
}

fn check_floor(
    path: PathBuf,
    version: PythonVersion,
    source: InterpreterSource,
    requirement: VersionRequirement,
) -> Result<InterpreterHandle, BootstrapError> {
    if !requirement.is_satisfied_by(version) {
        return Err(BootstrapError::VersionTooLow {
            path,
            found: version.to_string(),
            required: requirement.to_string(),
        });
    }
    debug!(path = %path.display(), %version, "interpreter resolved");
    Ok(InterpreterHandle {
        path,
        version,
        source,
    })
}
