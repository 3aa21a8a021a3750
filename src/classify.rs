use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BootstrapError;
use crate::interpreter::InterpreterHandle;
use crate::platform::{render_command, CommandRunner};

pub const POLICY_MARKER: &str = "EXTERNALLY-MANAGED";

/// Library directory categories, in the order markers are searched.
pub const LIBRARY_CATEGORIES: [&str; 4] = ["stdlib", "platstdlib", "purelib", "platlib"];

pub const PROBE_SCRIPT: &str = "import json, sys, sysconfig; p = sysconfig.get_paths(); \
print(json.dumps({'prefix': sys.prefix, 'base_prefix': getattr(sys, 'base_prefix', sys.prefix), \
'real_prefix': getattr(sys, 'real_prefix', None), \
'paths': {k: p.get(k) for k in ('stdlib', 'platstdlib', 'purelib', 'platlib')}}))";

#[derive(Debug, Deserialize)]
struct PrefixProbe {
    prefix: PathBuf,
    base_prefix: PathBuf,
    #[serde(default)]
    real_prefix: Option<PathBuf>,
    #[serde(default)]
    paths: BTreeMap<String, Option<PathBuf>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyMarker {
    pub category: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentClassification {
    ActiveIsolatedEnv {
        prefix: PathBuf,
        base_prefix: PathBuf,
    },
    ExternallyManagedBare {
        marker: PolicyMarker,
    },
    UnmanagedBare,
}

impl EnvironmentClassification {
    pub fn label(&self) -> &'static str {
        match self {
            EnvironmentClassification::ActiveIsolatedEnv { .. } => "active_isolated_env",
            EnvironmentClassification::ExternallyManagedBare { .. } => "externally_managed_bare",
            EnvironmentClassification::UnmanagedBare => "unmanaged_bare",
        }
    }
}

/// Derived fresh on every call; nothing is cached.
pub fn classify<R: CommandRunner>(
    handle: &InterpreterHandle,
    runner: &R,
) -> Result<EnvironmentClassification, BootstrapError> {
    let args = vec!["-c".to_string(), PROBE_SCRIPT.to_string()];
    let output = runner.run(&handle.path, &args, true).map_err(|err| {
        BootstrapError::Process(format!(
            "failed to run `{}`: {err}",
            render_command(&handle.path, &args)
        ))
    })?;
    if !output.success() {
        return Err(BootstrapError::Process(format!(
            "interpreter {} failed to report its prefixes (status {}): {}",
            handle.path.display(),
            output.status_code,
            output.stderr_text()
        )));
    }
    let probe: PrefixProbe = serde_json::from_str(&output.stdout_text())?;

    if probe.real_prefix.is_some() || probe.prefix != probe.base_prefix {
        debug!(prefix = %probe.prefix.display(), base_prefix = %probe.base_prefix.display(), "running inside an isolated environment");
        return Ok(EnvironmentClassification::ActiveIsolatedEnv {
            prefix: probe.prefix,
            base_prefix: probe.base_prefix,
        });
    }

    let categories: Vec<(String, PathBuf)> = LIBRARY_CATEGORIES
        .iter()
        .filter_map(|category| {
            probe
                .paths
                .get(*category)
                .cloned()
                .flatten()
                .map(|path| (category.to_string(), path))
        })
        .collect();

    Ok(match find_policy_marker(&categories) {
        Some(marker) => {
            debug!(category = %marker.category, path = %marker.path.display(), "policy marker found");
            EnvironmentClassification::ExternallyManagedBare { marker }
        }
        None => EnvironmentClassification::UnmanagedBare,
    })
}

/// First marker by category order, then by ancestor proximity.
pub fn find_policy_marker(categories: &[(String, PathBuf)]) -> Option<PolicyMarker> {
    for (category, dir) in categories {
        if let Some(path) = nearest_marker(dir) {
            return Some(PolicyMarker {
                category: category.clone(),
                path,
            });
        }
    }
    None
}

fn nearest_marker(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .map(|ancestor| ancestor.join(POLICY_MARKER))
        .find(|candidate| candidate.is_file())
}
