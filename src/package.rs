use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BootstrapError;
use crate::sync::manifest_entries;

pub const INSTALL_MANIFEST: &str = "install-manifest.txt";

fn parse_version_key(version_tag: &str) -> Option<Vec<u64>> {
    let mut values = Vec::new();
    for part in version_tag.split('.') {
        let value = part.parse::<u64>().ok()?;
        values.push(value);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version_key(a), parse_version_key(b)) {
        (Some(left), Some(right)) => left.cmp(&right),
        _ => a.cmp(b),
    }
}

/// `chatti-1.4.0-py3-none-any.whl` -> `1.4.0`, when the distribution matches.
fn wheel_version<'a>(file_name: &'a str, package: &str) -> Option<&'a str> {
    let stem = file_name.strip_suffix(".whl")?;
    let mut parts = stem.splitn(3, '-');
    let name = parts.next()?;
    let version = parts.next()?;
    parts.next()?;
    let normalize = |s: &str| s.to_lowercase().replace(['-', '.'], "_");
    (normalize(name) == normalize(package)).then_some(version)
}

pub fn newest_wheel(dist_dir: &Path, package: &str) -> Result<Option<PathBuf>, BootstrapError> {
    if !dist_dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<(String, PathBuf)> = None;
    for entry in fs::read_dir(dist_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(version) = wheel_version(&file_name, package) else {
            continue;
        };
        let newer = best
            .as_ref()
            .map(|(current, _)| compare_versions(version, current) == Ordering::Greater)
            .unwrap_or(true);
        if newer {
            best = Some((version.to_string(), entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Explicit spec wins; otherwise the newest wheel for `package` in `dist_dir`.
pub fn resolve_package_spec(
    explicit: Option<&str>,
    dist_dir: &Path,
    package: &str,
) -> Result<String, BootstrapError> {
    if let Some(spec) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        let as_path = Path::new(spec);
        let looks_like_file = spec.ends_with(".whl") || spec.ends_with(".tar.gz");
        if looks_like_file {
            if !as_path.is_file() {
                return Err(BootstrapError::MissingPackage(format!(
                    "package file {spec} does not exist"
                )));
            }
            let absolute = fs::canonicalize(as_path)?;
            return Ok(absolute.to_string_lossy().to_string());
        }
        return Ok(spec.to_string());
    }
    match newest_wheel(dist_dir, package)? {
        Some(wheel) => {
            let absolute = fs::canonicalize(&wheel).unwrap_or(wheel);
            Ok(absolute.to_string_lossy().to_string())
        }
        None => Err(BootstrapError::MissingPackage(format!(
            "no {package} wheel in {}",
            dist_dir.display()
        ))),
    }
}

/// Manifest for the private runtime: the package spec, then any extra entries.
pub fn render_install_manifest(
    spec: &str,
    extra_requirements: Option<&Path>,
) -> Result<(String, usize), BootstrapError> {
    let mut out = String::from("# generated by chatti-bootstrap\n");
    out.push_str(spec);
    out.push('\n');
    if let Some(path) = extra_requirements {
        let text = fs::read_to_string(path).map_err(|err| {
            BootstrapError::Config(format!(
                "cannot read requirements file {}: {err}",
                path.display()
            ))
        })?;
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    let entries = manifest_entries(&out);
    Ok((out, entries))
}
