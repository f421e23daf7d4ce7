//! RPM/ARPA source style detection.
//!
//! Per the current ARPA convention: a specfile at `fedora/SPECS/*.spec` or
//! a top-level `*.spec`. Exactly one must exist; finding two or more is
//! fatal. This supersedes `moncic/source/rpm.py`'s `.travis.yml`-based
//! detector, which targeted an older convention no longer in use.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::distro::Distro;
use crate::error::MonciError;

use super::{DistroSource, Source, SourceStyle};

/// Which RPM packaging convention a [`DistroSource`] was detected as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpmStyle {
    Arpa,
}

impl RpmStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            RpmStyle::Arpa => "rpm-arpa",
        }
    }
}

/// Finds the single specfile governing `path`, per the ARPA convention:
/// either `fedora/SPECS/*.spec`, or a `*.spec` at the repo root.
fn find_specfile(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let mut found = Vec::new();

    let fedora_specs = path.join("fedora/SPECS");
    if fedora_specs.is_dir() {
        for entry in std::fs::read_dir(&fedora_specs)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".spec") {
                found.push(Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?);
            }
        }
    }

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".spec") {
            found.push(Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?);
        }
    }

    match found.len() {
        0 => bail!(MonciError::Fail(format!("{path}: no specfile found"))),
        1 => Ok(found.remove(0)),
        n => bail!(MonciError::Fail(format!("{path}: found {n} specfiles, expected exactly one"))),
    }
}

/// Autodetects the RPM packaging style of `local`, which must be a
/// directory or git working tree containing an ARPA-convention specfile.
pub fn detect(local: Source, distro: Arc<dyn Distro>) -> Result<DistroSource> {
    let path = match &local {
        Source::Dir { path } | Source::Git { path, .. } => path.clone(),
        Source::File { .. } => bail!(MonciError::Fail("a single file is not a valid RPM source".to_string())),
        Source::Url { .. } => bail!(MonciError::Fail("a remote source must be cloned before RPM detection".to_string())),
    };

    find_specfile(&path)?;
    Ok(DistroSource { source: local, distro, style: SourceStyle::Rpm(RpmStyle::Arpa), debian_info: None, gbp_info: None })
}

/// Builds a `DistroSource` of an explicitly requested RPM style.
pub fn create_with_style(local: Source, distro: Arc<dyn Distro>, style: RpmStyle) -> Result<DistroSource> {
    match style {
        RpmStyle::Arpa => detect(local, distro),
    }
}

/// Adds the specfile's `Version:` tag to a lint version scan.
pub fn merge_lint_versions(path: &Utf8Path, versions: &mut BTreeMap<String, String>) -> Result<()> {
    let specfile = find_specfile(path)?;
    let contents = std::fs::read_to_string(&specfile)?;
    let re = Regex::new(r"(?m)^Version:\s*(\S+)").unwrap();
    if let Some(caps) = re.captures(&contents) {
        versions.insert("rpm-spec".to_string(), caps[1].to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::lookup_distro;

    #[test]
    fn find_specfile_prefers_fedora_specs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(path.join("fedora/SPECS")).unwrap();
        std::fs::write(path.join("fedora/SPECS/hello.spec"), "Name: hello\nVersion: 1.0\n").unwrap();
        let found = find_specfile(&path).unwrap();
        assert_eq!(found.file_name(), Some("hello.spec"));
    }

    #[test]
    fn find_specfile_accepts_root_level_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("hello.spec"), "Name: hello\nVersion: 1.0\n").unwrap();
        assert!(find_specfile(&path).is_ok());
    }

    #[test]
    fn find_specfile_rejects_multiple_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("a.spec"), "Name: a\nVersion: 1.0\n").unwrap();
        std::fs::write(path.join("b.spec"), "Name: b\nVersion: 1.0\n").unwrap();
        assert!(find_specfile(&path).is_err());
    }

    #[test]
    fn find_specfile_rejects_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        assert!(find_specfile(&path).is_err());
    }

    #[test]
    fn merge_lint_versions_reads_version_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("hello.spec"), "Name: hello\nVersion: 2.5\nRelease: 1\n").unwrap();
        let mut versions = BTreeMap::new();
        merge_lint_versions(&path, &mut versions).unwrap();
        assert_eq!(versions.get("rpm-spec"), Some(&"2.5".to_string()));
    }

    #[test]
    fn detect_requires_dir_or_git_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pkg.dsc");
        std::fs::write(&file, "x").unwrap();
        let path = Utf8PathBuf::from_path_buf(file).unwrap();
        let source = Source::File { path };
        let distro = lookup_distro("fedora:41").unwrap();
        assert!(detect(source, distro).is_err());
    }
}
