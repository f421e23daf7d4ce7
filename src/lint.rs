//! `monci lint`: host-side checks on a source tree against its resolved
//! distro/style, surfacing disagreeing version strings and missing
//! packaging metadata as warnings or errors.
//!
//! Grounded in `moncic/lint.py`. The in-container half (`guestLint`,
//! upstream's build-dependency/installability checks run inside a live
//! image) has no counterpart here: it is TODO upstream too, returning an
//! empty report, so only the host half is implemented.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::source::{DistroSource, SourceStyle};

/// Findings from linting a source tree, partitioned by severity.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LintReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl LintReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Lints `source`: disagreeing version strings across the files
/// [`DistroSource::lint_find_versions`] scans are reported as warnings; a
/// Debian source with no changelog-derived version, or an RPM source with
/// no specfile-derived style, is an error (the build pipeline cannot run
/// at all).
pub fn lint_source(source: &DistroSource, allow_exec: bool) -> Result<LintReport> {
    let mut report = LintReport::default();

    match &source.style {
        SourceStyle::Debian(_) if source.debian_info.is_none() => {
            report.error("no version could be determined from debian/changelog");
        }
        _ => {}
    }

    let versions = source.lint_find_versions(allow_exec)?;
    let distinct: BTreeSet<&String> = versions.values().collect();
    if distinct.len() > 1 {
        let detail = versions.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");
        report.warn(format!("version strings disagree across sources: {detail}"));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::lookup_distro;
    use crate::source::Source;
    use camino::Utf8PathBuf;

    #[test]
    fn missing_debian_info_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = DistroSource {
            source: Source::Dir { path },
            distro: lookup_distro("debian:bookworm").unwrap(),
            style: SourceStyle::Debian(crate::source::DebianStyle::Dir),
            debian_info: None,
            gbp_info: None,
        };
        let report = lint_source(&source, false).unwrap();
        assert!(report.has_errors());
    }

    #[test]
    fn disagreeing_versions_are_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("meson.build"), "project('x', version: '1.0')\n").unwrap();
        std::fs::write(path.join("NEWS.md"), "# New in version 2.0\n").unwrap();
        let info = crate::source::debian::SourceInfo {
            name: "x".to_string(),
            version: "1.0-1".to_string(),
            dsc_filename: "x_1.0-1.dsc".to_string(),
            tar_stem: "x_1.0.tar".to_string(),
            native: false,
            upstream_version: "1.0".to_string(),
            file_list: Vec::new(),
        };
        let source = DistroSource {
            source: Source::Dir { path },
            distro: lookup_distro("debian:bookworm").unwrap(),
            style: SourceStyle::Debian(crate::source::DebianStyle::Dir),
            debian_info: Some(info),
            gbp_info: None,
        };
        let report = lint_source(&source, false).unwrap();
        assert!(report.has_warnings());
        assert!(!report.has_errors());
    }
}
