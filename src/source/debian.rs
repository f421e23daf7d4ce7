//! Debian source style autodetection and metadata parsing.
//!
//! Grounded in `moncic/source/debian.py` (`SourceInfo`, `DSCInfo`,
//! `GBPInfo`, and the `DebianSource.create_from_{file,dir,git}`
//! autodetection cascade).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use regex::Regex;

use crate::distro::Distro;
use crate::error::MonciError;
use crate::executor::{CommandExecutor, CommandSpec};

use super::{DistroSource, Source, SourceStyle};

/// Which Debian packaging style a [`DistroSource`] was detected as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebianStyle {
    Dsc,
    Dir,
    GbpRelease,
    GbpTestDebian,
    GbpTestUpstream,
}

impl DebianStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            DebianStyle::Dsc => "debian-dsc",
            DebianStyle::Dir => "debian-dir",
            DebianStyle::GbpRelease => "debian-gbp-release",
            DebianStyle::GbpTestDebian => "debian-gbp-test",
            DebianStyle::GbpTestUpstream => "debian-gbp-upstream",
        }
    }
}

/// Parsed `debian/changelog` head line (or `.dsc` header fields).
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: String,
    pub version: String,
    pub dsc_filename: String,
    pub tar_stem: String,
    pub native: bool,
    pub upstream_version: String,
    /// Extra assets listed in a `.dsc`'s `Files:` section; empty unless
    /// this was parsed from one.
    pub file_list: Vec<String>,
}

static CHANGELOG_HEAD: &str = r"^(\S+) \((?:[^:]+:)?([^)]+)\)";

impl SourceInfo {
    fn from_name_version(name: &str, version: &str, file_list: Vec<String>) -> Self {
        let version_dsc = version.split_once(':').map(|(_, v)| v).unwrap_or(version);
        let native = !version_dsc.contains('-');

        let (tar_stem, upstream_version) = if native {
            (format!("{name}_{version_dsc}.tar"), version.to_string())
        } else {
            let upstream = version_dsc.split_once('-').map(|(u, _)| u).unwrap_or(version_dsc);
            (format!("{name}_{upstream}.orig.tar"), upstream.to_string())
        };

        Self {
            name: name.to_string(),
            version: version.to_string(),
            dsc_filename: format!("{name}_{version_dsc}.dsc"),
            tar_stem,
            native,
            upstream_version,
            file_list,
        }
    }

    /// Parses the first line of `debian/changelog`, e.g.
    /// `foo (1.2-1) unstable; urgency=medium`.
    pub fn from_changelog(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let re = Regex::new(CHANGELOG_HEAD).unwrap();
        let first_line = contents.lines().next().unwrap_or_default();
        let caps = re.captures(first_line).ok_or_else(|| MonciError::Fail("unparsable debian/changelog".to_string()))?;
        Ok(Self::from_name_version(&caps[1], &caps[2], Vec::new()))
    }

    /// Parses a `.dsc` file's `Source:`/`Version:`/`Files:` header.
    pub fn from_dsc(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let mut name = None;
        let mut version = None;
        let mut file_list = Vec::new();
        let re_file = Regex::new(r"^\s+\S+\s+\d+\s+(\S+)\s*$").unwrap();
        let mut in_files = false;
        for line in contents.lines() {
            if !in_files {
                if let Some(rest) = line.strip_prefix("Source: ") {
                    name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("Version: ") {
                    version = Some(rest.trim().to_string());
                } else if line.starts_with("Files:") {
                    in_files = true;
                }
            } else if let Some(caps) = re_file.captures(line) {
                file_list.push(caps[1].to_string());
            } else {
                in_files = false;
            }
        }
        let name = name.ok_or_else(|| MonciError::Fail(format!("{path}: Source: entry not found")))?;
        let version = version.ok_or_else(|| MonciError::Fail(format!("{path}: Version: entry not found")))?;
        Ok(Self::from_name_version(&name, &version, file_list))
    }

    /// Parses `debian/gbp.conf`, substituting `%(version)s` placeholders
    /// from this source's upstream/full version.
    pub fn parse_gbp(&self, gbp_conf_path: &Utf8Path) -> Result<GBPInfo> {
        let contents = std::fs::read_to_string(gbp_conf_path).with_context(|| format!("reading {gbp_conf_path}"))?;
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let upstream_branch = values.get("upstream-branch").cloned().unwrap_or_else(|| "upstream".to_string());
        let mut upstream_tag = values.get("upstream-tag").cloned().unwrap_or_else(|| "upstream/%(version)s".to_string());
        let debian_branch = values.get("debian-branch").cloned().unwrap_or_else(|| "master".to_string());
        let mut debian_tag = values.get("debian-tag").cloned().unwrap_or_else(|| "debian/%(version)s".to_string());

        if let Some((uv, _)) = self.version.split_once('-') {
            upstream_tag = upstream_tag.replace("%(version)s", uv);
            debian_tag = debian_tag.replace("%(version)s", &self.version);
        }

        Ok(GBPInfo { upstream_branch, upstream_tag, debian_branch, debian_tag })
    }
}

/// Parsed `debian/gbp.conf` fields.
#[derive(Debug, Clone)]
pub struct GBPInfo {
    pub upstream_branch: String,
    pub upstream_tag: String,
    pub debian_branch: String,
    pub debian_tag: String,
}

/// Autodetects the Debian packaging style of `local`.
pub fn detect(local: Source, distro: Arc<dyn Distro>, executor: &dyn CommandExecutor) -> Result<DistroSource> {
    match local {
        Source::File { ref path } => {
            if path.extension() == Some("dsc") {
                let info = SourceInfo::from_dsc(path)?;
                Ok(DistroSource { source: local, distro, style: SourceStyle::Debian(DebianStyle::Dsc), debian_info: Some(info), gbp_info: None })
            } else {
                bail!(MonciError::Fail(format!("{path}: cannot detect source type")))
            }
        }
        Source::Dir { ref path } => {
            if !path.join("debian").is_dir() {
                bail!(MonciError::Fail(format!("{path}: cannot detect source type")));
            }
            let info = SourceInfo::from_changelog(&path.join("debian/changelog"))?;
            Ok(DistroSource { source: local, distro, style: SourceStyle::Debian(DebianStyle::Dir), debian_info: Some(info), gbp_info: None })
        }
        Source::Git { .. } => detect_git(local, distro, executor),
        Source::Url { ref url } => {
            let cloned = super::clone_git(executor, url.as_str(), None)?;
            detect(cloned, distro, executor)
        }
    }
}

fn detect_git(local: Source, distro: Arc<dyn Distro>, executor: &dyn CommandExecutor) -> Result<DistroSource> {
    let Source::Git { path, .. } = &local else { unreachable!() };
    let changelog = path.join("debian/changelog");

    if !changelog.is_file() {
        let Some(branch) = find_packaging_branch(path, &distro, executor)? else {
            bail!(MonciError::Fail(format!("{path}: cannot detect source type")));
        };
        return prepare_test_upstream(local, distro, &branch, executor);
    }

    let info = SourceInfo::from_changelog(&changelog)?;
    let gbp_conf = path.join("debian/gbp.conf");
    if !gbp_conf.is_file() {
        return Ok(DistroSource { source: local, distro, style: SourceStyle::Debian(DebianStyle::Dir), debian_info: Some(info), gbp_info: None });
    }

    let gbp = info.parse_gbp(&gbp_conf)?;
    if is_tagged_head(path, executor)? {
        Ok(DistroSource { source: local, distro, style: SourceStyle::Debian(DebianStyle::GbpRelease), debian_info: Some(info), gbp_info: Some(gbp) })
    } else {
        prepare_test_debian(local, distro, info, gbp, executor)
    }
}

/// Creates a `DistroSource` of an explicitly requested style, skipping
/// autodetection but still enforcing that the style fits `local`'s kind.
pub fn create_with_style(local: Source, distro: Arc<dyn Distro>, style: DebianStyle, executor: &dyn CommandExecutor) -> Result<DistroSource> {
    match (style, &local) {
        (DebianStyle::Dsc, Source::File { path }) => {
            let info = SourceInfo::from_dsc(path)?;
            Ok(DistroSource { source: local.clone(), distro, style: SourceStyle::Debian(style), debian_info: Some(info), gbp_info: None })
        }
        (DebianStyle::Dir, Source::Dir { path }) | (DebianStyle::Dir, Source::Git { path, .. }) => {
            let info = SourceInfo::from_changelog(&path.join("debian/changelog"))?;
            Ok(DistroSource { source: local.clone(), distro, style: SourceStyle::Debian(style), debian_info: Some(info), gbp_info: None })
        }
        (DebianStyle::GbpRelease | DebianStyle::GbpTestDebian | DebianStyle::GbpTestUpstream, Source::Git { .. }) => {
            detect_git(local, distro, executor)
        }
        _ => bail!(MonciError::Fail(format!("source type {} is not applicable on this source", style.as_str()))),
    }
}

/// Adds Debian-specific entries to a lint version scan: the upstream and
/// (when non-native) release components of `debian/changelog`'s version.
pub fn merge_lint_versions(info: &SourceInfo, versions: &mut BTreeMap<String, String>) {
    if let Some((upstream, _)) = info.version.split_once('-') {
        versions.insert("debian-upstream".to_string(), upstream.to_string());
        versions.insert("debian-release".to_string(), info.version.clone());
    } else {
        versions.insert("debian-upstream".to_string(), info.version.clone());
    }
}

fn candidate_branches(distro: &Arc<dyn Distro>) -> Vec<String> {
    let full = distro.full_name();
    let codename = full.split_once(':').map(|(_, c)| c).unwrap_or(full);
    let prefix = if full.starts_with("ubuntu:") { "ubuntu" } else { "debian" };
    vec![format!("{prefix}/{codename}"), "debian/latest".to_string()]
}

fn find_packaging_branch(path: &Utf8Path, distro: &Arc<dyn Distro>, executor: &dyn CommandExecutor) -> Result<Option<String>> {
    let spec = CommandSpec::new(
        "git",
        vec!["for-each-ref".into(), "--format=%(refname:short)".into(), "refs/heads".into(), "refs/remotes".into()],
    )
    .with_cwd(path.to_path_buf());
    let result = executor.execute(&spec)?;
    let refs: Vec<&str> = result.stdout_string().lines().map(|l| l.trim()).collect();

    for candidate in candidate_branches(distro) {
        if refs.iter().any(|r| *r == candidate) {
            return Ok(Some(candidate));
        }
        let origin_ref = format!("origin/{candidate}");
        if refs.iter().any(|r| *r == origin_ref) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn is_tagged_head(path: &Utf8Path, executor: &dyn CommandExecutor) -> Result<bool> {
    let spec = CommandSpec::new("git", vec!["tag".into(), "--points-at".into(), "HEAD".into()]).with_cwd(path.to_path_buf());
    let result = executor.execute(&spec)?;
    Ok(!result.stdout_string().trim().is_empty())
}

fn current_branch(path: &Utf8Path, executor: &dyn CommandExecutor) -> Result<Option<String>> {
    let spec = CommandSpec::new("git", vec!["symbolic-ref".into(), "--short".into(), "-q".into(), "HEAD".into()]).with_cwd(path.to_path_buf());
    let result = executor.execute(&spec)?;
    if !result.success() {
        return Ok(None);
    }
    let name = result.stdout_string().trim().to_string();
    Ok(if name.is_empty() { None } else { Some(name) })
}

fn run_git(executor: &dyn CommandExecutor, path: &Utf8Path, args: Vec<std::ffi::OsString>) -> Result<()> {
    let spec = CommandSpec::new("git", args).with_cwd(path.to_path_buf());
    let result = executor.execute(&spec)?;
    if !result.success() {
        bail!("git command failed: {}", result.stdout_string());
    }
    Ok(())
}

/// Merges the active branch into the distro's packaging branch for a test
/// build, mirroring `DebianGBPTestUpstream.prepare_from_git`.
fn prepare_test_upstream(local: Source, distro: Arc<dyn Distro>, branch: &str, executor: &dyn CommandExecutor) -> Result<DistroSource> {
    let writable = local.get_writable(executor)?;
    let Source::Git { path, .. } = &writable else { unreachable!() };

    let active_branch = match current_branch(path, executor)? {
        Some(name) => name,
        None => {
            run_git(executor, path, vec!["checkout".into(), "HEAD".into(), "-b".into(), "moncic-ci".into()])?;
            "moncic-ci".to_string()
        }
    };

    run_git(executor, path, vec!["checkout".into(), "--quiet".into(), branch.into()])?;
    run_git(
        executor,
        path,
        vec![
            "-c".into(),
            "user.email=moncic-ci@example.org".into(),
            "-c".into(),
            "user.name=Moncic-CI".into(),
            "merge".into(),
            "--quiet".into(),
            active_branch.clone().into(),
            "-m".into(),
            "CI merge".into(),
        ],
    )?;

    let info = SourceInfo::from_changelog(&path.join("debian/changelog"))?;
    let gbp = info.parse_gbp(&path.join("debian/gbp.conf"))?;
    Ok(DistroSource { source: writable, distro, style: SourceStyle::Debian(DebianStyle::GbpTestUpstream), debian_info: Some(info), gbp_info: Some(gbp) })
}

/// Merges the upstream branch named in `gbp.conf` into the current
/// packaging branch for a test build, mirroring
/// `DebianGBPTestDebian.prepare_from_git`.
fn prepare_test_debian(local: Source, distro: Arc<dyn Distro>, info: SourceInfo, gbp: GBPInfo, executor: &dyn CommandExecutor) -> Result<DistroSource> {
    let writable = local.get_writable(executor)?;
    let Source::Git { path, .. } = &writable else { unreachable!() };

    run_git(
        executor,
        path,
        vec![
            "-c".into(),
            "user.email=moncic-ci@example.org".into(),
            "-c".into(),
            "user.name=Moncic-CI".into(),
            "merge".into(),
            gbp.upstream_branch.clone().into(),
            "--quiet".into(),
            "-m".into(),
            "CI merge".into(),
        ],
    )?;

    Ok(DistroSource { source: writable, distro, style: SourceStyle::Debian(DebianStyle::GbpTestDebian), debian_info: Some(info), gbp_info: Some(gbp) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::lookup_distro;
    use crate::executor::MockCommandExecutor;
    use crate::runlog::RunLog;
    use camino::Utf8PathBuf;
    use std::sync::{Arc as StdArc, Mutex};

    fn write_changelog(dir: &Utf8Path, line: &str) {
        std::fs::create_dir_all(dir.join("debian")).unwrap();
        std::fs::write(dir.join("debian/changelog"), format!("{line}\n")).unwrap();
    }

    #[test]
    fn source_info_from_changelog_non_native() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        write_changelog(&path, "hello (1.0-1) unstable; urgency=medium");
        let info = SourceInfo::from_changelog(&path.join("debian/changelog")).unwrap();
        assert_eq!(info.name, "hello");
        assert_eq!(info.version, "1.0-1");
        assert!(!info.native);
        assert_eq!(info.upstream_version, "1.0");
        assert_eq!(info.dsc_filename, "hello_1.0-1.dsc");
    }

    #[test]
    fn source_info_from_changelog_native() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        write_changelog(&path, "hello (1.0) unstable; urgency=medium");
        let info = SourceInfo::from_changelog(&path.join("debian/changelog")).unwrap();
        assert!(info.native);
        assert_eq!(info.upstream_version, "1.0");
    }

    #[test]
    fn detect_plain_dir_without_gbp() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        write_changelog(&path, "hello (2.0-1) unstable; urgency=medium");
        let source = Source::Dir { path };
        let log = StdArc::new(Mutex::new(RunLog::new()));
        let executor: StdArc<dyn CommandExecutor> = StdArc::new(MockCommandExecutor::new(log));
        let distro = lookup_distro("debian:bookworm").unwrap();
        let result = detect(source, distro, executor.as_ref()).unwrap();
        assert_eq!(result.style, SourceStyle::Debian(DebianStyle::Dir));
    }

    #[test]
    fn detect_file_requires_dsc_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, "not a dsc").unwrap();
        let path = Utf8PathBuf::from_path_buf(file).unwrap();
        let source = Source::File { path };
        let log = StdArc::new(Mutex::new(RunLog::new()));
        let executor: StdArc<dyn CommandExecutor> = StdArc::new(MockCommandExecutor::new(log));
        let distro = lookup_distro("debian:bookworm").unwrap();
        assert!(detect(source, distro, executor.as_ref()).is_err());
    }

    #[test]
    fn parse_gbp_substitutes_version_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(path.join("debian")).unwrap();
        std::fs::write(
            path.join("debian/gbp.conf"),
            "[DEFAULT]\nupstream-branch = upstream\nupstream-tag = upstream/%(version)s\ndebian-tag = debian/%(version)s\n",
        )
        .unwrap();
        let info = SourceInfo::from_name_version("hello", "2.0-3", Vec::new());
        let gbp = info.parse_gbp(&path.join("debian/gbp.conf")).unwrap();
        assert_eq!(gbp.upstream_tag, "upstream/2.0");
        assert_eq!(gbp.debian_tag, "debian/2.0-3");
    }
}
