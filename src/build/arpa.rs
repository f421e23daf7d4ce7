//! ARPA/RPM build style: the SIMC/ARPA packaging convention, building RPMs
//! with `rpmbuild` from either a `fedora/SPECS/*.spec` upstream layout or a
//! root-level specfile.
//!
//! Grounded in `moncic/build/arpa.py`.

use anyhow::{Context, Result, bail};
use camino::Utf8Path;

use crate::distro::Distro;
use crate::script::Script;
use crate::source::{DistroSource, RpmStyle, SourceStyle};

use super::{BuildConfig, Builder};

pub struct ArpaBuilder {
    #[allow(dead_code)]
    style: RpmStyle,
}

impl ArpaBuilder {
    pub fn new(style: RpmStyle) -> Self {
        Self { style }
    }
}

impl Builder for ArpaBuilder {
    fn name(&self) -> &'static str {
        "arpa"
    }

    fn setup_script(&self, _distro: &dyn Distro, _build_config: &BuildConfig) -> Script {
        Script::new()
    }

    fn build_script(&self, source: &DistroSource, build_config: &BuildConfig) -> Result<Script> {
        if !matches!(source.style, SourceStyle::Rpm(_)) {
            bail!("ArpaBuilder used with a non-RPM source");
        }
        let path = source.source.path().context("RPM build source must have a local path")?;
        let specfile = find_specfile_relative(path)?;
        let pkgname = specfile.trim_end_matches(".spec").rsplit('/').next().unwrap_or(&specfile).to_string();

        let mut script = Script::new().with_title("build RPM packages (ARPA convention)");
        for dir in ["BUILD", "BUILDROOT", "RPMS", "SOURCES", "SPECS", "SRPMS"] {
            script.command(["mkdir", "-p", &format!("/root/rpmbuild/{dir}")]);
        }

        script.command(["sh", "-c", "command -v dnf >/dev/null 2>&1 && dnf builddep -y \"$0\" || yum-builddep -y \"$0\"", &specfile]);

        if let Some(rest) = specfile.strip_prefix("fedora/SPECS/") {
            let _ = rest;
            script.if_block("[ -d fedora/SOURCES ]", |s| {
                s.command(["sh", "-c", "cp fedora/SOURCES/* /root/rpmbuild/SOURCES/"]);
            });
            script.command([
                "sh",
                "-c",
                &format!("git archive --prefix={pkgname}/ --format=tar HEAD | gzip > /root/rpmbuild/SOURCES/{pkgname}.tar.gz"),
            ]);
            script.command(["spectool", "-g", "-R", "--define", &format!("srcarchivename {pkgname}"), &specfile]);
            let build_arg = if build_config.source_only { "-br" } else { "-ba" };
            script.command(["rpmbuild", build_arg, "--define", &format!("srcarchivename {pkgname}"), &specfile]);
        } else {
            script.command(["sh", "-c", "cp *.patch /root/rpmbuild/SOURCES/ 2>/dev/null || true"]);
            script.command(["spectool", "-g", "-R", &specfile]);
            script.command(["rpmbuild", "-ba", &specfile]);
        }

        Ok(script)
    }

    fn collect_artifacts(&self, container_root: &Utf8Path, artifacts_dir: &Utf8Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let rpmbuild = container_root.join("root/rpmbuild");
        for subdir in ["RPMS", "SRPMS"] {
            let base = rpmbuild.join(subdir);
            if !base.is_dir() {
                continue;
            }
            collect_rpms(&base, artifacts_dir, &mut names)?;
        }
        Ok(names)
    }
}

fn collect_rpms(dir: &Utf8Path, artifacts_dir: &Utf8Path, names: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if let Ok(sub) = camino::Utf8PathBuf::from_path_buf(path) {
                collect_rpms(&sub, artifacts_dir, names)?;
            }
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".rpm") {
            std::fs::copy(entry.path(), artifacts_dir.join(name.as_ref()))?;
            names.push(name.into_owned());
        }
    }
    Ok(())
}

/// Finds the ARPA specfile relative to `path`, for embedding in the build
/// script's argv (which runs with `path` as cwd in the guest).
fn find_specfile_relative(path: &Utf8Path) -> Result<String> {
    let fedora_specs = path.join("fedora/SPECS");
    if fedora_specs.is_dir() {
        for entry in std::fs::read_dir(&fedora_specs)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".spec") {
                return Ok(format!("fedora/SPECS/{name}"));
            }
        }
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".spec") {
            return Ok(name.into_owned());
        }
    }
    bail!("no specfile found under {path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::lookup_distro;
    use crate::source::Source;
    use camino::Utf8PathBuf;

    fn fixture_source(path: Utf8PathBuf) -> DistroSource {
        let distro = lookup_distro("fedora:41").unwrap();
        DistroSource { source: Source::Dir { path }, distro, style: SourceStyle::Rpm(RpmStyle::Arpa), debian_info: None, gbp_info: None }
    }

    #[test]
    fn build_script_uses_fedora_specs_layout_archive_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(path.join("fedora/SPECS")).unwrap();
        std::fs::write(path.join("fedora/SPECS/hello.spec"), "Name: hello\nVersion: 1.0\n").unwrap();

        let source = fixture_source(path);
        let builder = ArpaBuilder::new(RpmStyle::Arpa);
        let script = builder.build_script(&source, &BuildConfig::default()).unwrap();
        assert!(script.lines().iter().any(|l| l.contains("git archive --prefix=hello/")));
        assert!(script.lines().iter().any(|l| l.contains("rpmbuild -ba")));
    }

    #[test]
    fn build_script_uses_root_spec_br_when_source_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("hello.spec"), "Name: hello\nVersion: 1.0\n").unwrap();

        let source = fixture_source(path);
        let builder = ArpaBuilder::new(RpmStyle::Arpa);
        let script = builder.build_script(&source, &BuildConfig::default()).unwrap();
        assert!(script.lines().iter().any(|l| l.contains("rpmbuild -ba hello.spec")));
    }
}
