//! Debian build style: `dpkg-buildpackage`/`gbp buildpackage` source step
//! plus the binary build step shared by all Debian-family styles.
//!
//! Grounded in `moncic/build/debian.py`.

use anyhow::{Result, bail};
use camino::Utf8Path;

use crate::distro::Distro;
use crate::script::Script;
use crate::source::{DebianStyle, DistroSource, SourceStyle};

use super::{BuildConfig, Builder, GUEST_BUILD_DIR};

pub struct DebianBuilder {
    style: DebianStyle,
}

impl DebianBuilder {
    pub fn new(style: DebianStyle) -> Self {
        Self { style }
    }
}

/// Splits a `buildProfile` string into `(profiles, options)` per the fixed
/// keyword classification: `nocheck`/`nodoc` go to both; a fixed set of
/// `key=value`/flag prefixes go to options only; everything else is a
/// profile name.
fn split_build_profile(build_profile: &str) -> (Vec<String>, Vec<String>) {
    const OPTION_PREFIXES: &[&str] =
        &["parallel=", "nostrip", "terse", "hardening=", "reproducibile=", "abi=", "future=", "qa=", "optimize=", "sanitize="];

    let mut profiles = Vec::new();
    let mut options = Vec::new();
    for entry in build_profile.split_whitespace() {
        if entry == "nocheck" || entry == "nodoc" {
            profiles.push(entry.to_string());
            options.push(entry.to_string());
        } else if OPTION_PREFIXES.iter().any(|p| entry.starts_with(p)) {
            options.push(entry.to_string());
        } else {
            profiles.push(entry.to_string());
        }
    }
    (profiles, options)
}

impl Builder for DebianBuilder {
    fn name(&self) -> &'static str {
        "debian"
    }

    fn setup_script(&self, _distro: &dyn Distro, _build_config: &BuildConfig) -> Script {
        let mut script = Script::new().with_title("prepare Debian system for build");
        script.line("echo man-db man-db/auto-update boolean false | debconf-set-selections");
        script
    }

    fn build_script(&self, source: &DistroSource, build_config: &BuildConfig) -> Result<Script> {
        let SourceStyle::Debian(style) = source.style else { bail!("DebianBuilder used with a non-Debian source") };

        let mut script = Script::new().with_title("build Debian packages");

        match style {
            DebianStyle::Dsc => {
                // The source is already a .dsc; nothing to produce, the
                // binary step unpacks it directly.
            }
            DebianStyle::Dir => {
                script.command(["dpkg-buildpackage", "-S", "--no-sign", "--no-pre-clean"]);
            }
            DebianStyle::GbpRelease => {
                script.command(["gbp", "buildpackage", "--git-export-dir=..", "--git-builder=dpkg-buildpackage -S --no-sign"]);
            }
            DebianStyle::GbpTestDebian => {
                script.command([
                    "gbp",
                    "buildpackage",
                    "--git-export-dir=..",
                    "--git-builder=dpkg-buildpackage -S --no-sign",
                    "--git-ignore-branch",
                ]);
            }
            DebianStyle::GbpTestUpstream => {
                script.command([
                    "gbp",
                    "buildpackage",
                    "--git-export-dir=..",
                    "--git-builder=dpkg-buildpackage -S --no-sign",
                    "--git-upstream-tree=branch",
                    "--git-ignore-branch",
                ]);
            }
        }

        if build_config.source_only {
            return Ok(script);
        }

        append_binary_build(&mut script, source, build_config)?;
        Ok(script)
    }

    fn collect_artifacts(&self, container_root: &Utf8Path, artifacts_dir: &Utf8Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(container_root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name();
                std::fs::copy(entry.path(), artifacts_dir.join(name.to_string_lossy().as_ref()))?;
                names.push(name.to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

fn append_binary_build(script: &mut Script, source: &DistroSource, build_config: &BuildConfig) -> Result<()> {
    let dsc_name = match &source.debian_info {
        Some(info) => info.dsc_filename.clone(),
        None => bail!("Debian build source has no changelog-derived info"),
    };

    script.cd(Utf8Path::new(GUEST_BUILD_DIR));
    script.command(["dpkg-source", "-x", &dsc_name]);

    if !build_config.build_profile.is_empty() {
        let (profiles, options) = split_build_profile(&build_config.build_profile);
        script.setenv("DEB_BUILD_PROFILES", &profiles.join(" "));
        script.setenv("DEB_BUILD_OPTIONS", &options.join(" "));
    }

    script.line("builddir=$(find . -mindepth 1 -maxdepth 1 -type d | head -n1)");
    script.if_block("[ -z \"$builddir\" ]", |s| {
        s.fail("build directory not found");
    });
    script.line("cd \"$builddir\"");

    script.setenv("DEBIAN_FRONTEND", "noninteractive");
    script.command(["apt-get", "build-dep", "-y", "./"]);

    // Build dependencies are installed; Debian packages must build without
    // network access from here on.
    script.command(["unshare", "--net", "--", "sh", "-c", "ip link set dev lo up && exec \"$0\" \"$@\"", "sh", "-c", &build_command(build_config)]);
    Ok(())
}

fn build_command(build_config: &BuildConfig) -> String {
    let mut argv = vec!["dpkg-buildpackage".to_string(), "--no-sign".to_string()];
    if build_config.include_source {
        argv.push("-sa".to_string());
    }
    crate::script::shell_join(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_build_profile_routes_shared_keywords_to_both() {
        let (profiles, options) = split_build_profile("nocheck parallel=4 foo");
        assert_eq!(profiles, vec!["nocheck", "foo"]);
        assert_eq!(options, vec!["nocheck", "parallel=4"]);
    }

    #[test]
    fn build_command_adds_sa_when_include_source() {
        let build_config = BuildConfig { include_source: true, ..Default::default() };
        assert_eq!(build_command(&build_config), "dpkg-buildpackage --no-sign -sa");
    }

    #[test]
    fn build_script_for_dir_style_runs_dpkg_buildpackage_source_step() {
        use crate::distro::lookup_distro;
        use crate::source::Source;
        use camino::Utf8PathBuf;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(path.join("debian")).unwrap();
        std::fs::write(path.join("debian/changelog"), "hello (1.0-1) unstable; urgency=medium\n").unwrap();

        let distro: Arc<dyn Distro> = lookup_distro("debian:bookworm").unwrap();
        let info = crate::source::debian::SourceInfo::from_changelog(&path.join("debian/changelog")).unwrap();
        let source = DistroSource {
            source: Source::Dir { path },
            distro,
            style: SourceStyle::Debian(DebianStyle::Dir),
            debian_info: Some(info),
            gbp_info: None,
        };

        let builder = DebianBuilder::new(DebianStyle::Dir);
        let build_config = BuildConfig { source_only: true, ..Default::default() };
        let script = builder.build_script(&source, &build_config).unwrap();
        assert!(script.lines().iter().any(|l| l.contains("dpkg-buildpackage -S --no-sign --no-pre-clean")));
    }
}
