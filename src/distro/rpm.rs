//! RPM-based families: Fedora, AlmaLinux, Rocky, CentOS.
//!
//! Grounded in `moncic/distro/rpm.py`: `RpmDistro`/`YumDistro`/`DnfDistro`
//! plus the concrete per-distro subclasses and their `init()` catalogs.
//!
//! **Deviation**: upstream's `DnfDistro.get_versions` shells out to the
//! guest's own `/usr/bin/python3` with an embedded `dnf`-API script. This
//! crate does not assume a Python runtime is present in every guest, so
//! `get_versions` here is a dependency-free `rpm -q --queryformat` probe
//! instead, preserving the *operation* (`Image::describe()` needs
//! installed package versions) while dropping the Python dependency.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;

use super::{Distro, VersionMap};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::script::Script;

/// Which noninteractive package manager frontend a distro uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frontend {
    Yum,
    Dnf,
}

impl Frontend {
    fn binary(self) -> &'static str {
        match self {
            Frontend::Yum => "/usr/bin/yum",
            Frontend::Dnf => "/usr/bin/dnf",
        }
    }
}

pub struct RpmDistro {
    full_name: String,
    aliases: Vec<&'static str>,
    mirror: String,
    baseurl_template: String,
    cgroup_v1: bool,
    systemd_version: Option<u32>,
    frontend: Frontend,
    podman_repo: &'static str,
    extra_base_packages: Vec<&'static str>,
    build_env_packages: Vec<&'static str>,
}

impl RpmDistro {
    fn baseurl(&self) -> String {
        self.baseurl_template.replace("{mirror}", &self.mirror)
    }

    fn noninteractive_flags(&self) -> Vec<&'static str> {
        vec!["-y", "-q"]
    }
}

impl Distro for RpmDistro {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    fn family(&self) -> super::Family {
        super::Family::Rpm
    }

    fn aliases(&self) -> &[&str] {
        &self.aliases
    }

    fn cgroup_v1(&self) -> bool {
        self.cgroup_v1
    }

    fn systemd_version(&self) -> Option<u32> {
        self.systemd_version
    }

    fn podman_name(&self) -> (String, String) {
        let version = self.full_name.split_once(':').map(|(_, v)| v).unwrap_or(&self.full_name);
        (self.podman_repo.to_string(), version.to_string())
    }

    fn base_packages(&self) -> Vec<String> {
        let mut pkgs = vec!["bash".to_string(), "dbus".to_string(), "rootfiles".to_string(), "iproute".to_string()];
        pkgs.extend(self.extra_base_packages.iter().map(|s| s.to_string()));
        match self.frontend {
            Frontend::Yum => pkgs.push("yum".to_string()),
            Frontend::Dnf => pkgs.push("dnf".to_string()),
        }
        pkgs
    }

    fn update_pkgdb_script(&self, script: &mut Script) {
        // `check-update` exits 100 when updates are pending; tolerate any
        // status here since this script is purely a cache refresh.
        let mut argv = vec![self.frontend.binary().to_string(), "check-update".to_string()];
        argv.extend(self.noninteractive_flags().iter().map(|s| s.to_string()));
        script.command(argv);
        script.line("true");
    }

    fn upgrade_system_script(&self, script: &mut Script) {
        let mut argv = vec![self.frontend.binary().to_string(), "upgrade".to_string()];
        argv.extend(self.noninteractive_flags().iter().map(|s| s.to_string()));
        script.command(argv);
    }

    fn install_packages_script(&self, script: &mut Script, packages: &[String]) {
        let mut argv = vec![self.frontend.binary().to_string(), "install".to_string()];
        argv.extend(self.noninteractive_flags().iter().map(|s| s.to_string()));
        argv.extend(packages.iter().cloned());
        script.command(argv);
    }

    fn prepare_build_script(&self, script: &mut Script) {
        let mut packages: Vec<String> = self.build_env_packages.iter().map(|s| s.to_string()).collect();
        packages.extend(["git".to_string(), "rpmdevtools".to_string()]);
        if self.frontend == Frontend::Dnf {
            if matches!(self.full_name.split_once(':'), Some((_, v)) if v.parse::<u32>().is_ok_and(|v| v >= 41)) {
                packages.push("dnf5-plugins".to_string());
            }
        }
        self.install_packages_script(script, &packages);
    }

    fn bootstrap(&self, executor: &dyn CommandExecutor, path: &Utf8Path) -> Result<()> {
        let installer = which::which("dnf").or_else(|_| which::which("yum")).context("yum or dnf not found")?;

        let mut repo_file = tempfile::Builder::new().suffix(".repo").tempfile()?;
        use std::io::Write;
        writeln!(repo_file, "[chroot-base]")?;
        writeln!(repo_file, "name=Linux $releasever - $basearch")?;
        writeln!(repo_file, "baseurl={}", self.baseurl())?;
        writeln!(repo_file, "enabled=1")?;
        writeln!(repo_file, "gpgcheck=0")?;
        repo_file.flush()?;
        let config_path = camino::Utf8PathBuf::try_from(repo_file.path().to_path_buf())?;

        let version = self.full_name.split_once(':').map(|(_, v)| v.to_string()).unwrap_or_else(|| self.full_name.clone());

        let mut argv: Vec<String> = vec![installer.to_string_lossy().into_owned(), "-c".to_string(), config_path.to_string()];
        argv.extend(self.noninteractive_flags().iter().map(|s| s.to_string()));
        argv.extend(
            [
                "--disablerepo=*".to_string(),
                "--enablerepo=chroot-base".to_string(),
                "--disableplugin=*".to_string(),
                format!("--installroot={path}"),
                format!("--releasever={version}"),
                "install".to_string(),
            ]
            .into_iter(),
        );
        let mut packages = self.base_packages();
        packages.sort();
        argv.extend(packages);

        let (program, args) = argv.split_first().expect("argv is non-empty");
        let spec = CommandSpec::new(program.clone(), args.iter().map(std::ffi::OsString::from).collect());
        let result = executor.execute(&spec)?;
        if !result.success() {
            bail!("bootstrap command failed for {}", self.full_name);
        }

        // If the installer used a private rpmdb under the install root,
        // promote it to the system location and rebuild it from inside an
        // nspawn shell (dnf run from the host resolves its rpmdb relative
        // to the host, not the target tree).
        let private_rpmdb = path.join("root").join(".rpmdb");
        let system_rpmdb = path.join("var").join("lib").join("rpm");
        if private_rpmdb.is_dir() {
            if system_rpmdb.is_symlink() {
                let resolved = std::fs::canonicalize(&system_rpmdb)?;
                if !resolved.starts_with(path.as_std_path()) {
                    bail!("/var/lib/rpm in installed system points to {} which is outside installroot", resolved.display());
                }
            }
            if system_rpmdb.exists() {
                std::fs::remove_dir_all(&system_rpmdb)?;
            }
            std::fs::rename(&private_rpmdb, &system_rpmdb)?;
        }

        let rebuild_spec = CommandSpec::new(
            "systemd-nspawn",
            vec!["-D".into(), path.as_str().into(), "/usr/bin/rpmdb".into(), "--rebuilddb".into()],
        );
        executor.execute(&rebuild_spec)?;

        Ok(())
    }

    fn get_versions(&self, executor: &dyn CommandExecutor, packages: &[String]) -> Result<VersionMap> {
        // `rpm -q --whatprovides <requirement>` against the guest's own
        // rpmdb: the dependency-free stand-in for upstream's dnf-sack query.
        let mut result: VersionMap = BTreeMap::new();
        for requirement in packages {
            let spec = CommandSpec::new(
                "rpm",
                vec![
                    "-q".into(),
                    "--whatprovides".into(),
                    requirement.into(),
                    "--queryformat".into(),
                    "%{NAME} %{VERSION}-%{RELEASE}\n".into(),
                ],
            );
            let output = executor.execute(&spec)?;
            let mut entry = BTreeMap::new();
            for line in output.stdout_string().lines() {
                if let Some((name, version)) = line.split_once(' ') {
                    entry.insert(name.to_string(), version.to_string());
                }
            }
            result.insert(requirement.clone(), entry);
        }
        Ok(result)
    }
}

pub fn catalog() -> Vec<Arc<dyn Distro>> {
    let mut out: Vec<Arc<dyn Distro>> = Vec::new();

    out.push(Arc::new(RpmDistro {
        full_name: "centos:7".to_string(),
        aliases: vec!["centos7"],
        mirror: "https://vault.centos.org".to_string(),
        baseurl_template: "{mirror}/centos/7/os/$basearch".to_string(),
        cgroup_v1: true,
        systemd_version: Some(219),
        frontend: Frontend::Yum,
        podman_repo: "quay.io/centos/centos",
        extra_base_packages: vec![],
        build_env_packages: vec!["@buildsys-build"],
    }));

    for (version, archived) in [(32, true), (33, true), (34, true), (35, true), (36, true), (37, false), (38, false), (39, false), (40, false), (41, false), (42, false)] {
        let (mirror, baseurl_template) = if archived {
            ("https://archives.fedoraproject.org".to_string(), format!("{{mirror}}/pub/archive/fedora/linux/releases/{version}/Everything/$basearch/os/"))
        } else {
            ("https://download.fedoraproject.org".to_string(), format!("{{mirror}}/pub/fedora/linux/releases/{version}/Everything/$basearch/os/"))
        };
        let mut extra_base_packages = vec![];
        if version >= 41 {
            extra_base_packages.push("systemd");
        }
        let mut build_env_packages = vec!["dnf-command(builddep)"];
        if version >= 41 {
            build_env_packages.push("dnf5-plugins");
        }
        out.push(Arc::new(RpmDistro {
            full_name: format!("fedora:{version}"),
            aliases: vec![],
            mirror,
            baseurl_template,
            cgroup_v1: false,
            systemd_version: None,
            frontend: Frontend::Dnf,
            podman_repo: "registry.fedoraproject.org/fedora",
            extra_base_packages,
            build_env_packages,
        }));
    }

    for version in [8, 9] {
        out.push(Arc::new(RpmDistro {
            full_name: format!("almalinux:{version}"),
            aliases: vec![],
            mirror: "http://repo.almalinux.org".to_string(),
            baseurl_template: format!("{{mirror}}/almalinux/{version}/BaseOS/$basearch/os/"),
            cgroup_v1: false,
            systemd_version: if version == 8 { Some(239) } else { None },
            frontend: Frontend::Dnf,
            podman_repo: "docker.io/library/almalinux",
            extra_base_packages: vec![],
            build_env_packages: vec!["dnf-command(builddep)"],
        }));
    }

    for version in [8, 9] {
        out.push(Arc::new(RpmDistro {
            full_name: format!("rocky:{version}"),
            aliases: vec![],
            mirror: "http://dl.rockylinux.org".to_string(),
            baseurl_template: format!("{{mirror}}/pub/rocky/{version}/BaseOS/$basearch/os/"),
            cgroup_v1: false,
            systemd_version: if version == 8 { Some(239) } else { None },
            frontend: Frontend::Dnf,
            podman_repo: "quay.io/rockylinux/rockylinux",
            extra_base_packages: vec![],
            build_env_packages: vec!["dnf-command(builddep)"],
        }));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centos7_requires_cgroup_v1_and_yum() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "centos:7").unwrap();
        assert!(distro.cgroup_v1());
        assert!(distro.base_packages().contains(&"yum".to_string()));
    }

    #[test]
    fn fedora41_prepare_build_adds_dnf5_plugins() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "fedora:41").unwrap();
        let mut script = Script::new();
        distro.prepare_build_script(&mut script);
        let rendered = script.lines().join(" ");
        assert!(rendered.contains("dnf5-plugins"));
    }

    #[test]
    fn fedora37_prepare_build_has_no_dnf5_plugins() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "fedora:37").unwrap();
        let mut script = Script::new();
        distro.prepare_build_script(&mut script);
        let rendered = script.lines().join(" ");
        assert!(!rendered.contains("dnf5-plugins"));
    }

    #[test]
    fn podman_name_uses_version_as_tag() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "almalinux:9").unwrap();
        let (repo, tag) = distro.podman_name();
        assert_eq!(repo, "docker.io/library/almalinux");
        assert_eq!(tag, "9");
    }

    #[test]
    fn get_versions_parses_rpm_queryformat_output() {
        use crate::executor::MockCommandExecutor;
        use crate::runlog::RunLog;
        use std::sync::{Arc, Mutex};

        let log = Arc::new(Mutex::new(RunLog::new()));
        let mock = MockCommandExecutor::new(log);
        mock.queue_result(
            "vim-enhanced",
            crate::executor::QueuedResult {
                returncode: 0,
                stdout: b"vim-enhanced 2:9.0-8.el9\n".to_vec(),
                stderr: Vec::new(),
            },
        );

        let distro = super::catalog().into_iter().find(|d| d.full_name() == "fedora:41").unwrap();
        let versions = distro.get_versions(&mock, &["vim-enhanced".to_string()]).unwrap();
        assert_eq!(versions["vim-enhanced"].get("vim-enhanced"), Some(&"2:9.0-8.el9".to_string()));
    }
}
