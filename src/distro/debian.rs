//! Debian and Ubuntu families.
//!
//! Grounded in `moncic/distro/debian.py`: `DebianDistro`/`UbuntuDistro`
//! plus the `Debian`/`Ubuntu` family catalogs (`init()` methods there).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use regex::Regex;

use super::{Distro, VersionMap};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::script::Script;

/// `apt-get` invocation prefix shared by the update/upgrade/install scripts.
/// The odd space after `-o` matches `apt-get`'s own quoting requirement for
/// this option.
const APT_INSTALL_CMD: &[&str] =
    &["/usr/bin/apt-get", "--assume-yes", "--quiet", "--show-upgraded", "-o Dpkg::Options::=\"--force-confnew\""];

pub struct DebianDistro {
    full_name: String,
    aliases: Vec<&'static str>,
    mirror: String,
    key_url: Option<String>,
    cgroup_v1: bool,
    bootstrappers: Vec<&'static str>,
    podman_repo: &'static str,
}

impl DebianDistro {
    fn new(codename: &str, version: Option<&str>, aliases: Vec<&'static str>) -> Self {
        Self {
            full_name: format!("debian:{codename}"),
            aliases,
            mirror: "http://deb.debian.org/debian".to_string(),
            key_url: None,
            cgroup_v1: false,
            bootstrappers: vec!["mmdebstrap", "debootstrap"],
            podman_repo: "docker.io/library/debian",
        }
        .with_version_hint(version)
    }

    fn with_version_hint(self, _version: Option<&str>) -> Self {
        // Version numbers are not part of `full_name` (we key by codename,
        // as the rest of the crate does); retained as a constructor
        // parameter so the catalog below documents them alongside upstream.
        self
    }

    fn archived(mut self, mirror: &str, key_url: &str) -> Self {
        self.mirror = mirror.to_string();
        self.key_url = Some(key_url.to_string());
        self
    }
}

impl Distro for DebianDistro {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    fn family(&self) -> super::Family {
        super::Family::Debian
    }

    fn aliases(&self) -> &[&str] {
        &self.aliases
    }

    fn cgroup_v1(&self) -> bool {
        self.cgroup_v1
    }

    fn podman_name(&self) -> (String, String) {
        let codename = self.full_name.split_once(':').map(|(_, c)| c).unwrap_or(&self.full_name);
        (self.podman_repo.to_string(), codename.to_string())
    }

    fn base_packages(&self) -> Vec<String> {
        let mut pkgs = vec!["bash".to_string(), "dbus".to_string()];
        pkgs.extend(["systemd", "apt-utils", "eatmydata", "iproute2"].map(str::to_string));
        pkgs
    }

    fn update_pkgdb_script(&self, script: &mut Script) {
        script.command(["/usr/bin/apt-get", "update"]);
    }

    fn upgrade_system_script(&self, script: &mut Script) {
        let mut argv: Vec<&str> = APT_INSTALL_CMD.to_vec();
        argv.push("full-upgrade");
        script.command(argv);
    }

    fn install_packages_script(&self, script: &mut Script, packages: &[String]) {
        let mut argv: Vec<String> = APT_INSTALL_CMD.iter().map(|s| s.to_string()).collect();
        argv.push("satisfy".to_string());
        argv.extend(packages.iter().cloned());
        script.command(argv);
    }

    fn prepare_build_script(&self, script: &mut Script) {
        self.install_packages_script(script, &["build-essential".to_string()]);
    }

    fn bootstrap(&self, executor: &dyn CommandExecutor, path: &Utf8Path) -> Result<()> {
        let bootstrapper = self
            .bootstrappers
            .iter()
            .find_map(|name| which::which(name).ok())
            .with_context(|| format!("no debian bootstrapper found; tried: {:?}", self.bootstrappers))?;

        let mut cmd: Vec<String> = Vec::new();
        if let Ok(eatmydata) = which::which("eatmydata") {
            cmd.push(eatmydata.to_string_lossy().into_owned());
        }
        cmd.push(bootstrapper.to_string_lossy().into_owned());
        cmd.push(format!("--include={}", self.base_packages().join(",")));
        cmd.push("--variant=minbase".to_string());

        if let Some(key_url) = &self.key_url {
            let keyring = fetch_archive_keyring(key_url)?;
            cmd.push(format!("--keyring={keyring}"));
        }

        let codename = self.full_name.split_once(':').map(|(_, c)| c.to_string()).unwrap_or_else(|| self.full_name.clone());
        cmd.push(codename);
        cmd.push(path.to_string());
        cmd.push(self.mirror.clone());

        let (program, args) = cmd.split_first().expect("argv is non-empty");
        let spec = CommandSpec::new(program.clone(), args.iter().map(std::ffi::OsString::from).collect());
        let result = executor.execute(&spec)?;
        if !result.success() {
            bail!("bootstrap command failed for {}", self.full_name);
        }
        Ok(())
    }

    fn get_versions(&self, executor: &dyn CommandExecutor, packages: &[String]) -> Result<VersionMap> {
        let re_inst = Regex::new(r"^Inst (\S+) \((\S+)").unwrap();
        let cmd_prefix = [
            "apt-get",
            "satisfy",
            "-s",
            "-o",
            "Dir::state::status=/dev/null",
            "-o",
            "APT::Build-Essential=,",
            "-o",
            "APT::Get::Show-Versions=true",
        ];

        let run = |requirement: &str| -> Result<String> {
            let mut argv: Vec<String> = cmd_prefix.iter().map(|s| s.to_string()).collect();
            argv.push(requirement.to_string());
            let spec = CommandSpec::new(argv[0].clone(), argv[1..].iter().map(std::ffi::OsString::from).collect());
            let result = executor.execute(&spec)?;
            Ok(result.stdout_string())
        };

        let mut base = std::collections::HashSet::new();
        for line in run("build-essential")?.lines() {
            if let Some(caps) = re_inst.captures(line) {
                base.insert(caps[1].to_string());
            }
        }

        let mut result: VersionMap = BTreeMap::new();
        for requirement in packages {
            if requirement == "build-essential" {
                continue;
            }
            let mut entry = BTreeMap::new();
            for line in run(requirement)?.lines() {
                if let Some(caps) = re_inst.captures(line) {
                    let name = caps[1].to_string();
                    if !base.contains(&name) {
                        entry.insert(name, caps[2].to_string());
                    }
                }
            }
            result.insert(requirement.clone(), entry);
        }

        // Packages common to every requirement's resolution are dependency
        // noise, not a requirement-specific pin; drop them the same way the
        // upstream probe does.
        if let Some(common) = result
            .values()
            .map(|v| v.keys().cloned().collect::<std::collections::HashSet<_>>())
            .reduce(|a, b| a.intersection(&b).cloned().collect())
        {
            for entry in result.values_mut() {
                for name in &common {
                    entry.remove(name);
                }
            }
        }

        Ok(result)
    }
}

fn fetch_archive_keyring(key_url: &str) -> Result<camino::Utf8PathBuf> {
    // Archived releases (jessie, stretch) ship a release key that is no
    // longer on the default keyring; fetch it once per bootstrap into a
    // scratch file that `mmdebstrap --keyring=` can consume directly.
    //
    // Kept as a single narrow seam so tests never need a live network:
    // only `DebianDistro::bootstrap` for archived releases reaches here.
    let response = reqwest::blocking::get(key_url).with_context(|| format!("fetching {key_url}"))?;
    let body = response.error_for_status().with_context(|| format!("fetching {key_url}"))?.bytes()?;
    let mut tmp = tempfile::Builder::new().suffix(".gpg").tempfile()?;
    std::io::Write::write_all(&mut tmp, &body)?;
    let (_file, path) = tmp.keep().context("persisting downloaded keyring")?;
    camino::Utf8PathBuf::try_from(path).context("keyring path is not valid UTF-8")
}

pub struct UbuntuDistro {
    inner: DebianDistro,
}

impl UbuntuDistro {
    fn new(codename: &str, version: Option<&str>, aliases: Vec<&'static str>, archived: bool) -> Self {
        let mirror = if archived { "https://old-releases.ubuntu.com/ubuntu/" } else { "https://archive.ubuntu.com/ubuntu/" };
        let mut inner = DebianDistro::new(codename, version, aliases);
        inner.full_name = format!("ubuntu:{codename}");
        inner.mirror = mirror.to_string();
        inner.podman_repo = "docker.io/library/ubuntu";
        Self { inner }
    }
}

impl Distro for UbuntuDistro {
    fn full_name(&self) -> &str {
        self.inner.full_name()
    }

    fn family(&self) -> super::Family {
        super::Family::Debian
    }

    fn aliases(&self) -> &[&str] {
        self.inner.aliases()
    }

    fn cgroup_v1(&self) -> bool {
        self.inner.cgroup_v1()
    }

    fn podman_name(&self) -> (String, String) {
        self.inner.podman_name()
    }

    fn base_packages(&self) -> Vec<String> {
        self.inner.base_packages()
    }

    fn update_pkgdb_script(&self, script: &mut Script) {
        self.inner.update_pkgdb_script(script)
    }

    fn upgrade_system_script(&self, script: &mut Script) {
        self.inner.upgrade_system_script(script)
    }

    fn install_packages_script(&self, script: &mut Script, packages: &[String]) {
        self.inner.install_packages_script(script, packages)
    }

    fn prepare_build_script(&self, script: &mut Script) {
        self.inner.prepare_build_script(script)
    }

    fn bootstrap(&self, executor: &dyn CommandExecutor, path: &Utf8Path) -> Result<()> {
        self.inner.bootstrap(executor, path)
    }

    fn get_versions(&self, executor: &dyn CommandExecutor, packages: &[String]) -> Result<VersionMap> {
        self.inner.get_versions(executor, packages)
    }
}

fn debian_with_cgroup_v1(mut d: DebianDistro) -> DebianDistro {
    d.cgroup_v1 = true;
    d
}

pub fn catalog() -> Vec<Arc<dyn Distro>> {
    let mut out: Vec<Arc<dyn Distro>> = Vec::new();

    out.push(Arc::new(debian_with_cgroup_v1(
        DebianDistro::new("jessie", Some("8"), vec!["jessie"])
            .archived("http://archive.debian.org/debian/", "https://ftp-master.debian.org/keys/release-8.asc"),
    )));
    out.push(Arc::new(
        DebianDistro::new("stretch", Some("9"), vec!["stretch"])
            .archived("http://archive.debian.org/debian/", "https://ftp-master.debian.org/keys/release-9.asc"),
    ));
    out.push(Arc::new(DebianDistro::new("buster", Some("10"), vec!["buster", "oldoldstable"])));
    out.push(Arc::new(DebianDistro::new("bullseye", Some("11"), vec!["bullseye", "oldstable"])));
    out.push(Arc::new(DebianDistro::new("bookworm", Some("12"), vec!["bookworm", "stable"])));
    out.push(Arc::new(DebianDistro::new("trixie", Some("13"), vec!["trixie", "testing"])));
    out.push(Arc::new(DebianDistro::new("sid", None, vec!["sid", "unstable"])));

    out.push(Arc::new(debian_with_cgroup_v1_ubuntu(UbuntuDistro::new("xenial", Some("16.04"), vec!["xenial"], false))));
    out.push(Arc::new(UbuntuDistro::new("bionic", Some("18.04"), vec!["bionic"], false)));
    out.push(Arc::new(UbuntuDistro::new("focal", Some("20.04"), vec!["focal"], false)));
    out.push(Arc::new(UbuntuDistro::new("hirsute", Some("21.04"), vec!["hirsute"], true)));
    out.push(Arc::new(UbuntuDistro::new("impish", Some("21.10"), vec!["impish"], true)));
    out.push(Arc::new(UbuntuDistro::new("jammy", Some("22.04"), vec!["jammy"], false)));
    out.push(Arc::new(UbuntuDistro::new("kinetic", Some("22.10"), vec!["kinetic"], true)));
    out.push(Arc::new(UbuntuDistro::new("lunar", Some("23.04"), vec!["lunar"], true)));
    out.push(Arc::new(UbuntuDistro::new("mantic", Some("23.10"), vec!["mantic"], true)));
    out.push(Arc::new(UbuntuDistro::new("noble", Some("24.04"), vec!["noble"], false)));
    out.push(Arc::new(UbuntuDistro::new("oracular", Some("24.10"), vec!["oracular"], false)));
    out.push(Arc::new(UbuntuDistro::new("plucky", Some("25.04"), vec!["plucky"], false)));

    out
}

fn debian_with_cgroup_v1_ubuntu(mut d: UbuntuDistro) -> UbuntuDistro {
    d.inner.cgroup_v1 = true;
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookworm_aliases_include_stable() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "debian:bookworm").unwrap();
        assert!(distro.aliases().contains(&"stable"));
    }

    #[test]
    fn base_packages_include_debian_extras() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "debian:sid").unwrap();
        let pkgs = distro.base_packages();
        assert!(pkgs.contains(&"eatmydata".to_string()));
        assert!(pkgs.contains(&"systemd".to_string()));
    }

    #[test]
    fn install_packages_script_uses_apt_satisfy() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "debian:bookworm").unwrap();
        let mut script = Script::new();
        distro.install_packages_script(&mut script, &["vim".to_string()]);
        let rendered = script.lines().join(" ");
        assert!(rendered.contains("satisfy"));
        assert!(rendered.contains("vim"));
    }

    #[test]
    fn ubuntu_podman_name_uses_ubuntu_repo() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "ubuntu:jammy").unwrap();
        let (repo, tag) = distro.podman_name();
        assert_eq!(repo, "docker.io/library/ubuntu");
        assert_eq!(tag, "jammy");
    }

    #[test]
    fn xenial_requires_cgroup_v1() {
        let distro = super::catalog().into_iter().find(|d| d.full_name() == "ubuntu:xenial").unwrap();
        assert!(distro.cgroup_v1());
    }

    #[test]
    fn get_versions_subtracts_build_essential_baseline() {
        use crate::executor::MockCommandExecutor;
        use crate::runlog::RunLog;
        use std::sync::{Arc, Mutex};

        let log = Arc::new(Mutex::new(RunLog::new()));
        let mock = MockCommandExecutor::new(log);
        mock.queue_result(
            "build-essential$",
            crate::executor::QueuedResult {
                returncode: 0,
                stdout: b"Inst libc6 (2.36-9)\n".to_vec(),
                stderr: Vec::new(),
            },
        );
        mock.queue_result(
            "vim$",
            crate::executor::QueuedResult {
                returncode: 0,
                stdout: b"Inst libc6 (2.36-9)\nInst vim (2:9.0-8)\n".to_vec(),
                stderr: Vec::new(),
            },
        );

        let distro = super::catalog().into_iter().find(|d| d.full_name() == "debian:bookworm").unwrap();
        let versions = distro.get_versions(&mock, &["vim".to_string()]).unwrap();
        let vim_versions = &versions["vim"];
        assert!(!vim_versions.contains_key("libc6"), "build-essential baseline should be subtracted");
        assert_eq!(vim_versions.get("vim"), Some(&"2:9.0-8".to_string()));
    }
}
