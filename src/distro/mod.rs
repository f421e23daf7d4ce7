//! Distro catalog (C1): enumerates supported distributions and renders
//! their per-distro bootstrap/update/install operations as shell commands
//! appended to a [`crate::script::Script`].
//!
//! Grounded in `moncic/distro/distro.py`'s `Distro`/`DistroFamily` class
//! hierarchy. Rather than a runtime class registry keyed by family name
//! (the Python `DistroFamily.families` dict, populated by importing
//! `debian`/`rpm` submodules for their side effects), the catalog here is
//! a fixed `Vec` of trait objects built once behind a `OnceLock`: every
//! distro this crate supports is known at compile time, so the dynamic
//! registration machinery has no counterpart worth keeping.

pub mod debian;
pub mod osrelease;
pub mod rpm;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result, bail};
use camino::Utf8Path;

use crate::executor::CommandExecutor;
use crate::script::Script;

/// Installed-version probe result: `requirement -> (package name -> version)`.
pub type VersionMap = BTreeMap<String, BTreeMap<String, String>>;

/// Packaging family a [`Distro`] belongs to, used where behaviour forks on
/// package-manager lineage rather than on a specific release (source style
/// autodetection, build pipeline dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Debian,
    Rpm,
}

/// Common contract for a single distribution (e.g. Debian bookworm, Fedora 41).
pub trait Distro: Send + Sync {
    /// Canonical `family:version` name, e.g. `"debian:bookworm"`.
    fn full_name(&self) -> &str;

    /// Packaging family this distro belongs to.
    fn family(&self) -> Family;

    /// Aliases this distro is reachable under without a family prefix,
    /// e.g. `"stable"` for `debian:bookworm`.
    fn aliases(&self) -> &[&str] {
        &[]
    }

    /// Whether the guest requires a cgroup-v1 hierarchy (legacy releases).
    fn cgroup_v1(&self) -> bool {
        false
    }

    /// The guest's systemd version, when known ahead of time for an
    /// archived release whose package index is no longer queryable.
    fn systemd_version(&self) -> Option<u32> {
        None
    }

    /// `(repository, tag)` to pull this distro from a container registry.
    fn podman_name(&self) -> (String, String);

    /// Packages expected on a freshly bootstrapped system.
    fn base_packages(&self) -> Vec<String> {
        vec!["bash".to_string(), "dbus".to_string()]
    }

    /// Packages additionally installed to prepare a build environment
    /// (compilers, packaging tools). Appended to `script` via
    /// [`Distro::install_packages_script`].
    fn prepare_build_script(&self, script: &mut Script);

    /// Refreshes package index metadata (`apt-get update`, `dnf check-update`, …).
    fn update_pkgdb_script(&self, script: &mut Script);

    /// Upgrades all installed packages to latest.
    fn upgrade_system_script(&self, script: &mut Script);

    /// Installs `packages`.
    fn install_packages_script(&self, script: &mut Script, packages: &[String]);

    /// Bootstraps a fresh root filesystem at `path` by invoking the
    /// distro's host-side bootstrapper (`mmdebstrap`/`debootstrap` or
    /// `dnf`/`yum`).
    fn bootstrap(&self, executor: &dyn CommandExecutor, path: &Utf8Path) -> Result<()>;

    /// Probes installed versions of packages satisfying each of `packages`,
    /// run inside a live container via `executor`.
    fn get_versions(&self, executor: &dyn CommandExecutor, packages: &[String]) -> Result<VersionMap> {
        let _ = (executor, packages);
        bail!("getting installed versions for package requirements is not implemented for {}", self.full_name())
    }
}

fn catalog() -> &'static Vec<Arc<dyn Distro>> {
    static CATALOG: OnceLock<Vec<Arc<dyn Distro>>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let mut all: Vec<Arc<dyn Distro>> = Vec::new();
        all.extend(debian::catalog());
        all.extend(rpm::catalog());
        all
    })
}

/// Looks up a distro by full `family:version` name or by a bare alias
/// (`"stable"`, `"oldstable"`, `"unstable"`, …).
pub fn lookup_distro(name: &str) -> Result<Arc<dyn Distro>> {
    for distro in catalog() {
        if distro.full_name() == name || distro.aliases().contains(&name) {
            return Ok(distro.clone());
        }
    }
    bail!("distro {name:?} not found")
}

/// Instantiates a Distro from a parsed os-release map, matching
/// `ID`/`VERSION_ID` against the catalog. Debian's `sid`/`testing`
/// ambiguity is resolved by falling back to `sid` when `VERSION_ID` is
/// absent, per upstream's documented policy (the two are otherwise
/// indistinguishable from os-release content alone).
pub fn from_os_release(info: &BTreeMap<String, String>, fallback_name: &str) -> Result<Arc<dyn Distro>> {
    let Some(os_id) = info.get("ID") else {
        return lookup_distro(fallback_name);
    };

    let mut os_version = info.get("VERSION_ID").cloned();
    if os_version.is_none() && os_id == "debian" {
        os_version = Some("sid".to_string());
    }

    let Some(os_version) = os_version else {
        return lookup_distro(fallback_name);
    };

    let mut candidates = vec![format!("{os_id}:{os_version}")];
    if let Some((major, _)) = os_version.split_once('.') {
        candidates.push(format!("{os_id}:{major}"));
    }

    for candidate in &candidates {
        if let Ok(distro) = lookup_distro(candidate) {
            return Ok(distro);
        }
    }

    bail!("distro ID={os_id:?}, VERSION_ID={os_version:?} not found. Tried: {candidates:?}")
}

/// Full names of every distro in the catalog, for listing purposes.
pub fn all_full_names() -> Vec<String> {
    catalog().iter().map(|d| d.full_name().to_string()).collect()
}

/// Instantiates a Distro from an existing root filesystem tree, reading
/// `<root>/etc/os-release` when present and falling back to looking up
/// `root`'s basename as a distro name otherwise.
pub fn from_path(root: &Utf8Path) -> Result<Arc<dyn Distro>> {
    match osrelease::parse_os_release(root) {
        Ok(info) => {
            let fallback = root.file_name().unwrap_or(root.as_str());
            from_os_release(&info, fallback)
        }
        Err(_) => {
            let fallback = root.file_name().context("root path has no file name")?;
            lookup_distro(fallback)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_full_name() {
        let distro = lookup_distro("debian:bookworm").unwrap();
        assert_eq!(distro.full_name(), "debian:bookworm");
    }

    #[test]
    fn lookup_by_alias() {
        let distro = lookup_distro("stable").unwrap();
        assert_eq!(distro.full_name(), "debian:bookworm");
    }

    #[test]
    fn lookup_unknown_fails() {
        assert!(lookup_distro("plan9:1").is_err());
    }

    #[test]
    fn from_os_release_resolves_exact_match() {
        let mut info = BTreeMap::new();
        info.insert("ID".to_string(), "fedora".to_string());
        info.insert("VERSION_ID".to_string(), "41".to_string());
        let distro = from_os_release(&info, "fallback").unwrap();
        assert_eq!(distro.full_name(), "fedora:41");
    }

    #[test]
    fn from_os_release_debian_missing_version_falls_back_to_sid() {
        let mut info = BTreeMap::new();
        info.insert("ID".to_string(), "debian".to_string());
        let distro = from_os_release(&info, "fallback").unwrap();
        assert_eq!(distro.full_name(), "debian:sid");
    }

    #[test]
    fn from_os_release_missing_id_uses_fallback_name() {
        let info = BTreeMap::new();
        let distro = from_os_release(&info, "bookworm").unwrap();
        assert_eq!(distro.full_name(), "debian:bookworm");
    }
}
