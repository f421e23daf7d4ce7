//! Build pipeline (C7): composes the container for a build, runs the
//! distro-specific build script inside it, harvests artifacts, and fires
//! post-build hooks.
//!
//! Grounded in `moncic/build/{build,debian,arpa}.py`.

pub mod arpa;
pub mod debian;

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::container::{BindConfig, BindType, ContainerConfig, ContainerRuntime, RunConfig};
use crate::distro::Distro;
use crate::error::MonciError;
use crate::script::Script;
use crate::source::{DistroSource, SourceStyle};

/// Options controlling a single build, matching the `BuildConfig` YAML
/// section a user can pass via `monci ci -B build.yaml`/`-O key=value`.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    pub artifacts_dir: Option<Utf8PathBuf>,
    pub source_only: bool,
    /// Skip the `update pkgdb`/`upgrade system` setup scripts, assuming the
    /// image is already current.
    pub quick: bool,
    pub on_success: Vec<String>,
    pub on_fail: Vec<String>,
    pub on_end: Vec<String>,
    /// Debian-only: space-separated `DEB_BUILD_PROFILES`/`DEB_BUILD_OPTIONS`
    /// source string.
    pub build_profile: String,
    /// Debian-only: pass `-sa` to `dpkg-buildpackage`.
    pub include_source: bool,
    /// Off by default, experimental: parse `debian/control` in the guest
    /// and report the build-dependency list in [`BuildResults`] without
    /// installing anything beyond what the build already needs.
    pub list_build_deps: bool,
}

/// Outcome of a build, mirroring the upstream `Build` dataclass's
/// result-carrying fields.
#[derive(Debug, Clone, Default)]
pub struct BuildResults {
    pub name: Option<String>,
    pub success: bool,
    pub artifacts: Vec<String>,
    pub trace_log: Vec<String>,
    pub build_deps: Option<Vec<String>>,
}

/// Per-style build logic: the container setup plugin, the build script
/// itself, and host-side artifact collection.
pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Appends this style's container setup steps (run once, before the
    /// build script, with the container already started).
    fn setup_script(&self, distro: &dyn Distro, build_config: &BuildConfig) -> Script;

    /// Builds the guest-side script that performs the actual build, run
    /// with the source directory as cwd.
    fn build_script(&self, source: &DistroSource, build_config: &BuildConfig) -> Result<Script>;

    /// Copies build artifacts out of `container_root` (the host-visible
    /// container filesystem) into `artifacts_dir`, returning their names.
    fn collect_artifacts(&self, container_root: &Utf8Path, artifacts_dir: &Utf8Path) -> Result<Vec<String>>;
}

/// Picks the [`Builder`] appropriate for `source`'s style.
pub fn builder_for(source: &DistroSource) -> Result<Box<dyn Builder>> {
    match source.style {
        SourceStyle::Debian(style) => Ok(Box::new(debian::DebianBuilder::new(style))),
        SourceStyle::Rpm(style) => Ok(Box::new(arpa::ArpaBuilder::new(style))),
    }
}

pub const GUEST_SOURCE_DIR: &str = "/srv/moncic-ci/source";
pub const GUEST_BUILD_DIR: &str = "/srv/moncic-ci/build";
pub const GUEST_ARTIFACTS_DIR: &str = "/srv/moncic-ci/artifacts";

/// Composes the `ContainerConfig` for a build: mounts the source tree,
/// prepares `build/`/`artifacts/`, and appends the distro-specific setup
/// plugin, matching pipeline step 1 in order.
pub fn compose_container_config(
    source: &DistroSource,
    distro: &dyn Distro,
    builder: &dyn Builder,
    build_config: &BuildConfig,
) -> Result<(ContainerConfig, Script)> {
    let mut config = ContainerConfig::new();

    let source_path = source.source.path().context("build source must have a local path")?;
    let name = source_path.file_name().unwrap_or("source").to_string();
    let guest_source = Utf8PathBuf::from(GUEST_SOURCE_DIR).join(&name);
    config.add_bind(BindConfig::new(BindType::Volatile, source_path.to_path_buf(), guest_source, true));

    let mut setup = Script::new().with_title("prepare build directories").with_cwd(Utf8PathBuf::from("/"));
    setup.command(["mkdir", "-p", GUEST_BUILD_DIR, GUEST_ARTIFACTS_DIR]);
    setup.command(["chmod", "1777", GUEST_BUILD_DIR, GUEST_ARTIFACTS_DIR]);

    if !build_config.quick {
        distro.update_pkgdb_script(&mut setup);
        distro.upgrade_system_script(&mut setup);
    }
    setup.extend(&builder.setup_script(distro, build_config));

    Ok((config, setup))
}

/// Runs the full build pipeline against an already-started container:
/// setup script, build script, artifact collection.
pub fn run_build(
    runtime: &dyn ContainerRuntime,
    source: &DistroSource,
    build_config: &BuildConfig,
    setup: &Script,
) -> Result<BuildResults> {
    let builder = builder_for(source)?;
    let mut results = BuildResults::default();

    if !setup.is_empty() {
        let run_config = RunConfig { user: None, ..Default::default() };
        let outcome = runtime.run_script(setup, Some(run_config))?;
        if !outcome.success() {
            bail!(MonciError::subprocess("build setup script", format!("exit code {}", outcome.returncode)));
        }
    }

    let build_script = builder.build_script(source, build_config)?;
    let build_outcome = runtime.run_script(&build_script, None)?;
    results.success = build_outcome.success();

    if let Ok(path) = source.source.path() {
        results.name = path.file_name().map(|s| s.to_string());
    }

    if build_config.list_build_deps {
        if let Ok(deps) = list_build_deps(runtime, source) {
            results.build_deps = Some(deps);
        }
    }

    if results.success {
        let artifacts_dir = runtime.get_root().join(GUEST_ARTIFACTS_DIR.trim_start_matches('/'));
        if let Some(host_dir) = &build_config.artifacts_dir {
            std::fs::create_dir_all(host_dir)?;
            results.artifacts = builder.collect_artifacts(&artifacts_dir, host_dir)?;
        }
    }

    Ok(results)
}

/// The opt-in `list_build_deps` introspection path: parses `debian/control`
/// in the guest via `dpkg-checkbuilddeps`-equivalent listing, without
/// installing anything. Grounded in `Debian.get_build_deps_in_container`
/// (present but not wired into the active build path upstream).
fn list_build_deps(runtime: &dyn ContainerRuntime, source: &DistroSource) -> Result<Vec<String>> {
    let name = source.source.path().ok().and_then(|p| p.file_name()).unwrap_or("source").to_string();
    let guest_source = Utf8PathBuf::from(GUEST_SOURCE_DIR).join(&name);
    let mut script = Script::new().with_title("list build dependencies").with_cwd(guest_source);
    script.command(["dpkg-checkbuilddeps", "-d", "-", "debian/control"]);
    let result = runtime.run_script(&script, None)?;
    Ok(result.stdout_string().lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

/// Environment variables injected into post-build hooks, per pipeline
/// step 5.
fn hook_env(
    build_config: &BuildConfig,
    container_name: &str,
    image_name: &str,
    container_root: &Utf8Path,
    results: &BuildResults,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "MONCIC_ARTIFACTS_DIR".to_string(),
        build_config.artifacts_dir.as_ref().map(|p| p.to_string()).unwrap_or_default(),
    );
    env.insert("MONCIC_CONTAINER_NAME".to_string(), container_name.to_string());
    env.insert("MONCIC_IMAGE".to_string(), image_name.to_string());
    env.insert("MONCIC_CONTAINER_ROOT".to_string(), container_root.to_string());
    env.insert("MONCIC_PACKAGE_NAME".to_string(), results.name.clone().unwrap_or_default());
    env.insert("MONCIC_RESULT".to_string(), if results.success { "success".to_string() } else { "fail".to_string() });
    env
}

/// Runs post-build hooks: `onSuccess`/`onFail` (mutually exclusive by
/// final status), then `onEnd`, always. `@shell` opens an interactive
/// root shell in the container; `@linger` leaves the container running
/// (handled by the caller, which owns its lifetime); anything else is
/// `sh -c` on the host with [`hook_env`].
pub fn run_post_build_hooks(
    runtime: &dyn ContainerRuntime,
    build_config: &BuildConfig,
    container_name: &str,
    image_name: &str,
    source_display: &str,
    results: &BuildResults,
    linger: &mut bool,
) -> Result<()> {
    let container_root = runtime.get_root().to_path_buf();
    let env = hook_env(build_config, container_name, image_name, &container_root, results);
    let mut env = env;
    env.insert("MONCIC_SOURCE".to_string(), source_display.to_string());

    let hooks: &[String] = if results.success { &build_config.on_success } else { &build_config.on_fail };

    for hook in hooks.iter().chain(build_config.on_end.iter()) {
        run_one_hook(runtime, hook, &env, linger)?;
    }
    Ok(())
}

fn run_one_hook(runtime: &dyn ContainerRuntime, hook: &str, env: &BTreeMap<String, String>, linger: &mut bool) -> Result<()> {
    match hook {
        "@shell" => {
            runtime.run_shell(None)?;
        }
        "@linger" => {
            *linger = true;
        }
        cmd => {
            let status = std::process::Command::new("sh").arg("-c").arg(cmd).envs(env.iter()).status();
            match status {
                Ok(status) if !status.success() => {
                    tracing::warn!("post-build hook {cmd:?} exited with {status}");
                }
                Err(err) => tracing::warn!("post-build hook {cmd:?} failed to start: {err}"),
                Ok(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_env_reports_fail_result() {
        let build_config = BuildConfig { artifacts_dir: Some(Utf8PathBuf::from("/tmp/out")), ..Default::default() };
        let results = BuildResults { name: Some("hello".to_string()), success: false, ..Default::default() };
        let env = hook_env(&build_config, "monci-1", "debian:bookworm", Utf8Path::new("/var/lib/machines/monci-1"), &results);
        assert_eq!(env.get("MONCIC_RESULT"), Some(&"fail".to_string()));
        assert_eq!(env.get("MONCIC_PACKAGE_NAME"), Some(&"hello".to_string()));
        assert_eq!(env.get("MONCIC_ARTIFACTS_DIR"), Some(&"/tmp/out".to_string()));
    }

    #[test]
    fn builder_for_dispatches_by_style() {
        // Covered indirectly by debian/arpa builder unit tests; this just
        // confirms the enum match stays exhaustive as styles are added.
    }
}
