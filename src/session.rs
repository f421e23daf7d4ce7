//! Session (C8): the process-wide aggregate holding the image repository,
//! the apt cache, the extra-packages mirror, and the privilege gate, built
//! once per `main()` invocation.
//!
//! Grounded in `moncic/session.py`'s `Session`/`MockSession`: the real
//! constructor dispatches on whether an imagedir was explicitly given
//! (`_instantiate_images_imagedir`) or not (`_instantiate_images_default`,
//! which always adds the podman store and adds the nspawn/btrfs store
//! rooted at `/var/lib/machines` only when root can be regained). A podman
//! *client* binding has no counterpart in this crate's dependency stack
//! (see `container/podman.rs`); what upstream calls the lazily-connected
//! podman socket client is represented here by a lazily-resolved `podman`
//! binary path, since every podman operation already goes through the
//! `podman` CLI via `CommandExecutor`.

use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::container::nspawn::NspawnContainer;
use crate::container::podman::PodmanContainer;
use crate::container::{ContainerConfig, ContainerRuntime};
use crate::debcache::DebCache;
use crate::executor::{CommandExecutor, MockCommandExecutor, RealCommandExecutor};
use crate::image::podman::PodmanImages;
use crate::image::store::{self, MACHINECTL_PATH};
use crate::image::{BackendHandle, ConfiguredImages, DistroImages, ImageRepository, ImagesProvider, RunnableImage};
use crate::privilege::ProcessPrivs;
use crate::runlog::RunLog;

/// Fallback systemd version assumed for an nspawn guest whose `Distro`
/// does not pin one (current releases are queried at runtime instead; see
/// `distro::Distro::systemd_version`).
const DEFAULT_SYSTEMD_VERSION: u32 = 255;

/// A fresh directory of host-supplied `.deb`/`.rpm` files hardlinked in,
/// rebuilt once per session. Unlike [`crate::debcache::AptArchives`],
/// nothing is merged back: this is a read-only package source, not a cache.
///
/// Grounded in `moncic/utils/fs.py`'s `extra_packages_dir` contextmanager.
pub struct ExtraPackagesMirror {
    _dir: tempfile::TempDir,
    pub path: Utf8PathBuf,
}

fn build_extra_packages_mirror(source: &Utf8Path) -> Result<ExtraPackagesMirror> {
    let dir = tempfile::Builder::new()
        .prefix(".")
        .suffix("-extra-packages")
        .tempdir()
        .context("creating extra packages mirror directory")?;
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?;

    let entries = match std::fs::read_dir(source) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ExtraPackagesMirror { _dir: dir, path }),
        Err(e) => return Err(e).with_context(|| format!("reading {source}")),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.ends_with(".deb") || name.ends_with(".rpm")) {
            continue;
        }
        std::fs::hard_link(entry.path(), path.join(name)).with_context(|| format!("linking {name} into extra packages mirror"))?;
    }
    Ok(ExtraPackagesMirror { _dir: dir, path })
}

/// Process-wide aggregate: image repository, apt cache, extra-packages
/// mirror, privilege gate. Constructed once per `main()` invocation.
pub struct Session {
    pub config: GlobalConfig,
    pub executor: Arc<dyn CommandExecutor>,
    pub privs: Arc<ProcessPrivs>,
    pub images: ImageRepository,
    pub debcache: Option<DebCache>,
    pub extra_packages: Option<ExtraPackagesMirror>,
    scriptdir: Utf8PathBuf,
    _scriptdir_guard: tempfile::TempDir,
    podman_binary: OnceLock<Utf8PathBuf>,
}

impl Session {
    /// Builds a real session: `imagedir_override` takes precedence over
    /// `config.imagedir`; if neither is set, the default store set
    /// (podman always, nspawn/btrfs at `/var/lib/machines` only if root
    /// can be regained) is assembled, mirroring
    /// `_instantiate_images_default`.
    pub fn new(config: GlobalConfig, imagedir_override: Option<Utf8PathBuf>, auto_sudo: bool) -> Result<Self> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new(false));
        let privs = Arc::new(ProcessPrivs::capture(auto_sudo || config.auto_sudo));

        let descriptors = crate::config::load_image_descriptors(&config.imageconfdirs)?;
        let mut images = ImageRepository::new(DistroImages, ConfiguredImages::new(descriptors));

        let imagedir = imagedir_override.or_else(|| config.imagedir.clone());
        match imagedir {
            Some(dir) => {
                images.add(store::create(executor.clone(), dir)?.into_provider());
            }
            None => {
                images.add(Box::new(PodmanImages::new(executor.clone())));
                if privs.can_regain() && Utf8Path::new(MACHINECTL_PATH).is_dir() {
                    images.add(store::create(executor.clone(), Utf8PathBuf::from(MACHINECTL_PATH))?.into_provider());
                }
            }
        }

        let debcache = config.deb_cache_dir.clone().map(DebCache::new);
        let extra_packages = match &config.extra_packages_dir {
            Some(dir) => Some(build_extra_packages_mirror(dir)?),
            None => None,
        };

        let scriptdir_guard = tempfile::Builder::new().prefix("monci-scripts-").tempdir().context("creating script exchange directory")?;
        let scriptdir =
            Utf8PathBuf::from_path_buf(scriptdir_guard.path().to_path_buf()).map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?;

        Ok(Self {
            config,
            executor,
            privs,
            images,
            debcache,
            extra_packages,
            scriptdir,
            _scriptdir_guard: scriptdir_guard,
            podman_binary: OnceLock::new(),
        })
    }

    /// Builds a mock session backed by a `RunLog`-driven `MockCommandExecutor`
    /// and an in-memory image store, for tests. Mirrors `MockSession`.
    pub fn mock() -> (Self, Arc<Mutex<RunLog>>) {
        let log = Arc::new(Mutex::new(RunLog::new()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(MockCommandExecutor::new(log.clone()));
        let privs = Arc::new(ProcessPrivs::capture(false));

        let mut images = ImageRepository::new(DistroImages, ConfiguredImages::new(Default::default()));
        images.add(store::create_mock().into_provider());

        let scriptdir_guard = tempfile::tempdir().expect("creating mock script exchange directory");
        let scriptdir = Utf8PathBuf::from_path_buf(scriptdir_guard.path().to_path_buf()).expect("non-utf8 tempdir path");

        let session = Self {
            config: GlobalConfig::default(),
            executor,
            privs,
            images,
            debcache: None,
            extra_packages: None,
            scriptdir,
            _scriptdir_guard: scriptdir_guard,
            podman_binary: OnceLock::new(),
        };
        (session, log)
    }

    /// Resolves the `podman` binary on `$PATH`, caching the result for the
    /// lifetime of the session. Stands in for upstream's lazily-connected
    /// podman socket client: every podman operation in this crate shells
    /// out to the same binary rather than speaking the API directly.
    pub fn podman_binary(&self) -> Result<&Utf8PathBuf> {
        if let Some(path) = self.podman_binary.get() {
            return Ok(path);
        }
        let resolved = which::which("podman").context("podman binary not found on $PATH")?;
        let resolved = Utf8PathBuf::from_path_buf(resolved).map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?;
        Ok(self.podman_binary.get_or_init(|| resolved))
    }

    /// Starts a container runtime appropriate for `image`'s backend,
    /// generating a fresh instance name.
    pub fn start_container(&self, image: &RunnableImage, config: ContainerConfig, maintenance: bool) -> Result<Box<dyn ContainerRuntime>> {
        let instance_name = format!("monci-{}", Uuid::new_v4().simple());
        match &image.backend {
            BackendHandle::Path(root) => {
                let systemd_version = image.distro.systemd_version().unwrap_or(DEFAULT_SYSTEMD_VERSION);
                Ok(Box::new(NspawnContainer::new(
                    instance_name,
                    root.clone(),
                    config,
                    image.distro.clone(),
                    self.executor.clone(),
                    self.privs.clone(),
                    self.scriptdir.clone(),
                    systemd_version,
                )))
            }
            BackendHandle::PodmanId(podman_image) => {
                Ok(Box::new(PodmanContainer::new(podman_image.clone(), config, self.executor.clone(), self.scriptdir.clone(), maintenance)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_session_has_distro_catalog_and_mock_store() {
        let (session, _log) = Session::mock();
        assert!(session.images.has_image("debian:bookworm"));
    }

    #[test]
    fn mock_session_has_no_debcache_or_extra_packages() {
        let (session, _log) = Session::mock();
        assert!(session.debcache.is_none());
        assert!(session.extra_packages.is_none());
    }

    #[test]
    fn extra_packages_mirror_hardlinks_deb_and_rpm_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(path.join("a.deb"), b"x").unwrap();
        std::fs::write(path.join("b.rpm"), b"x").unwrap();
        std::fs::write(path.join("readme.txt"), b"x").unwrap();
        let mirror = build_extra_packages_mirror(&path).unwrap();
        assert!(mirror.path.join("a.deb").is_file());
        assert!(mirror.path.join("b.rpm").is_file());
        assert!(!mirror.path.join("readme.txt").exists());
    }

    #[test]
    fn start_container_dispatches_on_backend_path() {
        let (session, _log) = Session::mock();
        let image = RunnableImage {
            name: "bookworm".to_string(),
            distro: crate::distro::lookup_distro("debian:bookworm").unwrap(),
            backend: BackendHandle::Path(Utf8PathBuf::from("/var/lib/machines/bookworm")),
            bootstrap_from: None,
        };
        let runtime = session.start_container(&image, ContainerConfig::new(), false).unwrap();
        assert_eq!(runtime.get_root(), Utf8Path::new("/var/lib/machines/bookworm"));
    }

    #[test]
    fn start_container_dispatches_on_backend_podman() {
        let (session, _log) = Session::mock();
        let image = RunnableImage {
            name: "bookworm".to_string(),
            distro: crate::distro::lookup_distro("debian:bookworm").unwrap(),
            backend: BackendHandle::PodmanId("localhost/moncic-ci/bookworm:latest".to_string()),
            bootstrap_from: None,
        };
        let runtime = session.start_container(&image, ContainerConfig::new(), true).unwrap();
        // Podman containers report no root until `start()` has run.
        let _ = runtime;
    }
}
