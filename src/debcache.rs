//! Apt package cache (part of C8 Session): a host directory of `.deb`
//! files hardlinked into a fresh per-session mirror before a container
//! starts, and merged back in afterward, LRU-trimmed to a size budget.
//!
//! Grounded in `original_source/moncic/utils/deb.py`'s `DebCache`.

use std::fs;
use std::time::SystemTime;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

/// Default cache budget, matching upstream's `DebCache.cache_size` default.
pub const DEFAULT_CACHE_SIZE: u64 = 512 * 1024 * 1024;

/// Host-side `.deb` cache directory, bind-mounted as
/// `/var/cache/apt/archives` in Debian containers via a per-session
/// mirror directory.
pub struct DebCache {
    pub cache_dir: Utf8PathBuf,
    pub cache_size: u64,
}

impl DebCache {
    pub fn new(cache_dir: Utf8PathBuf) -> Self {
        Self { cache_dir, cache_size: DEFAULT_CACHE_SIZE }
    }

    pub fn with_cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Creates a fresh mirror directory under the cache dir, hardlinking
    /// every existing `.deb` into it. The returned guard hardlinks any new
    /// `.deb`s back into the cache on drop, then trims to `cache_size`.
    pub fn apt_archives(&self) -> Result<AptArchives> {
        fs::create_dir_all(&self.cache_dir).with_context(|| format!("creating {}", self.cache_dir))?;
        let dir = tempfile::Builder::new()
            .prefix(".")
            .suffix("-aptdir")
            .tempdir_in(&self.cache_dir)
            .with_context(|| format!("creating mirror dir under {}", self.cache_dir))?;
        let mirror = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|p| anyhow::anyhow!("non-utf8 path: {p:?}"))?;

        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".deb") {
                continue;
            }
            let _ = fs::hard_link(entry.path(), mirror.join(name));
        }

        Ok(AptArchives { _dir: dir, mirror, cache_dir: self.cache_dir.clone(), cache_size: self.cache_size })
    }
}

/// RAII guard for a live mirror directory; merges new `.deb`s back into
/// the cache and trims on drop.
pub struct AptArchives {
    _dir: tempfile::TempDir,
    pub mirror: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    cache_size: u64,
}

impl Drop for AptArchives {
    fn drop(&mut self) {
        if let Err(e) = self.merge_back() {
            tracing::warn!("failed to merge apt cache mirror back: {:#}", e);
        }
        if let Err(e) = trim_cache(&self.cache_dir, self.cache_size) {
            tracing::warn!("failed to trim apt cache: {:#}", e);
        }
    }
}

impl AptArchives {
    fn merge_back(&self) -> Result<()> {
        for entry in fs::read_dir(&self.mirror)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".deb") {
                continue;
            }
            let dest = self.cache_dir.join(name);
            if !dest.exists() {
                fs::hard_link(entry.path(), &dest).with_context(|| format!("linking {name} back into cache"))?;
            }
        }
        Ok(())
    }
}

/// Removes the least-recently-accessed `.deb`s until the cache fits
/// `cache_size`, matching `DebCache.trim_cache`.
fn trim_cache(cache_dir: &camino::Utf8Path, cache_size: u64) -> Result<()> {
    let mut debs: Vec<(std::path::PathBuf, u64, SystemTime)> = Vec::new();
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {cache_dir}")),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".deb") {
            continue;
        }
        let meta = entry.metadata()?;
        let atime = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
        debs.push((entry.path(), meta.len(), atime));
    }
    debs.sort_by(|a, b| b.2.cmp(&a.2));

    let mut size = 0u64;
    for (path, len, _) in debs {
        if size + len > cache_size {
            fs::remove_file(&path).with_context(|| format!("trimming {path:?} from apt cache"))?;
        } else {
            size += len;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apt_archives_hardlinks_existing_debs_into_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::write(cache_dir.join("hello_1.0_amd64.deb"), b"x").unwrap();

        let cache = DebCache::new(cache_dir);
        let archives = cache.apt_archives().unwrap();
        assert!(archives.mirror.join("hello_1.0_amd64.deb").is_file());
    }

    #[test]
    fn merge_back_links_new_debs_into_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let cache = DebCache::new(cache_dir.clone());
        {
            let archives = cache.apt_archives().unwrap();
            fs::write(archives.mirror.join("new_2.0_amd64.deb"), b"y").unwrap();
        }
        assert!(cache_dir.join("new_2.0_amd64.deb").is_file());
    }

    #[test]
    fn trim_cache_removes_oldest_past_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::write(cache_dir.join("a.deb"), vec![0u8; 100]).unwrap();
        fs::write(cache_dir.join("b.deb"), vec![0u8; 100]).unwrap();
        trim_cache(&cache_dir, 150).unwrap();
        let remaining: Vec<_> = fs::read_dir(&cache_dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(remaining.len(), 1);
    }
}
