//! Low-level btrfs subvolume operations and block-level deduplication.
//!
//! Grounded in `moncic/utils/btrfs.py`'s `Subvolume` class and
//! `do_dedupe`/`is_btrfs` free functions.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::executor::{CommandExecutor, CommandSpec};

/// 1 MiB, the chunk size used for `FIDEDUPERANGE` calls against large files.
const DEDUPE_CHUNK_SIZE: u64 = 1024 * 1024;

/// `FIDEDUPERANGE`, from `linux/fs.h`. Not exposed by `libc`/`rustix` as a
/// named ioctl, so it is issued by raw request number.
const FIDEDUPERANGE: libc::c_ulong = 0xC018_9436;

/// A btrfs subvolume rooted at `path`.
pub struct Subvolume {
    pub path: Utf8PathBuf,
}

impl Subvolume {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    fn run(&self, executor: &dyn CommandExecutor, args: &[&str]) -> Result<()> {
        let spec = CommandSpec::new(
            args[0].to_string(),
            args[1..].iter().map(std::ffi::OsString::from).collect(),
        );
        let result = executor.execute(&spec)?;
        if !result.success() {
            bail!("command {:?} failed: {}", args, result.stdout_string());
        }
        Ok(())
    }

    /// Creates the subvolume, optionally setting a compression property
    /// before anything is written to it. Rolls back (removes the empty
    /// subvolume) if the property assignment fails.
    pub fn create(&self, executor: &dyn CommandExecutor, compression: Option<&str>) -> Result<()> {
        self.run(executor, &["btrfs", "subvolume", "create", self.path.as_str()])?;
        if let Some(compression) = compression {
            let prop = format!("compression={compression}");
            if let Err(e) = self.run(
                executor,
                &["btrfs", "property", "set", self.path.as_str(), "compression", &prop],
            ) {
                let _ = self.remove(executor);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Creates this subvolume as a writable snapshot of `source_path`.
    pub fn snapshot(&self, executor: &dyn CommandExecutor, source_path: &Utf8Path) -> Result<()> {
        self.run(executor, &["btrfs", "subvolume", "snapshot", source_path.as_str(), self.path.as_str()])
    }

    /// Recursively removes this subvolume, deleting nested subvolumes
    /// deepest-first (btrfs refuses to delete a subvolume containing
    /// other subvolumes).
    pub fn remove(&self, executor: &dyn CommandExecutor) -> Result<()> {
        let spec = CommandSpec::new(
            "btrfs".to_string(),
            vec!["subvolume".into(), "list".into(), "-o".into(), self.path.clone().into_string().into()],
        );
        let result = executor.execute(&spec)?;
        if !result.success() {
            bail!("btrfs subvolume list failed: {}", result.stdout_string());
        }

        let line_re = Regex::new(r"^ID (\d+) gen \d+ top level \d+ path (.+)$").unwrap();
        let mut nested = Vec::new();
        for line in result.stdout_string().lines() {
            if let Some(caps) = line_re.captures(line.trim_end()) {
                let id: u64 = caps[1].parse().context("parsing subvolume id")?;
                nested.push(id);
            }
        }

        // `btrfs subvolume list -o` lists ancestors before descendants;
        // delete in reverse so descendants go first.
        for id in nested.into_iter().rev() {
            self.run(executor, &["btrfs", "subvolume", "delete", "--subvolid", &id.to_string(), self.path.as_str()])?;
        }

        self.run(executor, &["btrfs", "subvolume", "delete", self.path.as_str()])
    }

    /// Atomically replaces the subvolume at `path` with this one: stashes
    /// the old subvolume aside, renames this one into place, then removes
    /// the stash. `path` and this subvolume must live on the same
    /// filesystem for the renames to be atomic.
    pub fn replace_subvolume(&self, executor: &dyn CommandExecutor, path: &Utf8Path) -> Result<()> {
        let stash = Utf8PathBuf::from(format!("{path}.tmp"));
        std::fs::rename(path, &stash).with_context(|| format!("stashing {path} aside as {stash}"))?;
        std::fs::rename(&self.path, path).with_context(|| format!("renaming {} to {path}", self.path))?;
        Subvolume::new(stash).remove(executor)
    }
}

#[repr(C)]
struct FileDedupeRange {
    src_offset: u64,
    src_length: u64,
    dest_count: u16,
    reserved1: u16,
    reserved2: u32,
    dest_fd: i64,
    dest_offset: u64,
    dest_length_out: u64,
    bytes_deduped_out: i64,
    status_out: u16,
    reserved3: [u8; 6],
}

/// Issues one `FIDEDUPERANGE` call covering `[offset, offset+length)` of
/// `src_fd`, deduplicating it against the same range of `dest_fd`.
/// Returns the number of bytes the kernel reports as deduplicated.
fn ioctl_dedupe_range(src_fd: i32, offset: u64, length: u64, dest_fd: i32) -> Result<u64> {
    let mut req = FileDedupeRange {
        src_offset: offset,
        src_length: length,
        dest_count: 1,
        reserved1: 0,
        reserved2: 0,
        dest_fd: dest_fd as i64,
        dest_offset: offset,
        dest_length_out: 0,
        bytes_deduped_out: 0,
        status_out: 0,
        reserved3: [0; 6],
    };
    let rc = unsafe { libc::ioctl(src_fd, FIDEDUPERANGE, &mut req as *mut FileDedupeRange) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("FIDEDUPERANGE ioctl failed");
    }
    Ok(req.bytes_deduped_out.max(0) as u64)
}

/// Deduplicates `dst` against `src` (assumed byte-identical up to `size`)
/// in `DEDUPE_CHUNK_SIZE` increments, freeing the shared extents on disk.
/// Returns the total number of bytes the kernel reports as deduplicated.
pub fn do_dedupe(src: &Utf8Path, dst: &Utf8Path, size: u64) -> Result<u64> {
    let src_file = OpenOptions::new().read(true).open(src).with_context(|| format!("opening {src}"))?;
    let dst_file = OpenOptions::new().write(true).open(dst).with_context(|| format!("opening {dst}"))?;

    let src_fd = src_file.as_raw_fd();
    let dst_fd = dst_file.as_raw_fd();

    let mut total = 0u64;
    let mut offset = 0u64;
    while offset < size {
        let length = DEDUPE_CHUNK_SIZE.min(size - offset);
        total += ioctl_dedupe_range(src_fd, offset, length, dst_fd)?;
        offset += length;
    }
    Ok(total)
}

/// Reports whether `path` is on a btrfs filesystem, by shelling out to
/// `stat --file-system`.
pub fn is_btrfs(executor: &dyn CommandExecutor, path: &Utf8Path) -> Result<bool> {
    let spec = CommandSpec::new(
        "stat".to_string(),
        vec!["--file-system".into(), "--format=%T".into(), path.as_str().into()],
    );
    let result = executor.execute(&spec)?;
    if !result.success() {
        bail!("stat --file-system failed for {path}: {}", result.stdout_string());
    }
    Ok(result.stdout_string().trim() == "btrfs")
}

/// Reads the apparent size of `path`, used by [`do_dedupe`] callers to
/// bound how much of the file to scan.
pub fn file_size(path: &Utf8Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockCommandExecutor, QueuedResult};
    use crate::runlog::RunLog;
    use std::sync::{Arc, Mutex};

    #[test]
    fn is_btrfs_true_on_matching_filesystem() {
        let log = Arc::new(Mutex::new(RunLog::default()));
        let mock = MockCommandExecutor::new(log);
        mock.queue_result("stat", QueuedResult { returncode: 0, stdout: b"btrfs\n".to_vec(), stderr: vec![] });
        assert!(is_btrfs(&mock, Utf8Path::new("/var/lib/machines")).unwrap());
    }

    #[test]
    fn is_btrfs_false_on_other_filesystem() {
        let log = Arc::new(Mutex::new(RunLog::default()));
        let mock = MockCommandExecutor::new(log);
        mock.queue_result("stat", QueuedResult { returncode: 0, stdout: b"ext4\n".to_vec(), stderr: vec![] });
        assert!(!is_btrfs(&mock, Utf8Path::new("/var/lib/machines")).unwrap());
    }

    #[test]
    fn remove_deletes_nested_subvolumes_deepest_first() {
        let log = Arc::new(Mutex::new(RunLog::default()));
        let mock = MockCommandExecutor::new(log.clone());
        let listing = b"ID 256 gen 10 top level 5 path foo\nID 257 gen 11 top level 256 path foo/bar\n".to_vec();
        mock.queue_result("subvolume list", QueuedResult { returncode: 0, stdout: listing, stderr: vec![] });
        mock.queue_result("subvolume delete", QueuedResult { returncode: 0, stdout: vec![], stderr: vec![] });
        mock.queue_result("subvolume delete", QueuedResult { returncode: 0, stdout: vec![], stderr: vec![] });
        mock.queue_result("subvolume delete", QueuedResult { returncode: 0, stdout: vec![], stderr: vec![] });
        let sub = Subvolume::new(Utf8PathBuf::from("/var/lib/machines/foo"));
        sub.remove(&mock).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
    }
}
