//! Privilege gate (C9): scoped "as root" and "as user" regions built on
//! the saved-uid trick, cooperating with an auto-sudo capability.
//!
//! Grounded in `moncic/privs.py`'s `ProcessPrivs`: on start, capture the
//! real/effective/saved uid and gid triples. If launched via `sudo`,
//! record the invoking user and start in the *dropped* state. `root()`
//! and `user()` are scoped regions that `setresuid`/`setresgid` into the
//! target ids and restore on exit; entry and exit must nest in strict
//! LIFO order, enforced here with a generation counter rather than trusting
//! callers to drop guards in order.
//!
//! The `setresuid(2)`/`setresgid(2)` syscalls are reached through
//! `rustix::process`, which this crate's `rustix` dependency carries the
//! `process`/`thread` features for specifically to cover this module (the
//! `fs` feature alone, as the teacher depends on it, does not expose
//! these). Passwd/group database lookups (`getpwuid`/`getgrgid`) have no
//! counterpart in `rustix` and stay on raw `libc`, the one FFI exception
//! in the dependency stack, matching how `LevitateOS-distro-builder`
//! reaches for `libc` for analogous low-level work.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use rustix::process::{Gid, Uid};

use crate::error::MonciError;

/// A real/effective/saved id triple, as returned by `getresuid`/`getresgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdTriple {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
}

fn getresuid() -> IdTriple {
    let ids = rustix::process::getresuid();
    IdTriple { real: ids.ruid.as_raw(), effective: ids.euid.as_raw(), saved: ids.suid.as_raw() }
}

fn getresgid() -> IdTriple {
    let ids = rustix::process::getresgid();
    IdTriple { real: ids.rgid.as_raw(), effective: ids.egid.as_raw(), saved: ids.sgid.as_raw() }
}

fn setresuid(real: u32, effective: u32, saved: u32) -> Result<()> {
    rustix::process::setresuid(Uid::from_raw(real), Uid::from_raw(effective), Uid::from_raw(saved))
        .map_err(|e| MonciError::io("setresuid", e.into()).into())
}

fn setresgid(real: u32, effective: u32, saved: u32) -> Result<()> {
    rustix::process::setresgid(Gid::from_raw(real), Gid::from_raw(effective), Gid::from_raw(saved))
        .map_err(|e| MonciError::io("setresgid", e.into()).into())
}

/// Reads `passwd`'s `pw_dir`/`pw_name` for a uid, used to resync `HOME`/
/// `USER` across a privilege transition.
fn lookup_passwd_entry(uid: u32) -> Option<(String, String)> {
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return None;
        }
        let home = std::ffi::CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned();
        let name = std::ffi::CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
        Some((home, name))
    }
}

/// Which scoped region is currently active, for LIFO-violation detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Root,
    User,
}

/// Captures the process's privilege state at startup and exposes scoped
/// `root()`/`user()` regions.
pub struct ProcessPrivs {
    orig_uid: IdTriple,
    orig_gid: IdTriple,
    /// The invoking (unprivileged) user's uid/gid: either from `SUDO_UID`/
    /// `SUDO_GID`, or the process's own real uid/gid if not under sudo.
    pub user_uid: u32,
    pub user_gid: u32,
    /// True if `SUDO_UID`/`SUDO_GID` were present at startup.
    pub have_sudo: bool,
    /// Opt-in: `needs_sudo()` may re-exec via `sudo` instead of failing.
    pub auto_sudo: bool,
    /// Monotonically increasing generation, used to detect non-LIFO
    /// guard drops (each guard captures the generation active when it
    /// was created and checks it matches on drop).
    generation: AtomicU64,
    region_stack: std::sync::Mutex<Vec<Region>>,
    dropped: bool,
}

impl ProcessPrivs {
    /// Captures the current uid/gid triples and detects `sudo` invocation.
    pub fn capture(auto_sudo: bool) -> Self {
        let orig_uid = getresuid();
        let orig_gid = getresgid();

        let sudo_uid = env::var("SUDO_UID").ok().and_then(|v| v.parse::<u32>().ok());
        let sudo_gid = env::var("SUDO_GID").ok().and_then(|v| v.parse::<u32>().ok());
        let have_sudo = sudo_uid.is_some() && sudo_gid.is_some();

        let (user_uid, user_gid) = if have_sudo {
            (sudo_uid.unwrap(), sudo_gid.unwrap())
        } else {
            (orig_uid.real, orig_gid.real)
        };

        Self {
            orig_uid,
            orig_gid,
            user_uid,
            user_gid,
            have_sudo,
            auto_sudo,
            generation: AtomicU64::new(0),
            region_stack: std::sync::Mutex::new(Vec::new()),
            // Launched via sudo: effective id is root, but we start dropped
            // to the invoking user until a root() scope is entered.
            dropped: have_sudo,
        }
    }

    /// Whether a `root()` scope could plausibly succeed: either we are
    /// already root, or we were launched via `sudo` and can regain root
    /// via the saved uid.
    pub fn can_regain(&self) -> bool {
        self.orig_uid.effective == 0 || self.have_sudo
    }

    fn sync_env(&self, uid: u32) {
        if let Some((home, name)) = lookup_passwd_entry(uid) {
            unsafe {
                std::env::set_var("HOME", home);
                std::env::set_var("USER", name);
            }
        }
    }

    fn drop_to_user(&self) -> Result<()> {
        setresgid(self.user_gid, self.user_gid, self.orig_gid.saved)
            .context("failed to drop group privileges")?;
        setresuid(self.user_uid, self.user_uid, self.orig_uid.saved)
            .context("failed to drop user privileges")?;
        self.sync_env(self.user_uid);
        Ok(())
    }

    fn regain_root(&self) -> Result<()> {
        setresuid(self.orig_uid.saved, self.orig_uid.saved, self.user_uid)
            .context("failed to regain root privileges")?;
        setresgid(self.orig_gid.saved, self.orig_gid.saved, self.user_gid)
            .context("failed to regain root group privileges")?;
        self.sync_env(0);
        Ok(())
    }

    /// Enters a scoped "as root" region. The returned guard restores the
    /// prior state on drop. Real privilege transitions only occur when
    /// `dry_run` is false; in dry-run mode (or when already root) this is
    /// a bookkeeping no-op so tests can exercise ordering without CAP_SETUID.
    pub fn root(&self, dry_run: bool) -> Result<PrivilegeGuard<'_>> {
        if !self.can_regain() {
            return Err(MonciError::Fail(
                "cannot regain root: process was not started via sudo and is not running as root".to_string(),
            )
            .into());
        }
        if !dry_run && self.dropped {
            self.regain_root()?;
        }
        self.push_region(Region::Root, dry_run)
    }

    /// Enters a scoped "as user" region.
    pub fn user(&self, dry_run: bool) -> Result<PrivilegeGuard<'_>> {
        if !dry_run && !self.dropped {
            self.drop_to_user()?;
        }
        self.push_region(Region::User, dry_run)
    }

    fn push_region(&self, region: Region, dry_run: bool) -> Result<PrivilegeGuard<'_>> {
        let mut stack = self.region_stack.lock().unwrap();
        stack.push(region);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(PrivilegeGuard {
            privs: self,
            generation,
            dry_run,
            restored: false,
        })
    }

    fn pop_region(&self, expected_generation: u64, dry_run: bool) -> Result<()> {
        let mut stack = self.region_stack.lock().unwrap();
        let current_generation = self.generation.load(Ordering::SeqCst);
        if current_generation != expected_generation + 1 {
            return Err(MonciError::Fail(format!(
                "privilege regions must be exited in LIFO order (expected generation {}, active generation {})",
                expected_generation, current_generation
            ))
            .into());
        }
        let region = stack.pop().ok_or_else(|| MonciError::Fail("privilege region stack underflow".to_string()))?;
        self.generation.fetch_sub(1, Ordering::SeqCst);

        let still_root = stack.iter().any(|r| *r == Region::Root);
        if !dry_run {
            match region {
                Region::Root if !still_root => self.drop_to_user()?,
                Region::User if still_root => self.regain_root()?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-execs the process via `sudo` if `auto_sudo` is enabled, else
    /// fails with `MonciError::Fail`. Returning `Ok` from this function
    /// never actually happens on success: `exec` replaces the process.
    pub fn needs_sudo(&self, argv0: &str, args: &[String]) -> Result<std::convert::Infallible> {
        if !self.auto_sudo {
            return Err(MonciError::Fail(
                "this operation requires root privileges; re-run under sudo or pass --auto-sudo".to_string(),
            )
            .into());
        }
        let sudo = which::which("sudo").context("auto-sudo requested but sudo was not found on $PATH")?;
        let err = exec_replace(&sudo, argv0, args);
        Err(anyhow::anyhow!("failed to exec sudo: {}", err))
    }
}

#[cfg(unix)]
fn exec_replace(sudo: &std::path::Path, argv0: &str, args: &[String]) -> std::io::Error {
    use std::os::unix::process::CommandExt;
    std::process::Command::new(sudo).arg(argv0).args(args).exec()
}

/// A uid/gid/username/groupname tuple identifying a user to forward into
/// a container, so files it creates come out owned by someone who can
/// read them back on the host.
///
/// Grounded in `moncic/unix.py`'s `UserConfig`, built three ways: from the
/// running process's own identity, from the `sudo` invoker recorded in
/// `SUDO_UID`/`SUDO_GID`/`SUDO_USER`, or from the owning uid/gid of a host
/// path (used when binding a working directory into the container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub user_id: u32,
    pub group_id: u32,
    pub user_name: String,
    pub group_name: String,
}

fn lookup_group_name(gid: u32) -> Option<String> {
    unsafe {
        let gr = libc::getgrgid(gid);
        if gr.is_null() {
            return None;
        }
        Some(std::ffi::CStr::from_ptr((*gr).gr_name).to_string_lossy().into_owned())
    }
}

impl UserConfig {
    fn resolve(user_id: u32, group_id: u32) -> Self {
        let (_, user_name) = lookup_passwd_entry(user_id).unwrap_or_else(|| (String::new(), user_id.to_string()));
        let group_name = lookup_group_name(group_id).unwrap_or_else(|| group_id.to_string());
        Self { user_id, group_id, user_name, group_name }
    }

    /// The identity of the running process (its real uid/gid).
    pub fn from_process() -> Self {
        let uid = getresuid().real;
        let gid = getresgid().real;
        Self::resolve(uid, gid)
    }

    /// The identity of the user who invoked `sudo`, from `SUDO_UID`/
    /// `SUDO_GID`. Returns `None` if either is absent or unparsable.
    pub fn from_sudo_env() -> Option<Self> {
        let uid = env::var("SUDO_UID").ok()?.parse::<u32>().ok()?;
        let gid = env::var("SUDO_GID").ok()?.parse::<u32>().ok()?;
        Some(Self::resolve(uid, gid))
    }

    /// The owning uid/gid of `path`, e.g. a working directory being bind
    /// mounted into a container.
    pub fn from_path_owner(path: &camino::Utf8Path) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path).with_context(|| format!("reading metadata for {path}"))?;
        Ok(Self::resolve(meta.uid(), meta.gid()))
    }
}

/// RAII guard returned by [`ProcessPrivs::root`]/[`ProcessPrivs::user`].
/// Restores the privilege state of the enclosing scope on drop, per the
/// "ordered list of scoped steps" pattern used throughout this codebase
/// for nested setup/teardown (bind mounts, container lifecycle).
pub struct PrivilegeGuard<'a> {
    privs: &'a ProcessPrivs,
    generation: u64,
    dry_run: bool,
    restored: bool,
}

impl Drop for PrivilegeGuard<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.privs.pop_region(self.generation, self.dry_run) {
            tracing::warn!("failed to restore privilege region: {:#}", e);
        }
        self.restored = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn privs_under_sudo() -> ProcessPrivs {
        ProcessPrivs {
            orig_uid: IdTriple { real: 1000, effective: 0, saved: 0 },
            orig_gid: IdTriple { real: 1000, effective: 0, saved: 0 },
            user_uid: 1000,
            user_gid: 1000,
            have_sudo: true,
            auto_sudo: false,
            generation: AtomicU64::new(0),
            region_stack: std::sync::Mutex::new(Vec::new()),
            dropped: true,
        }
    }

    fn privs_not_root() -> ProcessPrivs {
        ProcessPrivs {
            orig_uid: IdTriple { real: 1000, effective: 1000, saved: 1000 },
            orig_gid: IdTriple { real: 1000, effective: 1000, saved: 1000 },
            user_uid: 1000,
            user_gid: 1000,
            have_sudo: false,
            auto_sudo: false,
            generation: AtomicU64::new(0),
            region_stack: std::sync::Mutex::new(Vec::new()),
            dropped: false,
        }
    }

    #[test]
    fn can_regain_true_under_sudo() {
        assert!(privs_under_sudo().can_regain());
    }

    #[test]
    fn can_regain_false_without_sudo_and_not_root() {
        assert!(!privs_not_root().can_regain());
    }

    #[test]
    fn root_without_sudo_and_not_root_fails() {
        let privs = privs_not_root();
        let result = privs.root(true);
        assert!(result.is_err());
    }

    #[test]
    fn nested_root_and_user_regions_track_lifo_in_dry_run() {
        let privs = privs_under_sudo();
        {
            let _root_guard = privs.root(true).unwrap();
            assert_eq!(privs.region_stack.lock().unwrap().len(), 1);
            {
                let _user_guard = privs.user(true).unwrap();
                assert_eq!(privs.region_stack.lock().unwrap().len(), 2);
            }
            assert_eq!(privs.region_stack.lock().unwrap().len(), 1);
        }
        assert_eq!(privs.region_stack.lock().unwrap().len(), 0);
    }

    #[test]
    fn needs_sudo_without_auto_sudo_fails() {
        let privs = privs_not_root();
        let result = privs.needs_sudo("monci", &["bootstrap".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn user_config_from_path_owner_matches_process_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8Path::from_path(dir.path()).unwrap();
        let config = UserConfig::from_path_owner(path).unwrap();
        assert_eq!(config.user_id, UserConfig::from_process().user_id);
    }

    #[test]
    fn from_sudo_env_none_without_env_vars() {
        assert!(UserConfig::from_sudo_env().is_none());
    }

    #[test]
    fn have_sudo_detected_from_capture_when_env_set() {
        // SAFETY: test runs single-threaded within its own process; no other
        // thread reads these env vars concurrently.
        unsafe {
            env::set_var("SUDO_UID", "1000");
            env::set_var("SUDO_GID", "1000");
        }
        let privs = ProcessPrivs::capture(false);
        assert!(privs.have_sudo);
        assert_eq!(privs.user_uid, 1000);
        assert_eq!(privs.user_gid, 1000);
        unsafe {
            env::remove_var("SUDO_UID");
            env::remove_var("SUDO_GID");
        }
    }
}
