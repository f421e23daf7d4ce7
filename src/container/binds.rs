//! Bind-mount policy (C5): the six kinds of directory a container can
//! have mounted into it, each rendering to both the nspawn and podman
//! invocation styles and carrying its own guest-side setup/teardown.
//!
//! Grounded in `moncic/container/binds.py`.

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::script::{Script, shell_quote};

use super::ContainerRuntime;

/// Kind of bind mount requested on a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindType {
    ReadOnly,
    ReadWrite,
    Volatile,
    AptCache,
    AptPackages,
    Artifacts,
}

impl BindType {
    pub fn as_str(self) -> &'static str {
        match self {
            BindType::ReadOnly => "ro",
            BindType::ReadWrite => "rw",
            BindType::Volatile => "volatile",
            BindType::AptCache => "aptcache",
            BindType::AptPackages => "aptpackages",
            BindType::Artifacts => "artifacts",
        }
    }
}

/// A single requested bind mount.
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub bind_type: BindType,
    /// Host directory to bind mount. A relative-looking source prefixed
    /// with `+` (not modeled as a flag here, handled by the caller before
    /// constructing this struct) is taken relative to the image root.
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    /// Use as the container's default working directory.
    pub cwd: bool,
}

impl BindConfig {
    pub fn new(bind_type: BindType, source: Utf8PathBuf, destination: Utf8PathBuf, cwd: bool) -> Self {
        Self { bind_type, source, destination, cwd }
    }

    /// Parses a `--bind`/`--bind-ro`-style CLI argument: a bare path, or
    /// `source:destination`, with `\:` escaping an embedded colon.
    pub fn parse_nspawn_entry(entry: &str, bind_type: BindType) -> Result<Self> {
        let unescape = |s: &str| s.replace("\\:", ":");
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = entry.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' && chars.peek() == Some(&':') {
                current.push(':');
                chars.next();
            } else if c == ':' {
                parts.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        parts.push(current);

        match parts.len() {
            1 => {
                let path = Utf8PathBuf::from(unescape(&parts[0]));
                Ok(Self::new(bind_type, path.clone(), path, false))
            }
            2 | 3 => {
                let source = Utf8PathBuf::from(unescape(&parts[0]));
                let destination = Utf8PathBuf::from(unescape(&parts[1]));
                Ok(Self::new(bind_type, source, destination, false))
            }
            _ => anyhow::bail!("{entry:?}: unparsable bind option"),
        }
    }

    /// Renders the nspawn `--bind[-ro]=` argument for this mount.
    pub fn to_nspawn(&self) -> String {
        let opt = match self.bind_type {
            BindType::ReadOnly | BindType::AptPackages => "--bind-ro=",
            BindType::Volatile => {
                return format!("--bind={}:{}-readonly", escape_bind_ro(&self.source), escape_bind_ro(&self.destination));
            }
            _ => "--bind=",
        };
        if self.source == self.destination {
            format!("{opt}{}", escape_bind_ro(&self.source))
        } else {
            format!("{opt}{}:{}", escape_bind_ro(&self.source), escape_bind_ro(&self.destination))
        }
    }

    /// Renders the podman mount description (`Type`/`Source`/`Target`/`Readonly`).
    pub fn to_podman(&self) -> serde_json::Value {
        let readonly = matches!(self.bind_type, BindType::ReadOnly | BindType::AptPackages);
        serde_json::json!({
            "Type": "bind",
            "Readonly": readonly,
            "Source": self.source.as_str(),
            "Target": self.destination.as_str(),
        })
    }

    /// Runs this bind's guest-side setup script, if any, once the
    /// container has started.
    pub fn guest_setup(&self, runtime: &dyn ContainerRuntime) -> Result<BindTeardown> {
        match self.bind_type {
            BindType::AptCache => {
                let mut setup = Script::new().with_title(format!("apt cache mount setup for {}", self.destination));
                setup.line(
                    "cat > /etc/apt/apt.conf.d/99-tmp-moncic-ci-keep-downloads <<'EOF'\nBinary::apt::APT::Keep-Downloaded-Packages \"1\";\nEOF",
                );
                setup.if_block("id -u _apt > /dev/null 2>&1", |s| {
                    s.command(["touch", "/var/cache/apt/archives/.moncic-ci"]);
                    s.command(["chown", "--reference=/var/cache/apt/archives", "/var/cache/apt/archives/.moncic-ci"]);
                    s.line("chown _apt /var/cache/apt/archives/*.deb");
                    s.command(["chown", "_apt", "/var/cache/apt/archives"]);
                });
                runtime.run_script(&setup, None)?;

                let mut teardown = Script::new().with_title(format!("apt cache mount teardown for {}", self.destination));
                teardown.command(["rm", "-f", "/etc/apt/apt.conf.d/99-tmp-moncic-ci-keep-downloads"]);
                teardown.command(["chown", "-R", "--reference=/var/cache/apt/archives/.moncic-ci", "/var/cache/apt/archives"]);
                Ok(BindTeardown::Script(teardown))
            }
            BindType::AptPackages => {
                let mirror_dir = self.destination.parent().unwrap_or(&self.destination).to_path_buf();
                let packages_file = mirror_dir.join("Packages");
                let mirror_name = mirror_dir.file_name().unwrap_or("mirror").to_string();

                let mut setup = Script::new().with_title(format!("apt packages mount setup for {}", self.destination));
                setup.line(format!(
                    "(cd {} && apt-ftparchive packages {} > {})",
                    shell_quote(mirror_dir.as_str()),
                    shell_quote(&mirror_name),
                    shell_quote(packages_file.as_str())
                ));
                setup.line(format!(
                    "echo {} > /etc/apt/sources.list.d/tmp-moncic-ci.list",
                    shell_quote(&format!("deb [trusted=yes] file://{mirror_dir} ./"))
                ));
                setup.command(["apt-get", "update"]);
                runtime.run_script(&setup, None)?;

                let mut teardown = Script::new().with_title(format!("apt packages mount teardown for {}", self.destination));
                teardown.command(["rm", "-f", "/etc/apt/sources.list.d/tmp-moncic-ci.list"]);
                teardown.command(["rm", "-f", packages_file.as_str()]);
                Ok(BindTeardown::Script(teardown))
            }
            BindType::Artifacts => {
                let mut teardown = Script::new().with_title(format!("artifacts mount teardown for {}", self.destination));
                teardown.command(["chown", "-R", &format!("--reference={}", self.destination), self.destination.as_str()]);
                Ok(BindTeardown::Script(teardown))
            }
            BindType::Volatile => {
                let mut setup = Script::new().with_title(format!("volatile mount setup for {}", self.destination));
                let readonly_base = format!("{}-readonly", self.destination);
                let digest = format!("{:x}", simple_hash(self.destination.as_str()));
                let workdir = format!("/run/volatile/{digest}");
                setup.command(["mkdir", "-p", self.destination.as_str()]);
                setup.command(["mkdir", "-p", &format!("{workdir}/upper")]);
                setup.command(["chown", &format!("--reference={readonly_base}"), &format!("{workdir}/upper")]);
                setup.command(["mkdir", "-p", &format!("{workdir}/work")]);
                setup.command(["chown", &format!("--reference={readonly_base}"), &format!("{workdir}/work")]);
                setup.command([
                    "mount",
                    "-t",
                    "overlay",
                    "overlay",
                    &format!("-olowerdir={readonly_base},upperdir={workdir}/upper,workdir={workdir}/work"),
                    self.destination.as_str(),
                ]);
                runtime.run_script(&setup, None)?;
                Ok(BindTeardown::None)
            }
            BindType::ReadOnly | BindType::ReadWrite => Ok(BindTeardown::None),
        }
    }
}

/// What to run when a bind's guest setup needs undoing on container exit.
pub enum BindTeardown {
    None,
    Script(Script),
}

impl BindTeardown {
    pub fn run(self, runtime: &dyn ContainerRuntime) -> Result<()> {
        match self {
            BindTeardown::None => Ok(()),
            BindTeardown::Script(script) => runtime.run_script(&script, None).map(|_| ()),
        }
    }
}

fn simple_hash(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Escapes a path for nspawn's `--bind`/`--bind-ro` colon-separated
/// syntax: backslash-escape literal colons.
pub fn escape_bind_ro(path: &camino::Utf8Path) -> String {
    path.as_str().replace(':', "\\:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_same_source_and_destination_renders_single_path() {
        let bind = BindConfig::new(BindType::ReadOnly, Utf8PathBuf::from("/srv/x"), Utf8PathBuf::from("/srv/x"), false);
        assert_eq!(bind.to_nspawn(), "--bind-ro=/srv/x");
    }

    #[test]
    fn readwrite_distinct_paths_renders_pair() {
        let bind = BindConfig::new(BindType::ReadWrite, Utf8PathBuf::from("/host/a"), Utf8PathBuf::from("/guest/b"), false);
        assert_eq!(bind.to_nspawn(), "--bind=/host/a:/guest/b");
    }

    #[test]
    fn volatile_renders_readonly_suffix() {
        let bind = BindConfig::new(BindType::Volatile, Utf8PathBuf::from("/a"), Utf8PathBuf::from("/b"), false);
        assert_eq!(bind.to_nspawn(), "--bind=/a:/b-readonly");
    }

    #[test]
    fn escape_bind_ro_escapes_colons() {
        assert_eq!(escape_bind_ro(camino::Utf8Path::new("/a:b")), "/a\\:b");
    }

    #[test]
    fn parse_nspawn_entry_single_path() {
        let bind = BindConfig::parse_nspawn_entry("/srv/x", BindType::ReadWrite).unwrap();
        assert_eq!(bind.source, Utf8PathBuf::from("/srv/x"));
        assert_eq!(bind.destination, Utf8PathBuf::from("/srv/x"));
    }

    #[test]
    fn parse_nspawn_entry_pair() {
        let bind = BindConfig::parse_nspawn_entry("/host:/guest", BindType::ReadOnly).unwrap();
        assert_eq!(bind.source, Utf8PathBuf::from("/host"));
        assert_eq!(bind.destination, Utf8PathBuf::from("/guest"));
    }

    #[test]
    fn parse_nspawn_entry_handles_escaped_colon() {
        let bind = BindConfig::parse_nspawn_entry("/a\\:b:/c", BindType::ReadOnly).unwrap();
        assert_eq!(bind.source, Utf8PathBuf::from("/a:b"));
        assert_eq!(bind.destination, Utf8PathBuf::from("/c"));
    }

    #[test]
    fn to_podman_readonly_flag() {
        let bind = BindConfig::new(BindType::ReadOnly, Utf8PathBuf::from("/a"), Utf8PathBuf::from("/b"), false);
        let v = bind.to_podman();
        assert_eq!(v["Readonly"], serde_json::json!(true));
    }
}
