//! Container runtime (C4) and bind-mount policy (C5): starts an ephemeral
//! instance of a [`crate::image::RunnableImage`], runs commands and scripts
//! inside it, and tears it down.
//!
//! Grounded in `moncic/container/container.py` (`Container`),
//! `moncic/container/binds.py` (`BindConfig`), `moncic/container/config.py`
//! (`ContainerConfig`), and the two backends in
//! `moncic/nspawn/container.py` / `moncic/podman/container.py`.

pub mod binds;
pub mod nspawn;
pub mod podman;

pub use binds::{BindConfig, BindType};

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::privilege::UserConfig;
use crate::script::Script;

/// Options for a single command run inside a container, analogous to
/// `moncic.runner.RunConfig`.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub user: Option<UserConfig>,
    pub cwd: Option<Utf8PathBuf>,
    /// Fail (return an error) if the command exits non-zero. Defaults to
    /// `true`.
    pub check: Option<bool>,
    /// Whether `$PATH` is searched for the command, or only an absolute
    /// path is accepted (`ExecSearchPath=/dev/null` equivalent).
    pub use_path: bool,
    pub disable_network: bool,
    /// Attach the container's stdio to the host's, instead of capturing.
    pub interactive: bool,
}

impl RunConfig {
    pub fn checked(&self) -> bool {
        self.check.unwrap_or(true)
    }
}

/// Result of running a command or script inside a container.
#[derive(Debug, Clone)]
pub struct CompletedCommand {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub returncode: i32,
}

impl CompletedCommand {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Configuration used to start a container.
///
/// Grounded in `moncic/container/config.py`'s `ContainerConfig`.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub ephemeral: bool,
    /// `None` defers to the session/image default.
    pub tmpfs: Option<bool>,
    pub binds: Vec<BindConfig>,
    pub forward_user: Option<UserConfig>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self { ephemeral: true, tmpfs: None, binds: Vec::new(), forward_user: None }
    }
}

impl ContainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bind(&mut self, bind: BindConfig) {
        self.binds.push(bind);
    }

    /// Binds `workdir` read-write at `<mountpoint>/<workdir's name>`, marks
    /// it as the container's default cwd, and forwards its owning user.
    pub fn configure_workdir(&mut self, workdir: &camino::Utf8Path, bind_type: BindType, mountpoint: &camino::Utf8Path) -> Result<()> {
        let workdir = workdir.canonicalize_utf8()?;
        let name = workdir.file_name().unwrap_or("workdir").to_string();
        let destination = mountpoint.join(name);
        self.add_bind(BindConfig::new(bind_type, workdir.clone(), destination, true));
        self.forward_user = Some(UserConfig::from_path_owner(&workdir)?);
        Ok(())
    }

    /// Fills in unset fields of `run_config` (or builds a fresh one) from
    /// this container's `cwd`-marked bind and `forward_user`.
    pub fn resolve_run_config(&self, run_config: Option<RunConfig>) -> RunConfig {
        let mut res = run_config.unwrap_or_default();

        let home_bind = self.binds.iter().find(|b| b.cwd);

        if res.cwd.is_none() {
            res.cwd = Some(match (&home_bind, &res.user) {
                (Some(bind), _) => bind.destination.clone(),
                (None, Some(user)) if user.user_id != 0 => Utf8PathBuf::from(format!("/home/{}", user.user_name)),
                (None, _) => Utf8PathBuf::from("/root"),
            });
        }

        if res.user.is_none() {
            if let Some(bind) = home_bind {
                if let Ok(user) = UserConfig::from_path_owner(&bind.source) {
                    res.user = Some(user);
                }
            }
        }

        res
    }
}

/// Common contract implemented by the nspawn and podman backends.
///
/// Object-safe so a running container can be held as
/// `Box<dyn ContainerRuntime>` by the session/CLI layer.
pub trait ContainerRuntime: Send + Sync {
    fn get_root(&self) -> &camino::Utf8Path;
    fn get_pid(&self) -> Option<u32>;
    fn binds(&self) -> &[BindConfig];
    fn config(&self) -> &ContainerConfig;

    fn run(&self, command: &[String], config: Option<RunConfig>) -> Result<CompletedCommand>;

    /// Writes `script` to the exchange directory and runs it, honoring a
    /// leading shebang line.
    fn run_script(&self, script: &Script, config: Option<RunConfig>) -> Result<CompletedCommand> {
        tracing::info!("running script {}", script.title.as_deref().unwrap_or("<untitled>"));
        let path = self.stage_script(&script.render())?;
        self.run(&[path], config)
    }

    /// Stages `contents` as an executable file under the container's
    /// mounted scratch directory, returning the guest-visible path.
    fn stage_script(&self, contents: &str) -> Result<String>;

    /// Opens an interactive login shell, trying `$SHELL` first, then
    /// `bash`/`sh`.
    fn run_shell(&self, config: Option<RunConfig>) -> Result<CompletedCommand> {
        let mut candidates = Vec::new();
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(base) = shell.rsplit('/').next() {
                candidates.push(base.to_string());
            }
            candidates.push(shell);
        }
        candidates.push("bash".to_string());
        candidates.push("sh".to_string());

        let mut probe_script = Script::new().with_title("find a login shell");
        probe_script.for_block("candidate", &candidates.join(" "), |s| {
            s.line("command -v \"$candidate\" && break");
        });
        let found = self.run_script(&probe_script, None)?;
        let shell = found.stdout_string().trim().to_string();
        if shell.is_empty() {
            anyhow::bail!("no valid shell found; tried: {}", candidates.join(" "));
        }

        let mut run_config = config.unwrap_or_default();
        run_config.interactive = true;
        self.run(&[shell, "--login".to_string()], Some(run_config))
    }

    /// Runs `program` inside the guest with `payload` serialized as JSON on
    /// stdin, parsing its stdout as a `{"ok": bool, "value"?, "error"?}`
    /// envelope.
    ///
    /// There is no Rust equivalent of pickling an arbitrary host closure
    /// across the container boundary, so unlike the upstream
    /// `run_callable`, this always dispatches to a named guest-side
    /// program (a script or binary already staged/bind-mounted into the
    /// image) rather than marshalling host code.
    fn run_callable(&self, program: &str, payload: &serde_json::Value, config: Option<RunConfig>) -> Result<serde_json::Value> {
        let stdin_json = serde_json::to_string(payload)?;
        let mut script = Script::new().with_title(format!("run callable {program}"));
        script.line(format!("echo {} | {}", shell_escape(&stdin_json), program));
        let result = self.run_script(&script, config)?;
        if !result.success() {
            anyhow::bail!(
                "callable {program:?} failed with exit code {}: {}",
                result.returncode,
                String::from_utf8_lossy(&result.stderr)
            );
        }
        let envelope: serde_json::Value = serde_json::from_slice(&result.stdout).with_context_callable(program)?;
        let ok = envelope.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        if ok {
            Ok(envelope.get("value").cloned().unwrap_or(serde_json::Value::Null))
        } else {
            let message = envelope.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error").to_string();
            Err(crate::error::MonciError::Callable(message).into())
        }
    }

    /// Ensures `user` exists in the guest (creating it if necessary), so
    /// files it writes can be read back on the host.
    fn forward_user(&self, user: &UserConfig, allow_maint: bool) -> Result<()>;
}

trait ContextCallable<T> {
    fn with_context_callable(self, program: &str) -> Result<T>;
}

impl<T> ContextCallable<T> for Result<T, serde_json::Error> {
    fn with_context_callable(self, program: &str) -> Result<T> {
        use anyhow::Context;
        self.with_context(|| format!("callable {program:?} did not produce a valid JSON envelope"))
    }
}

fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_run_config_defaults_cwd_to_root_without_bind() {
        let config = ContainerConfig::new();
        let resolved = config.resolve_run_config(None);
        assert_eq!(resolved.cwd, Some(Utf8PathBuf::from("/root")));
    }

    #[test]
    fn resolve_run_config_uses_cwd_bind_destination() {
        let mut config = ContainerConfig::new();
        config.add_bind(BindConfig::new(
            BindType::ReadWrite,
            Utf8PathBuf::from("/home/user/project"),
            Utf8PathBuf::from("/media/project"),
            true,
        ));
        let resolved = config.resolve_run_config(None);
        assert_eq!(resolved.cwd, Some(Utf8PathBuf::from("/media/project")));
    }

    #[test]
    fn resolve_run_config_uses_home_for_non_root_user_without_bind() {
        let mut config = ContainerConfig::new();
        let mut run_config = RunConfig::default();
        run_config.user = Some(UserConfig { user_id: 1000, group_id: 1000, user_name: "alice".to_string(), group_name: "alice".to_string() });
        let resolved = config.resolve_run_config(Some(run_config));
        assert_eq!(resolved.cwd, Some(Utf8PathBuf::from("/home/alice")));
        let _ = &mut config;
    }
}
