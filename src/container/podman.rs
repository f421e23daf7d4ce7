//! podman backend for [`super::ContainerRuntime`].
//!
//! Grounded in `moncic/podman/container.py`. Upstream drives a local
//! `podman` Python binding; this crate has no such binding in its
//! dependency stack, so every operation shells out to the `podman` CLI
//! through the same [`CommandExecutor`] abstraction the nspawn backend
//! uses, which keeps both backends testable with
//! [`crate::executor::MockCommandExecutor`].

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::executor::{CommandExecutor, CommandSpec};
use crate::privilege::UserConfig;

use super::{BindConfig, CompletedCommand, ContainerConfig, ContainerRuntime, RunConfig};

/// A container instance backed by a podman image.
pub struct PodmanContainer {
    pub podman_image: String,
    pub config: ContainerConfig,
    pub executor: Arc<dyn CommandExecutor>,
    pub scriptdir: Utf8PathBuf,
    pub guest_scriptdir: Utf8PathBuf,
    /// Forces `ephemeral = false`, used by maintenance sessions that must
    /// commit changes back into the image after the container exits.
    pub maintenance: bool,
    container_id: Mutex<Option<String>>,
}

impl PodmanContainer {
    pub fn new(podman_image: String, mut config: ContainerConfig, executor: Arc<dyn CommandExecutor>, scriptdir: Utf8PathBuf, maintenance: bool) -> Self {
        config.ephemeral = !maintenance;
        Self {
            podman_image,
            config,
            executor,
            scriptdir,
            guest_scriptdir: Utf8PathBuf::from("/srv/moncic-ci/scripts"),
            maintenance,
            container_id: Mutex::new(None),
        }
    }

    fn run_podman(&self, args: Vec<String>) -> Result<crate::executor::ExecutionResult> {
        let spec = CommandSpec::new("podman".to_string(), args.iter().map(std::ffi::OsString::from).collect());
        self.executor.execute(&spec).with_context(|| format!("running podman {}", args.join(" ")))
    }

    fn id(&self) -> Result<String> {
        self.container_id.lock().unwrap().clone().ok_or_else(|| anyhow::anyhow!("container not started"))
    }

    /// Creates, starts and waits for the container to be running, with a
    /// read-only bind of the script exchange directory plus every
    /// configured bind mount.
    pub fn start(&self) -> Result<()> {
        if self.container_id.lock().unwrap().is_some() {
            bail!("container already started");
        }

        let mut args = vec![
            "create".to_string(),
            "--mount".to_string(),
            format!("type=bind,readonly=true,source={},destination={}", self.scriptdir, self.guest_scriptdir),
        ];
        for bind in &self.config.binds {
            let v = bind.to_podman();
            let readonly = v["Readonly"].as_bool().unwrap_or(false);
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,readonly={},source={},destination={}",
                readonly,
                v["Source"].as_str().unwrap_or_default(),
                v["Target"].as_str().unwrap_or_default()
            ));
        }
        args.push("--rm".to_string());
        args.push(self.podman_image.clone());
        args.push("sleep".to_string());
        args.push("inf".to_string());

        let result = self.run_podman(args)?;
        if !result.success() {
            bail!(crate::error::MonciError::ContainerCannotStart(result.stdout_string()));
        }
        let id = result.stdout_string().trim().to_string();

        let start = self.run_podman(vec!["start".to_string(), id.clone()])?;
        if !start.success() {
            bail!(crate::error::MonciError::ContainerCannotStart(start.stdout_string()));
        }
        self.run_podman(vec!["wait".to_string(), "--condition=running".to_string(), id.clone()])?;

        *self.container_id.lock().unwrap() = Some(id);
        Ok(())
    }

    /// Kills and waits for the container to stop; `--rm` at creation time
    /// takes care of removal.
    pub fn stop(&self) -> Result<()> {
        let id = { self.container_id.lock().unwrap().take() };
        let Some(id) = id else { return Ok(()) };
        self.run_podman(vec!["kill".to_string(), "--signal=KILL".to_string(), id.clone()])?;
        self.run_podman(vec!["wait".to_string(), "--condition=stopped".to_string(), id])?;
        Ok(())
    }
}

impl ContainerRuntime for PodmanContainer {
    fn get_root(&self) -> &Utf8Path {
        // podman containers have no host-visible root filesystem path;
        // callers needing one should use the nspawn backend instead.
        Utf8Path::new("/")
    }

    fn get_pid(&self) -> Option<u32> {
        let id = self.container_id.lock().unwrap().clone()?;
        let result = self
            .run_podman(vec!["inspect".to_string(), "--format".to_string(), "{{.State.Pid}}".to_string(), id])
            .ok()?;
        result.stdout_string().trim().parse().ok()
    }

    fn binds(&self) -> &[BindConfig] {
        &self.config.binds
    }

    fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn stage_script(&self, contents: &str) -> Result<String> {
        let name = format!("script-{}", uuid::Uuid::new_v4());
        let host_path = self.scriptdir.join(&name);
        std::fs::write(&host_path, contents).with_context(|| format!("writing {host_path}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(self.guest_scriptdir.join(&name).into_string())
    }

    fn run(&self, command: &[String], config: Option<RunConfig>) -> Result<CompletedCommand> {
        let run_config = self.config.resolve_run_config(config);
        let id = self.id()?;

        let mut args = vec!["exec".to_string()];
        if run_config.interactive {
            args.push("--interactive".to_string());
            args.push("--tty".to_string());
        }
        if let Some(cwd) = &run_config.cwd {
            args.push("--workdir".to_string());
            args.push(cwd.to_string());
        }
        if let Some(user) = &run_config.user {
            args.push("--user".to_string());
            args.push(user.user_name.clone());
        }
        args.push(id);
        args.extend(command.iter().cloned());

        let result = self.run_podman(args)?;
        let completed = CompletedCommand {
            stdout: result.stdout,
            stderr: result.stderr,
            returncode: result.code().unwrap_or(0),
        };
        if run_config.checked() && !completed.success() {
            bail!(crate::error::MonciError::subprocess(
                crate::script::shell_join(command),
                format!("exit code {}", completed.returncode)
            ));
        }
        Ok(completed)
    }

    fn forward_user(&self, user: &UserConfig, _allow_maint: bool) -> Result<()> {
        let mut script = crate::script::Script::new().with_title(format!("forward user {}", user.user_name));
        script.if_block(&format!("! getent group {} > /dev/null", user.group_id), |s| {
            s.command(["groupadd", "-g", &user.group_id.to_string(), &user.group_name]);
        });
        script.if_block(&format!("! getent passwd {} > /dev/null", user.user_id), |s| {
            s.command([
                "useradd",
                "-m",
                "-u",
                &user.user_id.to_string(),
                "-g",
                &user.group_id.to_string(),
                &user.user_name,
            ]);
        });
        self.run_script(&script, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockCommandExecutor;
    use crate::runlog::RunLog;

    fn container(maintenance: bool) -> PodmanContainer {
        let log = Arc::new(Mutex::new(RunLog::new()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(MockCommandExecutor::new(log));
        PodmanContainer::new(
            "docker.io/library/debian:bookworm".to_string(),
            ContainerConfig::new(),
            executor,
            Utf8PathBuf::from("/tmp/monci-scripts"),
            maintenance,
        )
    }

    #[test]
    fn new_forces_ephemeral_from_maintenance_flag() {
        assert!(container(false).config.ephemeral);
        assert!(!container(true).config.ephemeral);
    }

    #[test]
    fn run_without_started_container_is_an_error() {
        let c = container(false);
        assert!(c.run(&["true".to_string()], None).is_err());
    }

    #[test]
    fn get_root_is_not_meaningful_for_podman() {
        assert_eq!(container(false).get_root(), Utf8Path::new("/"));
    }
}
