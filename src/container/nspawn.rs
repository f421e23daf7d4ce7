//! systemd-nspawn backend for [`super::ContainerRuntime`].
//!
//! Grounded in `moncic/nspawn/container.py`: a container is a transient
//! `systemd-run` unit wrapping `systemd-nspawn --boot`, with fixed unit
//! properties pinning it into `machine.slice` and tolerating nspawn's
//! reboot/poweroff exit code convention (133).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::distro::Distro;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::privilege::{ProcessPrivs, UserConfig};

use super::{BindConfig, CompletedCommand, ContainerConfig, ContainerRuntime, RunConfig};

/// Fixed `systemd-run --property=` fragments pinning the transient unit
/// wrapping `systemd-nspawn`, reproduced verbatim from upstream.
pub fn unit_properties() -> &'static [&'static str] {
    &[
        "KillMode=mixed",
        "Type=notify",
        "RestartForceExitStatus=133",
        "SuccessExitStatus=133",
        "Slice=machine.slice",
        "Delegate=yes",
        "TasksMax=16384",
        "WatchdogSec=3min",
    ]
}

/// A running (or about-to-run) nspawn-backed container instance.
pub struct NspawnContainer {
    pub instance_name: String,
    pub root: Utf8PathBuf,
    pub config: ContainerConfig,
    pub distro: Arc<dyn Distro>,
    pub executor: Arc<dyn CommandExecutor>,
    pub privs: Arc<ProcessPrivs>,
    pub scriptdir: Utf8PathBuf,
    pub guest_scriptdir: Utf8PathBuf,
    pub systemd_version: u32,
    properties: Mutex<BTreeMap<String, String>>,
}

impl NspawnContainer {
    pub fn new(
        instance_name: String,
        root: Utf8PathBuf,
        config: ContainerConfig,
        distro: Arc<dyn Distro>,
        executor: Arc<dyn CommandExecutor>,
        privs: Arc<ProcessPrivs>,
        scriptdir: Utf8PathBuf,
        systemd_version: u32,
    ) -> Self {
        Self {
            instance_name,
            root,
            config,
            distro,
            executor,
            privs,
            scriptdir,
            guest_scriptdir: Utf8PathBuf::from("/srv/moncic-ci/scripts"),
            systemd_version,
            properties: Mutex::new(BTreeMap::new()),
        }
    }

    fn check_host_system(&self) -> Result<()> {
        if self.distro.cgroup_v1() {
            let cmdline = std::fs::read_to_string("/proc/cmdline").unwrap_or_default();
            if !cmdline.split_whitespace().any(|w| w == "systemd.unified_cgroup_hierarchy=0") {
                bail!(
                    "container requires guest cgroup v1, not available on host with cgroup v2; \
                     try the podman backend, or add systemd.unified_cgroup_hierarchy=0 to the host \
                     kernel command line"
                );
            }
        }
        Ok(())
    }

    fn start_command(&self) -> Vec<String> {
        let mut cmd = vec![
            "systemd-nspawn".to_string(),
            "--quiet".to_string(),
            format!("--directory={}", self.root),
            format!("--machine={}", self.instance_name),
            "--boot".to_string(),
            "--notify-ready=yes".to_string(),
            "--resolv-conf=replace-host".to_string(),
            format!(
                "--bind-ro={}:{}",
                super::binds::escape_bind_ro(&self.scriptdir),
                super::binds::escape_bind_ro(&self.guest_scriptdir)
            ),
        ];
        for bind in &self.config.binds {
            cmd.push(bind.to_nspawn());
        }
        if self.config.ephemeral {
            if self.config.tmpfs.unwrap_or(false) {
                cmd.push("--volatile=overlay".to_string());
                cmd.push("--read-only".to_string());
            } else {
                cmd.push("--ephemeral".to_string());
            }
        }
        if self.systemd_version >= 250 {
            cmd.push("--suppress-sync=yes".to_string());
        }
        cmd.push(format!("systemd.hostname={}", self.instance_name));
        cmd
    }

    /// Starts the transient unit wrapping `systemd-nspawn`, as root.
    pub fn start(&self) -> Result<()> {
        self.check_host_system()?;

        let _root = self.privs.root(false).context("starting a container requires root")?;

        let mut argv: Vec<String> = vec!["systemd-run".to_string()];
        argv.extend(unit_properties().iter().map(|p| format!("--property={p}")));
        argv.extend(self.start_command());

        let spec = CommandSpec::new(argv[0].clone(), argv[1..].iter().map(std::ffi::OsString::from).collect());
        let result = self.executor.execute(&spec).context("running systemd-run")?;
        if !result.success() {
            bail!("failed to start container: {}", result.stdout_string());
        }

        let show = CommandSpec::new(
            "machinectl".to_string(),
            vec!["show".into(), self.instance_name.clone().into()],
        );
        let show_result = self.executor.execute(&show).context("running machinectl show")?;
        let mut properties = BTreeMap::new();
        for line in show_result.stdout_string().lines() {
            if let Some((key, value)) = line.split_once('=') {
                properties.insert(key.to_string(), value.to_string());
            }
        }
        *self.properties.lock().unwrap() = properties;
        Ok(())
    }

    /// Sends the nspawn poweroff signal (SIGRTMIN+4) and waits for the
    /// leader process to exit, as root.
    pub fn stop(&self) -> Result<()> {
        let _root = self.privs.root(false).context("stopping a container requires root")?;
        let Some(pid) = self.get_pid() else { return Ok(()) };

        let rtmin4 = libc::SIGRTMIN() + 4;
        unsafe {
            libc::kill(pid as i32, rtmin4);
        }
        loop {
            let rc = unsafe { libc::kill(pid as i32, 0) };
            if rc != 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        Ok(())
    }
}

impl ContainerRuntime for NspawnContainer {
    fn get_root(&self) -> &Utf8Path {
        self.properties
            .lock()
            .unwrap()
            .get("RootDirectory")
            .map(|_| ())
            .map(|_| &self.root as &Utf8Path)
            .unwrap_or(&self.root)
    }

    fn get_pid(&self) -> Option<u32> {
        self.properties.lock().unwrap().get("Leader").and_then(|v| v.parse().ok())
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

        let mut argv: Vec<String> = vec![
            "/usr/bin/systemd-run".to_string(),
            format!("--machine={}", self.instance_name),
            "--wait".to_string(),
            "--collect".to_string(),
            "--service-type=exec".to_string(),
            "--quiet".to_string(),
        ];
        if let Some(cwd) = &run_config.cwd {
            argv.push(format!("--working-directory={cwd}"));
        }
        if run_config.interactive {
            argv.push("--tty".to_string());
        } else {
            argv.push("--pipe".to_string());
        }
        if !run_config.use_path {
            argv.push("--property=ExecSearchPath=/dev/null".to_string());
        }
        if let Some(user) = &run_config.user {
            argv.push(format!("--uid={}", user.user_id));
            argv.push(format!("--gid={}", user.group_id));
        }
        if run_config.disable_network {
            argv.push("--property=PrivateNetwork=true".to_string());
        }
        argv.extend(command.iter().cloned());

        let _root = self.privs.root(false).context("running a command in a container requires root")?;
        let spec = {
            let mut spec = CommandSpec::new(argv[0].clone(), argv[1..].iter().map(std::ffi::OsString::from).collect());
            if run_config.interactive {
                spec = spec.interactive();
            }
            spec
        };
        let result = self.executor.execute(&spec)?;

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
    use crate::distro::lookup_distro;
    use crate::executor::MockCommandExecutor;
    use crate::runlog::RunLog;

    fn container(config: ContainerConfig) -> NspawnContainer {
        let log = Arc::new(Mutex::new(RunLog::new()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(MockCommandExecutor::new(log));
        NspawnContainer::new(
            "mc-test".to_string(),
            Utf8PathBuf::from("/var/lib/machines/bookworm"),
            config,
            lookup_distro("debian:bookworm").unwrap(),
            executor,
            Arc::new(ProcessPrivs::capture(false)),
            Utf8PathBuf::from("/tmp/monci-scripts"),
            254,
        )
    }

    #[test]
    fn start_command_includes_boot_and_machine_name() {
        let c = container(ContainerConfig::new());
        let cmd = c.start_command();
        assert!(cmd.contains(&"--boot".to_string()));
        assert!(cmd.iter().any(|a| a == "--machine=mc-test"));
    }

    #[test]
    fn start_command_uses_ephemeral_without_tmpfs() {
        let c = container(ContainerConfig::new());
        assert!(c.start_command().contains(&"--ephemeral".to_string()));
    }

    #[test]
    fn start_command_uses_volatile_overlay_with_tmpfs() {
        let mut config = ContainerConfig::new();
        config.tmpfs = Some(true);
        let c = container(config);
        let cmd = c.start_command();
        assert!(cmd.contains(&"--volatile=overlay".to_string()));
        assert!(cmd.contains(&"--read-only".to_string()));
    }

    #[test]
    fn unit_properties_pin_machine_slice_and_delegate() {
        assert!(unit_properties().contains(&"Slice=machine.slice"));
        assert!(unit_properties().contains(&"Delegate=yes"));
        assert!(unit_properties().contains(&"SuccessExitStatus=133"));
    }
}
