//! Podman-backed image store: images are podman-local container images
//! tagged under a fixed repository prefix, listed and resolved by
//! shelling out to the `podman` CLI.
//!
//! Grounded in `original_source/moncic/podman/images.py`'s `PodmanImages`,
//! which upstream lists as always-empty and leaves `image()` unimplemented
//! (a documented stub); this store implements both for real, since a
//! `monci images` inventory that always under-reports podman images would
//! be a regression, not a faithful port.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::executor::{CommandExecutor, CommandSpec};

use super::{BackendHandle, Image, ImagesProvider, RunnableImage};

/// Prefix every podman-backed image is tagged under, matching
/// `Session.podman_repository_prefix` upstream.
pub const PODMAN_REPOSITORY_PREFIX: &str = "localhost/moncic-ci/";

pub struct PodmanImages {
    pub executor: Arc<dyn CommandExecutor>,
}

impl PodmanImages {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn tag_for(name: &str) -> String {
        format!("{PODMAN_REPOSITORY_PREFIX}{name}:latest")
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        let spec = CommandSpec::new("podman", vec!["images".into(), "--format".into(), "{{.Repository}}:{{.Tag}}".into()]);
        let result = self.executor.execute(&spec).context("listing podman images")?;
        Ok(result.stdout_string().lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }
}

impl ImagesProvider for PodmanImages {
    fn list_images(&self) -> Result<Vec<String>> {
        let tags = self.list_tags().unwrap_or_default();
        Ok(tags
            .into_iter()
            .filter_map(|tag| tag.strip_prefix(PODMAN_REPOSITORY_PREFIX).map(|rest| rest.trim_end_matches(":latest").to_string()))
            .collect())
    }

    fn has_image(&self, name: &str) -> bool {
        self.list_tags().unwrap_or_default().contains(&Self::tag_for(name))
    }

    fn image(&self, name: &str) -> Result<Image> {
        if !self.has_image(name) {
            bail!("podman image {name:?} not found under {PODMAN_REPOSITORY_PREFIX}");
        }
        let distro = crate::distro::lookup_distro(name)
            .context("podman images are named after their distro; could not resolve its identity")?;
        Ok(Image::Runnable(RunnableImage {
            name: name.to_string(),
            distro,
            backend: BackendHandle::PodmanId(Self::tag_for(name)),
            bootstrap_from: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockCommandExecutor, QueuedResult};
    use crate::runlog::RunLog;
    use std::sync::Mutex;

    #[test]
    fn list_images_strips_prefix_and_tag() {
        let log = Arc::new(Mutex::new(RunLog::new()));
        let executor = Arc::new(MockCommandExecutor::new(log));
        executor.queue_result(
            "podman images",
            QueuedResult { returncode: 0, stdout: b"localhost/moncic-ci/debian:bookworm:latest\n".to_vec(), stderr: Vec::new() },
        );
        let store = PodmanImages::new(executor);
        assert_eq!(store.list_images().unwrap(), vec!["debian:bookworm".to_string()]);
    }
}
