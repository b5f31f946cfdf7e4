//! The lifecycle orchestrator.
//!
//! Every command independently queries the runtime for the current state of
//! the single `kdk` container, applies its guard, and performs at most one
//! mutating call sequence. Nothing is cached between commands.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use kdk_common::{ImageRef, KdkError, Result};
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigStore, KdkConfig};
use crate::prompt::Prompt;
use crate::runtime::ContainerRuntime;
use crate::ssh;
use crate::tag::TagMatcher;

/// The reserved container name. At most one container with this name exists;
/// uniqueness is enforced by the runtime, not by this tool.
pub const CONTAINER_NAME: &str = "kdk";

/// Idempotent provisioning executable inside the container. It performs user
/// and dotfile setup on first run and no-ops afterwards; its exit code is the
/// only contract surface.
const PROVISION_COMMAND: &str = "/usr/local/bin/kdk-provision";

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    prompt: Arc<dyn Prompt>,
    tags: TagMatcher,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prompt: Arc<dyn Prompt>, user: &str) -> Self {
        Self {
            runtime,
            prompt,
            tags: TagMatcher::new(user),
        }
    }

    /// Write the configuration record, pull the base image, and generate the
    /// ssh identity. Overwriting an existing record requires confirmation;
    /// key generation failures are logged and swallowed.
    #[instrument(skip(self, store, config), fields(image = %config.image))]
    pub async fn init(&self, store: &ConfigStore, config: &KdkConfig) -> Result<()> {
        if store.exists() {
            let question = format!(
                "Configuration at {} already exists. Overwrite?",
                store.path().display()
            );
            if !self.prompt.confirm(&question)? {
                return Err(KdkError::Declined(
                    "init aborted, existing configuration kept".to_string(),
                ));
            }
        }
        store.save(config).await?;
        self.pull(config).await?;
        match ssh::ensure_keypair(&store.key_dir()).await {
            Ok(path) => info!(key = %path.display(), "ssh identity ready"),
            Err(e) => warn!(error = %e, "ssh key generation failed, continuing without one"),
        }
        Ok(())
    }

    /// Fetch the configured base image. Re-pulling a current image is a no-op
    /// at the runtime level; pull errors propagate verbatim.
    pub async fn pull(&self, config: &KdkConfig) -> Result<()> {
        self.runtime.pull_image(&config.image).await
    }

    /// Start the container and provision it.
    ///
    /// With a live container this is a guarded no-op that reports the state
    /// and performs zero mutations. An explicit `image_override` wins over
    /// selection; otherwise, when interactive and snapshots exist, the user
    /// picks from [configured base, snapshots newest-first]. The offered
    /// default is always the configured base image, not the newest snapshot.
    #[instrument(skip(self, config, image_override))]
    pub async fn up(
        &self,
        config: &KdkConfig,
        interactive: bool,
        image_override: Option<ImageRef>,
    ) -> Result<()> {
        if let Some(existing) = self.runtime.get_container(CONTAINER_NAME).await? {
            return Err(KdkError::WrongState(format!(
                "container {CONTAINER_NAME} already exists (running: {}); \
                 run `kdk destroy` first",
                existing.running
            )));
        }

        let image = match image_override {
            Some(image) => image,
            None => self.select_image(config, interactive).await?,
        };
        let spec = config.launch_spec(&image)?;
        info!(%image, "starting container");
        self.runtime.run_container(CONTAINER_NAME, &spec).await?;
        self.provision().await
    }

    async fn select_image(&self, config: &KdkConfig, interactive: bool) -> Result<ImageRef> {
        if !interactive {
            return Ok(config.image.clone());
        }
        let snapshots = self.snapshot_set().await?;
        if snapshots.is_empty() {
            return Ok(config.image.clone());
        }
        let mut options = vec![config.image.to_string()];
        options.extend(snapshots);
        let choice = self
            .prompt
            .select("Start from which image?", &options, 0)?;
        options[choice].parse()
    }

    /// This user's snapshot images, newest first. Recomputed on every use.
    async fn snapshot_set(&self) -> Result<Vec<String>> {
        let mut set: Vec<String> = self
            .runtime
            .list_images()
            .await?
            .into_iter()
            .filter(|repo_tag| self.tags.matches(repo_tag))
            .collect();
        set.sort_by_key(|repo_tag| std::cmp::Reverse(self.tags.timestamp(repo_tag).unwrap_or(0)));
        Ok(set)
    }

    /// Run the in-container provisioning executable. A non-zero exit is
    /// fatal and re-raised to the caller.
    #[instrument(skip(self))]
    pub async fn provision(&self) -> Result<()> {
        if self.runtime.get_container(CONTAINER_NAME).await?.is_none() {
            return Err(KdkError::NotFound(format!(
                "container {CONTAINER_NAME} is not running"
            )));
        }
        let cmd = vec![PROVISION_COMMAND.to_string()];
        let exit = self.runtime.exec(CONTAINER_NAME, &cmd).await?;
        if exit != 0 {
            return Err(KdkError::Provision(format!(
                "{PROVISION_COMMAND} exited with status {exit}"
            )));
        }
        info!("container provisioned");
        Ok(())
    }

    /// Open an interactive ssh session. Session failures are logged and
    /// swallowed; this command never fails the process.
    pub async fn ssh(&self, config: &KdkConfig, key_dir: &Path) -> Result<()> {
        let identity = match ssh::ensure_keypair(key_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "no ssh identity available, relying on agent or password");
                None
            }
        };
        if let Err(e) = ssh::attach(&config.ssh, identity.as_deref()).await {
            warn!(error = %e, "ssh session failed");
        }
        Ok(())
    }

    /// Commit the container filesystem to a freshly derived snapshot image
    /// and return its reference.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> Result<ImageRef> {
        if self.runtime.get_container(CONTAINER_NAME).await?.is_none() {
            return Err(KdkError::NotFound(format!(
                "container {CONTAINER_NAME} not found, nothing to snapshot"
            )));
        }
        // Derived exactly once per commit. Tags have second granularity and
        // a same-second commit silently re-points the tag at the runtime.
        let image = self.tags.derive(Utc::now());
        self.runtime.commit_container(CONTAINER_NAME, &image).await?;
        info!(%image, "snapshot committed");
        Ok(image)
    }

    /// Remove snapshot images not backing the running container. With
    /// nothing stale this reports a no-op and removes nothing.
    #[instrument(skip(self))]
    pub async fn prune(&self, interactive: bool) -> Result<()> {
        let running = self.runtime.get_container(CONTAINER_NAME).await?;
        let running_image = running.as_ref().map(|c| c.image.as_str());
        let stale: Vec<String> = self
            .runtime
            .list_images()
            .await?
            .into_iter()
            .filter(|repo_tag| self.tags.is_stale(repo_tag, running_image))
            .collect();

        if stale.is_empty() {
            info!("no stale snapshots to prune");
            return Ok(());
        }
        if interactive {
            let question = format!(
                "Remove {} stale snapshot(s)?\n  {}",
                stale.len(),
                stale.join("\n  ")
            );
            if !self.prompt.confirm(&question)? {
                return Err(KdkError::Declined("prune aborted".to_string()));
            }
        }
        for repo_tag in &stale {
            self.runtime.remove_image(repo_tag, true).await?;
            info!(%repo_tag, "removed stale snapshot");
        }
        Ok(())
    }

    /// Force-remove the container.
    #[instrument(skip(self))]
    pub async fn destroy(&self, interactive: bool) -> Result<()> {
        let Some(descriptor) = self.runtime.get_container(CONTAINER_NAME).await? else {
            return Err(KdkError::NotFound(format!(
                "container {CONTAINER_NAME} not found"
            )));
        };
        if interactive {
            let question = format!(
                "Destroy container {CONTAINER_NAME} (image {})?",
                descriptor.image
            );
            if !self.prompt.confirm(&question)? {
                return Err(KdkError::Declined("destroy aborted".to_string()));
            }
        }
        // The container may already be stopped; removal below is forced
        if let Err(e) = self.runtime.kill_container(CONTAINER_NAME).await {
            debug!(error = %e, "kill before remove failed");
        }
        self.runtime.remove_container(CONTAINER_NAME, true).await?;
        info!("container destroyed");
        Ok(())
    }

    /// Replace the container with a fresh instance of its own snapshot:
    /// snapshot, destroy, up on the new snapshot, prune.
    ///
    /// A failed snapshot aborts before anything is destroyed. After a
    /// successful snapshot there is no rollback; a failure partway leaves
    /// whatever the completed steps produced.
    #[instrument(skip(self, config))]
    pub async fn restart(&self, config: &KdkConfig) -> Result<()> {
        let image = self.snapshot().await?;
        self.destroy(false).await?;
        self.up(config, false, Some(image)).await?;
        self.prune(false).await?;
        Ok(())
    }
}
