//! The runtime facade: the one seam between the orchestrator and Docker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{
    CommitContainerOptions, CreateImageOptions, ListImagesOptions, RemoveImageOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use kdk_common::{ContainerDescriptor, ImageRef, KdkError, Result as CommonResult};
use thiserror::Error;
use tracing::{debug, info, instrument};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Image pull failed: {0}")]
    PullFailed(#[source] BollardError),
    #[error("Container inspect failed: {0}")]
    InspectFailed(#[source] BollardError),
    #[error("Image listing failed: {0}")]
    ListFailed(#[source] BollardError),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container commit failed: {0}")]
    CommitFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Container kill failed: {0}")]
    KillFailed(#[source] BollardError),
    #[error("Image removal failed: {0}")]
    ImageRemovalFailed(#[source] BollardError),
    #[error("Exec failed: {0}")]
    ExecFailed(#[source] BollardError),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError), // Catch-all for other bollard errors
}

// Implement conversion from RuntimeError to the common KdkError
impl From<RuntimeError> for KdkError {
    fn from(err: RuntimeError) -> Self {
        KdkError::Runtime(err.to_string())
    }
}

/// Port published from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
}

/// Flat, validated description of a container launch.
///
/// Produced from the configuration record; the facade consumes it without
/// further checks.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub image: String,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
}

/// The container runtime as seen by the orchestrator.
///
/// Injected as a trait object so tests can substitute an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `Ok(None)` signals the container does not exist; only real runtime
    /// failures surface as errors.
    async fn get_container(&self, name: &str) -> CommonResult<Option<ContainerDescriptor>>;

    /// All local images as `repo:tag` strings.
    async fn list_images(&self) -> CommonResult<Vec<String>>;

    async fn pull_image(&self, image: &ImageRef) -> CommonResult<()>;

    /// Create a named container from the spec and start it.
    async fn run_container(&self, name: &str, spec: &LaunchSpec)
        -> CommonResult<ContainerDescriptor>;

    /// Commit the container's filesystem to the given image reference.
    async fn commit_container(&self, name: &str, image: &ImageRef) -> CommonResult<()>;

    async fn remove_container(&self, name: &str, force: bool) -> CommonResult<()>;

    async fn kill_container(&self, name: &str) -> CommonResult<()>;

    async fn remove_image(&self, repo_tag: &str, force: bool) -> CommonResult<()>;

    /// Run a command over the exec channel, streaming output into the log,
    /// and return its exit code.
    async fn exec(&self, name: &str, cmd: &[String]) -> CommonResult<i64>;
}

// --- DockerRuntime Implementation ---

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn get_container(&self, name: &str) -> CommonResult<Option<ContainerDescriptor>> {
        let inspect = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            // 404 is a normal state, not a failure
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(RuntimeError::InspectFailed(e).into()),
        };

        let running = inspect
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        let image = inspect
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .unwrap_or_default();
        Ok(Some(ContainerDescriptor {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            image,
            running,
        }))
    }

    async fn list_images(&self) -> CommonResult<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(RuntimeError::ListFailed)?;
        Ok(images
            .into_iter()
            .flat_map(|summary| summary.repo_tags)
            .collect())
    }

    #[instrument(skip(self, image), fields(image = %image))]
    async fn pull_image(&self, image: &ImageRef) -> CommonResult<()> {
        let options = CreateImageOptions {
            from_image: image.repository.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let update = progress.map_err(RuntimeError::PullFailed)?;
            if let Some(status) = update.status {
                debug!(%status, "pull progress");
            }
        }
        info!("image pulled");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn run_container(
        &self,
        name: &str,
        spec: &LaunchSpec,
    ) -> CommonResult<ContainerDescriptor> {
        let mut bindings: HashMap<String, Vec<PortBinding>> = HashMap::new();
        for mapping in &spec.ports {
            bindings
                .entry(format!("{}/tcp", mapping.container_port))
                .or_default()
                .push(PortBinding {
                    host_ip: mapping.host_ip.clone(),
                    host_port: Some(mapping.host_port.to_string()),
                });
        }
        let exposed_ports: HashMap<String, HashMap<(), ()>> = bindings
            .keys()
            .cloned()
            .map(|port| (port, HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = bindings
            .into_iter()
            .map(|(port, list)| (port, Some(list)))
            .collect();

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
            security_opt: (!spec.security_opt.is_empty()).then(|| spec.security_opt.clone()),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let create_options = Some(CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        });
        // The image's own CMD is left untouched
        let body = self
            .docker
            .create_container(
                create_options,
                ContainerConfig {
                    image: Some(spec.image.clone()),
                    env: (!spec.env.is_empty()).then(|| spec.env.clone()),
                    exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .map_err(RuntimeError::CreationFailed)?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(RuntimeError::StartFailed)?;

        info!(%name, "container started");
        Ok(ContainerDescriptor {
            id: body.id,
            name: name.to_string(),
            image: spec.image.clone(),
            running: true,
        })
    }

    #[instrument(skip(self, image), fields(image = %image))]
    async fn commit_container(&self, name: &str, image: &ImageRef) -> CommonResult<()> {
        let options = CommitContainerOptions {
            container: name.to_string(),
            repo: image.repository.clone(),
            tag: image.tag.clone(),
            pause: true, // Pause container during commit for consistency
            ..Default::default()
        };
        self.docker
            .commit_container(options, ContainerConfig::<String>::default())
            .await
            .map_err(RuntimeError::CommitFailed)?;
        info!(%name, "container committed");
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> CommonResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(RuntimeError::RemovalFailed)?;
        info!(%name, "container removed");
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> CommonResult<()> {
        self.docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(RuntimeError::KillFailed)?;
        Ok(())
    }

    async fn remove_image(&self, repo_tag: &str, force: bool) -> CommonResult<()> {
        self.docker
            .remove_image(
                repo_tag,
                Some(RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map_err(RuntimeError::ImageRemovalFailed)?;
        Ok(())
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> CommonResult<i64> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(RuntimeError::ExecFailed)?;

        let start = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(RuntimeError::ExecFailed)?;

        if let StartExecResults::Attached { mut output, .. } = start {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(RuntimeError::ExecFailed)? {
                    LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                        info!(%name, "{}", String::from_utf8_lossy(&message).trim_end());
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(RuntimeError::ExecFailed)?;
        Ok(inspect.exit_code.unwrap_or(0))
    }
}
