// ABOUTME: Docker-backed ContainerRuntime using Bollard: session containers, image pulls and exec

use super::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, WORKSPACE_MOUNT};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Docker connection error: {0}")]
    Connection(#[from] bollard::errors::Error),
    #[error("Container not found: {0}")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },
    #[error("Container operation failed: {0}")]
    OperationFailed(String),
}

impl ContainerError {
    /// Daemon hiccups are worth retrying; bad input and missing containers are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ContainerError::Connection(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code >= 500,
            ContainerError::Connection(_) => true,
            ContainerError::OperationFailed(_) => true,
            ContainerError::ImagePull { .. } => true,
            ContainerError::NotFound(_) | ContainerError::InvalidConfig(_) => false,
        }
    }
}

pub struct ContainerManager {
    docker: Docker,
}

impl ContainerManager {
    /// Connect through the first socket in `sockets` that exists, falling
    /// back to Bollard's local defaults (which honour `DOCKER_HOST`).
    pub async fn new(sockets: &[PathBuf]) -> Result<Self, ContainerError> {
        let docker = Self::connect_to_docker(sockets).map_err(ContainerError::Connection)?;

        docker.ping().await.map_err(ContainerError::Connection)?;

        info!("Successfully connected to Docker daemon");
        Ok(Self { docker })
    }

    fn connect_to_docker(sockets: &[PathBuf]) -> Result<Docker, bollard::errors::Error> {
        for socket_path in sockets {
            if !socket_path.exists() {
                continue;
            }
            info!("Found Docker socket at: {}", socket_path.display());
            let socket = socket_path.to_string_lossy();
            match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => return Ok(docker),
                Err(e) => warn!("Failed to connect to Docker socket {}: {}", socket, e),
            }
        }

        warn!("No Docker socket found, trying default connection");
        Docker::connect_with_local_defaults()
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let mounts = vec![Mount {
            target: Some(WORKSPACE_MOUNT.to_string()),
            source: Some(spec.workspace.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];

        HostConfig {
            mounts: Some(mounts),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for ContainerManager {
    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters: {
                    let mut filters = HashMap::new();
                    filters.insert("reference".to_string(), vec![image.to_string()]);
                    filters
                },
                ..Default::default()
            }))
            .await?;

        Ok(!images.is_empty())
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        info!("Pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                error!("Failed to pull image {}: {}", image, e);
                return Err(ContainerError::ImagePull {
                    image: image.to_string(),
                    message: e.to_string(),
                });
            }
        }

        info!("Successfully pulled image {}", image);
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        if spec.image.trim().is_empty() {
            return Err(ContainerError::InvalidConfig("image must not be empty".to_string()));
        }
        if !spec.workspace.is_absolute() {
            return Err(ContainerError::InvalidConfig(format!(
                "workspace must be an absolute path: {}",
                spec.workspace.display()
            )));
        }

        let container_name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("agents-runner-{}", Uuid::new_v4()));

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            env: Some(spec.env.clone()),
            // Kept alive so the agent loop can exec into it.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            user: spec.user.clone(),
            tty: Some(false),
            host_config: Some(Self::host_config(spec)),
            labels: Some({
                let mut labels = HashMap::new();
                labels.insert("agents-runner-managed".to_string(), "true".to_string());
                labels
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        info!("Created container {} with ID {}", container_name, response.id);

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;
        info!("Started container {}", response.id);

        Ok(response.id)
    }

    async fn exec(&self, container_id: &str, command: &str) -> Result<ExecOutput, ContainerError> {
        debug!("Exec in {}: {}", container_id, command);

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(WORKSPACE_MOUNT.to_string()),
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    ContainerError::NotFound(container_id.to_string())
                }
                other => ContainerError::Connection(other),
            })?;

        let mut output = String::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ContainerError::OperationFailed(
                    "exec started detached".to_string(),
                ));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            output,
            exit_code: inspect.exit_code,
        })
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), ContainerError> {
        info!("Stopping container {}", container_id);

        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!("Container {} was already stopped", container_id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(ContainerError::NotFound(container_id.to_string()))
            }
            Err(e) => Err(ContainerError::Connection(e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), ContainerError> {
        info!("Removing container {}", container_id);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!("Container {} was already removed", container_id);
                Ok(())
            }
            Err(e) => Err(ContainerError::Connection(e)),
        }
    }
}
