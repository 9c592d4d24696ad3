//! Docker API wrapper using the bollard crate.
//!
//! Covers the container lifecycle a trial needs: image presence, create
//! with bind mounts, start, exec with combined output, stop and remove.

use std::path::PathBuf;

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;

use crate::error::SandboxError;
use crate::sandbox::ExecResult;

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command keeping the container alive.
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Requested platform, e.g. `linux/x86_64`.
    pub platform: Option<String>,
    /// Bind mounts as (host path, container path).
    pub mounts: Vec<(PathBuf, String)>,
}

impl ContainerConfig {
    /// Creates a configuration that idles with `tail -f /dev/null`.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            working_dir: None,
            user: None,
            platform: None,
            mounts: Vec::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<(PathBuf, String)>) -> Self {
        self.mounts = mounts;
        self
    }

    fn bind_mounts(&self) -> Vec<Mount> {
        self.mounts
            .iter()
            .map(|(source, target)| Mount {
                source: Some(source.display().to_string()),
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            })
            .collect()
    }
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates a container and returns its id.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, SandboxError> {
        let host_config = HostConfig {
            mounts: if config.mounts.is_empty() {
                None
            } else {
                Some(config.bind_mounts())
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.cmd.clone()),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            host_config: Some(host_config),
            tty: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: config.platform.clone(),
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::Provision(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by id.
    pub async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Provision(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Stops a container, waiting up to 10 seconds before SIGKILL.
    ///
    /// A container that is gone or already stopped counts as stopped.
    pub async fn stop_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = StopContainerOptions { t: 10 };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[304, 404]) => {
                tracing::debug!(container = id, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::Exec(format!("Failed to stop container: {e}"))),
        }
    }

    /// Force-removes a container and its anonymous volumes.
    ///
    /// A missing container counts as removed.
    pub async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => {
                tracing::debug!(container = id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(SandboxError::Exec(format!("Failed to remove container: {e}"))),
        }
    }

    /// Runs `bash -c <command>` inside a running container.
    ///
    /// Stdout and stderr are merged in the order they arrive.
    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        env: &[(String, String)],
        working_dir: Option<&str>,
    ) -> Result<ExecResult, SandboxError> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            env: if env.is_empty() {
                None
            } else {
                Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect())
            },
            working_dir: working_dir.map(str::to_string),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| SandboxError::Exec(format!("Failed to create exec: {e}")))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Exec(format!("Failed to start exec: {e}")))?;

        let mut output = Vec::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = start_result
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        output.extend_from_slice(&message);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(SandboxError::Exec(format!("Error reading output: {e}")));
                    }
                }
            }
        }

        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Exec(format!("Failed to inspect exec: {e}")))?;

        Ok(ExecResult {
            output: decode_output(&output),
            exit_code: exec_info.exit_code.unwrap_or(-1),
        })
    }

    /// Pulls an image from its registry.
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                SandboxError::Provision(format!("Failed to pull image {image}: {e}"))
            })?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }
}

fn is_status(error: &BollardError, codes: &[u16]) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

/// Decodes collected frames once, so characters split across frames survive.
fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
