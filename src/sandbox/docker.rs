//! Docker-backed sandboxes.
//!
//! One container per trial run, created from the instance's pre-built
//! evaluation image and kept alive with `tail -f /dev/null` while the
//! trial drives it through `exec`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SandboxSettings;
use crate::error::SandboxError;
use crate::instance::Instance;
use crate::sandbox::docker_client::{ContainerConfig, DockerClient};
use crate::sandbox::{ExecResult, Sandbox, SandboxLayout, SandboxProvider};

/// Creates Docker containers for trials.
pub struct DockerSandboxProvider {
    client: Arc<DockerClient>,
    settings: SandboxSettings,
}

impl DockerSandboxProvider {
    /// Connects to the local daemon.
    pub fn new(settings: SandboxSettings) -> Result<Self, SandboxError> {
        Ok(Self::with_client(Arc::new(DockerClient::new()?), settings))
    }

    pub fn with_client(client: Arc<DockerClient>, settings: SandboxSettings) -> Self {
        Self { client, settings }
    }

    /// Makes sure `image` is available locally, pulling it when allowed.
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.client.image_exists(image).await {
            return Ok(());
        }
        if !self.settings.pull_missing_images {
            return Err(SandboxError::Provision(format!(
                "image {image} is not present locally and pulling is disabled"
            )));
        }
        tracing::info!(image = image, "Pulling image");
        self.client.pull_image(image).await
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn create_and_start(
        &self,
        instance: &Instance,
        run_id: &str,
        run_dir: &Path,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        self.ensure_image(&instance.instance_image_key).await?;

        let layout = SandboxLayout::for_run(instance, run_dir);
        layout.create_dirs()?;

        let container_name = instance.container_name(run_id);

        // A container left over from an interrupted run would block the name.
        if let Err(e) = self.client.remove_container(&container_name).await {
            tracing::debug!(container = %container_name, error = %e, "Failed to remove stale container");
        }

        let config = ContainerConfig::new(&container_name, &instance.instance_image_key)
            .with_working_dir(&self.settings.workdir)
            .with_user(&self.settings.user)
            .with_platform(&self.settings.platform)
            .with_mounts(layout.mounts());

        let container_id = self.client.create_container(&config).await?;

        if let Err(e) = self.client.start_container(&container_id).await {
            if let Err(cleanup) = self.client.remove_container(&container_id).await {
                tracing::warn!(container = %container_name, error = %cleanup, "Failed to remove container after start failure");
            }
            return Err(e);
        }

        tracing::info!(
            container = %container_name,
            image = %instance.instance_image_key,
            instance_id = %instance.instance_id,
            "Docker sandbox ready"
        );

        Ok(Box::new(DockerSandbox {
            client: Arc::clone(&self.client),
            container_id,
            container_name,
            layout,
            workdir: self.settings.workdir.clone(),
            torn_down: AtomicBool::new(false),
        }))
    }
}

/// A running trial container.
pub struct DockerSandbox {
    client: Arc<DockerClient>,
    container_id: String,
    container_name: String,
    layout: SandboxLayout,
    workdir: String,
    torn_down: AtomicBool,
}

impl DockerSandbox {
    /// Host directories mounted into this container.
    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        &self.container_name
    }

    async fn exec(
        &self,
        command: &str,
        env: &[(String, String)],
    ) -> Result<ExecResult, SandboxError> {
        tracing::debug!(container = %self.container_name, command = command, "exec");
        self.client
            .exec(&self.container_id, command, env, Some(&self.workdir))
            .await
    }

    async fn write_bytes(&self, content: &[u8], path: &str) -> Result<(), SandboxError> {
        let copy = self.layout.stage(content, path)?;
        let result = self.exec(&copy, &[]).await?;
        if !result.success() {
            return Err(SandboxError::Staging {
                path: path.to_string(),
                reason: result.output,
            });
        }
        Ok(())
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.stop_container(&self.container_id).await {
            tracing::debug!(container = %self.container_name, error = %e, "Stop failed, forcing removal");
        }
        match self.client.remove_container(&self.container_id).await {
            Ok(()) => tracing::debug!(container = %self.container_name, "Sandbox removed"),
            Err(e) => {
                tracing::warn!(container = %self.container_name, error = %e, "Failed to remove sandbox")
            }
        }
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let name = self.container_name.clone();
        // No async in Drop: shell out on a detached thread.
        std::thread::spawn(move || {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", &name])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        });
    }
}
