//! Container runtime boundary.
//!
//! [`ContainerRuntime`] is the narrow set of engine calls the lifecycle
//! manager needs. [`DockerRuntime`] implements it against the local Docker
//! Engine API; tests substitute a recording fake.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWrite;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The image or container does not exist.
    #[error("not found: {reason}")]
    NotFound { reason: String },

    /// The request conflicts with the object's state (e.g. removal already
    /// in progress).
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("docker API error: {reason}")]
    Api { reason: String },
}

impl RuntimeError {
    /// "Already gone" answers that are expected after a successful stop of
    /// an auto-removing container.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotFound { .. } | RuntimeError::Conflict { .. }
        )
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound { reason: message },
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict { reason: message },
            other => RuntimeError::Api {
                reason: other.to_string(),
            },
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRunConfig {
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    /// `source:target[:options]` bind specs with absolute sources.
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// One demultiplexed chunk of container output.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub stream: StdStream,
    pub payload: Vec<u8>,
}

/// A live stream attachment: framed output plus the container's stdin.
pub struct ContainerAttachment {
    pub output: BoxStream<'static, Result<OutputFrame, RuntimeError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

// ─── ContainerRuntime ────────────────────────────────────────────────────────

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `Err(NotFound)` when the image is not present locally.
    async fn inspect_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Pull the image, discarding progress output.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create (not start) a container; returns its id.
    async fn create_container(&self, config: &ContainerRunConfig) -> Result<String, RuntimeError>;

    /// Attach stdin, stdout and stderr.
    async fn attach_container(&self, id: &str) -> Result<ContainerAttachment, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop, killing after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-remove.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Split an image reference into repository and tag for a pull.
///
/// An empty tag makes the engine pull every tag of the repository, so a
/// missing one becomes `latest`. Digest references pass through whole.
fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (&image[..at], &image[at + 1..])
        }
        None => (image, "latest"),
    }
}

// ─── DockerRuntime ───────────────────────────────────────────────────────────

/// Docker Engine API over the platform's default socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Honours `DOCKER_HOST`, otherwise the local socket or named pipe.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker.inspect_image(image).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step?;
        }
        tracing::info!(image, "pulled image");
        Ok(())
    }

    async fn create_container(&self, config: &ContainerRunConfig) -> Result<String, RuntimeError> {
        let body = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.cmd.clone()),
            env: Some(config.env.clone()),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(config.binds.clone()),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, body)
            .await?;
        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, "{warning}");
        }
        Ok(created.id)
    }

    async fn attach_container(&self, id: &str) -> Result<ContainerAttachment, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let attached = self.docker.attach_container(id, Some(options)).await?;

        let output = attached
            .output
            .filter_map(|frame| async move {
                match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(OutputFrame {
                            stream: StdStream::Stdout,
                            payload: message.to_vec(),
                        }))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputFrame {
                        stream: StdStream::Stderr,
                        payload: message.to_vec(),
                    })),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(RuntimeError::from(e))),
                }
            })
            .boxed();

        Ok(ContainerAttachment {
            output,
            input: attached.input,
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(RuntimeError::from),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_status_codes_map_to_kinds() {
        let not_found: RuntimeError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: c0ffee".into(),
        }
        .into();
        let conflict: RuntimeError = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "removal of container c0ffee is already in progress".into(),
        }
        .into();
        let other: RuntimeError = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        }
        .into();

        assert!(matches!(not_found, RuntimeError::NotFound { .. }));
        assert!(matches!(conflict, RuntimeError::Conflict { .. }));
        assert!(not_found.is_gone() && conflict.is_gone());
        assert!(!other.is_gone());
    }

    #[test]
    fn test_image_reference_defaults_to_latest_tag() {
        assert_eq!(split_image_reference("alpine"), ("alpine", "latest"));
        assert_eq!(split_image_reference("alpine:3.20"), ("alpine", "3.20"));
        assert_eq!(
            split_image_reference("localhost:5000/team/app:1.2"),
            ("localhost:5000/team/app", "1.2")
        );
        assert_eq!(
            split_image_reference("localhost:5000/team/app"),
            ("localhost:5000/team/app", "latest")
        );
        let pinned = "mcp/fetch@sha256:0123456789abcdef";
        assert_eq!(split_image_reference(pinned), (pinned, ""));
    }
}
