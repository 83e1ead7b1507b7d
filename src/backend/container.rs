//! Container backends.
//!
//! Launch is strictly sequential with no retries: resolve the image, compute
//! the run configuration, create, attach, start, then bridge the attach
//! streams. A failure at any step releases everything acquired so far.
//! Shutdown stops with a grace period, removes, and releases the runtime
//! handle, attempting every step even when an earlier one fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;

use super::demux::spawn_demux;
use super::errors::BackendError;
use super::runtime::{ContainerRunConfig, ContainerRuntime, RuntimeError};
use crate::errors::ErrorList;
use crate::mcp_client::Transport;

/// Grace period given to the container before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Deadline for each shutdown call, independent of any caller deadline.
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// How long shutdown waits for the output task after the container is gone.
const DEMUX_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Spec ────────────────────────────────────────────────────────────────────

/// One environment entry: a literal value or the orchestrator's own value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvEntry {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub pass_through: bool,
}

impl EnvEntry {
    pub fn literal(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.to_string()),
            pass_through: false,
        }
    }

    pub fn pass_through(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            pass_through: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("env entry has an empty key".into());
        }
        if self.pass_through && self.value.is_some() {
            return Err(format!(
                "env '{}': only value or pass_through can be set, not both",
                self.key
            ));
        }
        Ok(())
    }

    /// `KEY=value`. A pass-through of an unset variable yields an empty value.
    pub fn resolve(&self) -> Result<String, String> {
        self.validate()?;
        let value = if self.pass_through {
            std::env::var(&self.key).unwrap_or_default()
        } else {
            self.value.clone().unwrap_or_default()
        };
        Ok(format!("{}={value}", self.key))
    }
}

/// A bind mount. Relative sources resolve against the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MountConfig {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub options: Option<String>,
}

impl MountConfig {
    /// `source:target[:options]` with an absolute source.
    pub fn bind(&self, working_directory: &Path) -> std::io::Result<String> {
        let source = Path::new(&self.source);
        let joined = if source.is_absolute() {
            source.to_path_buf()
        } else {
            working_directory.join(source)
        };
        let absolute = std::path::absolute(joined)?;

        let mut bind = format!("{}:{}", absolute.display(), self.target);
        if let Some(options) = self.options.as_deref().filter(|o| !o.is_empty()) {
            bind.push(':');
            bind.push_str(options);
        }
        Ok(bind)
    }
}

/// How to start a containerised backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Argument blocks, flattened in order.
    pub args: Vec<Vec<String>>,
    pub env: Vec<EnvEntry>,
    pub mounts: Vec<MountConfig>,
    pub working_directory: PathBuf,
    pub verbose: bool,
}

impl ContainerSpec {
    /// Resolve env values, mount paths and the command vector.
    pub fn run_config(&self) -> Result<ContainerRunConfig, BackendError> {
        let misconfigured = |reason: String| BackendError::ConfigError {
            name: self.name.clone(),
            reason,
        };

        let env = self
            .env
            .iter()
            .map(EnvEntry::resolve)
            .collect::<Result<Vec<_>, _>>()
            .map_err(misconfigured)?;

        let binds = self
            .mounts
            .iter()
            .map(|m| {
                m.bind(&self.working_directory)
                    .map_err(|e| format!("mount '{}': {e}", m.source))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(misconfigured)?;

        Ok(ContainerRunConfig {
            image: self.image.clone(),
            cmd: self.args.iter().flatten().cloned().collect(),
            env,
            binds,
        })
    }

    /// Launch the container and bridge its streams.
    pub async fn start(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<RunningContainer, BackendError> {
        // 1. Resolve image
        match runtime.inspect_image(&self.image).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound { .. }) => {
                tracing::info!(backend = %self.name, image = %self.image, "image not present, pulling");
                runtime
                    .pull_image(&self.image)
                    .await
                    .map_err(|e| BackendError::runtime(&self.name, "pull image", e))?;
            }
            Err(e) => return Err(BackendError::runtime(&self.name, "inspect image", e)),
        }

        // 2. Compute runtime config
        let config = self.run_config()?;
        if self.verbose {
            self.log_run_config(&config);
        }

        // 3. Create
        let id = runtime
            .create_container(&config)
            .await
            .map_err(|e| BackendError::runtime(&self.name, "create container", e))?;

        // 4. Attach before start so no output is lost
        let attachment = match runtime.attach_container(&id).await {
            Ok(a) => a,
            Err(e) => {
                discard_container(runtime.as_ref(), &self.name, &id).await;
                return Err(BackendError::runtime(&self.name, "attach container", e));
            }
        };

        // 5. Start
        if let Err(e) = runtime.start_container(&id).await {
            drop(attachment);
            discard_container(runtime.as_ref(), &self.name, &id).await;
            return Err(BackendError::runtime(&self.name, "start container", e));
        }

        // 6. Bridge
        let demuxed = spawn_demux(&id, attachment.output);
        let transport = Transport::new(&self.name, Box::pin(demuxed.stdout), attachment.input)
            .with_stderr(Box::pin(demuxed.stderr), self.verbose);

        tracing::info!(backend = %self.name, image = %self.image, container_id = %id, "container started");

        Ok(RunningContainer {
            name: self.name.clone(),
            id: Some(id),
            runtime: Some(runtime),
            transport: Arc::new(transport),
            demux: Some(demuxed.task),
        })
    }

    fn log_run_config(&self, config: &ContainerRunConfig) {
        for entry in &self.env {
            tracing::info!(
                backend = %self.name,
                key = %entry.key,
                pass_through = entry.pass_through,
                "container env"
            );
        }
        let mut line = String::from("docker run --rm -i");
        for env in &config.env {
            let key = env.split_once('=').map(|(k, _)| k).unwrap_or(env);
            line.push_str(&format!(" -e {key}"));
        }
        for bind in &config.binds {
            line.push_str(&format!(" -v {bind}"));
        }
        line.push(' ');
        line.push_str(&config.image);
        for arg in &config.cmd {
            line.push(' ');
            line.push_str(arg);
        }
        tracing::info!(backend = %self.name, "equivalent command: {line}");
    }
}

/// Best-effort removal of a container whose launch failed.
async fn discard_container(runtime: &dyn ContainerRuntime, name: &str, id: &str) {
    if let Err(e) = runtime.remove_container(id).await {
        tracing::warn!(backend = %name, container_id = %id, error = %e, "failed to clean up container after launch failure");
    }
}

// ─── Running ─────────────────────────────────────────────────────────────────

/// A running container and everything needed to stop it.
pub struct RunningContainer {
    name: String,
    /// `None` after `stop`.
    id: Option<String>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    transport: Arc<Transport>,
    demux: Option<JoinHandle<()>>,
}

impl RunningContainer {
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    pub fn container_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Stop, remove, wait for the output task, release the runtime. Every
    /// step runs; failures are reported together. A second call is a no-op.
    pub async fn stop(&mut self) -> Result<(), BackendError> {
        let (Some(id), Some(runtime)) = (self.id.take(), self.runtime.take()) else {
            return Ok(());
        };
        let mut errors = ErrorList::new();

        if let Err(e) = self.transport.close().await {
            errors.push(BackendError::StreamError {
                name: self.name.clone(),
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, runtime.stop_container(&id, STOP_GRACE))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(BackendError::runtime(&self.name, "stop container", e)),
            Err(_) => errors.push(self.timeout("stop container")),
        }

        match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, runtime.remove_container(&id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_gone() => {
                tracing::debug!(backend = %self.name, container_id = %id, "container already removed");
            }
            Ok(Err(e)) => errors.push(BackendError::runtime(&self.name, "remove container", e)),
            Err(_) => errors.push(self.timeout("remove container")),
        }

        if let Some(mut task) = self.demux.take() {
            if tokio::time::timeout(DEMUX_DRAIN_TIMEOUT, &mut task).await.is_err() {
                tracing::debug!(backend = %self.name, "output stream still open after stop, aborting");
                task.abort();
            }
        }

        drop(runtime);
        tracing::info!(backend = %self.name, container_id = %id, "container stopped");

        errors.into_result().map_err(|errors| BackendError::Shutdown {
            name: self.name.clone(),
            errors,
        })
    }

    fn timeout(&self, step: &'static str) -> BackendError {
        BackendError::Timeout {
            name: self.name.clone(),
            step,
            timeout_secs: SHUTDOWN_STEP_TIMEOUT.as_secs(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
