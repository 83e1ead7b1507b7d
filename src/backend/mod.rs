//! Backends: how tool servers are started, reached and stopped.
//!
//! A backend is either a local subprocess or a container. Both expose the
//! same three capabilities: start from a spec, hand out the JSON-RPC
//! transport, and stop. Adding another kind means adding a variant here;
//! the tool registry and conversation driver never see the difference.

pub mod container;
pub mod demux;
pub mod errors;
pub mod local;
pub mod runtime;

use std::sync::Arc;

use crate::mcp_client::Transport;

// Re-exports for convenience
pub use container::{ContainerSpec, EnvEntry, MountConfig, RunningContainer};
pub use errors::BackendError;
pub use local::{LocalProgramSpec, RunningLocal};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};

/// How to start one backend.
#[derive(Clone)]
pub enum BackendSpec {
    Local(LocalProgramSpec),
    Container {
        spec: ContainerSpec,
        runtime: Arc<dyn ContainerRuntime>,
    },
}

impl BackendSpec {
    pub fn name(&self) -> &str {
        match self {
            BackendSpec::Local(spec) => &spec.name,
            BackendSpec::Container { spec, .. } => &spec.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendSpec::Local(_) => "local",
            BackendSpec::Container { .. } => "container",
        }
    }

    /// Start the backend. On error nothing is left running.
    pub async fn start(&self) -> Result<RunningBackend, BackendError> {
        match self {
            BackendSpec::Local(spec) => spec.start().await.map(RunningBackend::Local),
            BackendSpec::Container { spec, runtime } => spec
                .start(Arc::clone(runtime))
                .await
                .map(RunningBackend::Container),
        }
    }
}

impl std::fmt::Debug for BackendSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendSpec::Local(spec) => f.debug_tuple("Local").field(spec).finish(),
            BackendSpec::Container { spec, .. } => {
                f.debug_struct("Container").field("spec", spec).finish_non_exhaustive()
            }
        }
    }
}

/// The live handle for a started backend.
pub enum RunningBackend {
    Local(RunningLocal),
    Container(RunningContainer),
}

impl RunningBackend {
    pub fn transport(&self) -> Arc<Transport> {
        match self {
            RunningBackend::Local(r) => r.transport(),
            RunningBackend::Container(r) => r.transport(),
        }
    }

    /// Release everything. Safe to call twice.
    pub async fn stop(&mut self) -> Result<(), BackendError> {
        match self {
            RunningBackend::Local(r) => r.stop().await,
            RunningBackend::Container(r) => r.stop().await,
        }
    }
}
