//! Local subprocess backends.
//!
//! The program is spawned with piped stdio; stdin/stdout carry JSON-RPC and
//! stderr is forwarded to the log.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use super::errors::BackendError;
use crate::errors::ErrorList;
use crate::mcp_client::Transport;

/// Time the process gets to exit on its own after stdin closes.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start a local program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProgramSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl LocalProgramSpec {
    /// Spawn the program and bind a transport to its stdio.
    pub async fn start(&self) -> Result<RunningLocal, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| BackendError::SpawnFailed {
            name: self.name.clone(),
            reason: format!("{}: {e}", self.program),
        })?;

        // `child` is killed on drop if any pipe is missing.
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BackendError::SpawnFailed {
                name: self.name.clone(),
                reason: "failed to capture stdio".into(),
            });
        };

        tracing::info!(
            backend = %self.name,
            program = %self.program,
            args = ?self.args,
            pid = child.id().unwrap_or_default(),
            "started local program"
        );

        let transport = Transport::new(&self.name, Box::pin(stdout), Box::pin(stdin))
            .with_stderr(Box::pin(stderr), false);

        Ok(RunningLocal {
            name: self.name.clone(),
            child: Some(child),
            transport: Arc::new(transport),
        })
    }
}

/// A running local program.
pub struct RunningLocal {
    name: String,
    /// `None` after `stop`.
    child: Option<Child>,
    transport: Arc<Transport>,
}

impl RunningLocal {
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    /// Close stdin, give the process time to exit, then kill it. An exit
    /// status other than success is logged, not reported.
    pub async fn stop(&mut self) -> Result<(), BackendError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let mut errors = ErrorList::new();

        if let Err(e) = self.transport.close().await {
            errors.push(BackendError::StreamError {
                name: self.name.clone(),
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(backend = %self.name, %status, "local program exited");
            }
            Ok(Err(e)) => errors.push(BackendError::StreamError {
                name: self.name.clone(),
                reason: format!("failed to wait for exit: {e}"),
            }),
            Err(_) => {
                tracing::warn!(backend = %self.name, "local program ignored end of input, killing");
                if let Err(e) = child.kill().await {
                    errors.push(BackendError::StreamError {
                        name: self.name.clone(),
                        reason: format!("failed to kill: {e}"),
                    });
                }
            }
        }

        errors.into_result().map_err(|errors| BackendError::Shutdown {
            name: self.name.clone(),
            errors,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cat() -> LocalProgramSpec {
        LocalProgramSpec {
            name: "echo".into(),
            program: "cat".into(),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = LocalProgramSpec {
            name: "ghost".into(),
            program: "/definitely/not/a/program".into(),
            args: vec![],
        };
        let err = match spec.start().await {
            Err(e) => e,
            Ok(_) => panic!("expected spawn failure"),
        };
        assert!(matches!(err, BackendError::SpawnFailed { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transport_reaches_the_process() {
        let mut running = cat().start().await.unwrap();
        let transport = running.transport();

        // `cat` echoes the ping, the transport answers it, and the echoed
        // answer comes back as the response.
        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result, serde_json::json!({}));

        running.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut running = cat().start().await.unwrap();
        running.stop().await.unwrap();
        running.stop().await.unwrap();
        assert!(running.transport().notify("x", None).await.is_err());
    }
}
