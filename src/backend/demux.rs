//! Container output demultiplexing.
//!
//! The attach connection interleaves stdout and stderr frames. A background
//! task routes each frame into one of two in-memory pipes so the JSON-RPC
//! transport reads a clean stdout and stderr goes to the log. The task ends
//! only when the attach stream ends; a request deadline never stops it.

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use super::runtime::{OutputFrame, RuntimeError, StdStream};

/// Per-pipe buffer. Output beyond this waits until the reader catches up.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Read ends of the demultiplexed streams plus the routing task.
pub struct Demuxed {
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub task: JoinHandle<()>,
}

/// Spawn the routing task for one container's output.
pub fn spawn_demux(
    container: &str,
    mut output: BoxStream<'static, Result<OutputFrame, RuntimeError>>,
) -> Demuxed {
    let (mut stdout_tx, stdout) = duplex(PIPE_CAPACITY);
    let (mut stderr_tx, stderr) = duplex(PIPE_CAPACITY);
    let container = container.to_string();

    let task = tokio::spawn(async move {
        // A reader that went away must not stall the other stream.
        let mut stdout_open = true;
        let mut stderr_open = true;

        while let Some(frame) = output.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(container = %container, error = %e, "container output stream failed");
                    break;
                }
            };
            let (sink, open) = match frame.stream {
                StdStream::Stdout => (&mut stdout_tx, &mut stdout_open),
                StdStream::Stderr => (&mut stderr_tx, &mut stderr_open),
            };
            if *open && sink.write_all(&frame.payload).await.is_err() {
                tracing::debug!(container = %container, stream = ?frame.stream, "reader closed, discarding further output");
                *open = false;
            }
        }

        let _ = stdout_tx.shutdown().await;
        let _ = stderr_tx.shutdown().await;
        tracing::debug!(container = %container, "container output stream ended");
    });

    Demuxed {
        stdout,
        stderr,
        task,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    fn frame(stream: StdStream, text: &str) -> Result<OutputFrame, RuntimeError> {
        Ok(OutputFrame {
            stream,
            payload: text.as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn test_frames_are_routed_by_stream() {
        let output = stream::iter(vec![
            frame(StdStream::Stdout, "{\"id\":1}"),
            frame(StdStream::Stderr, "warming up\n"),
            frame(StdStream::Stdout, "\n"),
        ])
        .boxed();
        let mut demuxed = spawn_demux("c0ffee", output);

        let mut out = String::new();
        demuxed.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        demuxed.stderr.read_to_string(&mut err).await.unwrap();
        demuxed.task.await.unwrap();

        assert_eq!(out, "{\"id\":1}\n");
        assert_eq!(err, "warming up\n");
    }

    #[tokio::test]
    async fn test_dropped_stderr_reader_does_not_block_stdout() {
        let output = stream::iter(vec![
            frame(StdStream::Stderr, "noise"),
            frame(StdStream::Stdout, "payload"),
        ])
        .boxed();
        let Demuxed {
            mut stdout,
            stderr,
            task,
        } = spawn_demux("c0ffee", output);
        drop(stderr);

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();
        assert_eq!(out, "payload");
    }

    #[tokio::test]
    async fn test_stream_error_ends_task() {
        let output = stream::iter(vec![
            frame(StdStream::Stdout, "partial"),
            Err(RuntimeError::Api {
                reason: "connection reset".into(),
            }),
            frame(StdStream::Stdout, "never"),
        ])
        .boxed();
        let mut demuxed = spawn_demux("c0ffee", output);
        let mut out = String::new();
        demuxed.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "partial");
        demuxed.task.await.unwrap();
    }
}
