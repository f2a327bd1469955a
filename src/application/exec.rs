// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Exec Supervisor Application Service
//!
//! Per-call command execution inside a worker container. Races three
//! outcomes: natural completion, a hard deadline that fires regardless of
//! activity, and an idle deadline that is cancelled and rearmed on every
//! output chunk. Exactly one outcome resolves the call; dropping the exec
//! handle tears the channel down so late-arriving events are ignored and no
//! timer leaks across calls.

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::registry::LifecycleRegistry;
use crate::domain::engine::{ContainerEngine, EngineError, ExecChunk, ExecHandle, ExecRequest};
use crate::domain::store::StoreError;

/// Grace period for the container stop issued on `kill_on_timeout`.
const KILL_STOP_TIMEOUT_SECONDS: i64 = 5;

/// Options for a collecting exec call.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    /// Hard deadline in milliseconds; fires regardless of activity.
    pub timeout_ms: Option<u64>,
    /// Idle deadline in milliseconds; rearmed on every output chunk.
    pub idle_timeout_ms: Option<u64>,
    /// Allocate a pseudo-terminal. Output then arrives as one combined
    /// stream and is reported entirely as stdout.
    pub tty: bool,
    /// Escalate a timeout to a graceful container stop.
    pub kill_on_timeout: bool,
    /// TTL override forwarded to the registry's last-used bookkeeping.
    pub ttl_override_seconds: Option<i64>,
}

/// Options for an interactive (non-collecting) exec session.
#[derive(Debug, Clone, Default)]
pub struct InteractiveOptions {
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    pub tty: bool,
}

/// Result of a completed exec call.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the engine could not report an exit code.
    pub exit_code: Option<i64>,
}

/// Exec failures. The two timeout kinds are distinct so callers can phrase
/// different guidance ("ran too long overall" vs "stopped producing
/// output"); both carry elapsed time and the output captured before the
/// cutoff.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("container is not running: {0}")]
    NotRunning(String),

    #[error("command exceeded the {timeout_ms}ms execution limit after {elapsed_ms}ms")]
    HardTimeout {
        timeout_ms: u64,
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },

    #[error("command produced no output for {idle_timeout_ms}ms and was cancelled after {elapsed_ms}ms")]
    IdleTimeout {
        idle_timeout_ms: u64,
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },

    #[error("exec input channel error: {0}")]
    Input(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum TimeoutKind {
    Hard,
    Idle,
}

pub struct ExecSupervisor {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<LifecycleRegistry>,
}

impl ExecSupervisor {
    pub fn new(engine: Arc<dyn ContainerEngine>, registry: Arc<LifecycleRegistry>) -> Self {
        Self { engine, registry }
    }

    /// Run a command to completion, demultiplexing and collecting output.
    ///
    /// Touches the registry's last-used bookkeeping first, so the TTL clock
    /// tracks actual usage rather than only creation time.
    pub async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        options: ExecOptions,
    ) -> Result<ExecOutput, ExecError> {
        self.registry
            .touch_last_used(container_id, Utc::now(), options.ttl_override_seconds)
            .await?;

        let target = self.engine.inspect(container_id).await?;
        if !target.running {
            return Err(ExecError::NotRunning(container_id.to_string()));
        }

        let request = ExecRequest {
            cmd: command,
            workdir: options.workdir.clone(),
            env: options.env.clone(),
            tty: options.tty,
            attach_stdin: false,
        };
        let mut handle = self.engine.exec(container_id, request).await?;
        let exec_id = handle.exec_id.clone();

        let started = Instant::now();
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();

        // Disabled timers keep a far-future deadline and are never polled
        // thanks to the select guards below.
        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);
        let hard_deadline = options
            .timeout_ms
            .map(|ms| started + Duration::from_millis(ms))
            .unwrap_or(far_future);
        let idle_window = options.idle_timeout_ms.map(Duration::from_millis);

        let hard = tokio::time::sleep_until(hard_deadline);
        tokio::pin!(hard);
        let idle = tokio::time::sleep_until(
            idle_window.map(|w| started + w).unwrap_or(far_future),
        );
        tokio::pin!(idle);

        loop {
            tokio::select! {
                chunk = handle.output.next() => match chunk {
                    Some(Ok(chunk)) => {
                        match &chunk {
                            ExecChunk::Stdout(bytes) => stdout.extend_from_slice(bytes),
                            ExecChunk::Stderr(bytes) => stderr.extend_from_slice(bytes),
                        }
                        if let Some(window) = idle_window {
                            idle.as_mut().reset(Instant::now() + window);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
                _ = &mut hard, if options.timeout_ms.is_some() => {
                    return Err(self
                        .timed_out(container_id, TimeoutKind::Hard, &options, started, handle, stdout, stderr)
                        .await);
                }
                _ = &mut idle, if options.idle_timeout_ms.is_some() => {
                    return Err(self
                        .timed_out(container_id, TimeoutKind::Idle, &options, started, handle, stdout, stderr)
                        .await);
                }
            }
        }

        let exit_code = self.engine.exec_exit_code(&exec_id).await?;
        debug!(container_id, exec_id = %exec_id, ?exit_code, "exec completed");

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    /// Open a long-lived duplex exec session with live input/output handles.
    /// No timeout is imposed; the caller drives the session and calls
    /// [`InteractiveExec::close`] to end input and retrieve the exit code.
    pub async fn open_interactive(
        &self,
        container_id: &str,
        command: Vec<String>,
        options: InteractiveOptions,
    ) -> Result<InteractiveExec, ExecError> {
        self.registry
            .touch_last_used(container_id, Utc::now(), None)
            .await?;

        let target = self.engine.inspect(container_id).await?;
        if !target.running {
            return Err(ExecError::NotRunning(container_id.to_string()));
        }

        let request = ExecRequest {
            cmd: command,
            workdir: options.workdir,
            env: options.env,
            tty: options.tty,
            attach_stdin: true,
        };
        let handle = self.engine.exec(container_id, request).await?;

        Ok(InteractiveExec {
            engine: self.engine.clone(),
            handle,
        })
    }

    /// Tear down a timed-out exec: drop the channel, optionally stop the
    /// container, and build the matching timeout error. A failed stop is
    /// logged but never masks the timeout itself.
    async fn timed_out(
        &self,
        container_id: &str,
        kind: TimeoutKind,
        options: &ExecOptions,
        started: Instant,
        handle: ExecHandle,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    ) -> ExecError {
        drop(handle);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if options.kill_on_timeout {
            match self.engine.stop(container_id, KILL_STOP_TIMEOUT_SECONDS).await {
                Ok(()) => {}
                Err(e) if e.is_benign_on_cleanup() => {}
                Err(e) => {
                    warn!(container_id, error = %e, "failed to stop container after exec timeout");
                }
            }
        }

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        match kind {
            TimeoutKind::Hard => ExecError::HardTimeout {
                timeout_ms: options.timeout_ms.unwrap_or_default(),
                elapsed_ms,
                stdout,
                stderr,
            },
            TimeoutKind::Idle => ExecError::IdleTimeout {
                idle_timeout_ms: options.idle_timeout_ms.unwrap_or_default(),
                elapsed_ms,
                stdout,
                stderr,
            },
        }
    }
}

/// Live duplex exec session. The caller reads `output` and writes stdin via
/// [`InteractiveExec::write_stdin`]; `close` ends input and retrieves the
/// final exit code.
pub struct InteractiveExec {
    engine: Arc<dyn ContainerEngine>,
    handle: ExecHandle,
}

impl InteractiveExec {
    pub fn exec_id(&self) -> &str {
        &self.handle.exec_id
    }

    /// Next demultiplexed output chunk; `None` once the process has ended
    /// its streams.
    pub async fn next_chunk(&mut self) -> Option<Result<ExecChunk, EngineError>> {
        self.handle.output.next().await
    }

    /// Write raw bytes to the process stdin.
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let input = self
            .handle
            .input
            .as_mut()
            .ok_or_else(|| ExecError::Input("stdin is not attached".to_string()))?;
        input
            .write_all(data)
            .await
            .map_err(|e| ExecError::Input(e.to_string()))?;
        input.flush().await.map_err(|e| ExecError::Input(e.to_string()))
    }

    /// End input, tear down the channel, and fetch the final exit code.
    pub async fn close(mut self) -> Result<Option<i64>, ExecError> {
        if let Some(input) = self.handle.input.as_mut() {
            // A close failure only means the remote end is already gone.
            let _ = input.shutdown().await;
        }
        let exec_id = self.handle.exec_id.clone();
        drop(self.handle);
        Ok(self.engine.exec_exit_code(&exec_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::{
        CreateContainerSpec, EngineContainer, EngineContainerSummary,
    };
    use crate::domain::store::ContainerStore;
    use crate::infrastructure::repositories::InMemoryContainerStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_stream::wrappers::ReceiverStream;

    /// Engine stub that replays a scripted output timeline for every exec.
    struct ReplayEngine {
        /// (delay before chunk, chunk) pairs, replayed in order.
        script: Vec<(Duration, ExecChunk)>,
        /// Keep the stream open forever after the script ends.
        hang: bool,
        exit_code: Option<i64>,
        running: bool,
        stops: std::sync::atomic::AtomicUsize,
        /// Non-benign stop failure message, when set.
        stop_error: Option<String>,
    }

    impl ReplayEngine {
        fn new(script: Vec<(Duration, ExecChunk)>) -> Self {
            Self {
                script,
                hang: false,
                exit_code: Some(0),
                running: true,
                stops: std::sync::atomic::AtomicUsize::new(0),
                stop_error: None,
            }
        }

        fn hanging() -> Self {
            let mut engine = Self::new(Vec::new());
            engine.hang = true;
            engine
        }

        fn stop_count(&self) -> usize {
            self.stops.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContainerEngine for ReplayEngine {
        async fn ensure_image(&self, _: &str, _: Option<&str>) -> Result<(), EngineError> {
            Ok(())
        }

        async fn create_and_start(&self, _: CreateContainerSpec) -> Result<String, EngineError> {
            unimplemented!("not used by the supervisor")
        }

        async fn inspect(&self, id: &str) -> Result<EngineContainer, EngineError> {
            Ok(EngineContainer {
                id: id.to_string(),
                running: self.running,
                created_at: None,
                image: None,
                labels: HashMap::new(),
            })
        }

        async fn exec(&self, _: &str, _: ExecRequest) -> Result<ExecHandle, EngineError> {
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            let script = self.script.clone();
            let hang = self.hang;
            tokio::spawn(async move {
                for (delay, chunk) in script {
                    tokio::time::sleep(delay).await;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                if hang {
                    // Hold the sender open so the stream never ends.
                    futures::future::pending::<()>().await;
                }
            });
            Ok(ExecHandle {
                exec_id: "exec-1".to_string(),
                output: ReceiverStream::new(rx).boxed(),
                input: None,
            })
        }

        async fn exec_exit_code(&self, _: &str) -> Result<Option<i64>, EngineError> {
            Ok(self.exit_code)
        }

        async fn stop(&self, _: &str, _: i64) -> Result<(), EngineError> {
            self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match &self.stop_error {
                Some(message) => Err(EngineError::Api(message.clone())),
                None => Ok(()),
            }
        }

        async fn remove(&self, _: &str, _: bool) -> Result<(), EngineError> {
            Ok(())
        }

        async fn list_by_labels(
            &self,
            _: &HashMap<String, String>,
            _: bool,
        ) -> Result<Vec<EngineContainerSummary>, EngineError> {
            Ok(Vec::new())
        }

        async fn get_labels(&self, _: &str) -> Result<HashMap<String, String>, EngineError> {
            Ok(HashMap::new())
        }
    }

    fn supervisor(engine: Arc<ReplayEngine>) -> (ExecSupervisor, Arc<InMemoryContainerStore>) {
        let store = Arc::new(InMemoryContainerStore::new());
        let registry = Arc::new(LifecycleRegistry::new(store.clone()));
        (ExecSupervisor::new(engine, registry), store)
    }

    fn out(s: &str) -> ExecChunk {
        ExecChunk::Stdout(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn err_out(s: &str) -> ExecChunk {
        ExecChunk::Stderr(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[tokio::test]
    async fn collects_demultiplexed_output_and_exit_code() {
        let engine = Arc::new(ReplayEngine::new(vec![
            (Duration::ZERO, out("hello ")),
            (Duration::ZERO, err_out("warning\n")),
            (Duration::ZERO, out("world\n")),
        ]));
        let (supervisor, _) = supervisor(engine);

        let result = supervisor
            .exec("c1", vec!["echo".to_string()], ExecOptions::default())
            .await
            .unwrap();

        assert_eq!(result.stdout, "hello world\n");
        assert_eq!(result.stderr, "warning\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn exec_touches_last_used_bookkeeping() {
        let engine = Arc::new(ReplayEngine::new(vec![(Duration::ZERO, out("ok"))]));
        let (supervisor, store) = supervisor(engine);

        supervisor
            .exec("c1", vec!["true".to_string()], ExecOptions::default())
            .await
            .unwrap();

        // The unknown id got a placeholder record with a fresh deadline.
        let record = store.get("c1").await.unwrap().unwrap();
        assert!(record.kill_after_at.is_some());
    }

    #[tokio::test]
    async fn rejects_stopped_container() {
        let mut engine = ReplayEngine::new(Vec::new());
        engine.running = false;
        let (supervisor, _) = supervisor(Arc::new(engine));

        let err = supervisor
            .exec("c1", vec!["true".to_string()], ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NotRunning(_)));
    }

    #[tokio::test]
    async fn hard_timeout_fires_and_returns_partial_output() {
        let engine = Arc::new(ReplayEngine {
            script: vec![(Duration::from_millis(10), out("partial"))],
            hang: true,
            exit_code: Some(0),
            running: true,
            stops: std::sync::atomic::AtomicUsize::new(0),
            stop_error: None,
        });
        let (supervisor, _) = supervisor(engine.clone());

        let started = std::time::Instant::now();
        let err = supervisor
            .exec(
                "c1",
                vec!["sleep".to_string()],
                ExecOptions {
                    timeout_ms: Some(150),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            ExecError::HardTimeout { timeout_ms, elapsed_ms, stdout, .. } => {
                assert_eq!(timeout_ms, 150);
                assert!(elapsed_ms >= 150);
                assert_eq!(stdout, "partial");
            }
            other => panic!("expected hard timeout, got {other:?}"),
        }
        // kill_on_timeout not set: the container was left alone.
        assert_eq!(engine.stop_count(), 0);
    }

    #[tokio::test]
    async fn idle_timeout_fires_on_silence() {
        let engine = Arc::new(ReplayEngine {
            script: vec![(Duration::from_millis(5), out("one chunk"))],
            hang: true,
            exit_code: Some(0),
            running: true,
            stops: std::sync::atomic::AtomicUsize::new(0),
            stop_error: None,
        });
        let (supervisor, _) = supervisor(engine);

        let err = supervisor
            .exec(
                "c1",
                vec!["stall".to_string()],
                ExecOptions {
                    idle_timeout_ms: Some(80),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap_err();

        match err {
            ExecError::IdleTimeout { idle_timeout_ms, stdout, .. } => {
                assert_eq!(idle_timeout_ms, 80);
                assert_eq!(stdout, "one chunk");
            }
            other => panic!("expected idle timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sustained_output_rearms_the_idle_timer() {
        // Five chunks 40ms apart: total runtime exceeds the 100ms idle
        // window, but no single gap does.
        let script = (0..5)
            .map(|_| (Duration::from_millis(40), out("tick ")))
            .collect();
        let engine = Arc::new(ReplayEngine::new(script));
        let (supervisor, _) = supervisor(engine);

        let result = supervisor
            .exec(
                "c1",
                vec!["ticker".to_string()],
                ExecOptions {
                    idle_timeout_ms: Some(100),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.stdout, "tick tick tick tick tick ");
    }

    #[tokio::test]
    async fn kill_on_timeout_stops_the_container() {
        let engine = Arc::new(ReplayEngine::hanging());
        let (supervisor, _) = supervisor(engine.clone());

        let err = supervisor
            .exec(
                "c1",
                vec!["hang".to_string()],
                ExecOptions {
                    timeout_ms: Some(50),
                    kill_on_timeout: true,
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::HardTimeout { .. }));
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test]
    async fn failed_kill_never_masks_the_timeout() {
        let mut engine = ReplayEngine::hanging();
        engine.stop_error = Some("stop refused".to_string());
        let engine = Arc::new(engine);
        let (supervisor, _) = supervisor(engine.clone());

        let err = supervisor
            .exec(
                "c1",
                vec!["hang".to_string()],
                ExecOptions {
                    timeout_ms: Some(50),
                    kill_on_timeout: true,
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap_err();

        // Still the original timeout, not the stop failure.
        assert!(matches!(err, ExecError::HardTimeout { .. }));
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test]
    async fn interactive_session_streams_and_closes() {
        let engine = Arc::new(ReplayEngine::new(vec![
            (Duration::ZERO, out("ready\n")),
        ]));
        let (supervisor, _) = supervisor(engine);

        let mut session = supervisor
            .open_interactive("c1", vec!["repl".to_string()], InteractiveOptions::default())
            .await
            .unwrap();

        let chunk = session.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, out("ready\n"));
        assert!(session.next_chunk().await.is_none());

        let exit_code = session.close().await.unwrap();
        assert_eq!(exit_code, Some(0));
    }

    #[tokio::test]
    async fn interactive_write_without_stdin_is_an_error() {
        let engine = Arc::new(ReplayEngine::new(Vec::new()));
        let (supervisor, _) = supervisor(engine);

        let mut session = supervisor
            .open_interactive("c1", vec!["repl".to_string()], InteractiveOptions::default())
            .await
            .unwrap();

        let err = session.write_stdin(b"input\n").await.unwrap_err();
        assert!(matches!(err, ExecError::Input(_)));
    }
}
