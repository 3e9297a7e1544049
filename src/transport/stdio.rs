//! JSON-RPC over a child process's stdin/stdout.
//!
//! Writes are newline-terminated JSON. Reads go through a dedicated task
//! that reassembles frames with [`JsonFrameCodec`] and hands each response
//! to the caller waiting on its id. One request is in flight at a time; a
//! caller that gives up (timeout, disconnect) releases its turn and any
//! late reply is dropped by the read loop.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use super::framing::JsonFrameCodec;
use super::{Connection, TransportError};
use crate::config::{StdioSpec, TransportKind};
use crate::mcp::types::{client_initialize_params, JsonRpcRequest, JsonRpcResponse};
use crate::process::{ProcessArena, ProcessHandle};
use crate::sanitize::sanitize;

/// How long a partially received frame may go without new bytes.
const FRAME_STALL_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_TAIL_LINES: usize = 64;

type Reply = Result<JsonRpcResponse, TransportError>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StdioConnection {
    backend_id: String,
    writer: Mutex<ChildStdin>,
    pending: Pending,
    /// Serializes request/response exchanges on the shared pipe.
    turn: Mutex<()>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    process: ProcessHandle,
    arena: ProcessArena,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    /// Cached `initialize` result from the handshake.
    server_info: OnceLock<Value>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioConnection {
    /// Launches the backend process and starts its reader tasks. The
    /// handshake is performed separately by [`Connection::handshake`].
    pub fn spawn(
        backend_id: &str,
        spec: &StdioSpec,
        arena: ProcessArena,
    ) -> Result<Self, TransportError> {
        Self::launch(backend_id, spec, arena, FRAME_STALL_TIMEOUT)
    }

    fn launch(
        backend_id: &str,
        spec: &StdioSpec,
        arena: ProcessArena,
        frame_stall: Duration,
    ) -> Result<Self, TransportError> {
        let (program, args) = spec.command_line();
        tracing::info!(
            backend = %backend_id,
            command = %spec.redacted_command_line(),
            "launching stdio backend"
        );

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(spec.process_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| TransportError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            // Dropping the child kills it.
            return Err(TransportError::Spawn {
                program,
                reason: "standard streams were not captured".to_string(),
            });
        };

        let process = arena.insert(backend_id, child);
        let pending: Pending = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let tasks = vec![
            tokio::spawn(read_loop(
                backend_id.to_string(),
                stdout,
                pending.clone(),
                alive.clone(),
                frame_stall,
            )),
            tokio::spawn(drain_stderr(
                backend_id.to_string(),
                stderr,
                stderr_tail.clone(),
            )),
        ];

        Ok(Self {
            backend_id: backend_id.to_string(),
            writer: Mutex::new(stdin),
            pending,
            turn: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive,
            process,
            arena,
            stderr_tail,
            server_info: OnceLock::new(),
            tasks,
        })
    }

    /// The backend's `initialize` result, once the handshake has completed.
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.get()
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Reply {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The read loop drains waiters after flagging itself dead; a waiter
        // registered after that drain would never be answered.
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn write_message(&self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Removes an abandoned waiter so a late reply finds nobody.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

#[async_trait]
impl Connection for StdioConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let response = {
            let _turn = self.turn.lock().await;
            self.request("initialize", Some(client_initialize_params()))
                .await?
        };
        let info = response
            .into_result()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        self.write_message(&JsonRpcRequest::notification(
            "notifications/initialized",
            None,
        ))
        .await?;

        let server = info
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        tracing::info!(
            backend = %self.backend_id,
            server = %server,
            "stdio handshake complete"
        );
        let _ = self.server_info.set(info);
        Ok(())
    }

    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        _session_id: Option<String>,
    ) -> Result<JsonRpcResponse, TransportError> {
        // The process was initialized once for all clients.
        if method == "initialize" {
            if let Some(info) = self.server_info.get() {
                return Ok(JsonRpcResponse::success(Value::Null, info.clone()));
            }
        }

        let _turn = self.turn.lock().await;
        self.request(method, params).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        _session_id: Option<String>,
    ) -> Result<(), TransportError> {
        if method == "notifications/initialized" && self.server_info.get().is_some() {
            return Ok(());
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.arena.is_running(self.process)
    }

    fn stderr_tail(&self) -> Vec<String> {
        lock(&self.stderr_tail).iter().cloned().collect()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if self.arena.terminate(self.process).await {
            tracing::info!(backend = %self.backend_id, "stdio backend stopped");
        }
        for tx in lock(&self.pending).drain().map(|(_, tx)| tx) {
            let _ = tx.send(Err(TransportError::Closed));
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        // Connections dropped without close() still release their process.
        let arena = self.arena.clone();
        let process = self.process;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                arena.terminate(process).await;
            });
        }
    }
}

async fn read_loop(
    backend_id: String,
    stdout: ChildStdout,
    pending: Pending,
    alive: Arc<AtomicBool>,
    frame_stall: Duration,
) {
    let mut frames = FramedRead::new(stdout, JsonFrameCodec::default());

    let framing_failure = 'frames: loop {
        // Buffered length of the partial frame at the previous tick. A
        // frame that does not grow for a whole tick has stalled; idle
        // time between frames never counts.
        let mut partial_len = None;
        let next = loop {
            match tokio::time::timeout(frame_stall, frames.next()).await {
                Ok(next) => break next,
                Err(_) => {
                    let current = frames
                        .decoder()
                        .in_frame()
                        .then(|| frames.read_buffer().len());
                    if current.is_some() && current == partial_len {
                        break 'frames Some(format!(
                            "incomplete frame made no progress for {}ms",
                            frame_stall.as_millis()
                        ));
                    }
                    partial_len = current;
                }
            }
        };

        match next {
            Some(Ok(message)) => route_message(&backend_id, &pending, message),
            Some(Err(TransportError::Framing(reason))) => break Some(reason),
            Some(Err(e)) => {
                tracing::warn!(backend = %backend_id, error = %e, "stdout read failed");
                break None;
            }
            None => break None,
        }
    };

    alive.store(false, Ordering::SeqCst);
    match &framing_failure {
        Some(reason) => {
            tracing::error!(backend = %backend_id, %reason, "framing error, connection dropped")
        }
        None => tracing::info!(backend = %backend_id, "backend closed its stdout"),
    }

    let waiters: Vec<_> = lock(&pending).drain().map(|(_, tx)| tx).collect();
    for tx in waiters {
        let err = match &framing_failure {
            Some(reason) => TransportError::Framing(reason.clone()),
            None => TransportError::Closed,
        };
        let _ = tx.send(Err(err));
    }
}

fn route_message(backend_id: &str, pending: &Pending, message: Value) {
    let is_response = message.get("method").is_none()
        && (message.get("result").is_some() || message.get("error").is_some());

    if !is_response {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("<none>");
        tracing::debug!(
            backend = %backend_id,
            method = %method,
            "ignoring server-initiated message"
        );
        return;
    }

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        tracing::warn!(backend = %backend_id, "response without a numeric id");
        return;
    };

    let waiter = lock(pending).remove(&id);
    let Some(tx) = waiter else {
        tracing::debug!(backend = %backend_id, id, "discarding response nobody is waiting for");
        return;
    };

    let reply = serde_json::from_value::<JsonRpcResponse>(message)
        .map_err(|e| TransportError::InvalidResponse(e.to_string()));
    let _ = tx.send(reply);
}

async fn drain_stderr(
    backend_id: String,
    stderr: ChildStderr,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = sanitize(&line);
        tracing::debug!(backend = %backend_id, "stderr: {}", line);

        let mut tail = lock(&tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
