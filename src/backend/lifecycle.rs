//! Per-backend lifecycle state machine.
//!
//! ```text
//! Unstarted ──► Starting ──► Ready ──► Degraded ──► Starting (restart)
//!                  │                      │
//!                  └──► Failed ◄──────────┘ (restart budget exhausted)
//! any ──► Stopped (gateway shutdown)
//! ```
//!
//! Startups are single-flight: the `startup` mutex admits one launch at a
//! time, and callers that queued behind an attempt take its outcome instead
//! of launching again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    BackendSnapshot, BackendState, HealthOutcome, RestartPolicy, MAX_TOOL_PAGES, PROBE_TIMEOUT,
    TIMEOUT_STRIKES,
};
use crate::config::{BackendSpec, TransportKind};
use crate::error::{GatewayError, Result};
use crate::mcp::registry::ToolDispatch;
use crate::mcp::types::{client_initialize_params, JsonRpcResponse, Tool, ToolsListPage};
use crate::sanitize::sanitize;
use crate::transport::{Connection, Connector, TransportError};

/// Extra wait for stderr of a process that died before anything was read.
const STDERR_GRACE: Duration = Duration::from_millis(200);
const DIAGNOSTIC_STDERR_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartReason {
    Initial,
    Restart,
}

struct Status {
    state: BackendState,
    connection: Option<Arc<dyn Connection>>,
    last_error: Option<String>,
    ready_at: Option<DateTime<Utc>>,
    /// Launch attempts begun; lets queued callers detect a finished attempt.
    attempts: u64,
    /// Restarts since the last healthy probe; bounded by the restart policy.
    consecutive_restarts: u32,
    restart_count: u32,
    restart_exhausted: bool,
    tools: Arc<Vec<Tool>>,
    tools_generation: u64,
    /// Set when discovery could not complete; retried on the next listing.
    tools_stale: bool,
}

struct Discovery {
    tools: Vec<Tool>,
    complete: bool,
}

pub struct Backend {
    spec: BackendSpec,
    connector: Arc<dyn Connector>,
    startup_timeout: Duration,
    tool_timeout: Duration,
    restart_policy: RestartPolicy,
    status: RwLock<Status>,
    startup: Mutex<()>,
    launches: AtomicU64,
    timeout_strikes: AtomicU32,
}

impl Backend {
    pub fn new(
        spec: BackendSpec,
        connector: Arc<dyn Connector>,
        startup_timeout: Duration,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            spec,
            connector,
            startup_timeout,
            tool_timeout,
            restart_policy: RestartPolicy::default(),
            status: RwLock::new(Status {
                state: BackendState::Unstarted,
                connection: None,
                last_error: None,
                ready_at: None,
                attempts: 0,
                consecutive_restarts: 0,
                restart_count: 0,
                restart_exhausted: false,
                tools: Arc::new(Vec::new()),
                tools_generation: 0,
                tools_stale: false,
            }),
            startup: Mutex::new(()),
            launches: AtomicU64::new(0),
            timeout_strikes: AtomicU32::new(0),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub fn kind(&self) -> TransportKind {
        self.spec.kind()
    }

    pub fn state(&self) -> BackendState {
        self.read_status().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_status().last_error.clone()
    }

    pub fn is_restart_exhausted(&self) -> bool {
        self.read_status().restart_exhausted
    }

    /// Number of times a connection has been opened for this backend.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Current tool list and its generation; the generation changes every
    /// time the list is rediscovered.
    pub fn tool_catalog(&self) -> (u64, Arc<Vec<Tool>>) {
        let status = self.read_status();
        (status.tools_generation, status.tools.clone())
    }

    fn read_status(&self) -> RwLockReadGuard<'_, Status> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, Status> {
        self.status.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn unavailable(&self, status: &Status) -> GatewayError {
        GatewayError::Unavailable {
            backend: self.id().to_string(),
            reason: status
                .last_error
                .clone()
                .unwrap_or_else(|| "restart attempts exhausted".to_string()),
        }
    }

    /// The connection a call may use right now, `None` when a launch is
    /// needed, or the error to return without launching.
    fn usable_connection(&self) -> Result<Option<Arc<dyn Connection>>> {
        let status = self.read_status();
        match (status.state, &status.connection) {
            (BackendState::Ready, Some(conn)) => Ok(Some(conn.clone())),
            // HTTP backends are never restarted; every call retries the endpoint.
            (BackendState::Degraded, Some(conn)) if self.kind() == TransportKind::Http => {
                Ok(Some(conn.clone()))
            }
            (BackendState::Stopped, _) => Err(GatewayError::ShuttingDown),
            (BackendState::Failed, _) if status.restart_exhausted => Err(self.unavailable(&status)),
            _ => Ok(None),
        }
    }

    /// Returns a ready connection, launching the backend if needed.
    ///
    /// Concurrent callers never cause a second launch: whoever holds the
    /// startup lock launches, the rest wait and share the result.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = self.usable_connection()? {
            return Ok(conn);
        }

        // An attempt already in flight is the one this caller waits on.
        let observed = {
            let status = self.read_status();
            match status.state {
                BackendState::Starting => status.attempts.saturating_sub(1),
                _ => status.attempts,
            }
        };
        let _startup = self.startup.lock().await;

        if let Some(conn) = self.usable_connection()? {
            return Ok(conn);
        }

        let (state, attempts, last_error) = {
            let status = self.read_status();
            (status.state, status.attempts, status.last_error.clone())
        };
        if attempts != observed && state == BackendState::Failed {
            return Err(GatewayError::Startup {
                backend: self.id().to_string(),
                reason: last_error.unwrap_or_else(|| "startup failed".to_string()),
            });
        }

        let reason = match state {
            BackendState::Unstarted => StartReason::Initial,
            _ => StartReason::Restart,
        };
        self.start_locked(reason).await
    }

    /// Launches a fresh connection. Caller holds the startup lock.
    async fn start_locked(&self, reason: StartReason) -> Result<Arc<dyn Connection>> {
        let (previous, exhausted) = {
            let mut status = self.write_status();
            if status.state == BackendState::Stopped {
                return Err(GatewayError::ShuttingDown);
            }
            let previous = status.connection.take();
            if reason == StartReason::Restart
                && status.consecutive_restarts >= self.restart_policy.max_attempts
            {
                status.state = BackendState::Failed;
                status.restart_exhausted = true;
                (previous, Some(self.unavailable(&status)))
            } else {
                if reason == StartReason::Restart {
                    status.consecutive_restarts += 1;
                    status.restart_count += 1;
                }
                status.state = BackendState::Starting;
                status.attempts += 1;
                (previous, None)
            }
        };

        if let Some(conn) = previous {
            conn.close().await;
        }
        if let Some(err) = exhausted {
            tracing::error!(
                backend = %self.id(),
                max_attempts = self.restart_policy.max_attempts,
                "restart attempts exhausted, backend marked failed"
            );
            return Err(err);
        }

        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.timeout_strikes.store(0, Ordering::SeqCst);
        tracing::info!(
            backend = %self.id(),
            kind = self.kind().as_str(),
            launch,
            restart = (reason == StartReason::Restart),
            "starting backend"
        );
        let started = Instant::now();

        let conn = match self.connector.connect(&self.spec) {
            Ok(conn) => conn,
            Err(e) => return Err(self.record_startup_failure(None, e.to_string()).await),
        };

        let discovery =
            match tokio::time::timeout(self.startup_timeout, self.initialize(conn.as_ref())).await
            {
                Ok(Ok(discovery)) => discovery,
                Ok(Err(e)) => {
                    return Err(self.record_startup_failure(Some(conn), e.to_string()).await)
                }
                Err(_) => {
                    let error = format!(
                        "startup timed out after {}ms",
                        self.startup_timeout.as_millis()
                    );
                    return Err(self.record_startup_failure(Some(conn), error).await);
                }
            };

        let tool_count = discovery.tools.len();
        let stopped = {
            let mut status = self.write_status();
            if status.state == BackendState::Stopped {
                true
            } else {
                status.state = BackendState::Ready;
                status.connection = Some(conn.clone());
                status.last_error = None;
                status.ready_at = Some(Utc::now());
                status.tools = Arc::new(discovery.tools);
                status.tools_generation += 1;
                status.tools_stale = !discovery.complete;
                false
            }
        };
        if stopped {
            conn.close().await;
            return Err(GatewayError::ShuttingDown);
        }

        tracing::info!(
            backend = %self.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            tools = tool_count,
            "backend ready"
        );
        Ok(conn)
    }

    async fn record_startup_failure(
        &self,
        conn: Option<Arc<dyn Connection>>,
        error: String,
    ) -> GatewayError {
        let mut stderr = Vec::new();
        if let Some(conn) = conn {
            stderr = conn.stderr_tail();
            if stderr.is_empty() && conn.kind() == TransportKind::Stdio {
                tokio::time::sleep(STDERR_GRACE).await;
                stderr = conn.stderr_tail();
            }
            conn.close().await;
        }

        let diagnosis = self.diagnose(&error, &stderr);
        tracing::error!(backend = %self.id(), error = %diagnosis, "backend failed to start");

        {
            let mut status = self.write_status();
            if status.state != BackendState::Stopped {
                status.state = BackendState::Failed;
            }
            status.last_error = Some(diagnosis.clone());
        }

        GatewayError::Startup {
            backend: self.id().to_string(),
            reason: diagnosis,
        }
    }

    fn diagnose(&self, error: &str, stderr: &[String]) -> String {
        let mut message = format!("{error} [{}]", self.spec.describe());
        let skip = stderr.len().saturating_sub(DIAGNOSTIC_STDERR_LINES);
        let tail: Vec<&str> = stderr.iter().skip(skip).map(String::as_str).collect();
        if !tail.is_empty() {
            message.push_str("; stderr: ");
            message.push_str(&tail.join(" | "));
        }
        sanitize(&message)
    }

    async fn initialize(
        &self,
        conn: &dyn Connection,
    ) -> std::result::Result<Discovery, TransportError> {
        conn.handshake().await?;

        if conn.kind() == TransportKind::Http {
            let session = Some(format!("mcpgate-init-{}", self.id()));
            match conn
                .send("initialize", Some(client_initialize_params()), session.clone())
                .await
            {
                Ok(_) => {
                    if let Err(e) = conn.notify("notifications/initialized", None, session).await {
                        tracing::debug!(backend = %self.id(), error = %e, "initialized notification failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(backend = %self.id(), error = %e, "http backend did not accept initialize");
                }
            }
        }

        self.discover_tools(conn).await
    }

    /// Pages through `tools/list`. A stdio transport failure aborts the
    /// startup; anything else leaves a partial list marked incomplete.
    async fn discover_tools(
        &self,
        conn: &dyn Connection,
    ) -> std::result::Result<Discovery, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let response = match conn.send("tools/list", params, None).await {
                Ok(response) => response,
                Err(e) if conn.kind() == TransportKind::Stdio => return Err(e),
                Err(e) => {
                    tracing::warn!(backend = %self.id(), error = %e, "tool discovery failed");
                    return Ok(Discovery {
                        tools,
                        complete: false,
                    });
                }
            };

            let result = match response.into_result() {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(backend = %self.id(), error = %e, "backend rejected tools/list");
                    return Ok(Discovery {
                        tools,
                        complete: true,
                    });
                }
            };

            let page: ToolsListPage = match serde_json::from_value(result) {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(backend = %self.id(), error = %e, "unreadable tools/list result");
                    return Ok(Discovery {
                        tools,
                        complete: false,
                    });
                }
            };

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    return Ok(Discovery {
                        tools,
                        complete: true,
                    })
                }
            }
        }

        tracing::warn!(backend = %self.id(), pages = MAX_TOOL_PAGES, "tools/list pagination cut short");
        Ok(Discovery {
            tools,
            complete: true,
        })
    }

    /// Re-runs discovery for a ready backend whose last listing was
    /// incomplete. Returns true when the catalog changed.
    pub async fn refresh_tools(&self) -> bool {
        let conn = {
            let status = self.read_status();
            match (status.state, &status.connection, status.tools_stale) {
                (BackendState::Ready, Some(conn), true) => conn.clone(),
                _ => return false,
            }
        };

        let discovery =
            match tokio::time::timeout(self.startup_timeout, self.discover_tools(conn.as_ref()))
                .await
            {
                Ok(Ok(discovery)) if discovery.complete => discovery,
                _ => return false,
            };

        let mut status = self.write_status();
        status.tools = Arc::new(discovery.tools);
        status.tools_generation += 1;
        status.tools_stale = false;
        tracing::info!(backend = %self.id(), tools = status.tools.len(), "tool catalog refreshed");
        true
    }

    /// Sends one request, bounded by the tool timeout.
    ///
    /// A timeout abandons the call but leaves the backend running.
    pub async fn forward(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse> {
        let conn = self.ensure_ready().await?;

        let started = Instant::now();
        match tokio::time::timeout(self.tool_timeout, conn.send(method, params, session_id)).await {
            Ok(Ok(response)) => {
                self.timeout_strikes.store(0, Ordering::SeqCst);
                self.note_success(&conn);
                tracing::debug!(
                    backend = %self.id(),
                    method = %method,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend call completed"
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                self.note_transport_failure(&conn, &e);
                Err(GatewayError::Transport {
                    backend: self.id().to_string(),
                    source: e,
                })
            }
            Err(_) => {
                let strikes = self.timeout_strikes.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(
                    backend = %self.id(),
                    method = %method,
                    timeout_ms = self.tool_timeout.as_millis() as u64,
                    strikes,
                    "backend call timed out"
                );
                Err(GatewayError::Timeout {
                    operation: format!("{method} on backend '{}'", self.id()),
                    timeout_ms: self.tool_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Forwards a notification; no response is awaited.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<()> {
        let conn = self.ensure_ready().await?;
        match tokio::time::timeout(self.tool_timeout, conn.notify(method, params, session_id)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.note_transport_failure(&conn, &e);
                Err(GatewayError::Transport {
                    backend: self.id().to_string(),
                    source: e,
                })
            }
            Err(_) => Err(GatewayError::Timeout {
                operation: format!("{method} on backend '{}'", self.id()),
                timeout_ms: self.tool_timeout.as_millis() as u64,
            }),
        }
    }

    fn is_current(status: &Status, conn: &Arc<dyn Connection>) -> bool {
        status
            .connection
            .as_ref()
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(conn)))
    }

    fn note_success(&self, conn: &Arc<dyn Connection>) {
        if self.kind() != TransportKind::Http {
            return;
        }
        let mut status = self.write_status();
        if status.state == BackendState::Degraded && Self::is_current(&status, conn) {
            status.state = BackendState::Ready;
            tracing::info!(backend = %self.id(), "http backend recovered");
        }
    }

    fn note_transport_failure(&self, conn: &Arc<dyn Connection>, error: &TransportError) {
        if self.kind() == TransportKind::Stdio && !error.is_connection_lost() {
            return;
        }
        let mut status = self.write_status();
        if status.state == BackendState::Ready && Self::is_current(&status, conn) {
            status.state = BackendState::Degraded;
            status.last_error = Some(sanitize(&error.to_string()));
            tracing::warn!(backend = %self.id(), error = %error, "backend degraded after transport error");
        }
    }

    /// Moves a ready backend to `Degraded`. Returns false in any other state.
    pub fn mark_degraded(&self, reason: &str) -> bool {
        let mut status = self.write_status();
        match status.state {
            BackendState::Ready => {
                status.state = BackendState::Degraded;
                status.last_error = Some(sanitize(reason));
                tracing::warn!(backend = %self.id(), %reason, "backend degraded");
                true
            }
            BackendState::Degraded => true,
            _ => false,
        }
    }

    /// Probes the backend without launching anything.
    ///
    /// HTTP backends get a bounded `ping`; any JSON-RPC reply, error or not,
    /// counts as responsive. Stdio backends are judged by process liveness
    /// and consecutive tool timeouts, so a probe never queues behind a long
    /// running call on the shared pipe.
    pub async fn health_check(&self) -> HealthOutcome {
        let (state, conn, last_error) = {
            let status = self.read_status();
            (status.state, status.connection.clone(), status.last_error.clone())
        };

        let conn = match (state, conn, self.kind()) {
            (BackendState::Ready, Some(conn), _) => conn,
            (BackendState::Degraded, Some(conn), TransportKind::Http) => conn,
            (BackendState::Degraded, _, TransportKind::Stdio) => {
                return HealthOutcome::Unhealthy(
                    last_error.unwrap_or_else(|| "backend degraded".to_string()),
                )
            }
            _ => return HealthOutcome::Skipped,
        };

        match conn.kind() {
            TransportKind::Stdio => {
                if !conn.is_healthy() {
                    return HealthOutcome::Unhealthy("process is no longer running".to_string());
                }
                let strikes = self.timeout_strikes.load(Ordering::SeqCst);
                if strikes >= TIMEOUT_STRIKES {
                    return HealthOutcome::Unhealthy(format!(
                        "{strikes} consecutive tool calls timed out"
                    ));
                }
                HealthOutcome::Healthy
            }
            TransportKind::Http => {
                match tokio::time::timeout(PROBE_TIMEOUT, conn.send("ping", None, None)).await {
                    Ok(Ok(_)) => HealthOutcome::Healthy,
                    Ok(Err(e)) => HealthOutcome::Unhealthy(sanitize(&e.to_string())),
                    Err(_) => HealthOutcome::Unhealthy(format!(
                        "ping timed out after {}s",
                        PROBE_TIMEOUT.as_secs()
                    )),
                }
            }
        }
    }

    /// Records a passing probe: clears the restart budget and brings a
    /// degraded HTTP backend back to `Ready`.
    pub fn note_healthy(&self) {
        let mut status = self.write_status();
        status.consecutive_restarts = 0;
        if status.state == BackendState::Degraded && self.kind() == TransportKind::Http {
            status.state = BackendState::Ready;
            tracing::info!(backend = %self.id(), "http backend passed health probe");
        }
    }

    /// Restarts a degraded stdio backend with exponential backoff until it
    /// is ready, the restart budget runs out, or `cancel` fires.
    pub async fn restart_with_backoff(&self, cancel: &CancellationToken) -> Result<()> {
        if self.kind() != TransportKind::Stdio {
            return Ok(());
        }
        let _startup = self.startup.lock().await;

        loop {
            let (state, attempt) = {
                let status = self.read_status();
                (status.state, status.consecutive_restarts)
            };
            match state {
                BackendState::Degraded | BackendState::Failed => {}
                BackendState::Stopped => return Err(GatewayError::ShuttingDown),
                _ => return Ok(()),
            }

            if attempt < self.restart_policy.max_attempts {
                let delay = self.restart_policy.delay_for(attempt);
                tracing::info!(
                    backend = %self.id(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling backend restart"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::ShuttingDown),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.start_locked(StartReason::Restart).await {
                Ok(_) => return Ok(()),
                Err(e @ (GatewayError::Unavailable { .. } | GatewayError::ShuttingDown)) => {
                    return Err(e)
                }
                Err(e) => {
                    tracing::warn!(backend = %self.id(), error = %e, "restart attempt failed");
                }
            }
        }
    }

    /// Stops the backend for good. Returns true when a live connection was
    /// closed.
    pub async fn shutdown(&self) -> bool {
        let conn = {
            let mut status = self.write_status();
            status.state = BackendState::Stopped;
            status.connection.take()
        };
        match conn {
            Some(conn) => {
                conn.close().await;
                tracing::info!(backend = %self.id(), "backend stopped");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let status = self.read_status();
        let uptime = match (status.state, status.ready_at) {
            (BackendState::Ready | BackendState::Degraded, Some(ready_at)) => {
                Some((Utc::now() - ready_at).num_seconds().max(0) as u64)
            }
            _ => None,
        };
        BackendSnapshot {
            id: self.id().to_string(),
            state: status.state,
            status: status.state.health_label(),
            kind: self.kind(),
            uptime,
            restart_count: status.restart_count,
            tools: status.tools.len(),
            last_error: status.last_error.clone(),
        }
    }
}

#[async_trait]
impl ToolDispatch for Backend {
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse> {
        self.forward(
            "tools/call",
            Some(json!({ "name": tool_name, "arguments": arguments })),
            session_id,
        )
        .await
    }
}
