//! The gateway core: every backend, the tool registry and the session store,
//! owned together and shared by the HTTP handlers.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcpgate::config::load_from_path;
//! use mcpgate::gateway::Gateway;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_from_path("gateway.json")?;
//! let gateway = Arc::new(Gateway::new(config));
//! gateway.start_all().await;
//! let tools = gateway.list_tools().await;
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendSnapshot, BackendState, HealthOutcome, RestartPolicy};
use crate::config::{GatewayConfig, TransportKind};
use crate::error::{GatewayError, Result};
use crate::mcp::registry::{split_namespaced, ToolDispatch, ToolEntry, ToolRegistry};
use crate::mcp::sys::{self, SYS_PREFIX};
use crate::mcp::types::{JsonRpcResponse, Tool};
use crate::process::ProcessArena;
use crate::session::SessionStore;
use crate::transport::{Connector, TransportConnector};

pub const SPEC_VERSION: &str = "1.0.0";

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub spec_version: &'static str,
    pub gateway_version: &'static str,
    pub servers: BTreeMap<String, BackendSnapshot>,
}

pub struct Gateway {
    config: GatewayConfig,
    backends: BTreeMap<String, Arc<Backend>>,
    registry: ToolRegistry,
    sessions: SessionStore,
    arena: ProcessArena,
    shutdown: CancellationToken,
    stopping: AtomicBool,
    closed: AtomicBool,
}

impl Gateway {
    /// Builds the gateway with the production transports. Nothing is
    /// launched until [`Gateway::start_all`] or the first request.
    pub fn new(config: GatewayConfig) -> Self {
        let arena = ProcessArena::new();
        let connector = Arc::new(TransportConnector::new(arena.clone()));
        Self::with_connector(config, connector, arena, RestartPolicy::default())
    }

    pub fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        arena: ProcessArena,
        restart_policy: RestartPolicy,
    ) -> Self {
        let backends = config
            .backends
            .values()
            .map(|spec| {
                let backend = Backend::new(
                    spec.clone(),
                    connector.clone(),
                    config.startup_timeout,
                    config.tool_timeout,
                )
                .with_restart_policy(restart_policy);
                (spec.id.clone(), Arc::new(backend))
            })
            .collect();

        Self {
            config,
            backends,
            registry: ToolRegistry::new(),
            sessions: SessionStore::new(),
            arena,
            shutdown: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn arena(&self) -> &ProcessArena {
        &self.arena
    }

    /// Cancelled once shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Configured backend ids in sorted order.
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn backend(&self, id: &str) -> Result<&Arc<Backend>> {
        self.backends
            .get(id)
            .ok_or_else(|| GatewayError::BackendNotFound(id.to_string()))
    }

    /// Target for unified-mode methods the gateway does not answer itself.
    pub fn default_backend_id(&self) -> Option<String> {
        self.config
            .default_backend
            .clone()
            .or_else(|| self.backends.keys().next().cloned())
    }

    /// Brings a backend to `Ready` and makes sure its tools are registered.
    pub async fn ensure_ready(&self, id: &str) -> Result<Arc<Backend>> {
        let backend = self.backend(id)?.clone();
        let outcome = backend.ensure_ready().await;
        self.reconcile(&backend).await;
        outcome.map(|_| backend)
    }

    /// Starts every backend concurrently. Failures are logged and do not
    /// stop the others. Returns how many backends became ready.
    pub async fn start_all(&self) -> usize {
        let outcomes = join_all(self.backends.keys().map(|id| async move {
            (id, self.ensure_ready(id).await)
        }))
        .await;

        let mut ready = 0;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => ready += 1,
                Err(e) => tracing::warn!(backend = %id, error = %e, "backend unavailable at startup"),
            }
        }
        tracing::info!(ready, total = self.backends.len(), "backends started");
        ready
    }

    /// Brings the registry in line with the backend's current state.
    async fn reconcile(&self, backend: &Arc<Backend>) {
        match backend.state() {
            BackendState::Ready | BackendState::Degraded => {
                let (generation, tools) = backend.tool_catalog();
                let handler: Arc<dyn ToolDispatch> = backend.clone();
                self.registry
                    .sync(
                        backend.id(),
                        generation,
                        &tools,
                        backend.spec().tools.as_deref(),
                        handler,
                    )
                    .await;
            }
            BackendState::Failed if backend.is_restart_exhausted() => {
                self.registry.mark_unavailable(backend.id()).await;
            }
            _ => {}
        }
    }

    /// Sends a request to one backend, tool names untouched.
    pub async fn forward(
        &self,
        backend_id: &str,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse> {
        let backend = self.backend(backend_id)?.clone();
        let outcome = backend.forward(method, params, session_id).await;
        self.reconcile(&backend).await;
        outcome
    }

    pub async fn notify(
        &self,
        backend_id: &str,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<()> {
        let backend = self.backend(backend_id)?.clone();
        backend.notify(method, params, session_id).await
    }

    /// The unified catalog: every available namespaced tool sorted by name,
    /// followed by the introspection tools.
    ///
    /// Backends not started yet are started first, and ready backends whose
    /// last discovery was incomplete are asked again.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let unstarted: Vec<&str> = self
            .backends
            .values()
            .filter(|b| b.state() == BackendState::Unstarted)
            .map(|b| b.id())
            .collect();
        for (id, outcome) in unstarted
            .iter()
            .zip(join_all(unstarted.iter().map(|id| self.ensure_ready(id))).await)
        {
            if let Err(e) = outcome {
                tracing::warn!(backend = %id, error = %e, "backend tools not listed");
            }
        }

        join_all(self.backends.values().map(|backend| async move {
            backend.refresh_tools().await;
            self.reconcile(backend).await;
        }))
        .await;

        let mut tools: Vec<Tool> = self
            .registry
            .list_all()
            .await
            .iter()
            .map(ToolEntry::to_unified_tool)
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools.extend(sys::unified_tools());
        tools
    }

    /// Calls a tool by its namespaced name.
    ///
    /// A name missing from the catalog whose prefix is a configured backend
    /// starts that backend first, so lazily started backends can be called
    /// without a prior `tools/list`.
    pub async fn dispatch_tool(
        &self,
        name: &str,
        arguments: Value,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse> {
        if let Some(bare) = name.strip_prefix(SYS_PREFIX) {
            let result = sys::call(bare, &self.backend_ids())?;
            return Ok(JsonRpcResponse::success(Value::Null, result));
        }

        let Some((backend_id, _)) = split_namespaced(name) else {
            return Err(GatewayError::ToolNotFound(name.to_string()));
        };
        if !self.backends.contains_key(backend_id) {
            return Err(GatewayError::ToolNotFound(name.to_string()));
        }

        if self.registry.resolve(name).await.is_none() {
            self.ensure_ready(backend_id).await?;
        }

        let outcome = self.registry.dispatch(name, arguments, session_id).await;
        if let Ok(backend) = self.backend(backend_id) {
            self.reconcile(backend).await;
        }
        outcome
    }

    /// One supervision pass over every backend, run concurrently so a slow
    /// backend never delays the others.
    pub async fn run_health_checks(&self) {
        let cancel = self.shutdown.clone();
        join_all(self.backends.values().map(|backend| {
            let cancel = cancel.clone();
            async move {
                match backend.health_check().await {
                    HealthOutcome::Healthy => backend.note_healthy(),
                    HealthOutcome::Skipped => {}
                    HealthOutcome::Unhealthy(reason) => {
                        tracing::warn!(backend = %backend.id(), %reason, "health probe failed");
                        backend.mark_degraded(&reason);
                        if backend.kind() == TransportKind::Stdio {
                            match backend.restart_with_backoff(&cancel).await {
                                Ok(()) => tracing::info!(backend = %backend.id(), "backend restarted"),
                                Err(e) => tracing::error!(backend = %backend.id(), error = %e, "backend restart abandoned"),
                            }
                        }
                    }
                }
                self.reconcile(backend).await;
            }
        }))
        .await;
    }

    pub fn health_report(&self) -> HealthReport {
        let servers: BTreeMap<String, BackendSnapshot> = self
            .backends
            .values()
            .map(|b| (b.id().to_string(), b.snapshot()))
            .collect();
        let failed = servers.values().any(|s| s.state == BackendState::Failed);

        HealthReport {
            status: if failed { "unhealthy" } else { "healthy" },
            spec_version: SPEC_VERSION,
            gateway_version: env!("CARGO_PKG_VERSION"),
            servers,
        }
    }

    /// Flags the gateway as closed through `/close`. Returns false if it
    /// already was.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Stops the supervisor, closes every connection and kills every
    /// process. Idempotent; returns how many backends were terminated.
    pub async fn shutdown(&self) -> usize {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return 0;
        }
        tracing::info!("gateway shutting down");
        self.shutdown.cancel();

        let closed = join_all(self.backends.values().map(|b| b.shutdown()))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();
        let stray = self.arena.terminate_all().await;
        if stray > 0 {
            tracing::warn!(stray, "killed processes left behind by closed backends");
        }

        tracing::info!(terminated = closed, "gateway stopped");
        closed
    }
}
