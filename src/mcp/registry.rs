//! Thread-safe aggregated tool catalog
//!
//! Each backend's advertised tools are stored under a namespaced key
//! (`{backend}___{tool}`). A backend re-registering replaces exactly its own
//! slice of the catalog, so restarts never leave duplicates behind.
//! Uses a `tokio::sync::RwLock` for shared-read, exclusive-write access.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::mcp::schema::normalize_input_schema;
use crate::mcp::types::{JsonRpcResponse, Tool};

/// Separator between backend id and tool name in the unified catalog.
pub const NAMESPACE_SEPARATOR: &str = "___";

/// Builds `{backend}___{tool}`.
pub fn namespaced_name(backend_id: &str, tool_name: &str) -> String {
    format!("{backend_id}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Splits a namespaced name at the first separator.
///
/// Backend ids never contain the separator and never end with `_`, so the
/// first occurrence is always the boundary.
///
/// ```
/// use mcpgate::mcp::registry::split_namespaced;
///
/// assert_eq!(split_namespaced("git___log___x"), Some(("git", "log___x")));
/// assert_eq!(split_namespaced("plain"), None);
/// ```
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (backend, tool) = name.split_once(NAMESPACE_SEPARATOR)?;
    if backend.is_empty() || tool.is_empty() {
        return None;
    }
    Some((backend, tool))
}

/// Something that can execute a tool call by its backend-local name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse>;
}

/// One tool in the aggregated catalog.
#[derive(Clone)]
pub struct ToolEntry {
    pub namespaced_name: String,
    pub backend_id: String,
    pub original_name: String,
    pub description: Option<String>,
    /// Normalized input schema.
    pub input_schema: Value,
    /// Fields the gateway passes through untouched (`annotations`, ...).
    pub extra: Map<String, Value>,
    /// False once the owning backend has failed for good.
    pub available: bool,
    handler: Arc<dyn ToolDispatch>,
}

impl fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEntry")
            .field("namespaced_name", &self.namespaced_name)
            .field("backend_id", &self.backend_id)
            .field("original_name", &self.original_name)
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

impl ToolEntry {
    /// The tool as listed on the unified surface: namespaced name and a
    /// `[backend]` marker in front of the description.
    pub fn to_unified_tool(&self) -> Tool {
        let description = match &self.description {
            Some(desc) if !desc.is_empty() => format!("[{}] {}", self.backend_id, desc),
            _ => format!("[{}]", self.backend_id),
        };
        Tool {
            name: self.namespaced_name.clone(),
            description: Some(description),
            input_schema: Some(self.input_schema.clone()),
            extra: self.extra.clone(),
        }
    }

    /// The tool under its original name with the normalized schema.
    pub fn to_backend_tool(&self) -> Tool {
        Tool {
            name: self.original_name.clone(),
            description: self.description.clone(),
            input_schema: Some(self.input_schema.clone()),
            extra: self.extra.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<String, ToolEntry>,
    /// Catalog generation each backend was last registered from.
    generations: HashMap<String, u64>,
}

/// The unified tool catalog.
///
/// # Examples
///
/// ```rust,no_run
/// use mcpgate::mcp::registry::{ToolDispatch, ToolRegistry};
/// use mcpgate::mcp::types::Tool;
/// use std::sync::Arc;
///
/// # async fn example(tools: Vec<Tool>, handler: Arc<dyn ToolDispatch>) {
/// let registry = ToolRegistry::new();
/// registry.register("github", &tools, None, handler).await;
/// let entry = registry.resolve("github___search_issues").await;
/// # }
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every entry of `backend_id` with `tools`.
    ///
    /// Tools outside `allow` are skipped. A tool name reported twice by the
    /// same backend keeps its first definition. Returns the number of
    /// entries registered.
    pub async fn register(
        &self,
        backend_id: &str,
        tools: &[Tool],
        allow: Option<&[String]>,
        handler: Arc<dyn ToolDispatch>,
    ) -> usize {
        let mut state = self.state.write().await;
        Self::register_locked(&mut state, backend_id, tools, allow, handler)
    }

    /// Registers `tools` unless the registry already holds this catalog
    /// generation for the backend. Returns `None` when nothing changed.
    pub async fn sync(
        &self,
        backend_id: &str,
        generation: u64,
        tools: &[Tool],
        allow: Option<&[String]>,
        handler: Arc<dyn ToolDispatch>,
    ) -> Option<usize> {
        if self.state.read().await.generations.get(backend_id) == Some(&generation) {
            return None;
        }

        let mut state = self.state.write().await;
        // Re-check under the write lock; a concurrent sync may have won.
        if state.generations.get(backend_id) == Some(&generation) {
            return None;
        }
        let count = Self::register_locked(&mut state, backend_id, tools, allow, handler);
        state.generations.insert(backend_id.to_string(), generation);
        Some(count)
    }

    fn register_locked(
        state: &mut RegistryState,
        backend_id: &str,
        tools: &[Tool],
        allow: Option<&[String]>,
        handler: Arc<dyn ToolDispatch>,
    ) -> usize {
        state
            .entries
            .retain(|_, entry| entry.backend_id != backend_id);

        let mut count = 0;
        for tool in tools {
            if tool.name.is_empty() {
                tracing::warn!(backend = %backend_id, "skipping tool without a name");
                continue;
            }
            if let Some(allowed) = allow {
                if !allowed.iter().any(|name| name == &tool.name) {
                    tracing::debug!(backend = %backend_id, tool = %tool.name, "tool not in allow-list");
                    continue;
                }
            }

            let key = namespaced_name(backend_id, &tool.name);
            if state.entries.contains_key(&key) {
                tracing::warn!(backend = %backend_id, tool = %tool.name, "duplicate tool name, keeping the first definition");
                continue;
            }

            state.entries.insert(
                key.clone(),
                ToolEntry {
                    namespaced_name: key,
                    backend_id: backend_id.to_string(),
                    original_name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: normalize_input_schema(tool.input_schema.clone(), &tool.name),
                    extra: tool.extra.clone(),
                    available: true,
                    handler: handler.clone(),
                },
            );
            count += 1;
        }

        tracing::info!(backend = %backend_id, tools = count, "registered backend tools");
        count
    }

    /// Removes every entry of `backend_id`. Returns how many were removed.
    pub async fn unregister(&self, backend_id: &str) -> usize {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.backend_id != backend_id);
        state.generations.remove(backend_id);
        before - state.entries.len()
    }

    /// Keeps the backend's entries resolvable but hides them from listings;
    /// dispatching one reports the backend as unavailable.
    pub async fn mark_unavailable(&self, backend_id: &str) {
        let mut state = self.state.write().await;
        for entry in state
            .entries
            .values_mut()
            .filter(|entry| entry.backend_id == backend_id)
        {
            entry.available = false;
        }
        // Force the next sync to re-register once the backend recovers.
        state.generations.remove(backend_id);
    }

    pub async fn resolve(&self, namespaced_name: &str) -> Option<ToolEntry> {
        self.state.read().await.entries.get(namespaced_name).cloned()
    }

    /// The backend's entries, sorted by original name.
    pub async fn list_for_backend(&self, backend_id: &str) -> Vec<ToolEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<ToolEntry> = state
            .entries
            .values()
            .filter(|entry| entry.backend_id == backend_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.original_name.cmp(&b.original_name));
        entries
    }

    /// Every available entry, sorted by namespaced name.
    pub async fn list_all(&self) -> Vec<ToolEntry> {
        self.state
            .read()
            .await
            .entries
            .values()
            .filter(|entry| entry.available)
            .cloned()
            .collect()
    }

    pub async fn contains_backend(&self, backend_id: &str) -> bool {
        let state = self.state.read().await;
        state.generations.contains_key(backend_id)
            || state.entries.values().any(|e| e.backend_id == backend_id)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Looks up `namespaced_name` and forwards the call to its backend
    /// under the original tool name.
    pub async fn dispatch(
        &self,
        namespaced_name: &str,
        arguments: Value,
        session_id: Option<String>,
    ) -> Result<JsonRpcResponse> {
        let entry = self
            .resolve(namespaced_name)
            .await
            .ok_or_else(|| GatewayError::ToolNotFound(namespaced_name.to_string()))?;

        if !entry.available {
            return Err(GatewayError::Unavailable {
                backend: entry.backend_id,
                reason: "backend has failed and its tools are unavailable".to_string(),
            });
        }

        tracing::debug!(
            tool = %namespaced_name,
            backend = %entry.backend_id,
            "dispatching tool call"
        );
        entry
            .handler
            .call_tool(&entry.original_name, arguments, session_id)
            .await
    }
}
