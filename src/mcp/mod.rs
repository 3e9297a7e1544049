//! MCP protocol pieces shared by both HTTP surfaces
//!
//! # Architecture
//!
//! - [`types`] - JSON-RPC envelopes and the few MCP payloads the gateway reads
//! - [`schema`] - input schema normalization for aggregated tools
//! - [`registry`] - the namespaced tool catalog and [`ToolDispatch`] seam
//! - [`sys`] - gateway introspection tools under the reserved `sys` prefix

pub mod registry;
pub mod schema;
pub mod sys;
pub mod types;

pub use registry::{split_namespaced, ToolDispatch, ToolEntry, ToolRegistry, NAMESPACE_SEPARATOR};
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Tool};
