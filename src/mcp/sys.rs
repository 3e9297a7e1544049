//! Gateway introspection tools.
//!
//! These answer from the gateway itself and are never forwarded. On the
//! unified surface they appear as `sys___init` and `sys___list_servers`; on
//! the routed surface they live at `/mcp/sys` under their bare names.

use serde_json::{json, Map, Value};

use crate::error::{GatewayError, Result};
use crate::mcp::registry::namespaced_name;
use crate::mcp::types::{text_content, Tool};

/// Reserved backend id; configuration rejects it.
pub const SYS_BACKEND_ID: &str = "sys";
pub const SYS_PREFIX: &str = "sys___";

const INIT: &str = "init";
const LIST_SERVERS: &str = "list_servers";

/// The introspection tools under their bare names.
pub fn tools() -> Vec<Tool> {
    vec![
        Tool {
            name: INIT.to_string(),
            description: Some(
                "Initialize the gateway session and report the available servers".to_string(),
            ),
            input_schema: Some(json!({"type": "object", "properties": {}})),
            extra: Map::new(),
        },
        Tool {
            name: LIST_SERVERS.to_string(),
            description: Some("List every configured MCP server".to_string()),
            input_schema: Some(json!({"type": "object", "properties": {}})),
            extra: Map::new(),
        },
    ]
}

/// The introspection tools as listed on the unified surface.
pub fn unified_tools() -> Vec<Tool> {
    tools()
        .into_iter()
        .map(|mut tool| {
            tool.name = namespaced_name(SYS_BACKEND_ID, &tool.name);
            tool
        })
        .collect()
}

/// Runs an introspection tool by its bare name.
pub fn call(tool_name: &str, backend_ids: &[String]) -> Result<Value> {
    match tool_name {
        INIT => Ok(text_content(format!(
            "Gateway initialized. Available servers: [{}]",
            backend_ids.join(" ")
        ))),
        LIST_SERVERS => {
            let mut text = String::from("Configured MCP Servers:\n");
            for (i, id) in backend_ids.iter().enumerate() {
                text.push_str(&format!("{}. {}\n", i + 1, id));
            }
            Ok(text_content(text))
        }
        other => Err(GatewayError::ToolNotFound(namespaced_name(
            SYS_BACKEND_ID,
            other,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<String> {
        vec!["alpha".to_string(), "beta".to_string()]
    }

    #[test]
    fn init_lists_servers_inline() {
        let result = call("init", &ids()).unwrap();
        assert_eq!(
            result["content"][0]["text"],
            "Gateway initialized. Available servers: [alpha beta]"
        );
    }

    #[test]
    fn list_servers_is_numbered() {
        let result = call("list_servers", &ids()).unwrap();
        assert_eq!(
            result["content"][0]["text"],
            "Configured MCP Servers:\n1. alpha\n2. beta\n"
        );
    }

    #[test]
    fn unified_names_carry_prefix() {
        let names: Vec<String> = unified_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["sys___init", "sys___list_servers"]);
    }

    #[test]
    fn unknown_sys_tool_is_not_found() {
        assert!(matches!(
            call("reboot", &ids()),
            Err(GatewayError::ToolNotFound(name)) if name == "sys___reboot"
        ));
    }
}
