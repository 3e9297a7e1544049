//! The discovery document printed on stdout once the listener is bound, so
//! whatever launched the gateway can find its endpoints.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

use crate::config::{GatewayConfig, Mode};

/// Entry name used for the single unified endpoint.
pub const UNIFIED_ENTRY: &str = "mcpgate";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryEntry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDocument {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, DiscoveryEntry>,
}

/// Builds the document for `config`, using `port` as the reachable port
/// (the bound one, which differs from the configured one when it was 0).
pub fn discovery_document(config: &GatewayConfig, port: u16) -> DiscoveryDocument {
    let base = format!("http://{}:{}", config.domain, port);
    let headers = config.api_key.as_ref().map(|key| {
        BTreeMap::from([("Authorization".to_string(), key.clone())])
    });

    let entry = |url: String| DiscoveryEntry {
        kind: "http",
        url,
        headers: headers.clone(),
    };

    let mcp_servers = match config.mode {
        Mode::Routed => config
            .backends
            .keys()
            .map(|id| (id.clone(), entry(format!("{base}/mcp/{id}"))))
            .collect(),
        Mode::Unified => {
            BTreeMap::from([(UNIFIED_ENTRY.to_string(), entry(format!("{base}/mcp")))])
        }
    };

    DiscoveryDocument { mcp_servers }
}

/// Pretty-prints the document to `out` followed by a newline.
pub fn write_discovery(
    out: &mut impl Write,
    document: &DiscoveryDocument,
) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, document)?;
    writeln!(out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSpec, HttpSpec};
    use serde_json::json;

    fn config(mode: Mode, api_key: Option<&str>) -> GatewayConfig {
        let mut config = GatewayConfig::with_backends([
            BackendSpec::http("alpha", HttpSpec::new("http://a/mcp")),
            BackendSpec::http("beta", HttpSpec::new("http://b/mcp")),
        ]);
        config.mode = mode;
        config.api_key = api_key.map(str::to_string);
        config
    }

    #[test]
    fn routed_lists_every_backend() {
        let doc = discovery_document(&config(Mode::Routed, Some("k1")), 8080);
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"mcpServers": {
                "alpha": {"type": "http", "url": "http://localhost:8080/mcp/alpha",
                          "headers": {"Authorization": "k1"}},
                "beta": {"type": "http", "url": "http://localhost:8080/mcp/beta",
                         "headers": {"Authorization": "k1"}}
            }})
        );
    }

    #[test]
    fn unified_has_single_entry_without_headers() {
        let doc = discovery_document(&config(Mode::Unified, None), 3000);
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"mcpServers": {
                "mcpgate": {"type": "http", "url": "http://localhost:3000/mcp"}
            }})
        );
    }

    #[test]
    fn written_document_is_pretty_and_terminated() {
        let mut out = Vec::new();
        write_discovery(&mut out, &discovery_document(&config(Mode::Unified, None), 3000)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"mcpServers\""));
    }
}
