//! JSON configuration decoding, `${VAR}` expansion and fail-fast validation.
//!
//! Accepted document:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "github": {"type": "stdio", "container": "ghcr.io/github/github-mcp-server",
//!                "env": {"GITHUB_TOKEN": "${GITHUB_TOKEN}"}},
//!     "docs":   {"type": "http", "url": "https://docs.example.com/mcp"}
//!   },
//!   "gateway": {"port": 3000, "apiKey": "${MCP_GATEWAY_API_KEY}",
//!               "startupTimeout": 60, "toolTimeout": 120}
//! }
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::gateway::{
    BackendSpec, GatewayConfig, HttpSpec, LaunchTarget, Mode, StdioSpec, TransportSpec,
    DEFAULT_DOMAIN, DEFAULT_PORT, DEFAULT_STARTUP_TIMEOUT, DEFAULT_TOOL_TIMEOUT,
};
use crate::mcp::registry::NAMESPACE_SEPARATOR;
use crate::mcp::sys::SYS_BACKEND_ID;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error at {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("undefined environment variable '{name}' referenced at {path}")]
    UndefinedVariable { path: String, name: String },
}

impl ConfigError {
    fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }
}

// Patterns are compile-time constants.
#[allow(clippy::unwrap_used)]
static VARIABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

#[allow(clippy::unwrap_used)]
static BACKEND_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9_-]*[A-Za-z0-9-])?$").unwrap());

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    mcp_servers: BTreeMap<String, RawServer>,
    #[serde(default)]
    gateway: Option<RawGateway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServer {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    container: Option<String>,
    entrypoint: Option<String>,
    #[serde(default)]
    entrypoint_args: Vec<String>,
    #[serde(default)]
    mounts: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    tools: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGateway {
    port: Option<i64>,
    api_key: Option<String>,
    domain: Option<String>,
    startup_timeout: Option<i64>,
    tool_timeout: Option<i64>,
    default_backend: Option<String>,
    eager_start: Option<bool>,
}

/// Parses and validates a configuration document.
pub fn load_from_str(json: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = serde_json::from_str(json)?;
    build_config(raw)
}

pub fn load_from_reader(mut reader: impl Read) -> Result<GatewayConfig, ConfigError> {
    let mut json = String::new();
    reader.read_to_string(&mut json)?;
    load_from_str(&json)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    load_from_str(&json)
}

/// Expands `${VAR}` references from the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::UndefinedVariable`] naming the first variable
/// that is not set, together with the JSON path it appeared at.
pub fn expand_variables(value: &str, path: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;

    let expanded = VARIABLE_PATTERN.replace_all(value, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                caps[0].to_string()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::UndefinedVariable {
            path: path.to_string(),
            name,
        }),
        None => Ok(expanded.into_owned()),
    }
}

fn build_config(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let gateway = raw.gateway.unwrap_or_default();

    let port = match gateway.port {
        None => DEFAULT_PORT,
        Some(p) => u16::try_from(p)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| {
                ConfigError::invalid("gateway.port", format!("port must be 1-65535, got {p}"))
            })?,
    };

    let startup_timeout = timeout_secs(
        gateway.startup_timeout,
        "gateway.startupTimeout",
        DEFAULT_STARTUP_TIMEOUT,
    )?;
    let tool_timeout = timeout_secs(
        gateway.tool_timeout,
        "gateway.toolTimeout",
        DEFAULT_TOOL_TIMEOUT,
    )?;

    let api_key = gateway
        .api_key
        .map(|k| expand_variables(&k, "gateway.apiKey"))
        .transpose()?
        .filter(|k| !k.is_empty());

    let domain = gateway
        .domain
        .map(|d| expand_variables(&d, "gateway.domain"))
        .transpose()?
        .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());

    let mut backends = BTreeMap::new();
    for (id, server) in raw.mcp_servers {
        let spec = build_backend(&id, server)?;
        backends.insert(id, spec);
    }

    if let Some(default) = &gateway.default_backend {
        if !backends.contains_key(default) {
            return Err(ConfigError::invalid(
                "gateway.defaultBackend",
                format!("'{default}' is not a configured backend"),
            ));
        }
    }

    Ok(GatewayConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], port)),
        port,
        domain,
        mode: Mode::default(),
        api_key,
        startup_timeout,
        tool_timeout,
        default_backend: gateway.default_backend,
        eager_start: gateway.eager_start.unwrap_or(true),
        backends,
    })
}

fn timeout_secs(
    value: Option<i64>,
    path: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(secs) if secs >= 1 => Ok(Duration::from_secs(secs as u64)),
        Some(secs) => Err(ConfigError::invalid(
            path,
            format!("must be at least 1 second, got {secs}"),
        )),
    }
}

fn validate_backend_id(id: &str) -> Result<(), ConfigError> {
    let path = format!("mcpServers.{id}");
    if id.contains(NAMESPACE_SEPARATOR) {
        return Err(ConfigError::invalid(
            path,
            format!("backend id must not contain '{NAMESPACE_SEPARATOR}'"),
        ));
    }
    if id == SYS_BACKEND_ID {
        return Err(ConfigError::invalid(path, "backend id 'sys' is reserved"));
    }
    if !BACKEND_ID_PATTERN.is_match(id) {
        return Err(ConfigError::invalid(
            path,
            "backend id may only contain letters, digits, '-' and '_', and must not end with '_'",
        ));
    }
    Ok(())
}

fn build_backend(id: &str, server: RawServer) -> Result<BackendSpec, ConfigError> {
    validate_backend_id(id)?;
    let path = format!("mcpServers.{id}");

    let kind = match server.kind.as_deref() {
        None | Some("") | Some("stdio") | Some("local") => "stdio",
        Some("http") => "http",
        Some(other) => {
            return Err(ConfigError::invalid(
                format!("{path}.type"),
                format!("unsupported server type '{other}' (expected 'stdio' or 'http')"),
            ))
        }
    };

    let transport = if kind == "http" {
        let url = server
            .url
            .ok_or_else(|| ConfigError::invalid(&path, "'url' is required for http servers"))?;
        let url = expand_variables(&url, &format!("{path}.url"))?;
        reqwest::Url::parse(&url)
            .map_err(|e| ConfigError::invalid(format!("{path}.url"), e.to_string()))?;

        let mut headers = BTreeMap::new();
        for (name, value) in server.headers {
            let expanded = expand_variables(&value, &format!("{path}.headers.{name}"))?;
            headers.insert(name, expanded);
        }
        TransportSpec::Http(HttpSpec { url, headers })
    } else {
        let target = match (server.container, server.command) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::invalid(
                    &path,
                    "'container' and 'command' are mutually exclusive",
                ))
            }
            (Some(image), None) => {
                for (i, mount) in server.mounts.iter().enumerate() {
                    validate_mount(mount, &format!("{path}.mounts[{i}]"))?;
                }
                LaunchTarget::Container {
                    image,
                    entrypoint: server.entrypoint,
                    entrypoint_args: server.entrypoint_args,
                    mounts: server.mounts,
                }
            }
            (None, Some(program)) => LaunchTarget::Command {
                program,
                args: server.args,
            },
            (None, None) => {
                return Err(ConfigError::invalid(
                    &path,
                    "stdio servers need a 'container' (or a local 'command')",
                ))
            }
        };

        let mut env = BTreeMap::new();
        for (key, value) in server.env {
            let expanded = expand_variables(&value, &format!("{path}.env.{key}"))?;
            env.insert(key, expanded);
        }
        TransportSpec::Stdio(StdioSpec { target, env })
    };

    Ok(BackendSpec {
        id: id.to_string(),
        transport,
        tools: server.tools,
    })
}

fn validate_mount(mount: &str, path: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = mount.split(':').collect();
    match parts.as_slice() {
        [source, dest, mode] if !source.is_empty() && !dest.is_empty() => {
            if *mode == "ro" || *mode == "rw" {
                Ok(())
            } else {
                Err(ConfigError::invalid(
                    path,
                    format!("invalid mount mode '{mode}' (must be 'ro' or 'rw')"),
                ))
            }
        }
        _ => Err(ConfigError::invalid(
            path,
            format!("invalid mount '{mount}' (expected 'source:dest:mode')"),
        )),
    }
}
