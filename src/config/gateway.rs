//! Validated, immutable gateway configuration.
//!
//! Produced by [`crate::config::loader`] and never mutated afterwards.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::sanitize::truncate_secret;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DOMAIN: &str = "localhost";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment forced onto every containerized backend so its stdout stays
/// machine-readable.
const CONTAINER_BASE_ENV: [&str; 3] = ["NO_COLOR=1", "TERM=dumb", "PYTHONUNBUFFERED=1"];

/// Which HTTP surface the gateway exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One path per backend, tool names untouched.
    Routed,
    /// One aggregated path with namespaced tool names.
    #[default]
    Unified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub port: u16,
    pub domain: String,
    pub mode: Mode,
    pub api_key: Option<String>,
    pub startup_timeout: Duration,
    pub tool_timeout: Duration,
    /// Target for methods the unified surface does not handle itself.
    pub default_backend: Option<String>,
    /// Launch every backend before the listener opens.
    pub eager_start: bool,
    pub backends: BTreeMap<String, BackendSpec>,
}

impl GatewayConfig {
    /// A configuration with defaults and the given backends, mostly useful
    /// for tests and embedding.
    pub fn with_backends(backends: impl IntoIterator<Item = BackendSpec>) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            port: DEFAULT_PORT,
            domain: DEFAULT_DOMAIN.to_string(),
            mode: Mode::default(),
            api_key: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            default_backend: None,
            eager_start: true,
            backends: backends
                .into_iter()
                .map(|spec| (spec.id.clone(), spec))
                .collect(),
        }
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub id: String,
    pub transport: TransportSpec,
    /// Tool allow-list; `None` exposes everything the backend reports.
    pub tools: Option<Vec<String>>,
}

impl BackendSpec {
    pub fn stdio(id: impl Into<String>, spec: StdioSpec) -> Self {
        Self {
            id: id.into(),
            transport: TransportSpec::Stdio(spec),
            tools: None,
        }
    }

    pub fn http(id: impl Into<String>, spec: HttpSpec) -> Self {
        Self {
            id: id.into(),
            transport: TransportSpec::Http(spec),
            tools: None,
        }
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportSpec::Stdio(_) => TransportKind::Stdio,
            TransportSpec::Http(_) => TransportKind::Http,
        }
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        match &self.tools {
            Some(allowed) => allowed.iter().any(|t| t == name),
            None => true,
        }
    }

    /// Human-readable launch target with secrets masked, for diagnostics.
    pub fn describe(&self) -> String {
        match &self.transport {
            TransportSpec::Stdio(stdio) => stdio.redacted_command_line(),
            TransportSpec::Http(http) => format!("POST {}", http.url),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSpec {
    Stdio(StdioSpec),
    Http(HttpSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchTarget {
    /// Run an image through `docker run -i`.
    Container {
        image: String,
        entrypoint: Option<String>,
        entrypoint_args: Vec<String>,
        mounts: Vec<String>,
    },
    /// Run a local program directly.
    Command { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StdioSpec {
    pub target: LaunchTarget,
    pub env: BTreeMap<String, String>,
}

impl StdioSpec {
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            target: LaunchTarget::Container {
                image: image.into(),
                entrypoint: None,
                entrypoint_args: Vec::new(),
                mounts: Vec::new(),
            },
            env: BTreeMap::new(),
        }
    }

    pub fn command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            target: LaunchTarget::Command {
                program: program.into(),
                args,
            },
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program and argument vector used to launch the backend.
    ///
    /// Containers become
    /// `docker run --rm -i -e NO_COLOR=1 -e TERM=dumb -e PYTHONUNBUFFERED=1
    /// [--entrypoint E] [-v MOUNT].. [-e KEY[=VALUE]].. IMAGE [ARGS]..`.
    /// An empty env value is passed by name so docker forwards the
    /// gateway's own value.
    pub fn command_line(&self) -> (String, Vec<String>) {
        self.build_command_line(|value| value.to_string())
    }

    /// Like [`command_line`](Self::command_line) with env values masked.
    pub fn redacted_command_line(&self) -> String {
        let (program, args) = self.build_command_line(truncate_secret);
        std::iter::once(program)
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Env applied to the spawned process itself. Containers receive theirs
    /// through `-e` flags instead.
    pub fn process_env(&self) -> impl Iterator<Item = (&String, &String)> {
        let direct = matches!(self.target, LaunchTarget::Command { .. });
        self.env.iter().filter(move |_| direct)
    }

    fn build_command_line(&self, render: impl Fn(&str) -> String) -> (String, Vec<String>) {
        match &self.target {
            LaunchTarget::Command { program, args } => (program.clone(), args.clone()),
            LaunchTarget::Container {
                image,
                entrypoint,
                entrypoint_args,
                mounts,
            } => {
                let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "-i".into()];
                for base in CONTAINER_BASE_ENV {
                    args.push("-e".into());
                    args.push(base.into());
                }
                if let Some(entrypoint) = entrypoint {
                    args.push("--entrypoint".into());
                    args.push(entrypoint.clone());
                }
                for mount in mounts {
                    args.push("-v".into());
                    args.push(mount.clone());
                }
                for (key, value) in &self.env {
                    args.push("-e".into());
                    if value.is_empty() {
                        args.push(key.clone());
                    } else {
                        args.push(format!("{key}={}", render(value)));
                    }
                }
                args.push(image.clone());
                args.extend(entrypoint_args.iter().cloned());
                ("docker".to_string(), args)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSpec {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl HttpSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
