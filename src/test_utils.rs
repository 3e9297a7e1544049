pub mod test_helpers {
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    use crate::backend::RestartPolicy;
    use crate::config::{BackendSpec, GatewayConfig, HttpSpec, Mode, StdioSpec};
    use crate::gateway::Gateway;
    use crate::process::ProcessArena;
    use crate::transport::TransportConnector;

    /// A stdio backend running the `mock-backend` binary at `bin` with the
    /// given environment.
    pub fn mock_backend_spec(bin: &str, id: &str, env: &[(&str, &str)]) -> BackendSpec {
        let spec = env
            .iter()
            .fold(StdioSpec::command(bin, Vec::new()), |spec, (k, v)| {
                spec.with_env(*k, *v)
            });
        BackendSpec::stdio(id, spec)
    }

    pub fn http_backend_spec(id: &str, url: &str) -> BackendSpec {
        BackendSpec::http(id, HttpSpec::new(url))
    }

    /// Short timeouts and lazy startup, so tests control when backends run.
    pub fn test_config(backends: Vec<BackendSpec>, mode: Mode) -> GatewayConfig {
        let mut config = GatewayConfig::with_backends(backends);
        config.mode = mode;
        config.startup_timeout = Duration::from_secs(10);
        config.tool_timeout = Duration::from_secs(5);
        config.eager_start = false;
        config
    }

    /// Restart policy with millisecond backoff.
    pub fn fast_restart_policy() -> RestartPolicy {
        RestartPolicy {
            base_delay: Duration::from_millis(10),
            ..RestartPolicy::default()
        }
    }

    /// A gateway on the production transports with [`fast_restart_policy`].
    pub fn test_gateway(config: GatewayConfig) -> Arc<Gateway> {
        let arena = ProcessArena::new();
        let connector = Arc::new(TransportConnector::new(arena.clone()));
        Arc::new(Gateway::with_connector(
            config,
            connector,
            arena,
            fast_restart_policy(),
        ))
    }

    /// Temporary file the mock backend appends to on every launch.
    pub struct LaunchLog {
        file: NamedTempFile,
    }

    impl LaunchLog {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self {
                file: NamedTempFile::new()?,
            })
        }

        pub fn path(&self) -> String {
            self.file.path().to_string_lossy().into_owned()
        }

        /// Launches recorded so far.
        pub fn count(&self) -> usize {
            let mut contents = String::new();
            if let Ok(mut file) = self.file.reopen() {
                let _ = file.read_to_string(&mut contents);
            }
            contents.lines().filter(|l| l.starts_with("launch")).count()
        }
    }

    pub fn rpc(id: impl Into<Value>, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id.into(), "method": method, "params": params})
    }

    /// `POST uri` with a JSON body and an optional raw Authorization value.
    pub fn post_json(uri: &str, body: &Value, authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = authorization {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_default()
    }
}
