use mcpgate::config::{
    load_from_path, load_from_str, ConfigError, LaunchTarget, Mode, TransportSpec,
};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Sets environment variables for one test and restores them on drop.
struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    fn set(vars: &[(&str, Option<&str>)]) -> Self {
        let saved = vars
            .iter()
            .map(|(name, value)| {
                let previous = std::env::var(name).ok();
                match value {
                    Some(v) => std::env::set_var(name, v),
                    None => std::env::remove_var(name),
                }
                (name.to_string(), previous)
            })
            .collect();
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, previous) in &self.saved {
            match previous {
                Some(v) => std::env::set_var(name, v),
                None => std::env::remove_var(name),
            }
        }
    }
}

#[test]
#[serial]
fn test_variables_expand_in_env_headers_and_api_key() {
    let _env = EnvGuard::set(&[
        ("MCPGATE_TEST_TOKEN", Some("ghp_abcdef")),
        ("MCPGATE_TEST_KEY", Some("gateway-key")),
        ("MCPGATE_TEST_HOST", Some("docs.internal")),
    ]);

    let config = load_from_str(
        r#"{
            "mcpServers": {
                "github": {"container": "ghcr.io/github/github-mcp-server",
                           "env": {"GITHUB_TOKEN": "${MCPGATE_TEST_TOKEN}", "MODE": "ro"}},
                "docs": {"type": "http", "url": "https://${MCPGATE_TEST_HOST}/mcp",
                         "headers": {"Authorization": "Bearer ${MCPGATE_TEST_TOKEN}"}}
            },
            "gateway": {"apiKey": "${MCPGATE_TEST_KEY}", "port": 8080}
        }"#,
    )
    .unwrap();

    assert_eq!(config.api_key.as_deref(), Some("gateway-key"));
    assert_eq!(config.port, 8080);
    assert_eq!(config.mode, Mode::Unified);

    let TransportSpec::Stdio(github) = &config.backends["github"].transport else {
        panic!("github should be stdio");
    };
    assert_eq!(github.env["GITHUB_TOKEN"], "ghp_abcdef");
    assert_eq!(github.env["MODE"], "ro");

    let TransportSpec::Http(docs) = &config.backends["docs"].transport else {
        panic!("docs should be http");
    };
    assert_eq!(docs.url, "https://docs.internal/mcp");
    assert_eq!(docs.headers["Authorization"], "Bearer ghp_abcdef");
}

#[test]
#[serial]
fn test_undefined_variable_names_path() {
    let _env = EnvGuard::set(&[("MCPGATE_TEST_MISSING", None)]);

    let err = load_from_str(
        r#"{"mcpServers": {"a": {"container": "img", "env": {"TOKEN": "${MCPGATE_TEST_MISSING}"}}}}"#,
    )
    .unwrap_err();

    match err {
        ConfigError::UndefinedVariable { path, name } => {
            assert_eq!(path, "mcpServers.a.env.TOKEN");
            assert_eq!(name, "MCPGATE_TEST_MISSING");
        }
        other => panic!("expected undefined variable, got {other:?}"),
    }
}

#[test]
#[serial]
fn test_empty_api_key_disables_auth() {
    let _env = EnvGuard::set(&[("MCPGATE_TEST_EMPTY", Some(""))]);

    let config = load_from_str(r#"{"gateway": {"apiKey": "${MCPGATE_TEST_EMPTY}"}}"#).unwrap();
    assert!(config.api_key.is_none());
}

#[test]
fn test_container_and_command_are_exclusive() {
    let err = load_from_str(
        r#"{"mcpServers": {"a": {"container": "img", "command": "/bin/server"}}}"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("mutually exclusive"), "{err}");

    let config =
        load_from_str(r#"{"mcpServers": {"a": {"command": "/bin/server", "args": ["--stdio"]}}}"#)
            .unwrap();
    let TransportSpec::Stdio(stdio) = &config.backends["a"].transport else {
        panic!("a should be stdio");
    };
    assert_eq!(
        stdio.target,
        LaunchTarget::Command {
            program: "/bin/server".into(),
            args: vec!["--stdio".into()]
        }
    );
}

#[test]
fn test_default_backend_must_exist() {
    let err = load_from_str(
        r#"{"mcpServers": {"a": {"container": "img"}}, "gateway": {"defaultBackend": "b"}}"#,
    )
    .unwrap_err();
    assert!(
        matches!(err, ConfigError::Invalid { ref path, .. } if path == "gateway.defaultBackend"),
        "{err}"
    );
}

#[test]
fn test_tool_allow_list_is_kept() {
    let config = load_from_str(
        r#"{"mcpServers": {"a": {"container": "img", "tools": ["search", "fetch"]}}}"#,
    )
    .unwrap();
    let spec = &config.backends["a"];
    assert!(spec.allows_tool("search"));
    assert!(!spec.allows_tool("delete"));
}

#[test]
fn test_load_from_path_and_bad_json() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"mcpServers": {{"a": {{"container": "img"}}}}, "gateway": {{"startupTimeout": 5, "eagerStart": false}}}}"#
    )
    .unwrap();

    let config = load_from_path(file.path()).unwrap();
    assert_eq!(config.startup_timeout, Duration::from_secs(5));
    assert!(!config.eager_start);

    let err = load_from_str("{\"mcpServers\": ").unwrap_err();
    assert!(matches!(err, ConfigError::Json(_)));

    let err = load_from_path("/definitely/not/here.json").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
