use claps::config::{AdminConfig, GlobalConfig};

#[test]
fn minimal_config_gets_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config is valid");
    assert_eq!(config.gateway_port, 3001);
    assert_eq!(config.session_max_age_hours, 24);
    assert_eq!(config.agent.binary, "claude");
    assert_eq!(config.agent.timeout_seconds, 600);
    assert_eq!(config.agent.max_output_size, 1024 * 1024);
    assert!(config.slack.is_none());
    assert!(config.line.is_none());
}

#[test]
fn derived_paths_nest_under_home() {
    let config = GlobalConfig::from_toml_str("home_dir = '/tmp/claps-test'").expect("config");
    assert_eq!(
        config.sessions_path().to_string_lossy(),
        "/tmp/claps-test/sessions.json"
    );
    assert_eq!(
        config.auth_token_path().to_string_lossy(),
        "/tmp/claps-test/auth-token"
    );
    assert_eq!(
        config.repo_dir("octo", "demo").to_string_lossy(),
        "/tmp/claps-test/repos/octo/demo"
    );
    assert_eq!(
        config.shared_workspace_dir().to_string_lossy(),
        "/tmp/claps-test/workspace"
    );
}

#[test]
fn zero_gateway_port_is_rejected() {
    let err = GlobalConfig::from_toml_str("gateway_port = 0").expect_err("must fail");
    assert!(err.to_string().contains("gateway_port"));
}

#[test]
fn malformed_repo_spec_is_rejected() {
    let toml = r#"
[github]
repos = ["not-a-repo-spec"]
"#;
    let err = GlobalConfig::from_toml_str(toml).expect_err("must fail");
    assert!(err.to_string().contains("owner/repo"));
}

#[test]
fn agent_section_overrides_apply() {
    let toml = r#"
[agent]
binary = "my-agent"
timeout_seconds = 30
max_output_size = 4096
sanitize_env = true
"#;
    let config = GlobalConfig::from_toml_str(toml).expect("config");
    assert_eq!(config.agent.binary, "my-agent");
    assert_eq!(config.agent.timeout_seconds, 30);
    assert_eq!(config.agent.max_output_size, 4096);
    assert!(config.agent.sanitize_env);
}

#[test]
fn admin_config_defaults_when_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let admin = AdminConfig::load_or_default(&temp.path().join("absent.json"));
    assert!(admin.user_mappings.is_empty());
    assert!(admin.allowed_users.slack.is_empty());
}

#[test]
fn admin_config_malformed_falls_back_to_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("admin-config.json");
    std::fs::write(&path, "{not json").expect("write");
    let admin = AdminConfig::load_or_default(&path);
    assert!(admin.user_mappings.is_empty());
}

#[test]
fn admin_config_parses_mappings() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("admin-config.json");
    std::fs::write(
        &path,
        r#"{
  "allowed_users": { "slack": ["U1"], "line": [], "http": [] },
  "user_mappings": [
    { "slack_id": "U1", "github_handle": "octocat" }
  ],
  "admin_slack_id": "U0"
}"#,
    )
    .expect("write");
    let admin = AdminConfig::load_or_default(&path);
    assert_eq!(admin.allowed_users.slack, vec!["U1"]);
    assert_eq!(admin.user_mappings.len(), 1);
    assert_eq!(admin.admin_slack_id.as_deref(), Some("U0"));
}
