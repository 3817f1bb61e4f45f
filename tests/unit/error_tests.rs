use claps::AppError;

#[test]
fn display_prefixes_domain() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Git("clone".into()), "git: clone"),
        (AppError::Github("404".into()), "github: 404"),
        (AppError::Agent("spawn".into()), "agent: spawn"),
        (AppError::Gateway("token".into()), "gateway: token"),
        (AppError::Channel("slack".into()), "channel: slack"),
        (AppError::Session("persist".into()), "session: persist"),
        (AppError::Worktree("add".into()), "worktree: add"),
        (AppError::NotFound("task x".into()), "not found: task x"),
        (AppError::Unauthorized("nope".into()), "unauthorized: nope"),
        (AppError::Timeout("10m".into()), "timeout: 10m"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_and_json_conversions() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(io.to_string().starts_with("io: "));

    let json: AppError = serde_json::from_str::<serde_json::Value>("{oops")
        .expect_err("invalid json")
        .into();
    assert!(json.to_string().starts_with("json: "));
}

#[test]
fn toml_conversion_maps_to_config() {
    let err: AppError = toml::from_str::<claps::config::GlobalConfig>("gateway_port = 'x'")
        .expect_err("invalid toml")
        .into();
    assert!(err.to_string().starts_with("config: "));
}
