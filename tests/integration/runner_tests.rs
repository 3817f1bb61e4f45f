//! Agent runner behavior against a stub agent CLI.

use std::sync::Arc;

use claps::models::worklog::WorkLogEvent;
use claps::runner::{AgentInvocation, AgentRunner};

use super::test_helpers::{test_config, write_stub_agent};

fn invocation(dir: &std::path::Path) -> AgentInvocation {
    AgentInvocation {
        task_id: "task-1".into(),
        prompt: "say hello".into(),
        working_directory: dir.to_path_buf(),
        resume_session_id: None,
    }
}

#[tokio::test]
async fn captures_session_id_and_final_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"sess-9"}'
echo '{"type":"result","result":"hello from agent"}'"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;

    assert!(result.success);
    assert_eq!(result.session_id.as_deref(), Some("sess-9"));
    assert_eq!(result.output, "hello from agent");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn result_event_overrides_assistant_text() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"draft text"}]}}'
echo '{"type":"result","result":"final text"}'"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;
    assert_eq!(result.output, "final text");
}

#[tokio::test]
async fn assistant_text_is_the_fallback_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"line one"}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"line two"}]}}'"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;
    assert_eq!(result.output, "line one\nline two");
}

#[tokio::test]
async fn streams_work_log_events_while_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"user","message":{"content":[{"type":"tool_result","is_error":false,"content":"ok"}]}}'
echo '{"type":"result","result":"done"}'"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;
    assert!(result.success);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            WorkLogEvent::ToolStart {
                tool: "Bash".into(),
                details: "ls".into()
            },
            WorkLogEvent::ToolEnd,
        ]
    );
}

#[tokio::test]
async fn extracts_pr_url_from_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"result","result":"opened https://github.com/octo/demo/pull/5"}'"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;
    assert_eq!(
        result.pr_url.as_deref(),
        Some("https://github.com/octo/demo/pull/5")
    );
}

#[tokio::test]
async fn nonzero_exit_is_a_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"result","result":"partial"}'
exit 3"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;
    assert!(!result.success);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn missing_binary_is_a_failure_result_not_a_panic() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path(), "/nonexistent/agent-binary"));
    let runner = AgentRunner::new(config);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;
    assert!(!result.success);
    assert!(result.error.expect("error").contains("failed to spawn"));
}

#[tokio::test]
async fn hung_agent_is_terminated_with_a_timeout_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"sess-hung"}'
sleep 30"#,
    );
    let mut config = test_config(temp.path(), &agent.to_string_lossy());
    config.agent.timeout_seconds = 1;
    let runner = AgentRunner::new(Arc::new(config));

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let started = std::time::Instant::now();
    let result = runner.run(&invocation(temp.path()), tx).await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(
        result.error.expect("error").starts_with("Timeout after 1000ms"),
        "timeout failure names the configured deadline"
    );
    assert!(elapsed < std::time::Duration::from_secs(5), "SIGTERM is prompt");
}

#[tokio::test]
async fn output_cap_drops_excess_bytes() {
    let temp = tempfile::tempdir().expect("tempdir");
    // Flood stdout before the result event; with a small cap the result
    // line falls outside the captured window.
    let agent = write_stub_agent(
        temp.path(),
        r#"i=0
while [ $i -lt 200 ]; do
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}]}}'
  i=$((i+1))
done
echo '{"type":"result","result":"you should not see this"}'"#,
    );
    let mut config = test_config(temp.path(), &agent.to_string_lossy());
    config.agent.max_output_size = 2048;
    let runner = AgentRunner::new(Arc::new(config));

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation(temp.path()), tx).await;

    assert!(result.success, "the process itself exits cleanly");
    assert!(
        !result.output.contains("you should not see this"),
        "bytes past the cap are dropped"
    );
    assert!(result.output.len() <= 2048);
}

#[tokio::test]
async fn resume_flag_is_passed_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_stub_agent(
        temp.path(),
        r#"printf '%s\n' "$@" > last-args.txt
echo '{"type":"result","result":"ok"}'"#,
    );
    let config = Arc::new(test_config(temp.path(), &agent.to_string_lossy()));
    let runner = AgentRunner::new(config);

    let mut invocation = invocation(temp.path());
    invocation.resume_session_id = Some("sess-42".into());
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runner.run(&invocation, tx).await;
    assert!(result.success);

    let args = std::fs::read_to_string(temp.path().join("last-args.txt")).expect("args file");
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(args[0], "--dangerously-skip-permissions");
    assert_eq!(args[1], "--resume");
    assert_eq!(args[2], "sess-42");
    let p_index = args.iter().position(|a| *a == "-p").expect("-p flag");
    assert_eq!(args[p_index + 1], "say hello");
    assert!(args.contains(&"--output-format"));
    assert!(args.contains(&"stream-json"));
    assert!(args.contains(&"--verbose"));
}
