use claps::models::worklog::WorkLogEvent;
use claps::runner::{classify_line, extract_pr_url, tool_details, StreamEvent};
use serde_json::json;

#[test]
fn system_event_yields_session_id() {
    let line = r#"{"type":"system","subtype":"init","session_id":"sess-123"}"#;
    let events = classify_line(line);
    assert_eq!(events, vec![StreamEvent::SessionId("sess-123".into())]);
}

#[test]
fn permission_request_yields_approval_pending() {
    let line = r#"{"type":"system","subtype":"permission_request","tool":"Bash"}"#;
    let events = classify_line(line);
    assert_eq!(
        events,
        vec![StreamEvent::WorkLog(WorkLogEvent::ApprovalPending {
            tool: "Bash".into()
        })]
    );
}

#[test]
fn assistant_tool_use_yields_tool_start() {
    let line = json!({
        "type": "assistant",
        "message": { "content": [
            { "type": "tool_use", "name": "Edit", "input": { "file_path": "src/a.rs" } }
        ]}
    })
    .to_string();
    let events = classify_line(&line);
    assert_eq!(
        events,
        vec![StreamEvent::WorkLog(WorkLogEvent::ToolStart {
            tool: "Edit".into(),
            details: "src/a.rs".into()
        })]
    );
}

#[test]
fn assistant_thinking_truncates_to_100_chars() {
    let thought = "t".repeat(250);
    let line = json!({
        "type": "assistant",
        "message": { "content": [ { "type": "thinking", "thinking": thought } ] }
    })
    .to_string();
    let events = classify_line(&line);
    match &events[0] {
        StreamEvent::WorkLog(WorkLogEvent::Thinking { details }) => {
            assert_eq!(details.chars().count(), 100);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn assistant_text_is_not_a_work_log_event() {
    let line = json!({
        "type": "assistant",
        "message": { "content": [ { "type": "text", "text": "final words" } ] }
    })
    .to_string();
    let events = classify_line(&line);
    assert_eq!(events, vec![StreamEvent::AssistantText("final words".into())]);
}

#[test]
fn tool_result_yields_end_or_error() {
    let ok = json!({
        "type": "user",
        "message": { "content": [ { "type": "tool_result", "is_error": false, "content": "ok" } ] }
    })
    .to_string();
    assert_eq!(
        classify_line(&ok),
        vec![StreamEvent::WorkLog(WorkLogEvent::ToolEnd)]
    );

    let err = json!({
        "type": "user",
        "message": { "content": [ { "type": "tool_result", "is_error": true, "content": "bad" } ] }
    })
    .to_string();
    assert_eq!(
        classify_line(&err),
        vec![StreamEvent::WorkLog(WorkLogEvent::Error)]
    );
}

#[test]
fn result_event_yields_final_text() {
    let line = r#"{"type":"result","result":"all done"}"#;
    assert_eq!(
        classify_line(line),
        vec![StreamEvent::FinalResult("all done".into())]
    );
}

#[test]
fn empty_and_malformed_lines_are_skipped() {
    assert!(classify_line("").is_empty());
    assert!(classify_line("   ").is_empty());
    assert!(classify_line("{not json").is_empty());
    assert!(classify_line(r#"{"type":"unknown"}"#).is_empty());
}

#[test]
fn tool_details_per_tool() {
    assert_eq!(
        tool_details("Read", &json!({ "file_path": "/a/b.rs" })),
        "/a/b.rs"
    );
    let long_command = "c".repeat(150);
    let details = tool_details("Bash", &json!({ "command": long_command }));
    assert_eq!(details.chars().count(), 100);
    assert_eq!(tool_details("Glob", &json!({ "pattern": "**/*.rs" })), "**/*.rs");
    assert_eq!(tool_details("Grep", &json!({ "pattern": "fn main" })), "fn main");
    assert_eq!(
        tool_details("Task", &json!({ "description": "explore" })),
        "explore"
    );
    assert_eq!(tool_details("WebFetch", &json!({ "url": "u" })), "");
}

#[test]
fn pr_url_extraction() {
    let text = "Opened https://github.com/octo/demo/pull/17 for review";
    assert_eq!(
        extract_pr_url(text).as_deref(),
        Some("https://github.com/octo/demo/pull/17")
    );
    assert!(extract_pr_url("no links here").is_none());
    assert!(
        extract_pr_url("https://github.com/octo/demo/issues/17").is_none(),
        "issue links are not PR links"
    );
}

#[test]
fn work_log_rendering() {
    let start = WorkLogEvent::ToolStart {
        tool: "Bash".into(),
        details: "ls".into(),
    };
    assert_eq!(start.render(), "🔧 Bash: ls");
    let bare = WorkLogEvent::ToolStart {
        tool: "Task".into(),
        details: String::new(),
    };
    assert_eq!(bare.render(), "🔧 Task");
    assert_eq!(
        WorkLogEvent::ApprovalPending { tool: "Edit".into() }.render(),
        "⏳ waiting for approval: Edit"
    );
}
