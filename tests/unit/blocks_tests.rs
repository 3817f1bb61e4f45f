use claps::channels::slack::blocks::{
    answer_note, approval_blocks, decision_note, question_blocks, ACTION_APPROVE_ALLOW,
    ACTION_APPROVE_DENY,
};
use claps::channels::slack::inbound::parse_target_repo;

#[test]
fn approval_blocks_have_header_preview_and_buttons() {
    let blocks = approval_blocks("req-1", "Bash", "rm -rf /tmp/x", Some("U1"));
    assert_eq!(blocks.len(), 3);

    let serialized = serde_json::to_string(&blocks).expect("serialize");
    assert!(serialized.contains("Bash"));
    assert!(serialized.contains("rm -rf /tmp/x"));
    assert!(serialized.contains(ACTION_APPROVE_ALLOW));
    assert!(serialized.contains(ACTION_APPROVE_DENY));
    assert!(serialized.contains("req-1"));
    assert!(serialized.contains("U1"));
}

#[test]
fn approval_buttons_are_styled() {
    let blocks = approval_blocks("req-2", "Write", "Write to: a.rs", None);
    let serialized = serde_json::to_string(&blocks).expect("serialize");
    assert!(serialized.contains("primary"), "allow button is primary");
    assert!(serialized.contains("danger"), "deny button is danger");
}

#[test]
fn question_blocks_render_one_button_per_option() {
    let options = vec!["はい".to_owned(), "いいえ".to_owned(), "わからない".to_owned()];
    let blocks = question_blocks("req-9", "続行しますか？", &options);
    assert_eq!(blocks.len(), 2);
    let serialized = serde_json::to_string(&blocks).expect("serialize");
    assert!(serialized.contains("続行しますか"));
    for option in &options {
        assert!(serialized.contains(option.as_str()));
    }
    // Button values carry request_id::option so the handler can resolve
    // the pending answer statelessly.
    assert!(serialized.contains("req-9::はい"));
    assert!(serialized.contains("question_answer_2"));
}

#[test]
fn decision_and_answer_notes_name_the_actor() {
    let allowed = serde_json::to_string(&decision_note("allow", "U1")).expect("serialize");
    assert!(allowed.contains('✅'));
    assert!(allowed.contains("U1"));

    let denied = serde_json::to_string(&decision_note("deny", "U2")).expect("serialize");
    assert!(denied.contains('🚫'));

    let answered = serde_json::to_string(&answer_note("はい", "U3")).expect("serialize");
    assert!(answered.contains("はい"));
    assert!(answered.contains("U3"));
}

#[test]
fn target_repo_parsing_from_message_text() {
    assert_eq!(
        parse_target_repo("please fix repo:octo/demo today"),
        Some("octo/demo".into())
    );
    assert_eq!(parse_target_repo("no repo named here"), None);
    assert_eq!(parse_target_repo("repo:not-a-spec"), None);
    assert_eq!(parse_target_repo("repo:a/b/c"), None);
}
