//! Block Kit rendering for approval prompts, questions, and decisions.

use slack_morphism::prelude::{
    SlackActionBlockElement, SlackActionsBlock, SlackBlock, SlackBlockButtonElement,
    SlackBlockButtonStyle, SlackBlockId, SlackBlockPlainTextOnly, SlackBlockText,
    SlackSectionBlock,
};

/// Action id for the approval allow button.
pub const ACTION_APPROVE_ALLOW: &str = "approve_allow";
/// Action id for the approval deny button.
pub const ACTION_APPROVE_DENY: &str = "approve_deny";
/// Action id prefix for question option buttons.
pub const ACTION_QUESTION_PREFIX: &str = "question_answer_";
/// Separator between a request id and an option inside a button value.
pub const QUESTION_VALUE_SEPARATOR: &str = "::";

fn mrkdwn_section(text: String) -> SlackBlock {
    SlackBlock::Section(SlackSectionBlock::new().with_text(SlackBlockText::MarkDown(text.into())))
}

/// Approval prompt: what tool wants to run, the command preview fenced as
/// code, and styled Allow / Deny buttons carrying the request id.
#[must_use]
pub fn approval_blocks(
    request_id: &str,
    tool: &str,
    command: &str,
    requested_by: Option<&str>,
) -> Vec<SlackBlock> {
    let mut header = format!("⚠️ *Approval requested* — tool `{tool}`");
    if let Some(user) = requested_by {
        header.push_str(&format!(" (for <@{user}>)"));
    }

    let allow = SlackBlockButtonElement::new(
        ACTION_APPROVE_ALLOW.into(),
        SlackBlockPlainTextOnly::from("Allow"),
    )
    .with_style(SlackBlockButtonStyle::Primary)
    .with_value(request_id.to_owned());
    let deny = SlackBlockButtonElement::new(
        ACTION_APPROVE_DENY.into(),
        SlackBlockPlainTextOnly::from("Deny"),
    )
    .with_style(SlackBlockButtonStyle::Danger)
    .with_value(request_id.to_owned());

    vec![
        mrkdwn_section(header),
        mrkdwn_section(format!("```{command}```")),
        SlackBlock::Actions(
            SlackActionsBlock::new(vec![
                SlackActionBlockElement::Button(allow),
                SlackActionBlockElement::Button(deny),
            ])
            .with_block_id(SlackBlockId(format!("approval_{request_id}"))),
        ),
    ]
}

/// Question prompt: the question text and one button per option. Button
/// values carry `request_id::option` so the interaction handler can
/// resolve the pending answer without extra state.
#[must_use]
pub fn question_blocks(request_id: &str, question: &str, options: &[String]) -> Vec<SlackBlock> {
    let buttons: Vec<SlackActionBlockElement> = options
        .iter()
        .enumerate()
        .map(|(index, option)| {
            SlackActionBlockElement::Button(
                SlackBlockButtonElement::new(
                    format!("{ACTION_QUESTION_PREFIX}{index}").into(),
                    SlackBlockPlainTextOnly::from(option.as_str()),
                )
                .with_value(format!("{request_id}{QUESTION_VALUE_SEPARATOR}{option}")),
            )
        })
        .collect();

    vec![
        mrkdwn_section(format!("❓ {question}")),
        SlackBlock::Actions(
            SlackActionsBlock::new(buttons)
                .with_block_id(SlackBlockId(format!("question_{request_id}"))),
        ),
    ]
}

/// Static replacement for a decided approval, so a second tap on the same
/// message has nothing left to press.
#[must_use]
pub fn decision_note(decision: &str, user_id: &str) -> SlackBlock {
    let emoji = if decision == "allow" { "✅" } else { "🚫" };
    mrkdwn_section(format!("{emoji} Decision: *{decision}* by <@{user_id}>"))
}

/// Static replacement for an answered question.
#[must_use]
pub fn answer_note(answer: &str, user_id: &str) -> SlackBlock {
    mrkdwn_section(format!("💬 Answered: *{answer}* by <@{user_id}>"))
}
