//! Slack Socket Mode event handlers.
//!
//! Push events become inbound tasks; block actions resolve pending
//! approvals and questions. Every interaction passes the whitelist guard
//! before reaching a handler — unauthorized attempts are logged and
//! silently dropped so the user gets no feedback beyond Slack's own
//! acknowledgment.

use std::sync::Arc;

use slack_morphism::prelude::{
    SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector,
    SlackEventCallbackBody, SlackInteractionEvent, SlackPushEventCallback,
};
use tracing::{debug, info, warn};

use super::blocks::{
    self, ACTION_APPROVE_ALLOW, ACTION_APPROVE_DENY, ACTION_QUESTION_PREFIX,
    QUESTION_VALUE_SEPARATOR,
};
use super::{QuestionReply, SlackShared};
use crate::channels::InboundMessage;
use crate::models::approval::{ApprovalDecision, ApprovalOutcome};
use crate::models::task::TaskMetadata;

/// Extract an explicit `owner/repo` target from message text.
///
/// Recognizes a `repo:owner/name` token anywhere in the message.
#[must_use]
pub fn parse_target_repo(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        if let Some(spec) = token.strip_prefix("repo:") {
            let mut parts = spec.split('/');
            if let (Some(owner), Some(repo), None) = (parts.next(), parts.next(), parts.next()) {
                if !owner.is_empty() && !repo.is_empty() {
                    return Some(format!("{owner}/{repo}"));
                }
            }
        }
    }
    None
}

/// Handle message push events delivered via Socket Mode.
///
/// # Errors
///
/// Returns an error if the event cannot be processed.
pub async fn handle_push(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let shared: Option<Arc<SlackShared>> = {
        let guard = state.read().await;
        guard.get_user_state::<Arc<SlackShared>>().cloned()
    };
    let Some(shared) = shared else {
        warn!("slack shared state unavailable; push event dropped");
        return Ok(());
    };

    let SlackEventCallbackBody::Message(message) = event.event else {
        debug!("non-message push event ignored");
        return Ok(());
    };

    // Ignore our own and other bots' traffic.
    if message.sender.bot_id.is_some() {
        return Ok(());
    }
    let Some(user_id) = message.sender.user.map(|u| u.to_string()) else {
        return Ok(());
    };
    let Some(channel_id) = message.origin.channel.map(|c| c.to_string()) else {
        return Ok(());
    };
    let Some(text) = message.content.and_then(|content| content.text) else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    if !shared.identity.is_user_allowed(crate::models::task::TaskSource::Slack, &user_id) {
        warn!(user_id, "unauthorized slack user; message ignored");
        return Ok(());
    }

    let thread_ts = message
        .origin
        .thread_ts
        .map_or_else(|| message.origin.ts.to_string(), |ts| ts.to_string());

    let metadata = TaskMetadata::Slack {
        channel_id,
        thread_ts,
        user_id,
        text: text.clone(),
        target_repo: parse_target_repo(&text),
    };
    let inbound = InboundMessage {
        prompt: text,
        metadata,
    };

    if let Some(callbacks) = shared.callbacks.get() {
        if callbacks.inbound.send(inbound).is_err() {
            warn!("engine inbound channel closed; slack message dropped");
        }
    } else {
        warn!("slack adapter not initialized; message dropped");
    }
    Ok(())
}

/// Handle interactive payloads (button presses) delivered via Socket Mode.
///
/// # Errors
///
/// Returns an error if the interaction cannot be processed.
pub async fn handle_interaction(
    event: SlackInteractionEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let shared: Option<Arc<SlackShared>> = {
        let guard = state.read().await;
        guard.get_user_state::<Arc<SlackShared>>().cloned()
    };
    let Some(shared) = shared else {
        warn!("slack shared state unavailable; interaction dropped");
        return Ok(());
    };

    let SlackInteractionEvent::BlockActions(block_event) = &event else {
        return Ok(());
    };

    let user_id = block_event
        .user
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_default();
    if user_id.is_empty() {
        warn!("block action with empty user id; ignoring");
        return Ok(());
    }
    if !shared.identity.is_user_allowed(crate::models::task::TaskSource::Slack, &user_id) {
        warn!(user_id, "unauthorized slack interaction (silently ignored)");
        return Ok(());
    }

    let Some(actions) = &block_event.actions else {
        return Ok(());
    };

    for action in actions {
        let action_id = action.action_id.to_string();
        let Some(value) = action.value.clone() else {
            continue;
        };

        if action_id == ACTION_APPROVE_ALLOW || action_id == ACTION_APPROVE_DENY {
            let decision = if action_id == ACTION_APPROVE_ALLOW {
                ApprovalDecision::Allow
            } else {
                ApprovalDecision::Deny
            };
            let outcome = ApprovalOutcome {
                decision,
                comment: None,
                responded_by: Some(user_id.clone()),
            };
            let resolved = {
                let mut pendings = shared.pending_approvals.lock().await;
                pendings.remove(&value)
            };
            match resolved {
                Some(tx) => {
                    info!(request_id = %value, %decision, user_id, "approval decision received");
                    let _ = tx.send(outcome);
                    let note = blocks::decision_note(&decision.to_string(), &user_id);
                    replace_buttons(&shared, block_event, note).await;
                }
                None => debug!(request_id = %value, "stale approval action ignored"),
            }
        } else if action_id.starts_with(ACTION_QUESTION_PREFIX) {
            let Some((request_id, answer)) = value.split_once(QUESTION_VALUE_SEPARATOR) else {
                continue;
            };
            let resolved = {
                let mut pendings = shared.pending_questions.lock().await;
                pendings.remove(request_id)
            };
            match resolved {
                Some(tx) => {
                    info!(request_id, answer, user_id, "question answered");
                    let _ = tx.send(QuestionReply {
                        answer: answer.to_owned(),
                        answered_by: user_id.clone(),
                    });
                    let note = blocks::answer_note(answer, &user_id);
                    replace_buttons(&shared, block_event, note).await;
                }
                None => debug!(request_id, "stale question action ignored"),
            }
        }
    }
    Ok(())
}

/// Replace the interactive buttons with a static note so a second tap on
/// the same message is a no-op.
async fn replace_buttons(
    shared: &SlackShared,
    block_event: &slack_morphism::prelude::SlackInteractionBlockActionsEvent,
    note: slack_morphism::prelude::SlackBlock,
) {
    let Some(sender) = shared.sender.get() else {
        return;
    };
    let channel = block_event.channel.as_ref().map(|c| c.id.clone());
    let ts = block_event.message.as_ref().map(|m| m.origin.ts.clone());
    if let (Some(channel), Some(ts)) = (channel, ts) {
        if let Err(err) = sender.update_message(channel, ts, vec![note]).await {
            warn!(%err, "failed to replace interaction buttons");
        }
    }
}
