//! Slack outbound delivery.
//!
//! All outgoing traffic funnels through a single delivery queue so thread
//! replies, approval prompts, and button updates keep their relative
//! order. Posts that need their timestamp back (thread anchors,
//! interactive messages) attach a reply channel; notifications are
//! fire-and-forget. A delivery is retried a bounded number of times with
//! a growing pause, preferring Slack's own retry hint when rate-limited,
//! and dropped with a log once the attempt budget is spent.

use std::sync::Arc;
use std::time::Duration;

use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiChatUpdateRequest, SlackApiToken, SlackApiTokenType,
    SlackApiTokenValue, SlackBlock, SlackChannelId, SlackClient, SlackClientHyperHttpsConnector,
    SlackClientSession, SlackMessageContent, SlackTs,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::SlackConfig;
use crate::{AppError, Result};

const QUEUE_CAPACITY: usize = 128;
const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// One outgoing Slack message.
#[derive(Debug, Clone)]
pub struct SlackMessage {
    /// Target channel.
    pub channel: SlackChannelId,
    /// Plain text body.
    pub text: Option<String>,
    /// Block Kit body.
    pub blocks: Option<Vec<SlackBlock>>,
    /// Thread to reply in.
    pub thread_ts: Option<SlackTs>,
}

impl SlackMessage {
    /// Create a plain-text message for a channel.
    pub fn plain(channel: SlackChannelId, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: Some(text.into()),
            blocks: None,
            thread_ts: None,
        }
    }

    /// Reply in a thread.
    #[must_use]
    pub fn in_thread(mut self, thread_ts: SlackTs) -> Self {
        self.thread_ts = Some(thread_ts);
        self
    }

    /// Attach Block Kit blocks.
    #[must_use]
    pub fn with_blocks(mut self, blocks: Vec<SlackBlock>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    fn into_post_request(self) -> SlackApiChatPostMessageRequest {
        let mut content = SlackMessageContent::new();
        if let Some(text) = self.text {
            content = content.with_text(text);
        }
        if let Some(blocks) = self.blocks {
            content = content.with_blocks(blocks);
        }
        let mut request = SlackApiChatPostMessageRequest::new(self.channel, content);
        if let Some(thread_ts) = self.thread_ts {
            request = request.with_thread_ts(thread_ts);
        }
        request
    }
}

/// One unit of work for the delivery loop.
enum Delivery {
    /// Post a message; `reply` carries the resulting timestamp back when
    /// the caller needs it.
    Post {
        message: SlackMessage,
        reply: Option<oneshot::Sender<Result<SlackTs>>>,
    },
    /// Rewrite an existing message's blocks (button replacement).
    Update {
        channel: SlackChannelId,
        ts: SlackTs,
        blocks: Vec<SlackBlock>,
    },
}

/// Slack Web API wrapper owning the ordered delivery queue.
pub struct SlackSender {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    app_token: SlackApiToken,
    delivery_tx: mpsc::Sender<Delivery>,
    delivery_task: JoinHandle<()>,
}

impl SlackSender {
    /// Start the sender and its delivery loop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the HTTPS connector cannot be
    /// created.
    pub fn start(config: &SlackConfig) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Channel(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(config.bot_token.clone()))
            .with_token_type(SlackApiTokenType::Bot);
        let app_token = SlackApiToken::new(SlackApiTokenValue(config.app_token.clone()))
            .with_token_type(SlackApiTokenType::App);

        let (delivery_tx, delivery_rx) = mpsc::channel(QUEUE_CAPACITY);
        let delivery_task = spawn_delivery_loop(Arc::clone(&client), bot_token, delivery_rx);

        info!("slack delivery queue started");
        Ok(Self {
            client,
            app_token,
            delivery_tx,
            delivery_task,
        })
    }

    /// The shared Slack client (used by the socket-mode listener).
    #[must_use]
    pub fn client(&self) -> Arc<SlackClient<SlackClientHyperHttpsConnector>> {
        Arc::clone(&self.client)
    }

    /// The app-level token for Socket Mode.
    #[must_use]
    pub fn app_token(&self) -> SlackApiToken {
        self.app_token.clone()
    }

    /// Queue a fire-and-forget message. Delivery failures past the retry
    /// budget are logged, not surfaced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the delivery queue is full or gone.
    pub async fn enqueue(&self, message: SlackMessage) -> Result<()> {
        self.delivery_tx
            .send(Delivery::Post {
                message,
                reply: None,
            })
            .await
            .map_err(|err| AppError::Channel(format!("slack delivery queue rejected: {err}")))
    }

    /// Queue a post and wait for its timestamp. Keeps queue order with
    /// every other outgoing message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` when delivery fails after the retry
    /// budget, or when the delivery loop is gone.
    pub async fn post_returning_ts(&self, message: SlackMessage) -> Result<SlackTs> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.delivery_tx
            .send(Delivery::Post {
                message,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|err| AppError::Channel(format!("slack delivery queue rejected: {err}")))?;
        reply_rx
            .await
            .map_err(|_| AppError::Channel("slack delivery loop gone".into()))?
    }

    /// Queue a rewrite of an existing message's blocks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the delivery queue is full or gone.
    pub async fn update_message(
        &self,
        channel: SlackChannelId,
        ts: SlackTs,
        blocks: Vec<SlackBlock>,
    ) -> Result<()> {
        self.delivery_tx
            .send(Delivery::Update {
                channel,
                ts,
                blocks,
            })
            .await
            .map_err(|err| AppError::Channel(format!("slack delivery queue rejected: {err}")))
    }

    /// Stop the delivery loop.
    pub fn stop(&self) {
        self.delivery_task.abort();
    }
}

fn spawn_delivery_loop(
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
    mut delivery_rx: mpsc::Receiver<Delivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api = client.open_session(&bot_token);
        while let Some(delivery) = delivery_rx.recv().await {
            match delivery {
                Delivery::Post { message, reply } => {
                    let outcome = post_with_retry(&api, message).await;
                    match reply {
                        Some(reply_tx) => {
                            let _ = reply_tx.send(outcome);
                        }
                        None => {
                            if let Err(err) = outcome {
                                warn!(%err, "slack notification dropped");
                            }
                        }
                    }
                }
                Delivery::Update {
                    channel,
                    ts,
                    blocks,
                } => {
                    let content = SlackMessageContent::new().with_blocks(blocks);
                    let request = SlackApiChatUpdateRequest::new(channel, content, ts);
                    // Updates are cosmetic (button replacement); one shot.
                    if let Err(error) = api.chat_update(&request).await {
                        warn!(%error, "slack message update failed");
                    }
                }
            }
        }
        info!("slack delivery loop exiting");
    })
}

/// Post with a bounded retry budget. Each failed attempt waits
/// `RETRY_PAUSE × attempt`, except that a rate-limit error with a
/// `retry_after` hint waits exactly what Slack asked for.
async fn post_with_retry(
    api: &SlackClientSession<'_, SlackClientHyperHttpsConnector>,
    message: SlackMessage,
) -> Result<SlackTs> {
    let request = message.into_post_request();
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let error = match api.chat_post_message(&request).await {
            Ok(response) => return Ok(response.ts),
            Err(error) => error,
        };
        if attempt >= MAX_DELIVERY_ATTEMPTS {
            return Err(AppError::Channel(format!(
                "slack post gave up after {attempt} attempts: {error}"
            )));
        }
        let pause = match &error {
            slack_morphism::errors::SlackClientError::RateLimitError(limited) => {
                limited.retry_after.unwrap_or(RETRY_PAUSE * attempt)
            }
            _ => RETRY_PAUSE * attempt,
        };
        warn!(attempt, ?pause, %error, "slack post failed; retrying");
        sleep(pause).await;
    }
}
