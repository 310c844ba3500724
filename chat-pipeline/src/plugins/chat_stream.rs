use std::time::Duration;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::session::FallbackStrategy,
    utils::chat::{ChatMessage, ChatOptions},
};
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    context::{render_context_template, NO_CONTEXT_TEMPLATE},
    events::{ChatEvent, Next, Plugin, PluginError},
    plugins::prompt::history_as_messages,
    turn::{ChatFrame, ChatTurn},
};

/// Upper bound for one model answer, end to end.
const CHAT_DEADLINE: Duration = Duration::from_secs(600);

/// Streams the model answer: emits the references frame exactly once before
/// the first delta, forwards deltas in arrival order, and appends every
/// delta to the stream manager so the turn stays resumable.
pub struct ChatStreamPlugin;

#[async_trait]
impl Plugin for ChatStreamPlugin {
    fn name(&self) -> &'static str {
        "chat_stream"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::ChatStream]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        let session_id = turn.session.id.clone();
        let request_id = turn.request_id.clone();

        if let Err(err) = turn
            .services
            .streams
            .update(&session_id, &request_id, "", Some(&turn.references))
            .await
        {
            warn!(error = %err, "Failed to persist references on the active stream");
        }
        turn.emit(ChatFrame::References(turn.references.clone())).await;

        if turn.passages.is_empty() {
            match turn.session.fallback_strategy {
                FallbackStrategy::Fixed => {
                    let answer = turn.session.fallback_response.clone();
                    debug!("Retrieval empty; answering with the fixed fallback response");
                    if let Err(err) = turn
                        .services
                        .streams
                        .update(&session_id, &request_id, &answer, None)
                        .await
                    {
                        warn!(error = %err, "Failed to append fallback to the active stream");
                    }
                    turn.answer = answer.clone();
                    turn.emit(ChatFrame::Answer {
                        content: answer,
                        done: true,
                    })
                    .await;
                    turn.skip_chat = true;
                    return next.run(turn).await;
                }
                FallbackStrategy::Model => {
                    debug!("Retrieval empty; falling back to an ungrounded model answer");
                    let rendered =
                        render_context_template(NO_CONTEXT_TEMPLATE, &turn.query, &[])
                            .map_err(PluginError::from)?;
                    let mut prompt = history_as_messages(turn);
                    prompt.push(ChatMessage::user(rendered));
                    turn.prompt = prompt;
                }
            }
        }

        let options = ChatOptions::default();
        let deadline = Instant::now() + CHAT_DEADLINE;

        let mut stream = turn
            .services
            .chat
            .chat_stream(&turn.prompt, &options)
            .await
            .map_err(PluginError::from)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AppError::Cancelled("chat deadline exceeded".into()).into());
            }

            let item = match tokio::time::timeout(remaining, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    return Err(AppError::Cancelled("chat deadline exceeded".into()).into());
                }
            };

            match item {
                Some(Ok(delta)) => {
                    if delta.done {
                        turn.emit(ChatFrame::Answer {
                            content: String::new(),
                            done: true,
                        })
                        .await;
                        break;
                    }
                    if delta.content.is_empty() {
                        continue;
                    }
                    turn.answer.push_str(&delta.content);
                    if let Err(err) = turn
                        .services
                        .streams
                        .update(&session_id, &request_id, &delta.content, None)
                        .await
                    {
                        warn!(error = %err, "Failed to append delta to the active stream");
                    }
                    turn.emit(ChatFrame::Answer {
                        content: delta.content,
                        done: false,
                    })
                    .await;
                }
                Some(Err(err)) => return Err(err.into()),
                // Producer closed without a terminal event; treat what we
                // have as the final answer.
                None => {
                    turn.emit(ChatFrame::Answer {
                        content: String::new(),
                        done: true,
                    })
                    .await;
                    break;
                }
            }
        }

        next.run(turn).await
    }
}
