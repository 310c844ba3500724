use async_trait::async_trait;
use common::{
    storage::types::message::MessageRole,
    utils::chat::{ChatMessage, ChatRole},
};
use tracing::debug;

use crate::{
    context::{build_contexts, render_context_template, DEFAULT_CONTEXT_TEMPLATE},
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

/// Builds the grounded chat prompt: prior turns as chat messages, then the
/// session's context template instantiated with the merged passages.
pub struct IntoChatMessagePlugin;

#[async_trait]
impl Plugin for IntoChatMessagePlugin {
    fn name(&self) -> &'static str {
        "into_chat_message"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::IntoChatMessage]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        if turn.passages.is_empty() {
            // Nothing to ground on; the chat stage decides the fallback.
            return next.run(turn).await;
        }

        let contexts = build_contexts(&turn.passages);
        let template = turn
            .session
            .context_template
            .as_deref()
            .unwrap_or(DEFAULT_CONTEXT_TEMPLATE);
        let rendered = render_context_template(template, &turn.query, &contexts)
            .map_err(PluginError::from)?;

        let mut prompt = history_as_messages(turn);
        prompt.push(ChatMessage::user(rendered));

        debug!(
            contexts = contexts.len(),
            prompt_messages = prompt.len(),
            "Built grounded chat prompt"
        );
        turn.prompt = prompt;

        next.run(turn).await
    }
}

pub(crate) fn history_as_messages(turn: &ChatTurn) -> Vec<ChatMessage> {
    turn.history
        .iter()
        .map(|message| ChatMessage {
            role: match message.role {
                MessageRole::User => ChatRole::User,
                MessageRole::Assistant => ChatRole::Assistant,
                MessageRole::System => ChatRole::System,
            },
            content: message.content.clone(),
        })
        .collect()
}
