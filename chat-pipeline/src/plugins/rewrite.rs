use async_trait::async_trait;
use common::{
    storage::types::message::format_history,
    utils::chat::{ChatMessage, ChatOptions},
};
use tracing::{debug, warn};

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

const REWRITE_SYSTEM_PROMPT: &str = "You rewrite follow-up questions into \
standalone questions that keep every detail needed to answer them without \
the chat history. Reply with only the rewritten question.";

/// Rewrites a follow-up question into a standalone one using the recent
/// history. Any failure falls back to the original query.
pub struct RewriteQueryPlugin;

#[async_trait]
impl Plugin for RewriteQueryPlugin {
    fn name(&self) -> &'static str {
        "rewrite_query"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::RewriteQuery]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        if !turn.session.enable_rewrite || turn.history.is_empty() {
            return next.run(turn).await;
        }

        let user_prompt = format!(
            "Chat history:\n{}\n\nFollow-up question: {}\n\nStandalone question:",
            format_history(&turn.history),
            turn.query
        );
        let messages = vec![
            ChatMessage::system(REWRITE_SYSTEM_PROMPT),
            ChatMessage::user(user_prompt),
        ];
        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: Some(256),
            ..ChatOptions::default()
        };

        match turn.services.chat.chat(&messages, &options).await {
            Ok(response) => {
                let rewritten = response.content.trim();
                if rewritten.is_empty() {
                    debug!("Rewrite model returned nothing; keeping original query");
                } else {
                    debug!(
                        original = %turn.query,
                        rewritten = %rewritten,
                        "Rewrote follow-up question"
                    );
                    turn.query = rewritten.to_owned();
                }
            }
            Err(err) => {
                warn!(error = %err, "Query rewrite failed; keeping original query");
            }
        }

        next.run(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Next;
    use crate::turn::test_support::{test_services, turn_with_services, ScriptedChat};
    use common::storage::types::message::{Message, MessageRole};

    fn history_message(role: MessageRole, content: &str) -> Message {
        Message::new(
            "s1".to_string(),
            uuid::Uuid::new_v4().to_string(),
            role,
            content.to_string(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn rewrites_query_using_history() {
        let services = test_services(ScriptedChat {
            answer: "What is the orbital period of the comet?".to_string(),
            deltas: Vec::new(),
            fail: false,
        })
        .await;
        let (mut turn, _rx) = turn_with_services(services, "what about its period?");
        turn.history = vec![
            history_message(MessageRole::User, "Tell me about the comet."),
            history_message(MessageRole::Assistant, "It is a short-period object."),
        ];

        RewriteQueryPlugin
            .handle(&mut turn, Next::noop())
            .await
            .expect("rewrite");

        assert_eq!(turn.query, "What is the orbital period of the comet?");
        assert_eq!(turn.original_query, "what about its period?");
    }

    #[tokio::test]
    async fn failure_falls_back_to_original_query() {
        let services = test_services(ScriptedChat::failing()).await;
        let (mut turn, _rx) = turn_with_services(services, "what about its period?");
        turn.history = vec![history_message(MessageRole::User, "Earlier question")];

        RewriteQueryPlugin
            .handle(&mut turn, Next::noop())
            .await
            .expect("rewrite should not fail the turn");

        assert_eq!(turn.query, "what about its period?");
    }

    #[tokio::test]
    async fn disabled_rewrite_is_skipped() {
        let services = test_services(ScriptedChat {
            answer: "should not be used".to_string(),
            deltas: Vec::new(),
            fail: false,
        })
        .await;
        let (mut turn, _rx) = turn_with_services(services, "original");
        turn.session.enable_rewrite = false;
        turn.history = vec![history_message(MessageRole::User, "context")];

        RewriteQueryPlugin
            .handle(&mut turn, Next::noop())
            .await
            .expect("rewrite");

        assert_eq!(turn.query, "original");
    }

    #[tokio::test]
    async fn empty_history_skips_the_model_call() {
        let services = test_services(ScriptedChat {
            answer: "should not be used".to_string(),
            deltas: Vec::new(),
            fail: false,
        })
        .await;
        let (mut turn, _rx) = turn_with_services(services, "first question");

        RewriteQueryPlugin
            .handle(&mut turn, Next::noop())
            .await
            .expect("rewrite");

        assert_eq!(turn.query, "first question");
    }
}
