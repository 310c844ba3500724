use async_trait::async_trait;
use common::storage::types::message::{Message, MessageRole};
use tracing::{debug, warn};

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

/// Writes the assistant message (with references) and marks the active
/// stream complete. The message id is the request id, which is what makes
/// `continue-stream` able to replay a finished answer.
pub struct PersistPlugin;

#[async_trait]
impl Plugin for PersistPlugin {
    fn name(&self) -> &'static str {
        "persist"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::Persist]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        let mut message = Message::new(
            turn.session.id.clone(),
            turn.request_id.clone(),
            MessageRole::Assistant,
            turn.answer.clone(),
            turn.references.clone(),
        );
        message.id = turn.request_id.clone();

        turn.services
            .db
            .upsert_item(message)
            .await
            .map_err(|err| PluginError::from(common::error::AppError::from(err)))?;

        if let Err(err) = turn
            .services
            .streams
            .complete(&turn.session.id, &turn.request_id)
            .await
        {
            warn!(error = %err, "Failed to mark the active stream complete");
        }

        debug!(
            session_id = %turn.session.id,
            request_id = %turn.request_id,
            answer_chars = turn.answer.chars().count(),
            references = turn.references.len(),
            "Persisted assistant message"
        );

        next.run(turn).await
    }
}
