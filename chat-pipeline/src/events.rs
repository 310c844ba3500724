use std::collections::HashMap;
use std::sync::Arc;

use common::error::AppError;
use thiserror::Error;

use crate::turn::ChatTurn;

/// The closed set of events one QA turn is driven through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatEvent {
    PreprocessQuery,
    RewriteQuery,
    EmbedQuery,
    Retrieve,
    Rerank,
    MergeResult,
    IntoChatMessage,
    ChatStream,
    Persist,
}

impl ChatEvent {
    /// Dispatch order for a question-answering turn.
    pub const SEQUENCE: [ChatEvent; 9] = [
        ChatEvent::PreprocessQuery,
        ChatEvent::RewriteQuery,
        ChatEvent::EmbedQuery,
        ChatEvent::Retrieve,
        ChatEvent::Rerank,
        ChatEvent::MergeResult,
        ChatEvent::IntoChatMessage,
        ChatEvent::ChatStream,
        ChatEvent::Persist,
    ];
}

/// Halts the plugin chain; the coordinator maps it onto the error taxonomy.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub AppError);

impl From<AppError> for PluginError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<PluginError> for AppError {
    fn from(err: PluginError) -> Self {
        err.0
    }
}

/// A handler activated by one or more events. Plugins run in registration
/// order and pass control on through the explicit `next` continuation; not
/// calling `next` (by returning an error) short-circuits the chain.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn activates_on(&self) -> &'static [ChatEvent];

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError>;
}

/// Explicit continuation over the rest of one event's plugin chain.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Plugin>],
}

impl Next<'_> {
    pub async fn run(self, turn: &mut ChatTurn) -> Result<(), PluginError> {
        match self.remaining.split_first() {
            Some((head, rest)) => head.handle(turn, Next { remaining: rest }).await,
            None => Ok(()),
        }
    }

    /// Terminal continuation, for exercising a single plugin in isolation.
    pub fn noop() -> Next<'static> {
        Next { remaining: &[] }
    }
}

/// Event-keyed plugin table. Registration happens at startup; dispatch walks
/// the registered chain for one event in order.
#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<ChatEvent, Vec<Arc<dyn Plugin>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        for event in plugin.activates_on() {
            self.handlers
                .entry(*event)
                .or_default()
                .push(Arc::clone(&plugin));
        }
    }

    pub fn handler_count(&self, event: ChatEvent) -> usize {
        self.handlers.get(&event).map_or(0, Vec::len)
    }

    pub async fn dispatch(
        &self,
        event: ChatEvent,
        turn: &mut ChatTurn,
    ) -> Result<(), PluginError> {
        let Some(chain) = self.handlers.get(&event) else {
            return Ok(());
        };
        Next { remaining: chain }.run(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::test_support::bare_turn;
    use std::sync::Mutex;

    struct RecordingPlugin {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &'static str {
            self.label
        }

        fn activates_on(&self) -> &'static [ChatEvent] {
            &[ChatEvent::PreprocessQuery]
        }

        async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("enter {}", self.label));
            if self.fail {
                return Err(AppError::Validation(format!("{} refused", self.label)).into());
            }
            next.run(turn).await?;
            self.log
                .lock()
                .expect("log lock")
                .push(format!("exit {}", self.label));
            Ok(())
        }
    }

    #[tokio::test]
    async fn plugins_run_in_registration_order_with_explicit_next() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.register(Arc::new(RecordingPlugin {
            label: "first",
            log: Arc::clone(&log),
            fail: false,
        }));
        bus.register(Arc::new(RecordingPlugin {
            label: "second",
            log: Arc::clone(&log),
            fail: false,
        }));

        let (mut turn, _rx) = bare_turn("hello").await;
        bus.dispatch(ChatEvent::PreprocessQuery, &mut turn)
            .await
            .expect("dispatch");

        let entries = log.lock().expect("log lock").clone();
        assert_eq!(
            entries,
            vec!["enter first", "enter second", "exit second", "exit first"]
        );
    }

    #[tokio::test]
    async fn failing_plugin_short_circuits_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.register(Arc::new(RecordingPlugin {
            label: "first",
            log: Arc::clone(&log),
            fail: true,
        }));
        bus.register(Arc::new(RecordingPlugin {
            label: "second",
            log: Arc::clone(&log),
            fail: false,
        }));

        let (mut turn, _rx) = bare_turn("hello").await;
        let result = bus.dispatch(ChatEvent::PreprocessQuery, &mut turn).await;

        assert!(result.is_err());
        let entries = log.lock().expect("log lock").clone();
        assert_eq!(entries, vec!["enter first"]);
    }

    #[tokio::test]
    async fn dispatch_with_no_handlers_is_a_no_op() {
        let bus = EventBus::new();
        let (mut turn, _rx) = bare_turn("hello").await;
        bus.dispatch(ChatEvent::Rerank, &mut turn)
            .await
            .expect("dispatch");
    }
}
