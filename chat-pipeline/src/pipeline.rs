use std::sync::Arc;
use std::time::Duration;

use common::error::AppError;
use common::storage::types::message::Message;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::{
    events::{ChatEvent, EventBus},
    plugins::{
        ChatStreamPlugin, EmbedQueryPlugin, IntoChatMessagePlugin, MergeResultPlugin,
        PersistPlugin, PreprocessQueryPlugin, RerankPlugin, RetrievePlugin, RewriteQueryPlugin,
    },
    turn::{ChatFrame, ChatTurn},
};

/// How often a resuming client polls the stream manager for fresh deltas.
const RESUME_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// The ordered plugin chain driving one QA turn.
pub struct ChatPipeline {
    bus: EventBus,
}

impl Default for ChatPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatPipeline {
    /// Standard registration order for a question-answering turn.
    pub fn new() -> Self {
        let mut bus = EventBus::new();
        bus.register(Arc::new(PreprocessQueryPlugin));
        bus.register(Arc::new(RewriteQueryPlugin));
        bus.register(Arc::new(EmbedQueryPlugin));
        bus.register(Arc::new(RetrievePlugin));
        bus.register(Arc::new(RerankPlugin));
        bus.register(Arc::new(MergeResultPlugin));
        bus.register(Arc::new(IntoChatMessagePlugin));
        bus.register(Arc::new(ChatStreamPlugin));
        bus.register(Arc::new(PersistPlugin));
        Self { bus }
    }

    /// A pipeline over a caller-assembled bus, for custom plugin sets.
    pub fn with_bus(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Drive the event sequence over one turn. On a plugin error the chain
    /// halts, an error frame is pushed toward the client, and the error is
    /// returned for the transport layer to map.
    #[instrument(skip_all, fields(session_id = %turn.session.id, request_id = %turn.request_id))]
    pub async fn run(&self, turn: &mut ChatTurn) -> Result<(), AppError> {
        for event in ChatEvent::SEQUENCE {
            if let Err(err) = self.bus.dispatch(event, turn).await {
                let app_err: AppError = err.into();
                warn!(?event, error = %app_err, "Chat turn halted");
                turn.emit(ChatFrame::Error {
                    message: app_err.to_string(),
                })
                .await;
                return Err(app_err);
            }
        }
        Ok(())
    }
}

/// Re-attach to a (session, request) pair: replay the snapshot held by the
/// stream manager, then keep forwarding live deltas until completion. When
/// the active stream is gone, fall back to replaying the persisted
/// assistant message.
pub async fn resume_stream(
    streams: Arc<dyn crate::stream::StreamManager>,
    db: Arc<common::storage::db::SurrealDbClient>,
    session_id: String,
    request_id: String,
) -> Result<mpsc::Receiver<ChatFrame>, AppError> {
    let snapshot = streams.get(&session_id, &request_id).await?;
    let persisted = match snapshot {
        Some(_) => None,
        None => Message::find_by_request(&session_id, &request_id, &db).await?,
    };

    if snapshot.is_none() && persisted.is_none() {
        return Err(AppError::NotFound(format!(
            "no active or persisted answer for request '{request_id}'"
        )));
    }

    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        if let Some(message) = persisted {
            let _ = tx.send(ChatFrame::References(message.references.clone())).await;
            let _ = tx
                .send(ChatFrame::Answer {
                    content: message.content,
                    done: true,
                })
                .await;
            return;
        }

        let mut sent = 0usize;
        let mut references_sent = false;

        loop {
            let current = match streams.get(&session_id, &request_id).await {
                Ok(current) => current,
                Err(err) => {
                    warn!(error = %err, "Stream manager unavailable during resume");
                    let _ = tx
                        .send(ChatFrame::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let Some(stream) = current else {
                // Expired mid-resume; hand over whatever got persisted.
                match Message::find_by_request(&session_id, &request_id, &db).await {
                    Ok(Some(message)) => {
                        if !references_sent {
                            let _ = tx
                                .send(ChatFrame::References(message.references.clone()))
                                .await;
                        }
                        let remainder: String =
                            message.content.chars().skip(sent).collect();
                        let _ = tx
                            .send(ChatFrame::Answer {
                                content: remainder,
                                done: true,
                            })
                            .await;
                    }
                    _ => {
                        let _ = tx
                            .send(ChatFrame::Answer {
                                content: String::new(),
                                done: true,
                            })
                            .await;
                    }
                }
                return;
            };

            if !references_sent {
                let _ = tx.send(ChatFrame::References(stream.references.clone())).await;
                references_sent = true;
            }

            let fresh: String = stream.content.chars().skip(sent).collect();
            if !fresh.is_empty() {
                sent = sent.saturating_add(fresh.chars().count());
                if tx
                    .send(ChatFrame::Answer {
                        content: fresh,
                        done: false,
                    })
                    .await
                    .is_err()
                {
                    debug!("Resuming client went away");
                    return;
                }
            }

            if stream.is_completed {
                let _ = tx
                    .send(ChatFrame::Answer {
                        content: String::new(),
                        done: true,
                    })
                    .await;
                return;
            }

            tokio::time::sleep(RESUME_POLL_INTERVAL).await;
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamManager;
    use crate::turn::test_support::{test_services, turn_with_services, ScriptedChat};
    use crate::turn::TurnServices;
    use async_trait::async_trait;
    use common::retrieval::{MatchType, RetrieverEngineChoice, RetrieverType};
    use common::storage::types::message::{ChunkReference, MessageRole};
    use common::storage::types::session::FallbackStrategy;
    use retrieval_engines::{
        EngineRegistry, IndexEntry, RetrievalEngine, RetrieveParams, RetrieveResult,
    };
    use std::collections::HashMap;

    struct SingleHitEngine {
        hit: Option<RetrieveResult>,
    }

    #[async_trait]
    impl RetrievalEngine for SingleHitEngine {
        fn engine_type(&self) -> &'static str {
            "stub_vector"
        }

        fn supports(&self) -> &[RetrieverType] {
            &[RetrieverType::Vector]
        }

        async fn save(&self, _entry: &IndexEntry) -> Result<(), AppError> {
            Ok(())
        }

        async fn batch_save(&self, _entries: &[IndexEntry]) -> Result<(), AppError> {
            Ok(())
        }

        async fn delete_by_chunk_ids(
            &self,
            _chunk_ids: &[String],
            _dimension: usize,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn delete_by_knowledge_ids(
            &self,
            _knowledge_ids: &[String],
            _dimension: usize,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn copy_indices(
            &self,
            _src_kb_id: &str,
            _dst_kb_id: &str,
            _chunk_id_map: &HashMap<String, String>,
            _knowledge_id_map: &HashMap<String, String>,
            _dimension: usize,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn retrieve(
            &self,
            _params: &RetrieveParams,
        ) -> Result<Vec<RetrieveResult>, AppError> {
            Ok(self.hit.clone().into_iter().collect())
        }
    }

    fn vector_choice() -> Vec<RetrieverEngineChoice> {
        vec![RetrieverEngineChoice {
            retriever_type: RetrieverType::Vector,
            engine_type: "stub_vector".to_string(),
        }]
    }

    fn comet_hit() -> RetrieveResult {
        RetrieveResult {
            chunk_id: "c2".to_string(),
            kb_id: "kb".to_string(),
            knowledge_id: "k1".to_string(),
            chunk_index: 1,
            content: "COMET is a short-period object.".to_string(),
            score: 0.93,
            match_type: MatchType::Vector,
        }
    }

    async fn collect_frames(rx: &mut mpsc::Receiver<ChatFrame>) -> Vec<ChatFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn with_engine(
        services: Arc<TurnServices>,
        engine: Arc<dyn RetrievalEngine>,
    ) -> Arc<TurnServices> {
        Arc::new(TurnServices {
            db: Arc::clone(&services.db),
            registry: Arc::new(EngineRegistry::with_engines(vec![engine])),
            embedder: services.embedder.clone(),
            chat: Arc::clone(&services.chat),
            reranker: None,
            streams: Arc::clone(&services.streams),
        })
    }

    #[tokio::test]
    async fn streaming_turn_emits_references_then_deltas_then_done() {
        let services = test_services(ScriptedChat::with_deltas(&["A comet ", "is icy."])).await;
        let services = with_engine(
            services,
            Arc::new(SingleHitEngine {
                hit: Some(comet_hit()),
            }),
        );
        let (mut turn, mut rx) = turn_with_services(Arc::clone(&services), "Tell me about comets.");
        turn.tenant.retriever_engines = vector_choice();

        let session_id = turn.session.id.clone();
        let request_id = turn.request_id.clone();
        services
            .streams
            .register(&session_id, &request_id, &turn.query)
            .await
            .expect("register stream");

        ChatPipeline::new().run(&mut turn).await.expect("turn");
        drop(turn);

        let frames = collect_frames(&mut rx).await;
        match &frames[0] {
            ChatFrame::References(references) => {
                assert_eq!(references.len(), 1);
                assert_eq!(references[0].chunk_id, "c2");
                assert_eq!(references[0].knowledge_id, "k1");
            }
            other => panic!("expected references frame first, got {other:?}"),
        }

        let deltas: Vec<&ChatFrame> = frames
            .iter()
            .filter(|frame| matches!(frame, ChatFrame::Answer { .. }))
            .collect();
        assert_eq!(deltas.len(), 3);
        assert!(matches!(
            deltas.last(),
            Some(ChatFrame::Answer { done: true, .. })
        ));

        // The assistant message landed with references and the stream
        // completed with the full answer.
        let message = Message::find_by_request(&session_id, &request_id, &services.db)
            .await
            .expect("lookup")
            .expect("assistant message persisted");
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.content, "A comet is icy.");
        assert_eq!(message.references.len(), 1);

        let stream = services
            .streams
            .get(&session_id, &request_id)
            .await
            .expect("get stream")
            .expect("stream inside retention window");
        assert!(stream.is_completed);
        assert_eq!(stream.content, "A comet is icy.");
    }

    #[tokio::test]
    async fn fixed_fallback_answers_without_calling_the_model() {
        let services = test_services(ScriptedChat::failing()).await;
        let services = with_engine(services, Arc::new(SingleHitEngine { hit: None }));
        let (mut turn, mut rx) = turn_with_services(Arc::clone(&services), "anything");
        turn.tenant.retriever_engines = vector_choice();
        turn.session.fallback_strategy = FallbackStrategy::Fixed;
        turn.session.fallback_response = "I cannot answer.".to_string();

        let session_id = turn.session.id.clone();
        let request_id = turn.request_id.clone();
        services
            .streams
            .register(&session_id, &request_id, "anything")
            .await
            .expect("register stream");

        ChatPipeline::new().run(&mut turn).await.expect("turn");
        drop(turn);

        let frames = collect_frames(&mut rx).await;
        assert_eq!(
            frames,
            vec![
                ChatFrame::References(Vec::new()),
                ChatFrame::Answer {
                    content: "I cannot answer.".to_string(),
                    done: true,
                },
            ]
        );

        let message = Message::find_by_request(&session_id, &request_id, &services.db)
            .await
            .expect("lookup")
            .expect("assistant message persisted");
        assert_eq!(message.content, "I cannot answer.");
        assert!(message.references.is_empty());
    }

    #[tokio::test]
    async fn chat_failure_emits_an_error_frame_after_references() {
        let services = test_services(ScriptedChat::failing()).await;
        let services = with_engine(
            services,
            Arc::new(SingleHitEngine {
                hit: Some(comet_hit()),
            }),
        );
        let (mut turn, mut rx) = turn_with_services(Arc::clone(&services), "question");
        turn.tenant.retriever_engines = vector_choice();

        let result = ChatPipeline::new().run(&mut turn).await;
        assert!(result.is_err());
        drop(turn);

        let frames = collect_frames(&mut rx).await;
        assert!(matches!(frames.first(), Some(ChatFrame::References(_))));
        assert!(matches!(frames.last(), Some(ChatFrame::Error { .. })));
    }

    #[tokio::test]
    async fn resume_replays_snapshot_then_live_deltas_until_complete() {
        let services = test_services(ScriptedChat::with_deltas(&["x"])).await;
        let streams = Arc::clone(&services.streams);

        streams.register("s1", "r1", "q").await.expect("register");
        streams
            .update(
                "s1",
                "r1",
                "Hello ",
                Some(&[ChunkReference {
                    chunk_id: "c1".to_string(),
                    knowledge_id: "k1".to_string(),
                    score: 0.8,
                    match_type: MatchType::Hybrid,
                }]),
            )
            .await
            .expect("update");

        let mut rx = resume_stream(
            Arc::clone(&services.streams),
            Arc::clone(&services.db),
            "s1".to_string(),
            "r1".to_string(),
        )
        .await
        .expect("resume");

        // Live producer finishes while the client replays.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            streams.update("s1", "r1", "world", None).await.expect("update");
            streams.complete("s1", "r1").await.expect("complete");
        });

        let frames = collect_frames(&mut rx).await;
        assert!(matches!(
            frames.first(),
            Some(ChatFrame::References(refs)) if refs.len() == 1
        ));

        let mut content = String::new();
        let mut saw_done = false;
        for frame in &frames {
            if let ChatFrame::Answer { content: delta, done } = frame {
                content.push_str(delta);
                saw_done = saw_done || *done;
            }
        }
        assert_eq!(content, "Hello world");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn resume_falls_back_to_the_persisted_message() {
        let services = test_services(ScriptedChat::with_deltas(&["x"])).await;

        let mut message = Message::new(
            "s1".to_string(),
            "r9".to_string(),
            MessageRole::Assistant,
            "Persisted answer.".to_string(),
            Vec::new(),
        );
        message.id = "r9".to_string();
        services.db.store_item(message).await.expect("store");

        let mut rx = resume_stream(
            Arc::clone(&services.streams),
            Arc::clone(&services.db),
            "s1".to_string(),
            "r9".to_string(),
        )
        .await
        .expect("resume");
        let frames = collect_frames(&mut rx).await;

        assert_eq!(
            frames,
            vec![
                ChatFrame::References(Vec::new()),
                ChatFrame::Answer {
                    content: "Persisted answer.".to_string(),
                    done: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn resume_of_unknown_request_is_not_found() {
        let services = test_services(ScriptedChat::with_deltas(&["x"])).await;
        let result = resume_stream(
            Arc::clone(&services.streams),
            Arc::clone(&services.db),
            "s1".to_string(),
            "missing".to_string(),
        )
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
