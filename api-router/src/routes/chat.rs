use std::{pin::Pin, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    Extension, Json,
};
use chat_pipeline::{pipeline::resume_stream, ChatFrame, ChatTurn};
use common::storage::types::{
    message::{Message, MessageRole},
    tenant::Tenant,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::error;

use crate::{
    api_state::ApiState,
    error::ApiError,
    middleware_api_auth::request_id_from,
    routes::{knowledge_bases::load_owned_kb, sessions::load_owned_session},
};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;
type SseResponse = Sse<KeepAliveStream<EventStream>>;

fn sse_with_keep_alive(stream: EventStream) -> SseResponse {
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn frame_to_event(frame: &ChatFrame) -> Event {
    let payload = match frame {
        ChatFrame::References(references) => json!({
            "response_type": "references",
            "references": references,
        }),
        ChatFrame::Answer { content, done } => json!({
            "response_type": "answer",
            "content": content,
            "done": done,
        }),
        ChatFrame::Error { message } => json!({
            "response_type": "answer",
            "content": "",
            "done": true,
            "error": message,
        }),
    };
    Event::default().data(payload.to_string())
}

fn sse_from_frames(mut rx: mpsc::Receiver<ChatFrame>) -> SseResponse {
    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok(frame_to_event(&frame));
        }
    };
    sse_with_keep_alive(Box::pin(stream))
}

#[derive(Deserialize)]
pub struct KnowledgeChatRequest {
    pub query: String,
    pub request_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ContinueStreamQuery {
    pub message_id: String,
}

/// One question-answering turn over SSE. The turn runs decoupled from this
/// connection; a disconnect leaves it producing into the stream manager so
/// `continue-stream` can pick it up.
pub async fn knowledge_chat(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<KnowledgeChatRequest>,
) -> Result<SseResponse, ApiError> {
    let session = load_owned_session(&state, &tenant, &session_id).await?;
    let kb = load_owned_kb(&state, &tenant, &session.kb_id).await?;
    let services = state.turn_services(&session, &kb).await?;

    let header_request_id = headers
        .get("X-Request-ID")
        .and_then(|value| value.to_str().ok());
    let request_id = request_id_from(header_request_id, body.request_id.as_deref());

    let history = Message::load_recent(
        &session.id,
        session.max_rounds.saturating_mul(2),
        &state.db,
    )
    .await?;

    // The user message lands before the pipeline starts.
    let user_message = Message::new(
        session.id.clone(),
        request_id.clone(),
        MessageRole::User,
        body.query.clone(),
        Vec::new(),
    );
    state.db.store_item(user_message).await?;

    services
        .streams
        .register(&session.id, &request_id, &body.query)
        .await?;

    let (tx, rx) = mpsc::channel(256);
    let mut turn = ChatTurn::new(
        services,
        tenant,
        kb,
        session,
        request_id,
        body.query,
        history,
        tx,
    );

    let pipeline = Arc::clone(&state.chat_pipeline);
    tokio::spawn(async move {
        if let Err(err) = pipeline.run(&mut turn).await {
            error!(error = %err, "Chat turn failed");
        }
    });

    Ok(sse_from_frames(rx))
}

/// Re-attach to a running or just-finished answer for this session.
pub async fn continue_stream(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    Query(query): Query<ContinueStreamQuery>,
) -> Result<SseResponse, ApiError> {
    let session = load_owned_session(&state, &tenant, &session_id).await?;

    let rx = resume_stream(
        Arc::clone(&state.streams),
        Arc::clone(&state.db),
        session.id,
        query.message_id,
    )
    .await?;

    Ok(sse_from_frames(rx))
}
