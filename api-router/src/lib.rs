use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use middleware_api_auth::api_auth;
use routes::{
    chat::{continue_stream, knowledge_chat},
    chunks::{delete_chunk, delete_knowledge_chunks, list_chunks},
    knowledge::{
        delete_knowledge, download_knowledge, get_knowledge, get_knowledge_batch, list_knowledge,
        upload_knowledge_file, upload_knowledge_url,
    },
    knowledge_bases::{
        copy_knowledge_base, create_knowledge_base, delete_knowledge_base, get_knowledge_base,
        hybrid_search_knowledge_base, list_knowledge_bases, update_knowledge_base,
    },
    messages::{delete_message, load_messages},
    sessions::{
        create_session, delete_session, generate_title, get_session, knowledge_search,
        list_sessions, update_session,
    },
    tenants::{create_tenant, delete_tenant, get_tenant, list_tenants, update_tenant},
};

pub mod api_state;
pub mod error;
mod middleware_api_auth;
mod routes;

use api_state::ApiState;

/// Router for API functionality, version 1. Every endpoint requires a valid
/// `X-API-Key`.
pub fn api_routes_v1(state: ApiState) -> Router {
    Router::new()
        .route("/tenants", post(create_tenant).get(list_tenants))
        .route(
            "/tenants/{id}",
            get(get_tenant).put(update_tenant).delete(delete_tenant),
        )
        .route(
            "/knowledge-bases",
            post(create_knowledge_base).get(list_knowledge_bases),
        )
        .route("/knowledge-bases/copy", post(copy_knowledge_base))
        .route(
            "/knowledge-bases/{id}",
            get(get_knowledge_base)
                .put(update_knowledge_base)
                .delete(delete_knowledge_base),
        )
        .route(
            "/knowledge-bases/{id}/hybrid-search",
            get(hybrid_search_knowledge_base),
        )
        .route("/knowledge-bases/{id}/knowledge", get(list_knowledge))
        .route(
            "/knowledge-bases/{id}/knowledge/file",
            post(upload_knowledge_file),
        )
        .route(
            "/knowledge-bases/{id}/knowledge/url",
            post(upload_knowledge_url),
        )
        .route("/knowledge/batch", get(get_knowledge_batch))
        .route(
            "/knowledge/{id}",
            get(get_knowledge).delete(delete_knowledge),
        )
        .route("/knowledge/{id}/download", get(download_knowledge))
        .route(
            "/chunks/{knowledge_id}",
            get(list_chunks).delete(delete_knowledge_chunks),
        )
        .route("/chunks/{knowledge_id}/{id}", delete(delete_chunk))
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/continue-stream/{session_id}",
            get(continue_stream),
        )
        .route(
            "/sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/sessions/{id}/generate_title", post(generate_title))
        .route("/knowledge-chat/{session_id}", post(knowledge_chat))
        .route("/knowledge-search", post(knowledge_search))
        .route("/messages/{session_id}/load", get(load_messages))
        .route("/messages/{session_id}/{id}", delete(delete_message))
        .route_layer(from_fn_with_state(state.clone(), api_auth))
        .with_state(state)
}
