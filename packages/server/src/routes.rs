// ABOUTME: Router assembly for the HTTP surface
// ABOUTME: /mcp (bearer, JSON-RPC + SSE), /files downloads and the test UI

use std::convert::Infallible;

use axum::{
    http::Method,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::Html,
    routing::get,
    routing::post,
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::state::AppState;
use crate::{auth, files, mcp};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    // Single /mcp endpoint per the MCP streamable-HTTP transport: POST for
    // JSON-RPC messages, GET for the SSE stream. Auth wraps both.
    let mcp_routes = Router::new()
        .route("/mcp", post(mcp::handle_post).get(handle_sse))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/", get(homepage))
        .route("/files/{hashed_id}/{filename}", get(files::download))
        .merge(mcp_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// GET /mcp: hold an SSE stream open until the client disconnects.
///
/// v1 sends no server-initiated events; the opening comment confirms the
/// stream and keep-alive comments hold intermediaries off.
async fn handle_sse() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE stream established");
    let stream = stream::once(async {
        Ok::<_, Infallible>(Event::default().comment("runbox MCP stream connected"))
    })
    .chain(stream::pending());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /: embedded single-page test console.
async fn homepage() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}
