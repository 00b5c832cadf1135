// ABOUTME: HTTP surface of the Runbox sandbox server
// ABOUTME: Bearer-authenticated JSON-RPC endpoint, file downloads and the test UI

pub mod auth;
pub mod files;
pub mod jsonrpc;
pub mod mcp;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
