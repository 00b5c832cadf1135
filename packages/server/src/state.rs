use std::sync::Arc;

use runbox_filesign::Signer;
use runbox_runner::{Executor, RunnerRegistry};
use runbox_sandbox::SandboxManager;

/// Shared server state handed to every handler.
///
/// Everything here is read-only after startup; concurrent requests share the
/// registry and the manager's filesystem operations without coordination.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RunnerRegistry>,
    pub executor: Arc<Executor>,
    pub sandbox: Arc<SandboxManager>,
    pub signer: Arc<Signer>,
    pub api_token: String,
}
