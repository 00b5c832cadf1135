// ABOUTME: JSON-RPC dispatcher and the three sandbox tools
// ABOUTME: Protocol errors become JSON-RPC errors; tool errors become success=false payloads

use std::collections::HashMap;
use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, response::Response, Json};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jsonrpc::{
    JsonRpcRequest, JsonRpcResponse, ToolResult, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::state::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "runbox";

/// Environment variable injected into every execution so generated markdown
/// can reference files by their public URLs.
pub const FILE_BASE_URL_VAR: &str = "FILE_BASE_URL";

/// POST /mcp: parse one JSON-RPC request and dispatch it.
pub async fn handle_post(State(state): State<AppState>, body: Bytes) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("unparseable JSON-RPC request: {}", e);
            return Json(JsonRpcResponse::error(
                Value::Null,
                PARSE_ERROR,
                "Parse error",
                Some(json!(e.to_string())),
            ))
            .into_response();
        }
    };

    if request.is_notification() {
        // Notifications expect no response body.
        return StatusCode::ACCEPTED.into_response();
    }

    Json(dispatch(&state, request).await).into_response()
}

pub async fn dispatch(state: &AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    debug!("rpc method {} (id {})", request.method, request.id);

    if request.jsonrpc != crate::jsonrpc::JSONRPC_VERSION {
        return JsonRpcResponse::error(
            request.id,
            INVALID_REQUEST,
            "Invalid JSON-RPC version",
            None,
        );
    }

    match request.method.as_str() {
        "initialize" => initialize(request.id),
        "ping" => JsonRpcResponse::success(request.id, json!({})),
        "tools/list" => tools_list(state, request.id),
        "tools/call" => tools_call(state, request.id, request.params).await,
        method => JsonRpcResponse::error(
            request.id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
            None,
        ),
    }
}

fn initialize(id: Value) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": {}
            }
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn tools_call(state: &AppState, id: Value, params: Value) -> JsonRpcResponse {
    let params: ToolCallParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "Invalid params",
                Some(json!(e.to_string())),
            );
        }
    };

    info!("tool call: {}", params.name);

    match params.name.as_str() {
        "upload_file" => upload_file(state, id, params.arguments),
        "run_code" => run_code(state, id, params.arguments).await,
        "list_runners" => list_runners(state, id),
        name => JsonRpcResponse::error(
            id,
            METHOD_NOT_FOUND,
            format!("Tool not found: {}", name),
            None,
        ),
    }
}

// --- tool argument and result shapes -------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCodeArgs {
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    code: String,
    network: Option<bool>,
    environment: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadFileArgs {
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
pub struct FileDescriptor {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
struct RunCodeResult {
    success: bool,
    stdout: String,
    stderr: String,
    files: Vec<FileDescriptor>,
}

impl RunCodeResult {
    fn failure(stderr: String) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr,
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct UploadFileResult {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<FileDescriptor>,
}

#[derive(Debug, Serialize)]
struct RunnerDescriptor {
    language: String,
    image: String,
}

#[derive(Debug, Serialize)]
struct ListRunnersResult {
    languages: Vec<RunnerDescriptor>,
}

// --- tool implementations -------------------------------------------------

async fn run_code(state: &AppState, id: Value, arguments: Value) -> JsonRpcResponse {
    let args: RunCodeArgs = match serde_json::from_value(arguments) {
        Ok(args) => args,
        Err(e) => {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "Invalid arguments",
                Some(json!(e.to_string())),
            );
        }
    };

    if args.conversation_id.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "conversationId is required", None);
    }
    if args.language.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "language is required", None);
    }
    if args.code.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "code is required", None);
    }

    let Some(runner) = state.registry.lookup(&args.language).cloned() else {
        return wrap_tool_result(
            id,
            &RunCodeResult::failure(format!("Unsupported language: {}", args.language)),
        );
    };

    let sandbox_dir = match state.sandbox.ensure(&args.conversation_id) {
        Ok(dir) => dir,
        Err(e) => {
            return wrap_tool_result(
                id,
                &RunCodeResult::failure(format!("Failed to create sandbox: {}", e)),
            );
        }
    };

    let host_path = state
        .sandbox
        .host_path(&args.conversation_id)
        .to_string_lossy()
        .into_owned();

    let mut environment = args.environment.unwrap_or_default();
    environment.insert(
        FILE_BASE_URL_VAR.to_string(),
        state.signer.file_base_url(&sandbox_dir.hashed_id),
    );
    let network_enabled = args.network.unwrap_or(false);

    info!(
        "executing {} code in sandbox {} (network: {}, env vars: {})",
        args.language,
        sandbox_dir.hashed_id,
        network_enabled,
        environment.len()
    );

    // The execution runs in its own task so container cleanup always runs
    // to completion, but the caller's lifetime still bounds the run: this
    // handler future is dropped when the client disconnects, the guard
    // fires the token, and the execution reports timed_out.
    let cancel = CancellationToken::new();
    let execution_cancel = cancel.clone();
    let _cancel_guard = cancel.drop_guard();

    let executor = Arc::clone(&state.executor);
    let code = args.code;
    let outcome = tokio::spawn(async move {
        executor
            .execute(
                &runner.image,
                &host_path,
                &code,
                network_enabled,
                &environment,
                &execution_cancel,
            )
            .await
    })
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("execution task failed: {}", e);
            return wrap_tool_result(
                id,
                &RunCodeResult::failure(format!("Execution task failed: {}", e)),
            );
        }
    };

    debug!(
        "execution finished: success={} exit_code={} timed_out={}",
        outcome.success, outcome.exit_code, outcome.timed_out
    );

    wrap_tool_result(
        id,
        &RunCodeResult {
            success: outcome.success,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            files: list_file_descriptors(state, &args.conversation_id),
        },
    )
}

fn upload_file(state: &AppState, id: Value, arguments: Value) -> JsonRpcResponse {
    let args: UploadFileArgs = match serde_json::from_value(arguments) {
        Ok(args) => args,
        Err(e) => {
            return JsonRpcResponse::error(
                id,
                INVALID_PARAMS,
                "Invalid arguments",
                Some(json!(e.to_string())),
            );
        }
    };

    if args.conversation_id.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "conversationId is required", None);
    }
    if args.filename.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "filename is required", None);
    }
    if args.content.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "content is required", None);
    }

    let content = match BASE64.decode(&args.content) {
        Ok(content) => content,
        Err(e) => {
            return wrap_tool_result(
                id,
                &UploadFileResult {
                    success: false,
                    message: format!("Failed to decode base64 content: {}", e),
                    file: None,
                },
            );
        }
    };

    if let Err(e) = state
        .sandbox
        .write_file(&args.conversation_id, &args.filename, &content)
    {
        return wrap_tool_result(
            id,
            &UploadFileResult {
                success: false,
                message: format!("Failed to write file: {}", e),
                file: None,
            },
        );
    }

    let url = state.signer.file_url(&args.conversation_id, &args.filename);
    info!("uploaded {} ({} bytes) -> {}", args.filename, content.len(), url);

    wrap_tool_result(
        id,
        &UploadFileResult {
            success: true,
            message: format!(
                "File '{}' uploaded successfully ({} bytes)",
                args.filename,
                content.len()
            ),
            file: Some(FileDescriptor {
                name: args.filename,
                url,
            }),
        },
    )
}

fn list_runners(state: &AppState, id: Value) -> JsonRpcResponse {
    let mut runners = state.registry.list();
    runners.sort_by(|a, b| a.language.cmp(&b.language));

    wrap_tool_result(
        id,
        &ListRunnersResult {
            languages: runners
                .into_iter()
                .map(|runner| RunnerDescriptor {
                    language: runner.language,
                    image: runner.image,
                })
                .collect(),
        },
    )
}

fn list_file_descriptors(state: &AppState, conversation_id: &str) -> Vec<FileDescriptor> {
    match state.sandbox.list_files(conversation_id) {
        Ok(mut names) => {
            names.sort();
            names
                .into_iter()
                .map(|name| FileDescriptor {
                    url: state.signer.file_url(conversation_id, &name),
                    name,
                })
                .collect()
        }
        Err(e) => {
            warn!("failed to list sandbox files: {}", e);
            Vec::new()
        }
    }
}

fn wrap_tool_result<T: Serialize>(id: Value, result: &T) -> JsonRpcResponse {
    let text = serde_json::to_string_pretty(result)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {}\"}}", e));
    let wrapped = serde_json::to_value(ToolResult::text(text)).unwrap_or(Value::Null);
    JsonRpcResponse::success(id, wrapped)
}

// --- tool schemas ---------------------------------------------------------

fn tools_list(state: &AppState, id: Value) -> JsonRpcResponse {
    let languages = state.registry.languages();

    let run_code_description = format!(
        "Execute code in a sandboxed container. Supported languages: {}. \
         The container starts in /data, a per-conversation directory that \
         persists across executions; read and write files there with \
         relative paths. Every file written to /data becomes downloadable \
         and is returned in the result's `files` list.\n\n\
         The environment variable FILE_BASE_URL is injected automatically; \
         any file reference emitted for the end user (markdown links, image \
         tags) must be built as FILE_BASE_URL + '/' + filename - bare \
         relative paths will render as broken links.",
        languages.join(", ")
    );

    let tools = json!([
        {
            "name": "upload_file",
            "description": "Upload a file into the conversation's sandbox. The file lands in /data for subsequent run_code calls. Use this to provide data files (CSV, JSON, ...) before running code against them.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "conversationId": {
                        "type": "string",
                        "description": "Unique identifier for the conversation/session"
                    },
                    "filename": {
                        "type": "string",
                        "description": "Name of the file to create (e.g. 'data.csv')"
                    },
                    "content": {
                        "type": "string",
                        "description": "Base64 encoded file content"
                    }
                },
                "required": ["conversationId", "filename", "content"]
            }
        },
        {
            "name": "run_code",
            "description": run_code_description,
            "inputSchema": {
                "type": "object",
                "properties": {
                    "conversationId": {
                        "type": "string",
                        "description": "Unique identifier for the conversation/session; isolates the sandbox directory"
                    },
                    "language": {
                        "type": "string",
                        "description": "Programming language to execute",
                        "enum": languages
                    },
                    "code": {
                        "type": "string",
                        "description": "The code to execute; files written to /data persist and are returned as download URLs"
                    },
                    "network": {
                        "type": "boolean",
                        "description": "Enable network access for the container (default: false)"
                    },
                    "environment": {
                        "type": "object",
                        "description": "Environment variables to pass to the container",
                        "additionalProperties": {"type": "string"}
                    }
                },
                "required": ["conversationId", "language", "code"]
            }
        },
        {
            "name": "list_runners",
            "description": "List the available code execution runners and their container images",
            "inputSchema": {
                "type": "object"
            }
        }
    ]);

    JsonRpcResponse::success(id, json!({ "tools": tools }))
}
