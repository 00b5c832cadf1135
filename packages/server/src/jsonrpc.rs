use serde::{Deserialize, Serialize};
use serde_json::Value;

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Notifications carry no id and expect no response body.
    pub fn is_notification(&self) -> bool {
        self.id.is_null() && self.method.starts_with("notifications/")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// Tool results are wrapped in a single text content block per the MCP
/// convention; the text is the pretty-printed JSON of the tool's own result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: &'static str,
    pub text: String,
}

impl ToolResult {
    pub fn text(text: String) -> Self {
        Self {
            content: vec![ContentBlock {
                content_type: "text",
                text,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_success_response_shape() {
        let response = JsonRpcResponse::success(json!(1), json!({"ok": true}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response =
            JsonRpcResponse::error(Value::Null, METHOD_NOT_FOUND, "Method not found", None);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32601, "message": "Method not found"}
            })
        );
    }

    #[test]
    fn test_request_defaults_tolerate_missing_fields() {
        let request: JsonRpcRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.jsonrpc, "");
        assert!(request.id.is_null());
        assert!(request.method.is_empty());
        assert!(request.params.is_null());
    }

    #[test]
    fn test_notification_detection() {
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .unwrap();
        assert!(request.is_notification());

        let request: JsonRpcRequest = serde_json::from_value(
            json!({"jsonrpc": "2.0", "id": 5, "method": "notifications/initialized"}),
        )
        .unwrap();
        assert!(!request.is_notification());
    }

    #[test]
    fn test_tool_result_single_text_block() {
        let result = ToolResult::text("{\n  \"success\": true\n}".to_string());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["content"].as_array().unwrap().len(), 1);
        assert_eq!(value["content"][0]["type"], "text");
    }
}
