// ABOUTME: Public file download endpoint for sandbox contents
// ABOUTME: Unguessable hashed-id URLs with traversal defense on the realized path

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use crate::state::AppState;

/// GET /files/{hashed_id}/{filename}
///
/// No authentication: the hashed id is SHA-256(conversation_id ‖ secret),
/// so knowing a valid URL is the capability. The id is validated before any
/// filesystem access and the realized path must stay under the sandbox root.
pub async fn download(
    State(state): State<AppState>,
    Path((hashed_id, filename)): Path<(String, String)>,
) -> Response {
    if !runbox_filesign::is_valid_hashed_id(&hashed_id) {
        return (StatusCode::BAD_REQUEST, "Invalid directory hash").into_response();
    }

    let path = state.sandbox.file_path(&hashed_id, &filename);

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
        Err(e) => {
            error!("failed to stat download path: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    if metadata.is_dir() {
        return (StatusCode::BAD_REQUEST, "Not a file").into_response();
    }

    // Traversal defense: resolve the path and require the sandbox root as a
    // prefix. Catches `..` segments that arrive percent-encoded inside the
    // filename and symlinks pointing out of the root.
    let root = match tokio::fs::canonicalize(state.sandbox.sandbox_root()).await {
        Ok(root) => root,
        Err(e) => {
            error!("failed to resolve sandbox root: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };
    let resolved = match tokio::fs::canonicalize(&path).await {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("failed to resolve download path: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };
    if !resolved.starts_with(&root) {
        warn!("path traversal attempt on hashed id {}", hashed_id);
        return (StatusCode::FORBIDDEN, "Invalid file path").into_response();
    }

    let bytes = match tokio::fs::read(&resolved).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read download path: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(&filename).to_string()),
            (header::CONTENT_DISPOSITION, content_disposition_for(&filename)),
        ],
        bytes,
    )
        .into_response()
}

/// Filename hint for the browser; quotes, backslashes and control bytes are
/// stripped so the header stays parseable.
fn content_disposition_for(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    format!("inline; filename=\"{}\"", safe)
}

/// Minimal extension-based content type guess for common sandbox outputs.
fn content_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "log" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("report.txt", "text/plain; charset=utf-8")]
    #[case("chart.PNG", "image/png")]
    #[case("data.csv", "text/csv")]
    #[case("index.html", "text/html; charset=utf-8")]
    #[case("archive.tar.gz", "application/octet-stream")]
    #[case("noextension", "application/octet-stream")]
    fn test_content_type_for(#[case] filename: &str, #[case] expected: &str) {
        assert_eq!(content_type_for(filename), expected);
    }

    #[test]
    fn test_content_disposition_carries_filename() {
        assert_eq!(
            content_disposition_for("report.csv"),
            "inline; filename=\"report.csv\""
        );
    }

    #[test]
    fn test_content_disposition_strips_unsafe_characters() {
        assert_eq!(
            content_disposition_for("evil\"name\r\n.txt"),
            "inline; filename=\"evilname.txt\""
        );
    }
}
