// ABOUTME: Environment-driven configuration for the Runbox server
// ABOUTME: Reads and validates MCP_*, SANDBOX_* and FILE_SECRET variables

use std::env;
use thiserror::Error;

// Environment variable names
pub const MCP_HTTP_ADDR: &str = "MCP_HTTP_ADDR";
pub const MCP_API_TOKEN: &str = "MCP_API_TOKEN";
pub const SANDBOX_ROOT: &str = "SANDBOX_ROOT";
pub const SANDBOX_HOST_PATH: &str = "SANDBOX_HOST_PATH";
pub const FILE_SECRET: &str = "FILE_SECRET";
pub const PUBLIC_BASE_URL: &str = "PUBLIC_BASE_URL";
pub const DOCKER_HOST: &str = "DOCKER_HOST";

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP server.
    pub http_addr: String,
    /// Bearer token expected on `/mcp`.
    pub api_token: String,
    /// Root directory for sandbox filesystem operations (server's view).
    pub sandbox_root: String,
    /// Root directory on the Docker host used in bind mounts. Differs from
    /// `sandbox_root` only when the server itself runs in a container
    /// sharing the host's Docker daemon.
    pub sandbox_host_path: String,
    /// Secret mixed into the sandbox-id hash.
    pub file_secret: String,
    /// Base URL for download URLs and FILE_BASE_URL injection.
    pub public_base_url: String,
    /// Optional Docker daemon endpoint override (consumed by bollard).
    pub docker_host: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sandbox_root = required(SANDBOX_ROOT)?;
        let sandbox_host_path =
            env_or_default(SANDBOX_HOST_PATH, &sandbox_root);

        Ok(Config {
            http_addr: normalize_addr(&env_or_default(MCP_HTTP_ADDR, DEFAULT_HTTP_ADDR)),
            api_token: required(MCP_API_TOKEN)?,
            sandbox_root,
            sandbox_host_path,
            file_secret: required(FILE_SECRET)?,
            public_base_url: required(PUBLIC_BASE_URL)?,
            docker_host: env::var(DOCKER_HOST).ok().filter(|v| !v.is_empty()),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Accept the ":8080" shorthand for an all-interfaces listen address.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}
