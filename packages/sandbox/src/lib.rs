// ABOUTME: Sandbox directory management for per-conversation scratch areas
// ABOUTME: Owns the on-disk layout and the server-view/host-view path split

pub mod manager;

pub use manager::{ManagerError, SandboxDir, SandboxManager};

pub type Result<T> = std::result::Result<T, ManagerError>;
