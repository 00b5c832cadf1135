// ABOUTME: Hashed sandbox identifiers and download URL construction
// ABOUTME: The URL path segment is itself the keyed hash, so URLs need no signature

use sha2::{Digest, Sha256};

/// Length of a hashed sandbox id in hex characters.
pub const HASHED_ID_LEN: usize = 64;

/// Mints hashed sandbox ids and file download URLs.
///
/// The directory segment of a download URL is `SHA-256(conversation_id ‖
/// secret)`: guessing a valid URL is as hard as guessing an HMAC tag of the
/// same length, so no separate signature is carried.
#[derive(Debug, Clone)]
pub struct Signer {
    secret: String,
    public_base_url: String,
}

impl Signer {
    pub fn new(secret: impl Into<String>, public_base_url: impl Into<String>) -> Self {
        let public_base_url = public_base_url.into();
        Self {
            secret: secret.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Hash a conversation id into the filesystem- and URL-safe directory
    /// name. Deterministic: 64 lowercase hex characters.
    pub fn hashed_id(&self, conversation_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(conversation_id.as_bytes());
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build the public download URL for a file in a conversation's sandbox.
    pub fn file_url(&self, conversation_id: &str, filename: &str) -> String {
        format!(
            "{}/files/{}/{}",
            self.public_base_url,
            self.hashed_id(conversation_id),
            urlencoding::encode(filename)
        )
    }

    /// The public base URL with any trailing slash removed.
    pub fn base_url(&self) -> &str {
        &self.public_base_url
    }

    /// The base URL under which a conversation's files are served; injected
    /// into runner containers as FILE_BASE_URL.
    pub fn file_base_url(&self, hashed_id: &str) -> String {
        format!("{}/files/{}", self.public_base_url, hashed_id)
    }
}

/// Check that a string is a well-formed hashed id: exactly 64 lowercase hex
/// characters. Enforced before any filesystem access on download.
pub fn is_valid_hashed_id(candidate: &str) -> bool {
    candidate.len() == HASHED_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
