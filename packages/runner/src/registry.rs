use std::collections::HashMap;

use bollard::image::ListImagesOptions;
use bollard::Docker;
use thiserror::Error;
use tracing::{debug, warn};

/// Label a runner image must carry to be discovered.
pub const RUNNER_LABEL: &str = "sandbox.runner";
/// Label naming the language a runner image executes.
pub const LANGUAGE_LABEL: &str = "sandbox.language";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to list docker images: {0}")]
    ImageList(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A discovered runner: the language it executes and the image to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerInfo {
    pub language: String,
    pub image: String,
}

/// Read-only catalog of language runners, built once at startup.
///
/// A deployment that adds a new runner image restarts the server; in
/// exchange the tool schema served by `tools/list` is stable for the
/// process lifetime.
pub struct RunnerRegistry {
    runners_by_language: HashMap<String, RunnerInfo>,
}

impl RunnerRegistry {
    /// Discover runner images from the Docker daemon by label.
    ///
    /// Images labelled `sandbox.runner=true` are indexed under their
    /// `sandbox.language` label; images without a language label are
    /// skipped. When several images declare the same language the last one
    /// seen wins; operators are expected to avoid the collision.
    pub async fn discover(docker: &Docker) -> Result<Self> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", RUNNER_LABEL)]);

        let images = docker
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await?;

        let mut runners_by_language = HashMap::new();
        for image in images {
            let language = match image.labels.get(LANGUAGE_LABEL) {
                Some(language) if !language.is_empty() => language.clone(),
                _ => {
                    debug!("skipping runner image {} without a language label", image.id);
                    continue;
                }
            };

            // Prefer a human-readable tag over the content-addressed id.
            let image_ref = image
                .repo_tags
                .first()
                .cloned()
                .unwrap_or_else(|| image.id.clone());

            if let Some(previous) = runners_by_language.insert(
                language.clone(),
                RunnerInfo {
                    language: language.clone(),
                    image: image_ref,
                },
            ) {
                warn!(
                    "multiple runner images declare language {}; replacing {}",
                    language, previous.image
                );
            }
        }

        Ok(Self { runners_by_language })
    }

    /// Build a registry from known runners, bypassing discovery.
    pub fn from_runners(runners: impl IntoIterator<Item = RunnerInfo>) -> Self {
        Self {
            runners_by_language: runners
                .into_iter()
                .map(|runner| (runner.language.clone(), runner))
                .collect(),
        }
    }

    pub fn lookup(&self, language: &str) -> Option<&RunnerInfo> {
        self.runners_by_language.get(language)
    }

    pub fn list(&self) -> Vec<RunnerInfo> {
        self.runners_by_language.values().cloned().collect()
    }

    /// Languages with a registered runner, sorted for stable tool schemas.
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> =
            self.runners_by_language.keys().cloned().collect();
        languages.sort();
        languages
    }

    pub fn is_empty(&self) -> bool {
        self.runners_by_language.is_empty()
    }
}
