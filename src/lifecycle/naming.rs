//! Drafting dash-case drone names from seed prompts.

use async_trait::async_trait;
use serde::Deserialize;

use crate::registry::{DRAFT_NAME_MAX_LEN, Registry, is_valid_draft_name};

/// Suffix retries attempted when a drafted name collides (`-2` … `-7`).
pub const DRAFT_SUFFIX_RETRIES: u32 = 6;

/// Source of drafted names. The production implementation asks an LLM
/// endpoint; tests substitute a canned suggester.
#[async_trait]
pub trait NameSuggester: Send + Sync {
    /// Draft a dash-case name for the given seed prompt.
    async fn suggest(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Suggester backed by a JSON HTTP endpoint.
///
/// Contract: `POST <endpoint>` with `{"prompt": …, "style": "dash-case",
/// "maxLength": 48}` answers `{"name": …}`.
pub struct HttpNameSuggester {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpNameSuggester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNameSuggester")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SuggestResponse {
    name: String,
}

impl HttpNameSuggester {
    /// Build a suggester for the configured endpoint.
    #[must_use]
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl NameSuggester for HttpNameSuggester {
    async fn suggest(&self, prompt: &str) -> anyhow::Result<String> {
        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({
            "prompt": prompt,
            "style": "dash-case",
            "maxLength": DRAFT_NAME_MAX_LEN,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("naming endpoint returned {}", response.status());
        }
        let body: SuggestResponse = response.json().await?;
        Ok(body.name)
    }
}

/// Draft a free name for `prompt`: validate the suggestion, then try the
/// bare name and numeric suffixes `-2` … `-7` against live drones.
///
/// Returns `None` (never an error) when the draft is unusable or every
/// candidate collides; auto-naming is always non-fatal.
pub async fn draft_free_name(
    suggester: &dyn NameSuggester,
    registry: &Registry,
    prompt: &str,
) -> Option<String> {
    let raw = match suggester.suggest(prompt).await {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(error = %e, "name draft failed; keeping current name");
            return None;
        }
    };

    let candidate = raw.trim();
    if candidate != raw || !is_valid_draft_name(candidate) {
        tracing::debug!(draft = %raw, "discarding invalid name draft");
        return None;
    }

    if registry.get_by_name(candidate).await.is_none() {
        return Some(candidate.to_owned());
    }
    for n in 2..=(DRAFT_SUFFIX_RETRIES + 1) {
        let suffixed = format!("{candidate}-{n}");
        if suffixed.len() > crate::registry::NAME_MAX_LEN {
            break;
        }
        if registry.get_by_name(&suffixed).await.is_none() {
            return Some(suffixed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewDrone;

    struct FixedSuggester(&'static str);

    #[async_trait]
    impl NameSuggester for FixedSuggester {
        async fn suggest(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.to_owned())
        }
    }

    struct FailingSuggester;

    #[async_trait]
    impl NameSuggester for FailingSuggester {
        async fn suggest(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("model unavailable")
        }
    }

    fn registry(dir: &std::path::Path) -> Registry {
        Registry::load(&dir.join("registry.json")).expect("registry")
    }

    async fn occupy(registry: &Registry, name: &str) {
        registry
            .insert_starting(NewDrone {
                name: name.to_owned(),
                group: None,
                repo_path: None,
                container_port: 3000,
            })
            .await
            .expect("insert");
    }

    #[tokio::test]
    async fn uses_draft_when_free() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        let name = draft_free_name(&FixedSuggester("fix-login"), &registry, "fix login").await;
        assert_eq!(name.as_deref(), Some("fix-login"));
    }

    #[tokio::test]
    async fn retries_with_numeric_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        occupy(&registry, "fix-login").await;
        occupy(&registry, "fix-login-2").await;

        let name = draft_free_name(&FixedSuggester("fix-login"), &registry, "fix login").await;
        assert_eq!(name.as_deref(), Some("fix-login-3"));
    }

    #[tokio::test]
    async fn gives_up_after_all_suffixes_taken() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        occupy(&registry, "busy").await;
        for n in 2..=7 {
            occupy(&registry, &format!("busy-{n}")).await;
        }

        let name = draft_free_name(&FixedSuggester("busy"), &registry, "p").await;
        assert_eq!(name, None);
    }

    #[tokio::test]
    async fn invalid_drafts_are_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        assert_eq!(
            draft_free_name(&FixedSuggester("Has Spaces"), &registry, "p").await,
            None
        );
        assert_eq!(
            draft_free_name(&FixedSuggester("  padded  "), &registry, "p").await,
            None
        );
    }

    #[tokio::test]
    async fn suggester_failure_is_non_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        assert_eq!(draft_free_name(&FailingSuggester, &registry, "p").await, None);
    }
}
