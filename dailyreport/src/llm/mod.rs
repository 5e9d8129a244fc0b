use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

/// Core trait for LLM providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &str;

    /// Generate completion for a given request
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Plain-text completion of `prompt`, capped at `max_tokens`
    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, LlmError> {
        let response = self
            .generate(LlmRequest {
                prompt: prompt.to_string(),
                max_tokens: Some(max_tokens),
                temperature: None,
                timeout_seconds: None,
            })
            .await?;
        Ok(response.content)
    }
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("LLM authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::Transport(_) | LlmError::Timeout(_) | LlmError::Server { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown LLM provider '{requested}' (registered: {})", .known.join(", "))]
pub struct UnknownProvider {
    pub requested: String,
    pub known: Vec<String>,
}

/// Providers available to the summarizer, keyed by identifier
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let id = id.into();
        info!("Registering LLM provider: {} ({})", id, provider.name());
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(id).cloned()
    }

    /// Lookup that fails with the list of known identifiers
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn LlmProvider>, UnknownProvider> {
        self.get(id).ok_or_else(|| UnknownProvider {
            requested: id.to_string(),
            known: self.ids(),
        })
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub mod remote;
pub mod summarizer;

/// Strip markdown fences and a leading "Summary:" label some models add
pub fn clean_completion(text: &str) -> String {
    let mut body = text.trim();

    if let Some(start) = body.find("```") {
        let rest = &body[start + 3..];
        // skip an optional language tag on the fence line
        let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            body = rest[..end].trim();
        }
    }

    for label in ["Summary:", "summary:", "SUMMARY:", "摘要："] {
        if let Some(stripped) = body.strip_prefix(label) {
            body = stripped.trim_start();
            break;
        }
    }

    body.trim().to_string()
}
