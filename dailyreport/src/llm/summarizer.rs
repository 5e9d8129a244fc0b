// Summarizer module
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{clean_completion, LlmError, ProviderRegistry};
use crate::article::{ArticleContent, ArticleSummary};

#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    /// Article text is cut to this many characters before prompting
    pub max_input_chars: usize,
    pub max_tokens: usize,
    /// Calls in flight against the backend at any time
    pub max_concurrent: usize,
    /// Extra attempts after the first one, transient failures only
    pub max_retries: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            max_input_chars: 6000,
            max_tokens: 300,
            max_concurrent: 4,
            max_retries: 2,
            call_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// Turns article text into short abstracts through a registered provider.
///
/// All callers share one semaphore, so concurrent runs together never exceed
/// `max_concurrent` backend calls. A permit is held for one attempt only and
/// released while backing off.
pub struct Summarizer {
    registry: Arc<ProviderRegistry>,
    settings: SummarizerSettings,
    permits: Arc<Semaphore>,
}

impl Summarizer {
    pub fn new(registry: Arc<ProviderRegistry>, settings: SummarizerSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self { registry, settings, permits }
    }

    /// Summarize one article. Never fails: problems end up in the summary status.
    pub async fn summarize(&self, content: &ArticleContent, provider_id: &str) -> ArticleSummary {
        let article = content.article.clone();

        let provider = match self.registry.get(provider_id) {
            Some(p) => p,
            None => {
                warn!(origin = %article.origin, url = %article.url, stage = "summarize",
                      "unknown provider {}", provider_id);
                return ArticleSummary::failed(article, format!("unknown provider {}", provider_id), 0);
            }
        };

        let prompt = build_prompt(&article.title, truncate_chars(&content.body, self.settings.max_input_chars));
        let max_attempts = self.settings.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = {
                let _permit = match self.permits.acquire().await {
                    Ok(p) => p,
                    Err(_) => return ArticleSummary::failed(article, "summarizer shut down", attempt - 1),
                };
                match tokio::time::timeout(
                    self.settings.call_timeout,
                    provider.complete(&prompt, self.settings.max_tokens),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(LlmError::Timeout(self.settings.call_timeout)),
                }
            };

            let err = match result {
                Ok(text) => {
                    let text = clean_completion(&text);
                    if !text.is_empty() {
                        debug!(url = %article.url, attempt, "summary ok");
                        return ArticleSummary::ok(article, text, attempt);
                    }
                    LlmError::InvalidResponse("empty completion".to_string())
                }
                Err(e) => e,
            };

            if err.is_transient() && attempt < max_attempts {
                let delay = self.settings.backoff_base * 2u32.saturating_pow(attempt - 1);
                warn!(origin = %article.origin, url = %article.url, stage = "summarize",
                      "attempt {}/{} failed: {}. Retrying in {:?}", attempt, max_attempts, err, delay);
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(origin = %article.origin, url = %article.url, stage = "summarize",
                  "giving up after {} attempt(s): {}", attempt, err);
            return ArticleSummary::failed(article, err.to_string(), attempt);
        }
    }

    /// Summarize every article concurrently (bounded by the semaphore),
    /// returning summaries in input order.
    pub async fn summarize_all(&self, contents: &[ArticleContent], provider_id: &str) -> Vec<ArticleSummary> {
        join_all(contents.iter().map(|c| self.summarize(c, provider_id))).await
    }
}

fn build_prompt(title: &str, body: &str) -> String {
    format!(
        r#"You are an editor writing a daily briefing of AI news.
Summarize the article below in 2-3 sentences (at most 120 words).
Keep the article's original language. Reply with the summary only: no title, no preamble, no markdown.

TITLE: {}

ARTICLE:
{}
"#,
        title, body
    )
}

/// Longest prefix of `text` with at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::{ArticleRef, ExtractionStatus, SummaryStatus};
    use crate::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted results, then keeps answering "fine"
    struct Scripted {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self.script.lock().unwrap().pop_front();
            let content = match next {
                Some(r) => r?,
                None => format!("fine ({} chars)", request.prompt.len()),
            };
            Ok(LlmResponse { content, usage: UsageMetadata::default(), model: "scripted".into() })
        }
    }

    fn settings() -> SummarizerSettings {
        SummarizerSettings {
            max_input_chars: 50,
            max_tokens: 64,
            max_concurrent: 2,
            max_retries: 2,
            call_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
        }
    }

    fn summarizer(provider: Arc<Scripted>, settings: SummarizerSettings) -> Summarizer {
        let mut registry = ProviderRegistry::new();
        registry.register("openai", provider);
        Summarizer::new(Arc::new(registry), settings)
    }

    fn content(n: usize) -> ArticleContent {
        ArticleContent {
            article: ArticleRef::new("src", &format!("https://example.com/{}", n), format!("Title {}", n), None)
                .unwrap(),
            body: "Body text. ".repeat(20),
            status: ExtractionStatus::Extracted,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let provider = Arc::new(Scripted::new(vec![
            Err(LlmError::RateLimited("slow down".into())),
            Err(LlmError::Server { status: 502, body: String::new() }),
            Ok("Summary: A short abstract.".into()),
        ]));
        let s = summarizer(provider.clone(), settings());

        let summary = s.summarize(&content(1), "openai").await;
        assert!(summary.is_ok());
        assert_eq!(summary.text, "A short abstract.");
        assert_eq!(summary.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = Arc::new(Scripted::new(vec![Err(LlmError::Auth { status: 401, body: "bad key".into() })]));
        let s = summarizer(provider.clone(), settings());

        let summary = s.summarize(&content(1), "openai").await;
        assert!(matches!(summary.status, SummaryStatus::Failed(ref r) if r.contains("401")));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_into_failed_summary() {
        let outage = (0..5).map(|_| Err(LlmError::Transport("connection reset".into()))).collect();
        let provider = Arc::new(Scripted::new(outage));
        let s = summarizer(provider.clone(), settings());

        let summary = s.summarize(&content(1), "openai").await;
        assert!(!summary.is_ok());
        assert_eq!(summary.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_provider_fails_without_calls() {
        let provider = Arc::new(Scripted::new(vec![]));
        let s = summarizer(provider.clone(), settings());

        let summary = s.summarize(&content(1), "anthropic").await;
        assert!(!summary.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_order_kept() {
        let mut scripted = Scripted::new(vec![]);
        scripted.delay = Duration::from_millis(20);
        let provider = Arc::new(scripted);
        let s = summarizer(provider.clone(), settings());

        let contents: Vec<_> = (0..8).map(content).collect();
        let summaries = s.summarize_all(&contents, "openai").await;

        assert_eq!(summaries.len(), 8);
        assert!(summaries.iter().all(|s| s.is_ok()));
        for (i, summary) in summaries.iter().enumerate() {
            assert_eq!(summary.article.url, format!("https://example.com/{}", i));
        }
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn prompt_input_is_truncated() {
        let provider = Arc::new(Scripted::new(vec![]));
        let s = summarizer(provider.clone(), settings());
        let mut long = content(1);
        long.body = "x".repeat(10_000);

        let summary = s.summarize(&long, "openai").await;
        let template_len = build_prompt("Title 1", "").len();
        assert_eq!(summary.text, format!("fine ({} chars)", template_len + 50));
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("机器之心报道", 4), "机器之心");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
