//! AI bridge (C8): an `AiBackend` trait wrapping the external text generator, invoked
//! off the request path on a bounded `tokio` task set.
//!
//! No teacher counterpart exists for this component; it follows SPEC_FULL.md §9's
//! "fire-and-forget submission to a bounded task pool, back-pressure by rejection" note.
//! HTTP-calling backends use `reqwest`, the same crate `vbmcoder-pingo` depends on for its own
//! (blocking) HTTP needs, used here in async form since this crate is tokio-async throughout.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A pure `prompt -> text` generator. The server treats failures as non-fatal: the caller
/// gets an immediate `ACK` regardless, and a failed generation simply produces no message.
#[async_trait::async_trait]
pub trait AiBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// `AI_BACKEND=none` (the default): generation always fails, for deployments without an AI
/// reply feature configured.
pub struct NoneBackend;

#[async_trait::async_trait]
impl AiBackend for NoneBackend {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        anyhow::bail!("no AI backend configured")
    }
}

/// `AI_BACKEND=openai`: Chat Completions-shaped request against `OPENAI_API_KEY`.
pub struct OpenaiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenaiBackend {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        }
    }
}

#[async_trait::async_trait]
impl AiBackend for OpenaiBackend {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        if self.api_key.is_empty() {
            anyhow::bail!("OPENAI_API_KEY not set");
        }
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        resp["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("unexpected OpenAI response shape"))
    }
}

/// `AI_BACKEND=ollama`: local Ollama `/api/generate` endpoint, non-streaming.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3".to_string()),
        }
    }
}

#[async_trait::async_trait]
impl AiBackend for OllamaBackend {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        resp["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("unexpected Ollama response shape"))
    }
}

pub fn backend_from_name(name: &str) -> Arc<dyn AiBackend> {
    match name {
        "openai" => Arc::new(OpenaiBackend::from_env()),
        "ollama" => Arc::new(OllamaBackend::from_env()),
        _ => Arc::new(NoneBackend),
    }
}

/// Most recent messages considered for a generation prompt, per spec §4.7.
pub const PROMPT_HISTORY: i64 = 20;

/// Bounded concurrency gate for outstanding generation calls. Submissions beyond the bound are
/// rejected (dropped + logged) rather than queued, per spec §5's AI-task back-pressure note.
pub struct AiBridge {
    backend: Arc<dyn AiBackend>,
    permits: Arc<Semaphore>,
}

impl AiBridge {
    pub fn new(backend: Arc<dyn AiBackend>, max_concurrent: usize) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Fire-and-forget a generation call; `on_result` runs on the spawned task once the call
    /// succeeds (failures are logged and swallowed — the caller never learns of them).
    pub fn submit<F, Fut>(&self, prompt: String, on_result: F) -> bool
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!("AI task pool saturated, rejecting generation request");
            return false;
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match backend.generate(&prompt).await {
                Ok(text) => on_result(text).await,
                Err(err) => tracing::warn!(error = %err, "AI generation failed, dropping"),
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoBackend;

    #[async_trait::async_trait]
    impl AiBackend for EchoBackend {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl AiBackend for FailingBackend {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn test_submit_invokes_callback_on_success() {
        let bridge = AiBridge::new(Arc::new(EchoBackend), 4);
        let got = Arc::new(std::sync::Mutex::new(None));
        let got2 = got.clone();
        bridge.submit("hi".into(), move |text| async move {
            *got2.lock().unwrap() = Some(text);
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(got.lock().unwrap().as_deref(), Some("echo: hi"));
    }

    #[tokio::test]
    async fn test_submit_swallows_failure() {
        let bridge = AiBridge::new(Arc::new(FailingBackend), 4);
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        bridge.submit("hi".into(), move |_| async move {
            called2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let bridge = AiBridge::new(Arc::new(EchoBackend), 0);
        assert!(!bridge.submit("hi".into(), |_| async move {}));
    }
}
