use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared_types::ProviderConfig;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Shared HTTP connection pool for every provider client. Deadlines are
/// enforced by the dispatch scheduler; the client timeout is only a safety
/// net against leaked connections.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .expect("failed to build HTTP client")
});

/// Failure modes of a single provider call. Timeouts are not represented
/// here: the scheduler owns deadlines and classifies them itself.
#[derive(Debug, Error, Clone)]
pub enum ProviderCallError {
    #[error("remote error: {0}")]
    Remote(String),

    #[error("call canceled")]
    Canceled,
}

/// Successful provider output.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// One upstream LLM endpoint. `generate` must return promptly once `cancel`
/// fires.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerateOutput, ProviderCallError>;

    /// Cheap liveness check used by the background health probe.
    async fn probe(&self) -> bool {
        true
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// Rough token estimate (~4 chars per token) for providers that omit usage.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

fn compute_cost(tokens_in: u64, tokens_out: u64, cost_per_1k: f64) -> f64 {
    (tokens_in + tokens_out) as f64 / 1000.0 * cost_per_1k
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct HttpProviderClient {
    config: ProviderConfig,
}

impl HttpProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        HttpProviderClient { config }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn call(&self, prompt: &str) -> Result<GenerateOutput, ProviderCallError> {
        let body = ChatCompletionRequest {
            model: &self.config.model_name,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = HTTP_CLIENT.post(self.completions_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderCallError::Remote(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderCallError::Remote(format!(
                "status {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderCallError::Remote(format!("invalid response body: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderCallError::Remote("no choices in response".to_string()))?;

        let (tokens_in, tokens_out) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (estimate_tokens(prompt), estimate_tokens(&text)),
        };

        Ok(GenerateOutput {
            cost: compute_cost(tokens_in, tokens_out, self.config.cost_per_1k_tokens),
            text,
            tokens_in,
            tokens_out,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerateOutput, ProviderCallError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderCallError::Canceled),
            result = self.call(prompt) => result,
        }
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let mut request = HTTP_CLIENT.get(url).timeout(Duration::from_secs(5));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
