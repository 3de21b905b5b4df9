use prbot_adapters::config::LlmSettings;
use prbot_core::truncate::truncate_str;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Connect timeout for the HTTP client. The overall per-attempt budget is
/// enforced by the retry loop.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// A system + user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
}

impl ChatPrompt {
    pub fn len_chars(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }
}

/// Anything that can answer a chat prompt.
pub trait ChatCompletion: Send + Sync {
    fn complete<'a>(
        &'a self,
        prompt: &'a ChatPrompt,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;

    fn model(&self) -> &str;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    /// Content can be null in some API responses (e.g., when refusal or error occurs)
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Provider error body, sometimes returned with a 200 status.
#[derive(Deserialize)]
struct ProviderError {
    error: ProviderApiError,
}

#[derive(Deserialize)]
struct ProviderApiError {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// OpenAI-compatible chat-completion client.
pub struct ChatClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatClient {
    pub fn new(settings: &LlmSettings) -> anyhow::Result<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            anyhow::anyhow!("No API key configured. Set PRBOT_LLM_API_KEY or OPENAI_API_KEY.")
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_url: settings.api_url.clone(),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }

    async fn send(&self, prompt: &ChatPrompt) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        parse_completion(status, &text)
    }
}

impl ChatCompletion for ChatClient {
    fn complete<'a>(
        &'a self,
        prompt: &'a ChatPrompt,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(self.send(prompt))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Turn a raw HTTP response into the completion text or an error whose message
/// carries the status code for categorization.
fn parse_completion(status: reqwest::StatusCode, text: &str) -> anyhow::Result<String> {
    if !status.is_success() {
        let detail = match serde_json::from_str::<ProviderError>(text) {
            Ok(err) => truncate_str(&err.error.message, MAX_ERROR_CONTENT_LEN).to_string(),
            Err(_) => truncate_str(text.trim(), MAX_ERROR_CONTENT_LEN).to_string(),
        };
        return Err(anyhow::anyhow!("HTTP {}: {}", status.as_u16(), detail));
    }

    // Some gateways return errors with a 200 status.
    if let Ok(err) = serde_json::from_str::<ProviderError>(text) {
        let code = err
            .error
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "500".to_string());
        return Err(anyhow::anyhow!(
            "HTTP {}: {}",
            code.trim_matches('"'),
            truncate_str(&err.error.message, MAX_ERROR_CONTENT_LEN)
        ));
    }

    let parsed: ChatResponse = serde_json::from_str(text)
        .map_err(|e| anyhow::anyhow!("Failed to parse chat completion response: {}", e))?;
    let choice = parsed.choices.first();

    if let Some(refusal) = choice.and_then(|c| c.message.refusal.as_deref()) {
        return Err(anyhow::anyhow!(
            "Request was refused: {}",
            truncate_str(refusal, MAX_ERROR_CONTENT_LEN)
        ));
    }

    let content = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(anyhow::anyhow!("API returned empty response"));
    }
    Ok(content)
}

fn map_transport_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("chat completion request timed out")
    } else if err.is_connect() {
        anyhow::anyhow!("could not connect to the chat completion endpoint (connection refused or unreachable)")
    } else {
        anyhow::anyhow!("chat completion request failed: {}", err.without_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::errors::{categorize_error, ErrorCategory};
    use reqwest::StatusCode;

    #[test]
    fn test_parse_success() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"It adds numbers."}}]}"#;
        assert_eq!(parse_completion(StatusCode::OK, body).unwrap(), "It adds numbers.");
    }

    #[test]
    fn test_empty_content_is_provider_error() {
        let body = r#"{"choices":[{"message":{"content":null}}]}"#;
        let err = parse_completion(StatusCode::OK, body).unwrap_err();
        assert_eq!(categorize_error(&err.to_string()), ErrorCategory::Provider);

        let err = parse_completion(StatusCode::OK, r#"{"choices":[]}"#).unwrap_err();
        assert!(err.to_string().contains("empty response"));
    }

    #[test]
    fn test_error_status_keeps_code_and_nested_message() {
        let body = r#"{"error":{"message":"Rate limit reached for requests","type":"requests"}}"#;
        let err = parse_completion(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        assert_eq!(err.to_string(), "HTTP 429: Rate limit reached for requests");
        assert_eq!(categorize_error(&err.to_string()), ErrorCategory::RateLimit);

        let err = parse_completion(StatusCode::UNAUTHORIZED, "nope").unwrap_err();
        assert_eq!(categorize_error(&err.to_string()), ErrorCategory::Auth);
    }

    #[test]
    fn test_error_with_success_status() {
        let body = r#"{"error":{"message":"upstream overloaded","code":503}}"#;
        let err = parse_completion(StatusCode::OK, body).unwrap_err();
        assert_eq!(err.to_string(), "HTTP 503: upstream overloaded");
        assert!(categorize_error(&err.to_string()).is_retryable());
    }

    #[test]
    fn test_refusal() {
        let body = r#"{"choices":[{"message":{"content":null,"refusal":"I can't help with that."}}]}"#;
        let err = parse_completion(StatusCode::OK, body).unwrap_err();
        assert!(err.to_string().starts_with("Request was refused"));
    }

    #[test]
    fn test_client_requires_key() {
        let settings = LlmSettings::default();
        assert!(ChatClient::new(&settings).is_err());
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "m",
            messages: vec![Message {
                role: "user",
                content: "hi \"there\"",
            }],
            max_tokens: 10,
            temperature: 0.0,
            stream: false,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""role":"user""#));
        assert!(json.contains(r#"\"there\""#));
        assert!(json.contains(r#""stream":false"#));
    }
}
