use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use teller_config::Config;
use teller_kernel::PipelineError;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierError {
    #[error("classifier unreachable: {0}")]
    Transport(String),
    #[error("API error ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("Invalid response structure from classifier")]
    Shape,
    #[error("classifier not configured: {0}")]
    Unconfigured(String),
}

impl From<ClassifierError> for PipelineError {
    fn from(err: ClassifierError) -> Self {
        PipelineError::Parse(err.to_string())
    }
}

/// Natural-language classifier: one prompt in, one reply text out.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    /// generateContent envelope; reply at `candidates[0].content.parts[0].text`.
    Gemini,
    /// `{"prompt": ...}` POST; reply is the response body.
    Plain,
}

pub struct HttpClassifier {
    format: WireFormat,
    endpoint: String,
    api_key: Option<String>,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    temperature: f64,
    client: Client,
}

pub fn from_config(cfg: &Config) -> Result<Arc<dyn Classifier>, String> {
    Ok(Arc::new(HttpClassifier::new(cfg)?))
}

impl HttpClassifier {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.classifier.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let api_key = cfg
            .classifier
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty());
        Ok(Self {
            format: if cfg.classifier.mode == "gemini" {
                WireFormat::Gemini
            } else {
                WireFormat::Plain
            },
            endpoint: cfg.classifier.endpoint.clone(),
            api_key,
            retry_max_attempts: cfg.classifier.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.classifier.retry_backoff_ms),
            temperature: cfg.classifier.temperature,
            client,
        })
    }

    fn body(&self, prompt: &str) -> Value {
        match self.format {
            WireFormat::Gemini => json!({
                "contents": [{"parts": [{"text": prompt}]}],
                "generationConfig": {
                    "temperature": self.temperature,
                    "topP": 1,
                    "topK": 1,
                    "maxOutputTokens": 1000,
                },
            }),
            WireFormat::Plain => json!({ "prompt": prompt }),
        }
    }

    async fn attempt(&self, body: &Value) -> Result<String, ClassifierError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let detail: Value = response.json().await.unwrap_or(Value::Null);
            let message = detail
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                message,
            });
        }
        match self.format {
            WireFormat::Gemini => {
                let envelope: Value = response
                    .json()
                    .await
                    .map_err(|_| ClassifierError::Shape)?;
                envelope
                    .pointer("/candidates/0/content/parts/0/text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or(ClassifierError::Shape)
            }
            WireFormat::Plain => response
                .text()
                .await
                .map_err(|e| ClassifierError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError> {
        if self.format == WireFormat::Gemini && self.api_key.is_none() {
            return Err(ClassifierError::Unconfigured(
                "api key environment variable is not set".to_string(),
            ));
        }
        let body = self.body(prompt);
        let mut last = ClassifierError::Shape;
        for attempt in 0..self.retry_max_attempts {
            match self.attempt(&body).await {
                Ok(text) => return Ok(text),
                Err(err @ ClassifierError::Http { status, .. }) if status < 500 && status != 429 => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "classifier attempt failed");
                    last = err;
                }
            }
            if attempt + 1 < self.retry_max_attempts && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff).await;
            }
        }
        Err(last)
    }
}

/// Canned classifier: answers with the reply of the first rule whose needle
/// occurs in the quoted user request, or a chat reply otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedClassifier {
    rules: Vec<(String, String)>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError> {
        let request = prompt
            .split_once("User request: ")
            .map(|(_, rest)| rest.lines().next().unwrap_or(""))
            .unwrap_or(prompt);
        Ok(self
            .rules
            .iter()
            .find(|(needle, _)| request.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| {
                json!({"function": "chat", "response": "How can I help with your assets?"})
                    .to_string()
            }))
    }
}
