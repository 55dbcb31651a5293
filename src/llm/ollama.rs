//! Ollama-style `/api/generate` client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug};

use super::{CallFailure, ModelClient, PromptTemplate};
use crate::telemetry::{genai, metrics};
use opentelemetry::KeyValue;

const PROVIDER: &str = "ollama";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

/// Client for a local inference endpoint. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    url: String,
    model: String,
    prompt: PromptTemplate,
}

impl OllamaClient {
    /// Build a client for `{base_url}/api/generate` with a request timeout.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        prompt: PromptTemplate,
        timeout: Duration,
    ) -> Result<Self, CallFailure> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallFailure::connection(format!("http client: {e}")))?;
        Ok(Self {
            http,
            url: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.into(),
            prompt,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn classify(e: reqwest::Error) -> CallFailure {
    if e.is_timeout() {
        CallFailure::timeout(e.to_string())
    } else if e.is_connect() {
        CallFailure::connection(e.to_string())
    } else if e.is_decode() {
        CallFailure::server(format!("bad response body: {e}"))
    } else {
        CallFailure::connection(e.to_string())
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn analyze(&self, ticket_text: &str) -> Result<String, CallFailure> {
        let span = genai::start_chat_span(&self.model, PROVIDER);
        let start = Instant::now();
        let prompt = self.prompt.render(ticket_text);

        let result = async {
            let response = self
                .http
                .post(&self.url)
                .json(&GenerateRequest {
                    model: &self.model,
                    prompt: &prompt,
                    stream: false,
                })
                .send()
                .await
                .map_err(classify)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(CallFailure::server(format!("{status}: {body}")));
            }

            let body: GenerateResponse = response.json().await.map_err(classify)?;
            Ok(body)
        }
        .instrument(span.clone())
        .await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(failure) => failure.kind.to_string(),
        };
        metrics::model_call_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("model", self.model.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );

        let body = result?;
        let input = body.prompt_eval_count.unwrap_or(0);
        let output = body.eval_count.unwrap_or(0);
        genai::record_token_usage(&span, input, output);
        metrics::llm_tokens().add(
            input,
            &[
                KeyValue::new("model", self.model.clone()),
                KeyValue::new("provider", PROVIDER),
                KeyValue::new("direction", "input"),
            ],
        );
        metrics::llm_tokens().add(
            output,
            &[
                KeyValue::new("model", self.model.clone()),
                KeyValue::new("provider", PROVIDER),
                KeyValue::new("direction", "output"),
            ],
        );
        debug!(model = %self.model, elapsed_ms, chars = body.response.len(), "model replied");

        Ok(body.response.trim().to_string())
    }
}
