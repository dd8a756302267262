use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{AdapterOutput, ExecutorAdapter, InvokeRequest, QUOTA_EXIT_CODE};
use crate::core::config::ExecutorDef;
use crate::core::routing::estimate_tokens;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Metered messages-style HTTP API.
pub struct HttpApiAdapter {
    name: String,
    base_url: String,
    api_key_env: String,
    model: String,
    max_tokens: u32,
    client: Client,
}

impl HttpApiAdapter {
    pub fn from_def(def: &ExecutorDef) -> Result<Self> {
        let ExecutorDef::Http {
            name,
            base_url,
            api_key_env,
            model,
            max_tokens,
            timeout_secs,
        } = def
        else {
            bail!("executor '{}' is not an http executor", def.name());
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(*timeout_secs))
            .build()?;
        Ok(Self {
            name: name.clone(),
            base_url: base_url.clone(),
            api_key_env: api_key_env.clone(),
            model: model.clone(),
            max_tokens: *max_tokens,
            client,
        })
    }

    async fn call(&self, prompt: &str, model: &str) -> Result<(StatusCode, String)> {
        let api_key = std::env::var(&self.api_key_env)
            .map_err(|_| anyhow!("{} is not set", self.api_key_env))?;
        let body = MessagesRequest {
            model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };
        let res = self
            .client
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

/// HTTP status to adapter exit code: 2xx is 0, 429 is a quota failure.
fn exit_code_for(status: StatusCode) -> i32 {
    if status.is_success() {
        0
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        QUOTA_EXIT_CODE
    } else {
        1
    }
}

#[async_trait]
impl ExecutorAdapter for HttpApiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvokeRequest<'_>) -> Result<AdapterOutput> {
        let prompt = request.prompt();
        let model = request.model.unwrap_or(&self.model);
        let started = Instant::now();
        debug!(executor = %self.name, model, "Calling API");

        let (status, body) = tokio::select! {
            res = self.call(&prompt, model) => res?,
            _ = request.cancel.cancelled() => bail!("{} invocation cancelled", self.name),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_code = exit_code_for(status);

        if exit_code != 0 {
            return Ok(AdapterOutput {
                output: format!("{} API error {}: {}", self.name, status, body),
                exit_code,
                duration_ms,
                input_tokens: 0,
                output_tokens: 0,
            });
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)?;
        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        let (input_tokens, output_tokens) = match parsed.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (estimate_tokens(&prompt), estimate_tokens(&text)),
        };
        Ok(AdapterOutput {
            output: text,
            exit_code,
            duration_ms,
            input_tokens,
            output_tokens,
        })
    }
}
