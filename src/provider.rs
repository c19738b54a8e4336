//! Answer provider abstraction and implementations.
//!
//! Defines the [`AnswerProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when no model is configured.
//! - **[`OpenAiProvider`]** — calls an OpenAI-compatible chat-completions
//!   API, whole-answer or streaming, with retry and backoff.
//!
//! The provider receives a built [`Collection`] and grounds the model
//! with a bounded file listing assembled from the collection manifest.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::collection::{read_manifest, Collection};
use crate::config::ModelConfig;
use crate::stream::StreamEvent;

/// Upper bound on the assembled context listing, in characters.
const MAX_CONTEXT_CHARS: usize = 24_000;
/// Upper bound on listed files per resource.
const MAX_FILES_PER_RESOURCE: usize = 400;

/// Produces answers for a question grounded in a built collection.
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    /// Model identifier reported in `meta` events.
    fn model_name(&self) -> &str;

    /// Produce a complete answer.
    async fn ask(&self, collection: &Collection, question: &str) -> Result<String>;

    /// Produce a lazy sequence of answer fragments. The receiver yields
    /// `text.delta` events in emission order and ends with exactly one
    /// terminal `error` or `done`.
    async fn ask_stream(
        &self,
        collection: &Collection,
        question: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// Instantiate the provider selected by configuration.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn AnswerProvider>> {
    match config.provider.as_str() {
        "openai-compatible" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledProvider)),
        other => bail!("Unknown model provider: {}", other),
    }
}

// ============ Disabled Provider ============

/// A no-op provider that always returns errors, used when
/// `model.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl AnswerProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn ask(&self, _collection: &Collection, _question: &str) -> Result<String> {
        bail!("Model provider is disabled — set [model] provider in the config file")
    }

    async fn ask_stream(
        &self,
        _collection: &Collection,
        _question: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        bail!("Model provider is disabled — set [model] provider in the config file")
    }
}

// ============ OpenAI-compatible Provider ============

/// Provider speaking the OpenAI chat-completions API, which most hosted
/// and local model servers expose. The base URL and the environment
/// variable holding the API key both come from configuration.
pub struct OpenAiProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiProvider {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let model = config
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model.name required for the OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn request_body(&self, collection: &Collection, question: &str, stream: bool) -> Result<serde_json::Value> {
        let context = collection_context(collection)?;
        Ok(serde_json::json!({
            "model": self.model,
            "stream": stream,
            "messages": [
                {
                    "role": "system",
                    "content": "You answer questions about the source code of the listed \
                                resources. Ground every claim in the file listing or your \
                                knowledge of the referenced project, and cite file paths \
                                where relevant.",
                },
                {
                    "role": "user",
                    "content": format!("{}\n\nQuestion: {}", context, question),
                },
            ],
        }))
    }

    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("model API error {}: {}", status, text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let text = response.text().await.unwrap_or_default();
                    bail!("model API error {}: {}", status, text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("model request failed after retries")))
    }
}

#[async_trait]
impl AnswerProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn ask(&self, collection: &Collection, question: &str) -> Result<String> {
        let body = self.request_body(collection, question, false)?;
        let response = self.send_with_retry(&body).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse model response")?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("model response missing choices[0].message.content"))
    }

    async fn ask_stream(
        &self,
        collection: &Collection,
        question: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = self.request_body(collection, question, true)?;
        let response = self.send_with_retry(&body).await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut source = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            let mut terminated = false;

            'outer: while let Some(chunk) = source.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: format!("model stream failed: {}", e),
                                tag: "provider_error".to_string(),
                                hint: None,
                            })
                            .await;
                        terminated = true;
                        break;
                    }
                };

                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = buf.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let line = String::from_utf8_lossy(&line).into_owned();
                    match parse_delta_line(&line) {
                        DeltaLine::Delta(delta) => {
                            if tx.send(StreamEvent::TextDelta { delta }).await.is_err() {
                                // Consumer cancelled; stop reading.
                                terminated = true;
                                break 'outer;
                            }
                        }
                        DeltaLine::Done => {
                            let _ = tx.send(StreamEvent::Done).await;
                            terminated = true;
                            break 'outer;
                        }
                        DeltaLine::Ignore => {}
                    }
                }
            }

            // Upstream closed without an explicit end marker.
            if !terminated {
                let _ = tx.send(StreamEvent::Done).await;
            }
        });

        Ok(rx)
    }
}

/// One parsed line of an OpenAI-compatible SSE response.
#[derive(Debug, PartialEq, Eq)]
enum DeltaLine {
    Delta(String),
    Done,
    Ignore,
}

/// Extract the text delta from one `data:` line of a chat-completions
/// stream. Everything that is not a well-formed delta (comments, role
/// preludes, finish chunks) is ignored.
fn parse_delta_line(line: &str) -> DeltaLine {
    let payload = match line.strip_prefix("data: ") {
        Some(p) => p.trim(),
        None => return DeltaLine::Ignore,
    };
    if payload == "[DONE]" {
        return DeltaLine::Done;
    }
    let json: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return DeltaLine::Ignore,
    };
    match json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.is_empty() => DeltaLine::Delta(content.to_string()),
        _ => DeltaLine::Ignore,
    }
}

/// Assemble the grounding context for a collection: a bounded per-resource
/// file listing from the manifest, honoring git search paths.
pub fn collection_context(collection: &Collection) -> Result<String> {
    let manifest = read_manifest(&collection.path).ok_or_else(|| {
        anyhow::anyhow!(
            "collection manifest missing or incomplete: {}",
            collection.path.display()
        )
    })?;

    let mut out = String::from("Resources available to answer from:\n");
    for resource in &manifest.resources {
        out.push_str(&format!("\n## {} ({})\n", resource.name, resource.path.display()));

        let roots: Vec<std::path::PathBuf> = if resource.search_paths.is_empty() {
            vec![resource.path.clone()]
        } else {
            resource
                .search_paths
                .iter()
                .map(|p| resource.path.join(p))
                .collect()
        };

        let mut listed = 0;
        'resource: for root in &roots {
            for entry in WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git")
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if listed >= MAX_FILES_PER_RESOURCE || out.len() >= MAX_CONTEXT_CHARS {
                    out.push_str("- …\n");
                    break 'resource;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&resource.path)
                    .unwrap_or(entry.path());
                out.push_str(&format!("- {}\n", relative.display()));
                listed += 1;
            }
        }
    }
    Ok(out)
}
