//! Best-effort text formatting and summarization collaborators.
//!
//! Both speak the OpenAI-compatible chat-completions shape, which local
//! servers (Ollama, llama.cpp, vLLM) expose as well. A collaborator
//! failure never fails a job: the caller logs a warning and ships the
//! raw artifact.

use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;

use scriba_core::{Result, ScribaError};

/// Per-call timeout; formatting a long transcript can be slow.
const CHAT_TIMEOUT_SECS: u64 = 120;

/// Default model when the config names an endpoint but no model.
pub const DEFAULT_MODEL: &str = "qwen2.5:1.5b";

const FORMAT_PROMPT: &str = "Restore punctuation, casing and paragraph breaks in this \
raw transcript. Do not add, remove or reorder words. \
Output only the formatted text, no explanations.";

const SUMMARY_PROMPT: &str = "Summarize the following transcript in a short paragraph. \
Keep names and technical terms intact. Output only the summary.";

/// A configured chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    pub url: String,
    pub model: String,
}

impl LlmEndpoint {
    /// Build from optional config keys; no URL means disabled.
    pub fn from_config(url: &Option<String>, model: &Option<String>) -> Option<Self> {
        url.as_ref().map(|url| Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

/// Reformat a raw transcript; returns the formatted text.
pub async fn format_text(
    client: &reqwest::Client,
    endpoint: &LlmEndpoint,
    text: &str,
    language: Option<&str>,
) -> Result<String> {
    let system = match language {
        Some(lang) => format!("{FORMAT_PROMPT} The transcript language is {lang}."),
        None => FORMAT_PROMPT.to_string(),
    };
    chat(client, endpoint, &system, text)
        .await
        .map_err(|e| ScribaError::ExternalTool(format!("formatter: {e:#}")))
}

/// Produce a short summary of a transcript.
pub async fn summarize(
    client: &reqwest::Client,
    endpoint: &LlmEndpoint,
    text: &str,
) -> Result<String> {
    chat(client, endpoint, SUMMARY_PROMPT, text)
        .await
        .map_err(|e| ScribaError::ExternalTool(format!("summarizer: {e:#}")))
}

async fn chat(
    client: &reqwest::Client,
    endpoint: &LlmEndpoint,
    system: &str,
    user: &str,
) -> anyhow::Result<String> {
    let url = format!("{}/v1/chat/completions", endpoint.url);
    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "model": endpoint.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ]
        }))
        .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("{url} returned {status}"));
    }

    let parsed: ChatResponse = response
        .json()
        .await
        .context("chat response is not valid JSON")?;
    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| anyhow!("chat response contained no completion"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_requires_a_url() {
        assert!(LlmEndpoint::from_config(&None, &Some("m".into())).is_none());

        let ep = LlmEndpoint::from_config(&Some("http://localhost:11434/".into()), &None).unwrap();
        assert_eq!(ep.url, "http://localhost:11434");
        assert_eq!(ep.model, DEFAULT_MODEL);

        let ep = LlmEndpoint::from_config(
            &Some("http://gpu-box:8000".into()),
            &Some("llama3:8b".into()),
        )
        .unwrap();
        assert_eq!(ep.model, "llama3:8b");
    }

    #[test]
    fn chat_response_shape_parses() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":" cleaned up. "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.trim(), "cleaned up.");
    }
}
