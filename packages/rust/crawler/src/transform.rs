//! LLM post-processing of converted Markdown through an OpenRouter
//! (OpenAI-compatible) chat completion endpoint.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use webindex_shared::{IndexError, Result};

use crate::fetcher::status_error;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const SYSTEM_PROMPT: &str = "You clean up web page content for a search index. \
Rewrite the given Markdown so it keeps only the page's substantive content: \
remove navigation, cookie banners, boilerplate, and repeated menus. \
Preserve headings, lists, tables, code blocks, and facts verbatim. \
Reply with Markdown only.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Rewrites Markdown with a chat model.
#[derive(Debug, Clone)]
pub struct LlmTransformer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmTransformer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| IndexError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Point at another OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[instrument(skip_all, fields(url = %source_url, model = %self.model))]
    pub async fn transform(&self, markdown: &str, source_url: &str) -> Result<String> {
        let user_prompt = format!("Source: {source_url}\n\n{markdown}");
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| IndexError::Network(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if let Some(err) = status_error(status, "LLM transform") {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "LLM transform failed");
            return Err(err);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| IndexError::parse(format!("invalid LLM response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| IndexError::parse("LLM response had no content"))?;

        debug!(before = markdown.len(), after = content.len(), "LLM transform complete");
        Ok(content)
    }
}
