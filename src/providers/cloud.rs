// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Together AI chat-completion client

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{http_client, VisionProvider, REQUEST_TIMEOUT};
use crate::{Result, ShotsortError};

/// Together AI (OpenAI-compatible) client
pub struct CloudProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart<'a> {
    #[serde(rename = "text")]
    Text { text: &'a str },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl CloudProvider {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(ShotsortError::Config(
                "Together AI API key is not set. Please configure it in settings.".to_string(),
            ));
        }

        let base_url = base_url
            .trim_end_matches('/')
            .trim_end_matches("/v1")
            .to_string();

        Ok(Self {
            client: http_client(REQUEST_TIMEOUT)?,
            base_url,
            model: model.to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Detect image MIME type from magic bytes
fn detect_image_mime(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        "image/png"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Encode raw image bytes as a `data:` URL
pub fn data_url(image: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        detect_image_mime(image),
        general_purpose::STANDARD.encode(image)
    )
}

#[async_trait]
impl VisionProvider for CloudProvider {
    fn name(&self) -> &'static str {
        "together"
    }

    async fn describe(&self, prompt: &str, image: &[u8]) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url(image) },
                    },
                ],
            }],
            stream: false,
        };

        info!("Making Together AI API call: model={}", self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("Together AI API error ({}): {}", status, body);
            error!("{}", msg);
            return Err(ShotsortError::Provider(msg));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| ShotsortError::Provider(format!("Malformed Together AI response: {}", e)))?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ShotsortError::Provider("No completion in Together AI response".to_string()))?;

        debug!("Together AI response: {}", content);
        Ok(content.trim().to_string())
    }
}
