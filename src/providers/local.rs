// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Ollama API client for local vision inference

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{http_client, VisionProvider, REQUEST_TIMEOUT};
use crate::{Result, ShotsortError};

/// Longest edge sent to Ollama
pub const MAX_EDGE: u32 = 1024;

/// Ollama API client
pub struct LocalProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
}

impl LocalProvider {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Result<Self> {
        // Normalize URL
        let base_url = base_url
            .trim_end_matches('/')
            .replace("/api/generate", "")
            .replace("/api/chat", "");

        Ok(Self {
            client: http_client(REQUEST_TIMEOUT)?,
            base_url,
            model: model.to_string(),
            api_key: api_key.map(String::from),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> ShotsortError {
        if e.is_connect() {
            error!("Could not connect to Ollama at {}: {}", self.base_url, e);
            ShotsortError::ServiceNotRunning(self.base_url.clone())
        } else {
            error!("Ollama request error: {}", e);
            ShotsortError::Api(e)
        }
    }

    /// Check if Ollama is reachable
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);

        self.authorize(self.client.get(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        Ok(())
    }

    /// List pulled models
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(ShotsortError::Provider(format!(
                "Ollama returned status {} listing models",
                response.status()
            )));
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Check if the configured model has been pulled
    pub async fn model_available(&self) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| {
            m == &self.model || m.starts_with(&format!("{}:", self.model))
        }))
    }
}

/// Force RGB, shrink to at most `MAX_EDGE` on the longest side, re-encode as JPEG
pub fn prepare_image(data: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let img = DynamicImage::ImageRgb8(img.to_rgb8());

    let img = if img.width() > MAX_EDGE || img.height() > MAX_EDGE {
        img.resize(MAX_EDGE, MAX_EDGE, FilterType::Lanczos3)
    } else {
        img
    };

    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)?;
    Ok(buffer)
}

#[async_trait]
impl VisionProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn describe(&self, prompt: &str, image: &[u8]) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let raw = image.to_vec();
        let prepared = tokio::task::spawn_blocking(move || prepare_image(&raw)).await??;
        let encoded = general_purpose::STANDARD.encode(prepared);

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            images: vec![encoded],
        };

        info!("Making Ollama API call to: {}", url);
        debug!("Ollama request: model={}, image_bytes={}", self.model, request.images[0].len());

        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            error!("Ollama model '{}' not found", self.model);
            return Err(ShotsortError::ModelNotPulled(self.model.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("Ollama API error: Status {}, Response: {}", status, body);
            error!("{}", msg);
            return Err(ShotsortError::Provider(msg));
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ShotsortError::Provider(format!("Malformed Ollama response: {}", e)))?;
        debug!("Ollama response: {}", result.response);
        Ok(result.response)
    }
}
