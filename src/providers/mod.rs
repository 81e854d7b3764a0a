// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Vision model backends
//!
//! Both backends take the same prompt and raw image bytes and return the
//! model's free-text reply. Request shapes, image preparation and error
//! mapping differ per backend.

pub mod cloud;
pub mod local;

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::config::{Provider, Settings};
use crate::Result;

pub use cloud::CloudProvider;
pub use local::LocalProvider;

/// Timeout applied to every classification request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A backend that can answer a prompt about an image
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Human-readable backend name, used in logs
    fn name(&self) -> &'static str;

    /// Send `prompt` together with `image` and return the text reply
    async fn describe(&self, prompt: &str, image: &[u8]) -> Result<String>;
}

/// Build the backend selected in `settings`.
///
/// Fails with a configuration error when the cloud backend is selected
/// without an API key.
pub fn provider_for(settings: &Settings) -> Result<Box<dyn VisionProvider>> {
    match settings.provider {
        Provider::CloudApi => Ok(Box::new(CloudProvider::new(
            &settings.cloud_url,
            &settings.model,
            &settings.cloud_key(),
        )?)),
        Provider::LocalApi => {
            let key = Some(settings.local_api_key.as_str()).filter(|k| !k.trim().is_empty());
            Ok(Box::new(LocalProvider::new(&settings.local_url, &settings.model, key)?))
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}
