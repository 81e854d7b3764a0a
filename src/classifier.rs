// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Screenshot classification through the configured vision backend

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::SettingsStore;
use crate::organizer::sanitize;
use crate::providers::provider_for;
use crate::Result;

/// Instruction sent with every image
pub const CLASSIFY_PROMPT: &str = "Analyze the given image and provide a category and subcategory.
Respond in the format: 'Category: [category], Subcategory: [subcategory]'

Examples:
Category: code, Subcategory: python_script
Category: receipt, Subcategory: payment
Category: document, Subcategory: identity_docs
Category: document, Subcategory: sensitive
Category: document, Subcategory: finance

Analyze the given image and provide the category and subcategory in the specified format.";

static CATEGORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCategory:\s*(\w+)").expect("valid category regex"));
static SUBCATEGORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Subcategory:\s*(\w+)").expect("valid subcategory regex"));

/// Category/subcategory pair assigned to one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub subcategory: String,
}

impl Classification {
    pub fn new(category: &str, subcategory: &str) -> Self {
        Self {
            category: category.to_lowercase(),
            subcategory: subcategory.to_lowercase(),
        }
    }

    /// Fallback when the model reply cannot be parsed
    pub fn unknown() -> Self {
        Self::new("unknown", "unclassified")
    }

    /// Destination folder name, `<category>_<subcategory>`
    pub fn folder_name(&self) -> String {
        format!("{}_{}", sanitize(&self.category), sanitize(&self.subcategory))
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category, self.subcategory)
    }
}

/// Anything that can classify an image file
#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn classify(&self, image_path: &Path) -> Result<Classification>;
}

/// Extract the classification from a free-text model reply.
///
/// Never fails: a reply missing either field yields [`Classification::unknown`].
pub fn parse_reply(content: &str) -> Classification {
    let category = CATEGORY_RE.captures(content).and_then(|c| c.get(1));
    let subcategory = SUBCATEGORY_RE.captures(content).and_then(|c| c.get(1));

    match (category, subcategory) {
        (Some(cat), Some(sub)) => {
            let result = Classification::new(cat.as_str(), sub.as_str());
            debug!("Parsed result: {}", result);
            result
        }
        _ => {
            warn!("Could not parse category/subcategory from response: {}", content);
            Classification::unknown()
        }
    }
}

/// Classifier backed by the settings file.
///
/// Settings are re-read for every image so provider or model changes take
/// effect without restarting a running batch.
#[derive(Clone)]
pub struct Classifier {
    store: SettingsStore,
}

impl Classifier {
    pub fn new(store: SettingsStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ImageClassifier for Classifier {
    async fn classify(&self, image_path: &Path) -> Result<Classification> {
        info!("Processing image: {:?}", image_path);

        let settings = self.store.load();
        let provider = provider_for(&settings)?;
        let image = tokio::fs::read(image_path).await?;

        info!("Using {} provider", provider.name());
        let reply = provider.describe(CLASSIFY_PROMPT, &image).await?;
        Ok(parse_reply(&reply))
    }
}
