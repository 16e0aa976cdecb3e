//! Registry of posting destinations.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Posting configuration for one website.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteConfig {
    /// Website id, unique within the registry.
    pub name: String,
    /// Minimum wait between two posts to this website, in milliseconds.
    #[serde(default)]
    pub post_wait_interval_ms: u64,
    /// Whether this website consumes a source URL produced by an earlier
    /// post of the same submission. Such websites post after the
    /// independent ones.
    #[serde(default)]
    pub accepts_source_url: bool,
}

/// Ordered collection of website configurations with keyed lookup.
#[derive(Debug, Clone, Default)]
pub struct WebsiteRegistry {
    ordered: Vec<WebsiteConfig>,
    index: HashMap<String, usize>,
}

impl WebsiteRegistry {
    /// Build a registry, rejecting duplicate website ids.
    pub fn new(configs: Vec<WebsiteConfig>) -> Result<Self, CoreError> {
        let mut index = HashMap::with_capacity(configs.len());
        for (i, config) in configs.iter().enumerate() {
            if index.insert(config.name.clone(), i).is_some() {
                return Err(CoreError::DuplicateWebsite(config.name.clone()));
            }
        }
        Ok(Self {
            ordered: configs,
            index,
        })
    }

    /// Load a registry from a JSON file holding an array of configs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let configs: Vec<WebsiteConfig> =
            serde_json::from_str(&raw).map_err(|source| CoreError::ConfigParse {
                path: path.display().to_string(),
                source,
            })?;
        Self::new(configs)
    }

    pub fn get(&self, name: &str) -> Option<&WebsiteConfig> {
        self.index.get(name).map(|&i| &self.ordered[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registration-ordered iteration, used for limiter construction.
    pub fn iter(&self) -> impl Iterator<Item = &WebsiteConfig> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
