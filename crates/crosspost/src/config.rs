//! Daemon config files.

use std::collections::HashMap;
use std::path::Path;

use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;

use crosspost_core::{WebsiteConfig, WebsiteRegistry};

/// One entry of the website registry file: the registry config plus the
/// endpoint the HTTP poster targets.
#[derive(Debug, Clone, Deserialize)]
pub struct WebsiteEntry {
    #[serde(flatten)]
    pub config: WebsiteConfig,
    /// Upload endpoint for this website.
    pub endpoint: Option<String>,
}

/// Parsed website registry file.
#[derive(Debug)]
pub struct WebsiteFile {
    pub registry: WebsiteRegistry,
    /// Endpoint per website id, for the HTTP poster.
    pub endpoints: HashMap<String, String>,
}

/// Load the website registry file (a JSON array of entries).
pub fn load_websites(path: impl AsRef<Path>) -> Result<WebsiteFile> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<WebsiteEntry> = serde_json::from_str(&raw)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to parse {}", path.display()))?;

    let endpoints = entries
        .iter()
        .filter_map(|e| {
            e.endpoint
                .as_ref()
                .map(|url| (e.config.name.clone(), url.clone()))
        })
        .collect();

    let registry = WebsiteRegistry::new(entries.into_iter().map(|e| e.config).collect())
        .into_diagnostic()?;

    Ok(WebsiteFile {
        registry,
        endpoints,
    })
}
