//! Generic HTTP poster.
//!
//! Posts a submission as a multipart form to each website's configured
//! endpoint. Real website integrations replace this with their own
//! request shapes; the scheduler only ever sees the [`Poster`] trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crosspost_core::{PostFailure, PostSuccess, Poster, Rating, Submission};

/// Network timeout for one upload.
const POST_TIMEOUT: Duration = Duration::from_secs(120);

/// Body of a successful upload response.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    /// URL of the created post, if the website reports one.
    #[serde(default)]
    url: Option<String>,
}

pub struct HttpPoster {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpPoster {
    pub fn new(endpoints: HashMap<String, String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(POST_TIMEOUT).build()?;
        Ok(Self { client, endpoints })
    }

    fn rating_field(rating: Rating) -> &'static str {
        match rating {
            Rating::General => "general",
            Rating::Mature => "mature",
            Rating::Adult => "adult",
            Rating::Extreme => "extreme",
        }
    }

    async fn build_form(
        &self,
        website: &str,
        submission: &Submission,
    ) -> Result<reqwest::multipart::Form, PostFailure> {
        let form_data = submission.form_data();
        let options = form_data
            .overrides
            .get(website)
            .unwrap_or(&form_data.defaults);

        let mut form = reqwest::multipart::Form::new()
            .text("title", submission.label())
            .text("rating", Self::rating_field(submission.rating()))
            .text("tags", options.tags.join(","));

        if let Some(description) = &options.description {
            form = form.text("description", description.clone());
        }

        // Dependent websites consume the URL of an earlier post.
        if let Some(url) = submission.stats().source_urls.first() {
            form = form.text("source_url", url.clone());
        }

        if let Some(info) = submission.file_info()
            && let Some(path) = info.path
        {
            let bytes = tokio::fs::read(&path).await.map_err(|e| PostFailure {
                error: format!("failed to read {}: {}", path, e),
                user_message: Some(format!("Could not read file for {}", website)),
            })?;
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(info.name.clone())
                .mime_str(&info.mime_type)
                .map_err(|e| PostFailure {
                    error: format!("invalid mime type {}: {}", info.mime_type, e),
                    user_message: None,
                })?;
            form = form.part("file", part);
        }

        Ok(form)
    }
}

#[async_trait]
impl Poster for HttpPoster {
    async fn post(
        &self,
        website: &str,
        submission: &Submission,
    ) -> Result<PostSuccess, PostFailure> {
        let endpoint = self.endpoints.get(website).ok_or_else(|| PostFailure {
            error: format!("no endpoint configured for {}", website),
            user_message: Some(format!("{} has no upload endpoint configured", website)),
        })?;

        let form = self.build_form(website, submission).await?;

        let response = self
            .client
            .post(endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PostFailure {
                error: format!("request to {} failed: {}", website, e),
                user_message: Some(format!("Could not reach {}", website)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PostFailure {
                error: format!("{} returned {}: {}", website, status, body),
                user_message: Some(format!("{} rejected the post ({})", website, status)),
            });
        }

        let parsed: UploadResponse = response.json().await.unwrap_or(UploadResponse { url: None });
        debug!(website, id = submission.id(), url = ?parsed.url, "upload accepted");
        Ok(PostSuccess {
            source_url: parsed.url,
        })
    }
}
