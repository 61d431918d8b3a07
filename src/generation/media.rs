//! Image-to-image media client implementing [`ImageService`].

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{ImageResult, ImageService};
use crate::error::GenerationError;
use crate::pipeline::PipelineConfig;

const IMAGE_TO_IMAGE_PATH: &str = "/image-to-image";

/// Storage prefix the service uploads rendered images under.
const KEY_PREFIX: &str = "images";

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    prompt: &'a str,
    image_url: &'a str,
    model: &'a str,
    key_prefix: &'a str,
}

#[derive(Debug, Serialize)]
struct ComposeRequest<'a> {
    prompt: &'a str,
    image_urls: &'a [String],
    model: &'a str,
}

/// Client for the media service's image-to-image endpoints.
#[derive(Debug, Clone)]
pub struct MediaClient {
    client: Client,
    render_url: String,
    compose_url: String,
    model: String,
}

impl MediaClient {
    pub fn new(
        render_url: &str,
        compose_url: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            render_url: normalize_endpoint(render_url),
            compose_url: normalize_endpoint(compose_url),
            model: model.into(),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, GenerationError> {
        Self::new(
            &config.image_api_url,
            &config.scene_api_url,
            &config.image_model,
            config.image_timeout,
        )
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<ImageResult, GenerationError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| GenerationError::Parse(format!("Failed to parse image response: {}", e)))
    }
}

/// Appends `/image-to-image` to a bare origin; custom paths are kept.
pub(crate) fn normalize_endpoint(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.ends_with(IMAGE_TO_IMAGE_PATH) {
        return url.to_string();
    }

    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let has_path = after_scheme.contains('/');
    if has_path {
        url.to_string()
    } else {
        format!("{}{}", url, IMAGE_TO_IMAGE_PATH)
    }
}

#[async_trait]
impl ImageService for MediaClient {
    async fn render(
        &self,
        prompt: &str,
        reference_url: &str,
    ) -> Result<ImageResult, GenerationError> {
        let request = RenderRequest {
            prompt,
            image_url: reference_url,
            model: &self.model,
            key_prefix: KEY_PREFIX,
        };
        tracing::debug!(url = %self.render_url, reference_url, "Requesting magnet render");
        self.post(&self.render_url, &request).await
    }

    async fn compose(
        &self,
        prompt: &str,
        image_urls: &[String],
    ) -> Result<ImageResult, GenerationError> {
        let request = ComposeRequest {
            prompt,
            image_urls,
            model: &self.model,
        };
        tracing::debug!(url = %self.compose_url, images = image_urls.len(), "Requesting scene composition");
        self.post(&self.compose_url, &request).await
    }
}
