//! Prompt and image generation services.
//!
//! Both services are external HTTP collaborators. The pipeline depends only on
//! the [`PromptService`] and [`ImageService`] traits; [`DifyClient`] and
//! [`MediaClient`] are the production implementations.
//!
//! Responses are validated at this boundary: a prompt answer missing
//! `task_id`, `outlook`, `video_prompt` or `magnet_sku_list` is a typed
//! [`GenerationError::MissingField`], never a partially filled value.

mod dify;
mod media;
pub mod sse;

pub use dify::DifyClient;
pub use media::MediaClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GenerationError;
use crate::model::{value_to_id, Magnet};

/// Generates the outreach prompt bundle for one creator.
#[async_trait]
pub trait PromptService: Send + Sync {
    async fn generate(&self, creator_id: &str) -> Result<PromptResponse, GenerationError>;
}

/// Renders and composes images.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Image-to-image render of one magnet from a single reference image.
    async fn render(&self, prompt: &str, reference_url: &str)
        -> Result<ImageResult, GenerationError>;

    /// Composes several images into one scene. The first URL is the template.
    async fn compose(&self, prompt: &str, image_urls: &[String])
        -> Result<ImageResult, GenerationError>;
}

/// Response body of the image service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub texts: Vec<Value>,
}

impl ImageResult {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            texts: Vec::new(),
        }
    }

    /// Treats an empty URL list as a (retryable) failure.
    pub fn require_urls(self) -> Result<Self, GenerationError> {
        if self.urls.iter().all(|u| u.trim().is_empty()) {
            return Err(GenerationError::EmptyResult);
        }
        Ok(self)
    }
}

/// A validated prompt-generation answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub task_id: String,
    pub outlook: String,
    pub video_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub magnets: Vec<Magnet>,
}

impl PromptResponse {
    /// Validates a decoded answer object.
    ///
    /// # Errors
    ///
    /// `MissingField` when `task_id` is absent or empty, or when `outlook`,
    /// `video_prompt` or `magnet_sku_list` is absent. `Parse` when
    /// `magnet_sku_list` is not an array of objects.
    pub fn from_object(map: Map<String, Value>) -> Result<Self, GenerationError> {
        let task_id = map
            .get("task_id")
            .and_then(value_to_id)
            .ok_or(GenerationError::MissingField("task_id"))?;

        let outlook = text_field(&map, "outlook")?;
        let video_prompt = text_field(&map, "video_prompt")?;

        let magnets = match map.get("magnet_sku_list") {
            None | Some(Value::Null) => return Err(GenerationError::MissingField("magnet_sku_list")),
            Some(list @ Value::Array(_)) => serde_json::from_value::<Vec<Magnet>>(list.clone())
                .map_err(|e| GenerationError::Parse(format!("magnet_sku_list: {}", e)))?,
            Some(_) => {
                return Err(GenerationError::Parse(
                    "magnet_sku_list must be an array".to_string(),
                ))
            }
        };

        let message = map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            task_id,
            outlook,
            video_prompt,
            message,
            magnets,
        })
    }

    /// Decodes and validates raw answer text.
    pub fn from_text(text: &str) -> Result<Self, GenerationError> {
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        let map = crate::utils::parse_json_object(text)
            .map_err(|e| GenerationError::Parse(e.to_string()))?;
        Self::from_object(map)
    }
}

/// A present field rendered as text; non-string scalars are stringified.
fn text_field(map: &Map<String, Value>, field: &'static str) -> Result<String, GenerationError> {
    match map.get(field) {
        None => Err(GenerationError::MissingField(field)),
        Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answer() -> Value {
        json!({
            "task_id": "t-1",
            "outlook": "Hello there",
            "video_prompt": "a slow pan",
            "magnet_sku_list": [
                {"context_id": "m1", "front_name": "Sunrise", "front_style_key": "retro",
                 "front_image_prompt": "a sunrise"}
            ]
        })
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_valid_answer() {
        let response = PromptResponse::from_object(object(answer())).unwrap();
        assert_eq!(response.task_id, "t-1");
        assert_eq!(response.magnets.len(), 1);
        assert_eq!(response.magnets[0].front_name, "Sunrise");
        assert!(response.message.is_none());
    }

    #[test]
    fn test_missing_fields() {
        for field in ["task_id", "outlook", "video_prompt", "magnet_sku_list"] {
            let mut map = object(answer());
            map.remove(field);
            let err = PromptResponse::from_object(map).unwrap_err();
            assert!(
                matches!(err, GenerationError::MissingField(f) if f == field),
                "expected missing {}",
                field
            );
        }
    }

    #[test]
    fn test_empty_task_id_is_missing() {
        let mut map = object(answer());
        map.insert("task_id".into(), json!(""));
        assert!(matches!(
            PromptResponse::from_object(map),
            Err(GenerationError::MissingField("task_id"))
        ));
    }

    #[test]
    fn test_magnet_list_must_be_array() {
        let mut map = object(answer());
        map.insert("magnet_sku_list".into(), json!("none"));
        assert!(matches!(
            PromptResponse::from_object(map),
            Err(GenerationError::Parse(_))
        ));
    }

    #[test]
    fn test_from_text_with_prose() {
        let text = format!("Result:\n{}\nDone.", answer());
        let response = PromptResponse::from_text(&text).unwrap();
        assert_eq!(response.outlook, "Hello there");

        assert!(matches!(
            PromptResponse::from_text("   "),
            Err(GenerationError::EmptyResponse)
        ));
    }

    #[test]
    fn test_require_urls() {
        assert!(matches!(
            ImageResult::new(vec![]).require_urls(),
            Err(GenerationError::EmptyResult)
        ));
        assert!(ImageResult::new(vec!["https://img/1.png".into()])
            .require_urls()
            .is_ok());
    }
}
