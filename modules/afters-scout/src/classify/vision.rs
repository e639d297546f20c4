use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use afters_common::Vibe;
use ai_client::{strip_code_blocks, truncate_to_char_boundary, Claude, ImageInput};

use super::ClassificationError;

/// One image's assessment as the vision service reports it.
///
/// Deserializing only checks shape; ranges and the vibe label are checked by
/// the classification client so a bad reading drops just that item.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct VibeReading {
    /// 1 = empty or dead, 5 = moderate activity, 10 = packed and wild.
    pub energy: u8,
    /// 1 = empty, 5 = half capacity, 10 = shoulder to shoulder.
    pub crowd: u8,
    /// Dominant character of the scene.
    #[schemars(with = "Vibe")]
    pub vibe: String,
    /// 0.0-1.0. Low when the image is blurry, unclear, or not a venue scene.
    pub confidence: f64,
}

/// External vision classifier.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// One raw reading per locator, in request order.
    async fn classify_batch(&self, locators: &[String]) -> Result<Vec<Value>, ClassificationError>;
}

// --- Claude ---

#[derive(Debug, Deserialize, JsonSchema)]
struct VibeBatch {
    /// One reading per image, in the order the images were shown.
    #[schemars(with = "Vec<VibeReading>")]
    readings: Vec<Value>,
}

const SYSTEM_PROMPT: &str = "You rate nightlife venue photos and video thumbnails taken from \
social media. For each image judge how energetic the scene is, how crowded it is, and which \
vibe dominates: Techno (dark room, DJ, electronic crowd), Chill (lounge, seated, quiet), Hype \
(hands up, hip-hop or mainstream party energy) or Mixed. If an image is not a venue or party \
scene, still give your best guess but set confidence low.";

/// Classifies images with Claude vision, one request per batch.
///
/// Images are downloaded and sent inline because platform CDNs often refuse
/// fetches from the model provider; a failed download falls back to the URL.
pub struct ClaudeVisionService {
    claude: Claude,
    http: reqwest::Client,
}

impl ClaudeVisionService {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            claude: Claude::new(api_key, model).with_timeout(timeout),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.claude = self.claude.with_base_url(url);
        self
    }

    async fn load_image(&self, locator: &str) -> ImageInput {
        match self.download(locator).await {
            Ok(image) => image,
            Err(e) => {
                debug!(locator, error = %e, "Image download failed, passing URL through");
                ImageInput::Url(locator.to_string())
            }
        }
    }

    async fn download(&self, locator: &str) -> Result<ImageInput, reqwest::Error> {
        let resp = self.http.get(locator).send().await?.error_for_status()?;
        let media_type = media_type(
            resp.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
        );
        let data = resp.bytes().await?.to_vec();
        Ok(ImageInput::Bytes {
            media_type: media_type.to_string(),
            data,
        })
    }
}

/// Map a Content-Type header to a media type the vision API accepts.
fn media_type(content_type: &str) -> &'static str {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("png") {
        "image/png"
    } else if ct.contains("gif") {
        "image/gif"
    } else if ct.contains("webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

#[async_trait]
impl VisionService for ClaudeVisionService {
    async fn classify_batch(&self, locators: &[String]) -> Result<Vec<Value>, ClassificationError> {
        let images = futures::future::join_all(locators.iter().map(|l| self.load_image(l))).await;
        let instructions = format!(
            "Rate each of the {} images above. Return exactly one reading per image, in order.",
            locators.len()
        );

        let batch: VibeBatch = self
            .claude
            .extract_from_images(SYSTEM_PROMPT, images, instructions)
            .await?;
        Ok(batch.readings)
    }
}

// --- Generic HTTP ---

/// Classifier behind a plain JSON endpoint.
///
/// Request: `{"items": [{"locator": "..."}, ...]}`. Response: a JSON array of
/// readings in request order (optionally wrapped in a code fence).
pub struct HttpVisionService {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpVisionService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl VisionService for HttpVisionService {
    async fn classify_batch(&self, locators: &[String]) -> Result<Vec<Value>, ClassificationError> {
        let body = json!({
            "items": locators.iter().map(|l| json!({ "locator": l })).collect::<Vec<_>>(),
        });

        let resp = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;

        match status {
            200..=299 => parse_readings(&text),
            429 => Err(ClassificationError::RateLimited),
            _ => {
                warn!(status, "Vision endpoint returned non-success");
                Err(ClassificationError::Rejected {
                    status,
                    message: truncate_to_char_boundary(&text, 200).to_string(),
                })
            }
        }
    }
}

/// Parse an HTTP classifier body into raw readings.
pub fn parse_readings(body: &str) -> Result<Vec<Value>, ClassificationError> {
    let cleaned = strip_code_blocks(body);
    match serde_json::from_str::<Value>(cleaned)
        .map_err(|e| ClassificationError::Schema(e.to_string()))?
    {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("readings") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ClassificationError::Schema("expected an array of readings".into())),
        },
        _ => Err(ClassificationError::Schema("expected an array of readings".into())),
    }
}
