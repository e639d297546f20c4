mod client;
pub(crate) mod types;

use std::time::Duration;

use crate::error::{AiError, Result};
use crate::schema::StructuredOutput;

use client::ClaudeClient;
use types::*;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// An image to show the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    /// Publicly reachable URL; Claude fetches it.
    Url(String),
    /// Raw bytes with their MIME type.
    Bytes { media_type: String, data: Vec<u8> },
}

impl ImageInput {
    fn into_block(self) -> ContentBlock {
        use base64::Engine;

        let source = match self {
            ImageInput::Url(url) => ImageSource::Url { url },
            ImageInput::Bytes { media_type, data } => ImageSource::Base64 {
                media_type,
                data: base64::engine::general_purpose::STANDARD.encode(data),
            },
        };
        ContentBlock::Image { source }
    }
}

// =============================================================================
// Claude Agent
// =============================================================================

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    pub(crate) model: String,
    base_url: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AiError::Config("ANTHROPIC_API_KEY environment variable not set".into()))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> ClaudeClient {
        let client = ClaudeClient::new(&self.api_key, self.http.clone());
        match self.base_url {
            Some(ref url) => client.with_base_url(url),
            None => client,
        }
    }

    /// Show the model a set of images and force a structured answer of type `T`.
    ///
    /// Images are sent in order, each preceded by an `Image N:` label so the
    /// prompt can ask for per-image answers in the same order.
    pub async fn extract_from_images<T: StructuredOutput>(
        &self,
        system_prompt: impl Into<String>,
        images: Vec<ImageInput>,
        instructions: impl Into<String>,
    ) -> Result<T> {
        let tool_name = "structured_response";

        let mut blocks = Vec::with_capacity(images.len() * 2 + 1);
        for (i, image) in images.into_iter().enumerate() {
            blocks.push(ContentBlock::Text {
                text: format!("Image {}:", i + 1),
            });
            blocks.push(image.into_block());
        }
        blocks.push(ContentBlock::Text {
            text: instructions.into(),
        });

        let request = ChatRequest::new(&self.model)
            .system(system_prompt)
            .message(WireMessage::user_blocks(blocks))
            .max_tokens(2048)
            .temperature(0.0)
            .forced_tool(ToolDefinitionWire {
                name: tool_name.to_string(),
                description: "Record the structured assessment of the images.".to_string(),
                input_schema: T::tool_schema(),
            });

        let response = self.client().chat(&request, self.timeout).await?;

        let input = response
            .tool_input(tool_name)
            .ok_or_else(|| AiError::Parse("No structured output in Claude response".into()))?;
        serde_json::from_value(input.clone())
            .map_err(|e| AiError::Parse(format!("Failed to deserialize response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_new() {
        let ai = Claude::new("sk-ant-test", "claude-sonnet-4-20250514");
        assert_eq!(ai.model(), "claude-sonnet-4-20250514");
        assert_eq!(ai.api_key, "sk-ant-test");
        assert_eq!(ai.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_claude_with_base_url() {
        let ai = Claude::new("sk-ant-test", "claude-sonnet-4-20250514")
            .with_base_url("https://custom.api.com");
        assert_eq!(ai.base_url, Some("https://custom.api.com".to_string()));
    }

    #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
    struct Answer {
        #[allow(dead_code)]
        ok: bool,
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let ai = Claude::new("sk-ant-test", "claude-sonnet-4-20250514")
            .with_base_url("http://127.0.0.1:9")
            .with_timeout(Duration::from_secs(5));
        let err = ai
            .extract_from_images::<Answer>("system", vec![], "answer")
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[test]
    fn byte_images_are_base64_encoded() {
        let block = ImageInput::Bytes {
            media_type: "image/png".into(),
            data: vec![1, 2, 3],
        }
        .into_block();
        match block {
            ContentBlock::Image {
                source: ImageSource::Base64 { media_type, data },
            } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "AQID");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }
}
