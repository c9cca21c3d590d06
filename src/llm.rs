//! LLM provider port.
//!
//! The runtime only needs two calls: text generation for action proposal and
//! image-grounded generation for the vision fallback. Providers that cannot
//! see images report `supports_vision() == false` and are never handed a
//! screenshot.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    pub model_name: String,
}

#[derive(Debug, Error)]
#[error("llm error: {0}")]
pub struct LLMError(pub String);

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
    ) -> Result<LLMResponse, LLMError>;

    /// Image-grounded generation. Default errors; only called when
    /// `supports_vision()` is true.
    async fn generate_with_image(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _image_base64: &str,
        _temperature: f64,
    ) -> Result<LLMResponse, LLMError> {
        Err(LLMError(format!(
            "provider '{}' does not support vision",
            self.model_name()
        )))
    }

    fn supports_vision(&self) -> bool {
        false
    }

    fn model_name(&self) -> &str;
}
