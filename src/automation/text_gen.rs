use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TextGenerationError {
    #[error("text generation is not configured")]
    NotConfigured,
    #[error("text generation request failed: {0}")]
    Request(String),
    #[error("text generation returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("text generation returned no content")]
    Empty,
}

/// Everything the generator needs to write the free-text part of a challenge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChallengeTextRequest {
    pub pcn_number: String,
    pub issuer: String,
    pub contravention_code: Option<String>,
    pub reason_label: String,
    pub custom_reason: Option<String>,
    /// Hint text the portal shows inside its free-text box.
    pub portal_prompt: Option<String>,
    pub evidence_urls: Vec<String>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn generate(&self, request: &ChallengeTextRequest)
        -> Result<String, TextGenerationError>;
}

const SYSTEM_PROMPT: &str = "You write concise, factual appeals against UK parking penalty \
charge notices. Write in the first person as the registered keeper, refer to the \
contravention and the grounds given, mention supporting evidence where provided, and never \
invent facts. Plain text only, no greeting placeholders, under 250 words.";

pub fn build_user_prompt(request: &ChallengeTextRequest) -> String {
    let mut prompt = format!(
        "PCN {} issued by {}.\nGrounds: {}.",
        request.pcn_number, request.issuer, request.reason_label
    );
    if let Some(code) = &request.contravention_code {
        prompt.push_str(&format!("\nContravention code: {code}."));
    }
    if let Some(custom) = request.custom_reason.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nMotorist's account: {}", custom.trim()));
    }
    if let Some(hint) = request.portal_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nThe portal asks: {}", hint.trim()));
    }
    if !request.evidence_urls.is_empty() {
        prompt.push_str("\nEvidence images:");
        for url in &request.evidence_urls {
            prompt.push_str(&format!("\n- {url}"));
        }
    }
    prompt
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiTextGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiTextGenerator {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn generate(
        &self,
        request: &ChallengeTextRequest,
    ) -> Result<String, TextGenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(TextGenerationError::NotConfigured)?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "temperature": 0.3,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_user_prompt(request) },
            ],
        });

        debug!(pcn_number = %request.pcn_number, model = %self.model, "requesting challenge text");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| TextGenerationError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "text generation failed");
            return Err(TextGenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|err| TextGenerationError::Request(err.to_string()))?;
        completion
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(TextGenerationError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_optional_context_only_when_present() {
        let mut request = ChallengeTextRequest {
            pcn_number: "LW12345678".into(),
            issuer: "Lewisham Council".into(),
            reason_label: "The contravention did not occur".into(),
            ..Default::default()
        };
        let bare = build_user_prompt(&request);
        assert!(bare.contains("PCN LW12345678 issued by Lewisham Council"));
        assert!(!bare.contains("Evidence images"));

        request.custom_reason = Some("  The bay markings were worn away. ".into());
        request.evidence_urls = vec!["https://cdn.example/1.png".into()];
        request.portal_prompt = Some("Please explain why".into());
        let full = build_user_prompt(&request);
        assert!(full.contains("Motorist's account: The bay markings were worn away."));
        assert!(full.contains("The portal asks: Please explain why"));
        assert!(full.contains("- https://cdn.example/1.png"));
    }

    #[tokio::test]
    async fn missing_key_is_reported_without_a_request() {
        let generator = OpenAiTextGenerator::new("http://127.0.0.1:9", None, "gpt-4o-mini");
        let err = generator
            .generate(&ChallengeTextRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TextGenerationError::NotConfigured));
    }
}
