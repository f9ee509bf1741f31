use async_trait::async_trait;

use super::{Completion, CompletionRequest, LlmClient, ResponseFormat};
use crate::errors::LlmError;

/// Offline client for local development. Output is derived from the prompt
/// only, so identical requests give identical documents.
pub struct StubClient;

#[async_trait]
impl LlmClient for StubClient {
    fn provider(&self) -> &'static str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let topic = request
            .prompt
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("document")
            .trim_start_matches('#')
            .trim()
            .to_string();

        let text = match request.format {
            ResponseFormat::Json => serde_json::json!({
                "generated_by": "stub",
                "topic": topic,
                "items": [],
            })
            .to_string(),
            ResponseFormat::Markdown => format!(
                "# {}\n\nThis document was generated offline by the stub provider.\n\n\
                 Configure LLM_PROVIDER=anthropic to generate real content.\n",
                topic
            ),
        };

        Ok(Completion {
            text,
            model: request.model,
            input_tokens: None,
            output_tokens: None,
        })
    }
}
