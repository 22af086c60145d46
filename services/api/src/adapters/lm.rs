//! services/api/src/adapters/lm.rs
//!
//! This module contains the adapter for the local language-model server.
//! It implements the `LanguageModelService` port from the `core` crate against
//! any OpenAI-compatible chat-completion endpoint (LM Studio in development).

use async_openai::{
    config::OpenAIConfig,
    types::chat::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs},
    Client, error::OpenAIError,
};
use async_trait::async_trait;
use futures::StreamExt;
use lm_chat_core::ports::{
    GenerationOptions, LanguageModelService, PortError, PortResult, TokenStream,
};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `LanguageModelService` using an OpenAI-compatible
/// model server.
#[derive(Clone)]
pub struct LmStudioAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LmStudioAdapter {
    /// Creates a new `LmStudioAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    /// Builds a single-user-message completion request carrying the sampling
    /// parameters.
    fn build_request(
        &self,
        prompt: &str,
        options: GenerationOptions,
        stream: bool,
    ) -> PortResult<CreateChatCompletionRequest> {
        let messages = vec![ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| PortError::Backend(e.to_string()))?
            .into()];

        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(stream)
            .temperature(options.temperature)
            .max_tokens(options.max_tokens)
            .top_p(options.top_p)
            .build()
            .map_err(|e| PortError::Backend(e.to_string()))
    }
}

//=========================================================================================
// `LanguageModelService` Trait Implementation
//=========================================================================================

#[async_trait]
impl LanguageModelService for LmStudioAdapter {
    /// Generates a complete response for the prompt in one round trip.
    async fn generate(&self, prompt: &str, options: GenerationOptions) -> PortResult<String> {
        let request = self.build_request(prompt, options, false)?;

        // Call the API and manually map the error if it occurs, which respects the orphan rule.
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Backend(e.to_string()))?;

        // Extract the text content from the first choice in the response.
        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(content) = choice.message.content {
                Ok(content)
            } else {
                Err(PortError::Backend(
                    "Model response contained no text content.".to_string(),
                ))
            }
        } else {
            Err(PortError::Backend(
                "Model returned no choices in its response.".to_string(),
            ))
        }
    }

    /// Opens a streaming generation and relays each non-empty delta as one
    /// fragment. The backend terminates the frame sequence with its `[DONE]`
    /// sentinel, which the client library consumes for us.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> PortResult<TokenStream> {
        let request = self.build_request(prompt, options, true)?;

        let mut inner = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e: OpenAIError| PortError::Backend(e.to_string()))?;

        let stream = async_stream::stream! {
            while let Some(frame) = inner.next().await {
                match frame {
                    Ok(response) => {
                        let fragment = response
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.clone());
                        // Frames without content (role preambles, keep-alives)
                        // are skipped.
                        if let Some(fragment) = fragment {
                            if !fragment.is_empty() {
                                yield Ok(fragment);
                            }
                        }
                    }
                    // One corrupt frame must not abort an otherwise healthy
                    // stream.
                    Err(OpenAIError::JSONDeserialize(..)) => continue,
                    Err(e) => {
                        yield Err(PortError::Backend(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
