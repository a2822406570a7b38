use std::sync::Arc;

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};

use crate::ai_sdk::{CompletionProvider, ProviderError, StructuredRequest};
use crate::prompts;
use crate::protocol::ConversationTurn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Route {
    Greeting,
    Conversation,
    DatabaseQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub route: Route,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0, max = 1))]
    pub confidence: Option<f64>,
    #[schemars(description = "The user input restated as a self-contained question")]
    pub question: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("no user message to classify")]
    EmptyHistory,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("classifier returned an invalid object: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("classifier confidence {0} is outside [0, 1]")]
    Confidence(f64),
}

/// Picks the response strategy for a conversation. There is no default
/// route: anything the model returns outside the three labels is an error.
pub struct Classifier {
    provider: Arc<dyn CompletionProvider>,
    model: String,
}

impl Classifier {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub async fn classify(
        &self,
        history: &[ConversationTurn],
    ) -> Result<Classification, ClassifyError> {
        if history.is_empty() {
            return Err(ClassifyError::EmptyHistory);
        }

        let request = StructuredRequest {
            model: self.model.clone(),
            system: prompts::CLASSIFICATION.to_string(),
            messages: history.to_vec(),
            schema_name: "classification".to_string(),
            schema: serde_json::to_value(schema_for!(Classification))?,
        };

        let value = self.provider.structured_complete(request).await?;
        let classification: Classification = serde_json::from_value(value)?;

        if let Some(confidence) = classification.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ClassifyError::Confidence(confidence));
            }
        }

        Ok(classification)
    }
}
