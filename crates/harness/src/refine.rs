use broker_evaluator::{strip_think, BenchmarkTask};
use broker_provider::{CompletionRequest, ModelProvider};
use std::sync::Arc;
use std::time::Duration;

const CRITIC_SYSTEM_PROMPT: &str =
    "You are a prompt engineer. Rewrite prompts so that a model produces the expected result.";
const CRITIC_TEMPERATURE: f32 = 0.2;
const CRITIC_MAX_TOKENS: u32 = 500;
const MAX_RESPONSE_CHARS_IN_CRITIQUE: usize = 4000;

pub const DEFAULT_CRITIC_TIMEOUT: Duration = Duration::from_secs(60);

/// Asks a critic model for a better prompt after a grading failure.
#[derive(Clone)]
pub struct PromptRefiner {
    provider: Arc<dyn ModelProvider>,
    critic_model: Option<String>,
    timeout: Duration,
}

impl PromptRefiner {
    /// With no `critic_model`, the model under test critiques itself.
    pub fn new(provider: Arc<dyn ModelProvider>, critic_model: Option<String>) -> Self {
        Self {
            provider,
            critic_model,
            timeout: DEFAULT_CRITIC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn critic_for<'a>(&'a self, model_under_test: &'a str) -> &'a str {
        self.critic_model.as_deref().unwrap_or(model_under_test)
    }

    /// Revised prompt, or `None` when the critic fails or has nothing new.
    pub async fn refine(
        &self,
        task: &BenchmarkTask,
        used_prompt: &str,
        failing_response: &str,
        model_under_test: &str,
    ) -> Option<String> {
        let critic = self.critic_for(model_under_test);
        let request = CompletionRequest::new(
            critic,
            critique_prompt(task, used_prompt, failing_response),
            self.timeout,
        )
        .with_system_prompt(Some(CRITIC_SYSTEM_PROMPT.to_string()))
        .with_temperature(Some(CRITIC_TEMPERATURE))
        .with_max_tokens(Some(CRITIC_MAX_TOKENS));

        match self.provider.complete(&request).await {
            Ok(completion) => {
                let revised = clean_revision(&completion.text);
                if revised.is_empty() || revised == used_prompt.trim() {
                    log::info!("critic {critic} returned no usable revision for task {}", task.id);
                    None
                } else {
                    log::debug!("critic {critic} revised prompt for task {}", task.id);
                    Some(revised)
                }
            }
            Err(err) => {
                log::warn!("critic {critic} failed for task {}: {err}", task.id);
                None
            }
        }
    }
}

fn critique_prompt(task: &BenchmarkTask, used_prompt: &str, failing_response: &str) -> String {
    let response: String = failing_response.chars().take(MAX_RESPONSE_CHARS_IN_CRITIQUE).collect();
    format!(
        "Original prompt: {used_prompt}\n\
         Grading method: {method}\n\
         Expected output:\n{expected}\n\
         Previous response: {response}\n\n\
         The previous response did not produce the expected output. \
         Generate an improved version of the original prompt that will lead to the expected result. \
         Focus on clarity and on guiding the model to the expected format. \
         Return only the improved prompt, no explanations.",
        method = task.evaluation_method(),
        expected = task.expected_shape(),
    )
}

fn clean_revision(text: &str) -> String {
    let text = strip_think(text);
    let text = text.trim();
    let text = text
        .strip_prefix("Improved prompt:")
        .or_else(|| text.strip_prefix("Revised prompt:"))
        .unwrap_or(text)
        .trim();
    let unquoted = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);
    unquoted.trim().to_string()
}
