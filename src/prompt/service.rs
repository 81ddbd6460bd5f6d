//! Prompt Service: render templates, call the LLM port, validate
//! structured responses.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::info;

use super::template::PromptTemplateStore;
use crate::errors::{CoreError, LLMResponseInvalid, LLMUnavailable, PromptBindingError};

/// The narrow port to the LLM provider: accessed through a single
/// `complete(prompt) -> text` call, with no consensus/council layer.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn complete(&self, model_id: &str, system_role: &str, prompt: &str) -> Result<String, LLMUnavailable>;
}

/// Renders versioned templates and invokes the LLM port, enforcing
/// schema-valid structured output.
pub struct PromptService {
    templates: PromptTemplateStore,
    llm: Box<dyn LlmPort>,
}

impl PromptService {
    pub fn new(templates: PromptTemplateStore, llm: Box<dyn LlmPort>) -> Self {
        Self { templates, llm }
    }

    /// Render a template's body with the given variables, without calling
    /// the LLM. Variables must exactly match the template's declared set.
    pub fn render(
        &self,
        template_id: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<String, PromptBindingError> {
        let template = self.lookup(template_id)?;
        self.check_variables(template_id, template.context_variables.as_slice(), variables)?;
        Ok(template.render_body(variables))
    }

    /// Render, call the LLM, parse, and schema-validate the response.
    /// No retries — the caller decides whether to retry.
    pub async fn invoke(
        &self,
        template_id: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<Value, CoreError> {
        let template = self.lookup(template_id)?.clone();
        self.check_variables(template_id, template.context_variables.as_slice(), variables)?;
        let prompt_text = template.render_body(variables);

        let started = Instant::now();
        let raw_response = self
            .llm
            .complete(&template.model_id, &template.system_role, &prompt_text)
            .await?;
        info!(
            template_id,
            version = template.version,
            prompt_chars = prompt_text.len(),
            completion_chars = raw_response.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "llm call completed"
        );

        let parsed: Value = serde_json::from_str(&raw_response).map_err(|e| LLMResponseInvalid {
            template_id: template_id.to_string(),
            reason: format!("response was not valid JSON: {e}"),
            raw_response: raw_response.clone(),
        })?;

        let schema = JSONSchema::compile(&template.output_schema).map_err(|e| LLMResponseInvalid {
            template_id: template_id.to_string(),
            reason: format!("template output_schema is not a valid JSON schema: {e}"),
            raw_response: raw_response.clone(),
        })?;

        if let Err(errors) = schema.validate(&parsed) {
            let reason = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            return Err(LLMResponseInvalid {
                template_id: template_id.to_string(),
                reason,
                raw_response,
            }
            .into());
        }

        Ok(parsed)
    }

    fn lookup(&self, template_id: &str) -> Result<&super::template::PromptTemplate, PromptBindingError> {
        self.templates
            .get(template_id, None)
            .ok_or_else(|| PromptBindingError::UnknownTemplate {
                template_id: template_id.to_string(),
            })
    }

    fn check_variables(
        &self,
        template_id: &str,
        declared: &[String],
        supplied: &HashMap<String, Value>,
    ) -> Result<(), PromptBindingError> {
        for variable in declared {
            if !supplied.contains_key(variable) {
                return Err(PromptBindingError::MissingVariable {
                    template_id: template_id.to_string(),
                    variable: variable.clone(),
                });
            }
        }
        for key in supplied.keys() {
            if !declared.contains(key) {
                return Err(PromptBindingError::UnexpectedVariable {
                    template_id: template_id.to_string(),
                    variable: key.clone(),
                });
            }
        }
        Ok(())
    }
}
