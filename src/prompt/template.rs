//! Versioned prompt templates.
//!
//! Templates are treated as data loaded once at startup rather than code
//! assembled per call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One versioned prompt document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub version: u32,
    pub model_id: String,
    pub system_role: String,
    pub context_variables: Vec<String>,
    pub template_body: String,
    pub output_schema: serde_json::Value,
}

impl PromptTemplate {
    /// Substitute `{{variable}}` placeholders in the template body.
    /// Variables must exactly match `context_variables`; extras or
    /// omissions are rejected by `PromptService::render` before this runs.
    pub fn render_body(&self, variables: &HashMap<String, serde_json::Value>) -> String {
        let mut rendered = self.template_body.clone();
        for key in &self.context_variables {
            let placeholder = format!("{{{{{key}}}}}");
            let value = variables
                .get(key)
                .map(render_value)
                .unwrap_or_default();
            rendered = rendered.replace(&placeholder, &value);
        }
        rendered
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

/// An in-memory, load-once store of templates keyed by `(id, version)`,
/// with `highest()` resolving the default version per id — selected by
/// template id and version, default to the highest.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplateStore {
    templates: HashMap<(String, u32), PromptTemplate>,
}

impl PromptTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: PromptTemplate) {
        self.templates
            .insert((template.id.clone(), template.version), template);
    }

    pub fn get(&self, id: &str, version: Option<u32>) -> Option<&PromptTemplate> {
        match version {
            Some(v) => self.templates.get(&(id.to_string(), v)),
            None => self
                .templates
                .values()
                .filter(|t| t.id == id)
                .max_by_key(|t| t.version),
        }
    }

    /// Load the two required templates plus the optional ones, with
    /// bodies and schemas fixed at compile time. A deployment that needs to
    /// customize prompt text overrides these at startup via `insert`.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store.insert(evaluation_quality_template());
        store.insert(evaluation_correction_template());
        store.insert(format_detection_template());
        store.insert(correction_user_prompt_template());
        store
    }
}

fn evaluation_quality_template() -> PromptTemplate {
    PromptTemplate {
        id: "evaluation_quality".into(),
        version: 1,
        model_id: "claude-sonnet".into(),
        system_role: "You are a neurophysiology data curator summarizing an NWB validation report for a researcher.".into(),
        context_variables: vec!["overall_status".into(), "issue_counts".into(), "file_info".into()],
        template_body: r#"The NWB file validation finished with status {{overall_status}}.

Issue counts by severity:
{{issue_counts}}

File information:
{{file_info}}

Write a concise executive summary, an overall quality assessment, and a short list of prioritized recommendations. Respond as JSON matching the declared schema."#.into(),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["executive_summary", "quality_assessment", "recommendations"],
            "properties": {
                "executive_summary": {"type": "string"},
                "quality_assessment": {"type": "string"},
                "recommendations": {"type": "array", "items": {"type": "string"}}
            }
        }),
    }
}

fn evaluation_correction_template() -> PromptTemplate {
    PromptTemplate {
        id: "evaluation_correction".into(),
        version: 1,
        model_id: "claude-sonnet".into(),
        system_role: "You are a neurophysiology data curator helping a researcher fix a failed NWB conversion.".into(),
        context_variables: vec!["issues".into(), "attempt_number".into(), "previous_issues".into()],
        template_body: r#"Attempt {{attempt_number}} of the conversion failed validation.

Current issues:
{{issues}}

Previous attempt's issues (if any):
{{previous_issues}}

For each issue, explain what it means and how to fix it. Produce an ordered fix roadmap and classify each issue as auto-fixable or needing user input. Respond as JSON matching the declared schema."#.into(),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["issue_analysis", "fix_roadmap", "auto_fixable", "user_input_needed"],
            "properties": {
                "issue_analysis": {"type": "array", "items": {"type": "object"}},
                "fix_roadmap": {"type": "array", "items": {"type": "string"}},
                "auto_fixable": {"type": "array", "items": {"type": "string"}},
                "user_input_needed": {"type": "array", "items": {"type": "string"}}
            }
        }),
    }
}

fn format_detection_template() -> PromptTemplate {
    PromptTemplate {
        id: "format_detection".into(),
        version: 1,
        model_id: "claude-sonnet".into(),
        system_role: "You are disambiguating which recording-system interface matches a directory of files.".into(),
        context_variables: vec!["directory_listing".into(), "candidates".into()],
        template_body: r#"Directory listing:
{{directory_listing}}

Candidate interfaces with confidence scores:
{{candidates}}

Pick the single best-matching interface name. Respond as JSON matching the declared schema."#.into(),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["selected_interface", "rationale"],
            "properties": {
                "selected_interface": {"type": "string"},
                "rationale": {"type": "string"}
            }
        }),
    }
}

fn correction_user_prompt_template() -> PromptTemplate {
    PromptTemplate {
        id: "correction_user_prompt".into(),
        version: 1,
        model_id: "claude-sonnet".into(),
        system_role: "You are writing a short, precise prompt asking a researcher for one missing piece of NWB metadata.".into(),
        context_variables: vec!["field_name".into(), "issue_message".into()],
        template_body: r#"The field "{{field_name}}" needs a value. Validator context: {{issue_message}}

Produce {question, why_it_is_needed, example_value, validation_rule} as JSON matching the declared schema."#.into(),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["question", "why_it_is_needed", "example_value", "validation_rule"],
            "properties": {
                "question": {"type": "string"},
                "why_it_is_needed": {"type": "string"},
                "example_value": {"type": "string"},
                "validation_rule": {"type": "string"}
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_store_resolves_highest_version() {
        let store = PromptTemplateStore::with_defaults();
        let template = store.get("evaluation_quality", None).unwrap();
        assert_eq!(template.version, 1);
    }

    #[test]
    fn render_body_substitutes_known_variables() {
        let template = evaluation_quality_template();
        let mut vars = HashMap::new();
        vars.insert("overall_status".to_string(), serde_json::json!("PASSED"));
        vars.insert("issue_counts".to_string(), serde_json::json!({}));
        vars.insert("file_info".to_string(), serde_json::json!({}));
        let rendered = template.render_body(&vars);
        assert!(rendered.contains("PASSED"));
        assert!(!rendered.contains("{{overall_status}}"));
    }
}
