// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Workflow templates
//!
//! A template maps a flat `input` object onto a full prompt graph: each
//! declared input lands at one node/field. Validation is a plain
//! per-template pass yielding `{parsed, errors[]}` with pointer-style
//! locations; the first error fails the request.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use comfygate_engine::Prompt;
use comfygate_kernel::error::{GatewayError, Result};

/// Declared template input
#[derive(Debug, Clone, Deserialize)]
pub struct InputSpec {
    /// Node id the value lands on
    pub node: String,
    /// Input field on that node
    pub field: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Expected JSON type: `string`, `number`, `boolean`; unset = any
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// One named workflow template
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    pub prompt: Prompt,
}

/// One validation problem, pointer-located
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    pub location: String,
    pub message: String,
}

/// Validation outcome: what parsed, and everything wrong
#[derive(Debug)]
pub struct Validated {
    pub parsed: Map<String, Value>,
    pub errors: Vec<ValidationIssue>,
}

impl WorkflowTemplate {
    /// Check a request's `input` object against the declared inputs
    pub fn validate(&self, input: &Value) -> Validated {
        let mut parsed = Map::new();
        let mut errors = Vec::new();

        let input_obj = match input {
            Value::Object(obj) => obj.clone(),
            Value::Null => Map::new(),
            _ => {
                return Validated {
                    parsed,
                    errors: vec![ValidationIssue {
                        location: "/input".to_string(),
                        message: "input must be an object".to_string(),
                    }],
                }
            }
        };

        for (name, spec) in &self.inputs {
            let location = format!("/input/{name}");
            match input_obj.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if let Some(kind) = &spec.kind {
                        let ok = match kind.as_str() {
                            "string" => value.is_string(),
                            "number" => value.is_number(),
                            "boolean" => value.is_boolean(),
                            _ => true,
                        };
                        if !ok {
                            errors.push(ValidationIssue {
                                location,
                                message: format!("expected {kind}"),
                            });
                            continue;
                        }
                    }
                    parsed.insert(name.clone(), value.clone());
                }
                None => match (&spec.default, spec.required) {
                    (Some(default), _) => {
                        parsed.insert(name.clone(), default.clone());
                    }
                    (None, true) => errors.push(ValidationIssue {
                        location,
                        message: "required input is missing".to_string(),
                    }),
                    (None, false) => {}
                },
            }
        }

        for name in input_obj.keys() {
            if !self.inputs.contains_key(name) {
                errors.push(ValidationIssue {
                    location: format!("/input/{name}"),
                    message: "unknown input".to_string(),
                });
            }
        }

        Validated { parsed, errors }
    }

    /// Validate and instantiate the template's prompt
    pub fn apply(&self, input: &Value) -> Result<Prompt> {
        let validated = self.validate(input);
        if let Some(first) = validated.errors.first() {
            return Err(GatewayError::validation_at(
                first.message.clone(),
                first.location.clone(),
            ));
        }

        let mut prompt = self.prompt.clone();
        for (name, value) in &validated.parsed {
            let Some(spec) = self.inputs.get(name) else {
                continue;
            };
            let node = prompt.get_mut(&spec.node).ok_or_else(|| {
                GatewayError::internal(format!(
                    "template {} routes input {name} to missing node {}",
                    self.name, spec.node
                ))
            })?;
            node.inputs.insert(spec.field.clone(), value.clone());
        }

        Ok(prompt)
    }
}

/// Templates loaded from the workflow directory at boot
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    templates: HashMap<String, WorkflowTemplate>,
}

impl WorkflowRegistry {
    /// Load every `*.json` in `dir`; unparseable files are skipped with a
    /// warning so one bad template doesn't take the gateway down
    pub fn load_dir(dir: &Path) -> Self {
        let mut templates = HashMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "workflow directory not readable: {e}");
                return Self::default();
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<WorkflowTemplate>(&raw).map_err(|e| e.to_string()))
            {
                Ok(template) => {
                    tracing::info!(name = %template.name, "workflow template loaded");
                    templates.insert(template.name.clone(), template);
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), "skipping workflow template: {e}");
                }
            }
        }

        Self { templates }
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_template() -> WorkflowTemplate {
        serde_json::from_value(json!({
            "name": "txt2img",
            "description": "text to image",
            "inputs": {
                "prompt_text": { "node": "2", "field": "text", "required": true, "type": "string" },
                "steps": { "node": "4", "field": "steps", "default": 20, "type": "number" }
            },
            "prompt": {
                "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
                "4": { "class_type": "KSampler", "inputs": { "steps": 20 } },
                "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out" } }
            }
        }))
        .expect("template")
    }

    #[test]
    fn test_apply_places_inputs() {
        let template = sample_template();
        let prompt = template
            .apply(&json!({ "prompt_text": "a lighthouse at dusk" }))
            .expect("apply");

        assert_eq!(
            prompt["2"].inputs.get("text"),
            Some(&json!("a lighthouse at dusk"))
        );
        // Default applied
        assert_eq!(prompt["4"].inputs.get("steps"), Some(&json!(20)));
    }

    #[test]
    fn test_missing_required_input() {
        let template = sample_template();
        let err = template.apply(&json!({})).err();
        assert_eq!(
            err.as_ref().and_then(|e| e.location()).map(str::to_string),
            Some("/input/prompt_text".to_string())
        );
    }

    #[test]
    fn test_type_mismatch_located() {
        let template = sample_template();
        let validated = template.validate(&json!({ "prompt_text": 42 }));
        assert!(validated
            .errors
            .iter()
            .any(|e| e.location == "/input/prompt_text" && e.message.contains("string")));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let template = sample_template();
        let validated = template.validate(&json!({
            "prompt_text": "x",
            "bogus": true
        }));
        assert!(validated.errors.iter().any(|e| e.location == "/input/bogus"));
    }

    #[test]
    fn test_registry_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("good.json"),
            serde_json::to_string(&json!({
                "name": "good",
                "prompt": {
                    "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
                }
            }))
            .expect("encode"),
        )
        .expect("write");
        std::fs::write(dir.path().join("bad.json"), "{ not json").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let registry = WorkflowRegistry::load_dir(dir.path());
        assert_eq!(registry.names(), vec!["good".to_string()]);
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());
    }
}
