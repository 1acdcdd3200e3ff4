//! Versioned job configuration accepted at submission time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::object_ref::ObjectReference;

/// Configuration schema version understood by this build.
pub const CONFIGURATION_VERSION: u32 = 1;

/// Default score an item must reach to count as passed.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.5;

fn default_version() -> u32 {
    CONFIGURATION_VERSION
}

/// How a job is evaluated and where its items come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfiguration {
    #[serde(default = "default_version")]
    pub version: u32,
    pub data_source: DataSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluation_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
}

impl JobConfiguration {
    /// Configuration over inline items with no extra hints.
    pub fn inline(items: Vec<EvaluationItem>) -> Self {
        Self {
            version: CONFIGURATION_VERSION,
            data_source: DataSource::Inline { items },
            prompt_template: None,
            evaluation_criteria: Vec::new(),
            agent_hint: None,
            knowledge_source: None,
            pass_threshold: None,
        }
    }

    /// Configuration over a dataset stored behind an object reference.
    pub fn referenced(reference: ObjectReference) -> Self {
        Self {
            data_source: DataSource::Reference { reference },
            ..Self::inline(Vec::new())
        }
    }

    pub fn pass_threshold(&self) -> f64 {
        self.pass_threshold.unwrap_or(DEFAULT_PASS_THRESHOLD)
    }
}

/// Where the items of a job come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// Items travel with the submission.
    Inline { items: Vec<EvaluationItem> },
    /// Object key in the configured object store holding a JSON array of items.
    Location { key: String },
    /// Explicit object-store reference holding a JSON array of items.
    Reference { reference: ObjectReference },
}

impl DataSource {
    /// Item count when it is known without reading the object store.
    pub fn known_item_count(&self) -> Option<u32> {
        match self {
            DataSource::Inline { items } => Some(items.len() as u32),
            DataSource::Location { .. } | DataSource::Reference { .. } => None,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, DataSource::Inline { .. })
    }
}

/// One row of an evaluation dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub prompt: String,
    pub expected_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_response: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EvaluationItem {
    pub fn new(prompt: impl Into<String>, expected_response: impl Into<String>) -> Self {
        Self {
            id: None,
            prompt: prompt.into(),
            expected_response: expected_response.into(),
            actual_response: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_actual_response(mut self, actual: impl Into<String>) -> Self {
        self.actual_response = Some(actual.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_configuration_fields_are_rejected() {
        let raw = serde_json::json!({
            "data_source": { "kind": "inline", "items": [] },
            "temperature": 0.2
        });
        assert!(serde_json::from_value::<JobConfiguration>(raw).is_err());
    }

    #[test]
    fn version_defaults_when_omitted() {
        let raw = serde_json::json!({
            "data_source": { "kind": "location", "key": "uploads/set.json" },
            "evaluation_criteria": ["accuracy"]
        });
        let config: JobConfiguration = serde_json::from_value(raw).unwrap();
        assert_eq!(config.version, CONFIGURATION_VERSION);
        assert_eq!(config.data_source.known_item_count(), None);
        assert!((config.pass_threshold() - DEFAULT_PASS_THRESHOLD).abs() < f64::EPSILON);
    }
}
