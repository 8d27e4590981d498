// Persisted wizard progress document
//
// One JSON document per installation attempt. It is rewritten wholesale on every transition and
// deleted once the installation finishes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Step whose provisioning payload is held in `raw_env_data` when no owner was recorded.
pub const DEFAULT_RAW_STEP: &str = "environment";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Monotonic write counter used to reject stale writers.
    #[serde(default)]
    pub version: u64,
    /// Key of the last committed step (the first step's key for a fresh document).
    pub current_step: String,
    /// Committed payload per completed step.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    /// Payload whose side effects succeeded but whose commit has not happened yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_env_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_env_step: Option<String>,
    /// Set once a failure involving the pending payload has been surfaced. A failed payload is
    /// never promoted; only a fresh submission of its step replaces it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raw_failed: bool,
    /// Last failure message, surfaced once on the next load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Progress {
    pub fn fresh(first_step: &str) -> Self {
        Self {
            version: 0,
            current_step: first_step.to_string(),
            data: BTreeMap::new(),
            raw_env_data: None,
            raw_env_step: None,
            raw_failed: false,
            error: None,
        }
    }

    pub fn has_raw(&self) -> bool {
        self.raw_env_data.is_some()
    }

    /// Step that owns the pending raw payload.
    pub fn raw_step(&self) -> &str {
        self.raw_env_step.as_deref().unwrap_or(DEFAULT_RAW_STEP)
    }

    pub fn record_raw(&mut self, step_key: &str, payload: &Value) {
        self.raw_env_data = Some(payload.clone());
        self.raw_env_step = Some(step_key.to_string());
        self.raw_failed = false;
    }

    /// Pending payload exists and has not been marked failed.
    pub fn has_promotable_raw(&self) -> bool {
        self.has_raw() && !self.raw_failed
    }

    pub fn clear_raw(&mut self) {
        self.raw_env_data = None;
        self.raw_env_step = None;
        self.raw_failed = false;
    }

    /// Take the persisted error, leaving the field empty.
    pub fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }

    /// Commit a completed step: store a non-empty payload, move the pointer and drop transient
    /// fields in one mutation so a single write makes the whole transition durable.
    pub fn commit(&mut self, step_key: &str, payload: &Value) {
        if !is_empty_payload(payload) {
            self.data.insert(step_key.to_string(), payload.clone());
        }
        self.current_step = step_key.to_string();
        self.clear_raw();
        self.error = None;
    }
}

/// `null`, `{}` and `[]` carry nothing worth committing.
pub fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_document_points_at_first_step() {
        let p = Progress::fresh("welcome");
        assert_eq!(p.current_step, "welcome");
        assert!(p.data.is_empty());
        assert!(!p.has_raw());
        assert!(p.error.is_none());
    }

    #[test]
    fn commit_skips_empty_payloads_but_moves_pointer() {
        let mut p = Progress::fresh("welcome");
        p.commit("welcome", &Value::Null);
        assert_eq!(p.current_step, "welcome");
        assert!(p.data.is_empty());

        p.commit("requirements", &json!({ "php": { "passed": true } }));
        assert_eq!(p.current_step, "requirements");
        assert_eq!(p.data["requirements"]["php"]["passed"], true);
    }

    #[test]
    fn commit_clears_transient_fields() {
        let mut p = Progress::fresh("welcome");
        p.record_raw("mail", &json!({ "mail_host": "smtp.example.test" }));
        p.error = Some("boom".to_string());
        p.raw_failed = true;
        p.commit("mail", &json!({ "mail_host": "smtp.example.test" }));
        assert!(!p.has_raw());
        assert!(p.raw_env_step.is_none());
        assert!(!p.raw_failed);
        assert!(p.error.is_none());
    }

    #[test]
    fn raw_step_defaults_to_environment() {
        let doc = json!({
            "current_step": "requirements",
            "data": {},
            "raw_env_data": { "app_url": "https://example.test" }
        });
        let p: Progress = serde_json::from_value(doc).expect("parse");
        assert_eq!(p.version, 0);
        assert_eq!(p.raw_step(), "environment");
    }

    #[test]
    fn transient_fields_are_omitted_when_absent() {
        let text = serde_json::to_string(&Progress::fresh("welcome")).expect("json");
        assert!(!text.contains("raw_env_data"));
        assert!(!text.contains("error"));
        assert!(!text.contains("raw_failed"));
    }

    #[test]
    fn failed_payload_is_not_promotable_until_resubmitted() {
        let mut p = Progress::fresh("welcome");
        let payload = json!({ "app_url": "https://example.test" });
        p.record_raw("environment", &payload);
        assert!(p.has_promotable_raw());

        p.raw_failed = true;
        assert!(p.has_raw());
        assert!(!p.has_promotable_raw());

        p.record_raw("environment", &payload);
        assert!(p.has_promotable_raw());
    }
}
