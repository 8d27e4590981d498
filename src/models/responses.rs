// Response models returned to the presentation layer

use crate::error::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =========================
// Generic wrapper
// =========================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            message: None,
        }
    }
}

// =========================
// Wizard navigation
// =========================

/// Where the presentation layer should go next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "camelCase")]
pub enum RedirectTarget {
    /// Another wizard step, by key.
    Step(String),
    /// Post-install destination (outside the wizard).
    Destination(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepState {
    Completed,
    Current,
    Upcoming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub key: String,
    pub label: String,
    pub description: String,
    pub optional: bool,
    pub state: StepState,
}

/// Everything needed to render the active step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub key: String,
    pub label: String,
    pub description: String,
    pub index: usize,
    pub total: usize,
    pub skippable: bool,
    pub can_proceed: bool,
    pub working: bool,
    /// One-shot message consumed by this render.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash: Option<String>,
    /// Step-specific context (prefill, requirement report, summary).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    pub steps: Vec<StepSummary>,
}

/// Result of asking the active step to complete (or skip).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Transition {
    /// Move on (or back to the same step after a recorded failure).
    Redirect {
        target: RedirectTarget,
        #[serde(skip_serializing_if = "Option::is_none")]
        flash: Option<String>,
    },
    /// Stay on the step and show inline field errors; nothing was persisted.
    Invalid {
        #[serde(rename = "fieldErrors")]
        field_errors: Vec<FieldError>,
    },
    /// The step reported an error of its own; proceeding is disabled.
    Rejected { flash: String },
}

/// Result of entering a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum MountOutcome {
    Render { view: StepView },
    Redirect {
        target: RedirectTarget,
        #[serde(skip_serializing_if = "Option::is_none")]
        flash: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub installed: bool,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub pending_raw_step: Option<String>,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsExportResponse {
    pub file_name: String,
    pub path: Option<String>,
    pub content: String,
}
