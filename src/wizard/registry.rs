// Step registry
//
// Ordered, immutable catalog of the configured steps. Built once from `InstallerConfig`; lookups
// are linear over a handful of entries.

use crate::config::{InstallerConfig, StepConfig, StepKind};
use crate::error::{InstallerError, InstallerResult};
use crate::installation::provisioner::SideEffect;
use std::collections::HashSet;

impl StepKind {
    /// Side effect run before the step's payload is committed.
    pub fn side_effect(self) -> Option<SideEffect> {
        match self {
            StepKind::Environment => Some(SideEffect::ProvisionEnvironment),
            StepKind::Mail => Some(SideEffect::ProvisionMail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub key: String,
    pub label: String,
    pub description: String,
    pub optional: bool,
    pub kind: StepKind,
}

impl Step {
    pub fn side_effect(&self) -> Option<SideEffect> {
        self.kind.side_effect()
    }

    /// The finish step ends the wizard instead of committing progress.
    pub fn is_terminal(&self) -> bool {
        self.kind == StepKind::Finish
    }
}

impl From<&StepConfig> for Step {
    fn from(c: &StepConfig) -> Self {
        Self {
            key: c.key.clone(),
            label: c.label.clone(),
            description: c.description.clone(),
            optional: c.optional,
            kind: c.handler,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<Step>,
}

impl StepRegistry {
    /// Build from configuration. The admin step is dropped when admin creation is disabled.
    pub fn from_config(config: &InstallerConfig) -> InstallerResult<Self> {
        let steps = config
            .steps
            .iter()
            .filter(|s| config.create_admin || s.handler != StepKind::Admin)
            .map(Step::from)
            .collect();
        Self::new(steps)
    }

    pub fn new(steps: Vec<Step>) -> InstallerResult<Self> {
        if steps.is_empty() {
            return Err(InstallerError::Config(
                "at least one step must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if step.key.trim().is_empty() {
                return Err(InstallerError::Config("step keys must not be empty".to_string()));
            }
            if !seen.insert(step.key.as_str()) {
                return Err(InstallerError::Config(format!(
                    "duplicate step key '{}'",
                    step.key
                )));
            }
        }

        let terminal = steps.iter().filter(|s| s.is_terminal()).count();
        let ends_with_finish = steps.last().is_some_and(Step::is_terminal);
        if terminal != 1 || !ends_with_finish {
            return Err(InstallerError::Config(
                "exactly one finish step must be configured, as the last step".to_string(),
            ));
        }

        Ok(Self { steps })
    }

    pub fn step_index(&self, key: &str) -> InstallerResult<usize> {
        self.steps
            .iter()
            .position(|s| s.key == key)
            .ok_or_else(|| InstallerError::NotFound(key.to_string()))
    }

    pub fn step_at(&self, index: usize) -> InstallerResult<&Step> {
        self.steps
            .get(index)
            .ok_or_else(|| InstallerError::NotFound(format!("step index {}", index)))
    }

    /// Key of the step after `index`, `None` at the last step.
    pub fn next_key(&self, index: usize) -> Option<&str> {
        self.steps.get(index + 1).map(|s| s.key.as_str())
    }

    pub fn get(&self, key: &str) -> InstallerResult<&Step> {
        let index = self.step_index(key)?;
        self.step_at(index)
    }

    pub fn first(&self) -> &Step {
        &self.steps[0]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }
}
