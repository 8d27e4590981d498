// Input validation utilities

use crate::error::ValidationError;
use regex::Regex;
use std::sync::OnceLock;

fn email_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
}

/// Collects field failures for one submission.
///
/// Each check records at most one message per field; later checks on an already failed field are
/// skipped so the operator sees the first broken rule only.
#[derive(Debug, Default)]
pub struct FieldValidator {
    errors: ValidationError,
}

impl FieldValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn failed(&self, field: &str) -> bool {
        self.errors.errors.iter().any(|e| e.field == field)
    }

    fn fail(&mut self, field: &str, message: String) -> &mut Self {
        if !self.failed(field) {
            self.errors.push(field, message);
        }
        self
    }

    pub fn required(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if value.map(|v| v.trim().is_empty()).unwrap_or(true) {
            return self.fail(field, format!("The {} field is required.", label(field)));
        }
        self
    }

    pub fn no_whitespace(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if value.map(|v| v.chars().any(char::is_whitespace)).unwrap_or(false) {
            return self.fail(
                field,
                format!("The {} must not contain spaces.", label(field)),
            );
        }
        self
    }

    pub fn numeric(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            if v.parse::<u32>().is_err() {
                return self.fail(field, format!("The {} must be a number.", label(field)));
            }
        }
        self
    }

    pub fn min_len(&mut self, field: &str, value: Option<&str>, min: usize) -> &mut Self {
        if let Some(v) = value {
            if v.chars().count() < min {
                return self.fail(
                    field,
                    format!(
                        "The {} must be at least {} characters.",
                        label(field),
                        min
                    ),
                );
            }
        }
        self
    }

    pub fn email(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            if !email_regex().map(|re| re.is_match(v)).unwrap_or(false) {
                return self.fail(
                    field,
                    format!("The {} must be a valid email address.", label(field)),
                );
            }
        }
        self
    }

    pub fn url(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            let ok = url::Url::parse(v)
                .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
                .unwrap_or(false);
            if !ok {
                return self.fail(
                    field,
                    format!("The {} must be a valid http(s) URL.", label(field)),
                );
            }
        }
        self
    }

    pub fn confirmed(
        &mut self,
        field: &str,
        value: Option<&str>,
        confirmation: Option<&str>,
    ) -> &mut Self {
        if value != confirmation {
            return self.fail(
                field,
                format!("The {} confirmation does not match.", label(field)),
            );
        }
        self
    }

    pub fn database_name(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            if let Err(msg) = validate_database_name(v) {
                return self.fail(field, msg);
            }
        }
        self
    }

    pub fn finish(self) -> Result<(), ValidationError> {
        self.errors.into_result()
    }
}

fn label(field: &str) -> String {
    field.replace('_', " ")
}

/// Validate database name (MySQL / PostgreSQL common subset)
pub fn validate_database_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Database name cannot be empty".to_string());
    }

    if name.len() > 63 {
        return Err("Database name cannot exceed 63 characters".to_string());
    }

    if name.contains('\0') {
        return Err("Database name cannot contain null bytes".to_string());
    }

    let invalid_chars = ['/', '\\', '.', '"', '\'', '`', ';'];
    if name.chars().any(|c| invalid_chars.contains(&c)) {
        return Err("Database name contains invalid characters".to_string());
    }

    Ok(())
}
