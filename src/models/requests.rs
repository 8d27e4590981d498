// Step submission payloads
//
// Steps receive loosely typed JSON from the presentation layer. These types give the handlers and
// the provisioner a typed view; numbers are accepted where strings are expected because form
// encoders disagree about ports.

use crate::error::ValidationError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(match v {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn parse<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, ValidationError> {
    let source = if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload.clone()
    };
    serde_json::from_value(source)
        .map_err(|e| ValidationError::field("payload", format!("Malformed submission: {}", e)))
}

/// Mail transport settings, shared by the environment and mail steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_mailer: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_host: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_port: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_username: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_password: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_from_address: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub mail_from_name: Option<String>,
}

impl MailSettings {
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        parse(payload)
    }

    /// True when any mail field was submitted.
    pub fn is_present(&self) -> bool {
        [
            &self.mail_mailer,
            &self.mail_host,
            &self.mail_port,
            &self.mail_username,
            &self.mail_password,
            &self.mail_from_address,
            &self.mail_from_name,
        ]
        .iter()
        .any(|f| f.is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub db_connection: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub db_host: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub db_port: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub db_database: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub db_username: Option<String>,
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,
    #[serde(flatten)]
    pub mail: MailSettings,
}

impl EnvironmentSettings {
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        parse(payload)
    }

    /// Connection parameters with the stock defaults for anything left blank.
    pub fn database_params(&self) -> DatabaseParams {
        DatabaseParams {
            connection: non_empty(&self.db_connection).unwrap_or_else(|| "mysql".to_string()),
            host: non_empty(&self.db_host).unwrap_or_else(|| "127.0.0.1".to_string()),
            port: non_empty(&self.db_port).unwrap_or_else(|| "3306".to_string()),
            database: self.db_database.clone().unwrap_or_default(),
            username: self.db_username.clone().unwrap_or_default(),
            password: self.db_password.clone().unwrap_or_default(),
        }
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref().filter(|s| !s.trim().is_empty()).cloned()
}

/// Parameters for the live database connection.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseParams {
    /// Driver name as the application spells it (`mysql`, `mariadb`, `pgsql`).
    pub connection: String,
    pub host: String,
    pub port: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for DatabaseParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseParams")
            .field("connection", &self.connection)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl DatabaseParams {
    /// Environment variables the application console reads for its connection.
    pub fn as_env(&self) -> Vec<(String, String)> {
        vec![
            ("DB_CONNECTION".to_string(), self.connection.clone()),
            ("DB_HOST".to_string(), self.host.clone()),
            ("DB_PORT".to_string(), self.port.clone()),
            ("DB_DATABASE".to_string(), self.database.clone()),
            ("DB_USERNAME".to_string(), self.username.clone()),
            ("DB_PASSWORD".to_string(), self.password.clone()),
        ]
    }
}

#[derive(Clone, Default, PartialEq, Deserialize)]
pub struct AdminAccount {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_confirmation: Option<String>,
}

impl std::fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAccount")
            .field("name", &self.name)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl AdminAccount {
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        parse(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ports_are_accepted() {
        let env = EnvironmentSettings::from_payload(&json!({
            "app_url": "https://example.test",
            "db_port": 5432,
            "mail_port": 587
        }))
        .expect("parse");
        assert_eq!(env.db_port.as_deref(), Some("5432"));
        assert_eq!(env.mail.mail_port.as_deref(), Some("587"));
        assert!(env.mail.is_present());
    }

    #[test]
    fn blank_database_fields_fall_back_to_defaults() {
        let env = EnvironmentSettings::from_payload(&json!({
            "db_connection": "",
            "db_database": "shop"
        }))
        .expect("parse");
        let params = env.database_params();
        assert_eq!(params.connection, "mysql");
        assert_eq!(params.host, "127.0.0.1");
        assert_eq!(params.port, "3306");
        assert_eq!(params.database, "shop");
    }

    #[test]
    fn debug_output_never_shows_passwords() {
        let env = EnvironmentSettings::from_payload(&json!({ "db_password": "hunter2-secret" }))
            .expect("parse");
        let rendered = format!("{:?}", env.database_params());
        assert!(!rendered.contains("hunter2-secret"), "{}", rendered);

        let admin = AdminAccount::from_payload(&json!({ "password": "hunter2-secret" }))
            .expect("parse");
        assert!(!format!("{:?}", admin).contains("hunter2-secret"));
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = EnvironmentSettings::from_payload(&json!(["not", "an", "object"])).unwrap_err();
        assert_eq!(err.errors[0].field, "payload");
    }

    #[test]
    fn null_payload_parses_as_empty() {
        let mail = MailSettings::from_payload(&Value::Null).expect("parse");
        assert!(!mail.is_present());
    }
}
