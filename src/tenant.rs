//! Tenant descriptors: the connection details of one tenant's database, as stored in the registry table.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Key of the always-present fallback tenant. Never stored in the registry table.
pub const DEFAULT_TENANT: &str = "default";

fn tenant_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,62}$").expect("tenant name pattern is valid")
    })
}

/// Connection details for one tenant. `name` is the tenant key.
///
/// Equality follows the persistent id only: two descriptors without an id are never equal,
/// even when every other field matches.
#[derive(Clone, Serialize, Deserialize)]
pub struct TenantDescriptor {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub initialize: bool,
    #[serde(default, skip_deserializing)]
    pub created_at: Option<DateTime<Utc>>,
}

impl TenantDescriptor {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        TenantDescriptor {
            id: None,
            name: name.into(),
            url: url.into(),
            username: username.into(),
            password: password.into(),
            initialize: true,
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_initialize(mut self, initialize: bool) -> Self {
        self.initialize = initialize;
        self
    }

    /// Checks the mandatory fields before a row is written. The routing core itself does not
    /// re-validate rows it reads back.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be blank".into());
        }
        if self.name == DEFAULT_TENANT {
            return Err(format!("name '{}' is reserved", DEFAULT_TENANT));
        }
        if !tenant_name_pattern().is_match(&self.name) {
            return Err(format!(
                "name '{}' must start with a letter or digit and contain only letters, digits, '_', '.' or '-'",
                self.name
            ));
        }
        for (field, value) in [
            ("url", &self.url),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be blank", field));
            }
        }
        Ok(())
    }
}

impl PartialEq for TenantDescriptor {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TenantDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("initialize", &self.initialize)
            .finish()
    }
}
