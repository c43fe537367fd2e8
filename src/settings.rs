//! Runtime settings read from environment variables (after `dotenvy::dotenv()` in binaries).

use crate::error::RoutingError;
use crate::migration::ProvisionPolicy;
use sqlx::postgres::PgConnectOptions;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Sizing and timeouts applied to one pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Upper bound on how long `acquire` waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Where and as whom to connect. Either `url` or the `host` + `database` pair must be present.
#[derive(Clone, Default)]
pub struct DataSourceSettings {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl DataSourceSettings {
    pub fn from_url(url: impl Into<String>) -> Self {
        DataSourceSettings {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn url_has_userinfo(&self) -> bool {
        non_blank(&self.url)
            .and_then(|u| u.split_once("://"))
            .map(|(_, rest)| rest.split('/').next().unwrap_or("").contains('@'))
            .unwrap_or(false)
    }

    /// Mandatory-field check for the bootstrap data source.
    pub fn validate(&self) -> Result<(), RoutingError> {
        let has_address =
            non_blank(&self.url).is_some() || (non_blank(&self.host).is_some() && non_blank(&self.database).is_some());
        if !has_address {
            return Err(RoutingError::Configuration(
                "default data source needs DATABASE_URL or DATABASE_HOST and DATABASE_NAME".into(),
            ));
        }
        if !self.url_has_userinfo() {
            if non_blank(&self.username).is_none() {
                return Err(RoutingError::Configuration(
                    "default data source needs DATABASE_USERNAME".into(),
                ));
            }
            if non_blank(&self.password).is_none() {
                return Err(RoutingError::Configuration(
                    "default data source needs DATABASE_PASSWORD".into(),
                ));
            }
        }
        Ok(())
    }

    /// Builds driver options. Explicit username/password override any userinfo in the url.
    /// Errors never include the password.
    pub fn connect_options(&self) -> Result<PgConnectOptions, String> {
        let mut opts = if let Some(url) = non_blank(&self.url) {
            PgConnectOptions::from_str(url).map_err(|e| format!("invalid url: {}", e))?
        } else {
            match (non_blank(&self.host), non_blank(&self.database)) {
                (Some(host), Some(database)) => {
                    PgConnectOptions::new().host(host).port(self.port.unwrap_or(5432)).database(database)
                }
                _ => return Err("url is blank and no host/database pair is set".into()),
            }
        };
        if let Some(username) = non_blank(&self.username) {
            opts = opts.username(username);
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            opts = opts.password(password);
        }
        Ok(opts)
    }
}

impl fmt::Debug for DataSourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceSettings")
            .field("url", &self.url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Migration runner inputs supplied for every admitted tenant.
#[derive(Clone, Debug)]
pub struct ProvisionerSettings {
    pub policy: ProvisionPolicy,
    /// Directory of ordered `*.sql` change sets.
    pub changelog_path: PathBuf,
    /// Schema the change sets are applied to, also holding the history table.
    pub schema: String,
    /// Drop and recreate the schema before applying. Destructive.
    pub drop_first: bool,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        ProvisionerSettings {
            policy: ProvisionPolicy::Flagged,
            changelog_path: PathBuf::from("changelog"),
            schema: "public".into(),
            drop_first: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub default_source: DataSourceSettings,
    pub default_pool: PoolSettings,
    pub tenant_pool: PoolSettings,
    /// When set, tenant pools copy sizing and timeouts from the default pool.
    pub inherit_default_pool: bool,
    pub provisioner: ProvisionerSettings,
    /// Schema holding the tenant descriptor table.
    pub registry_schema: String,
    /// `None` disables the polling watcher.
    pub poll_interval: Option<Duration>,
    /// Accept an unauthenticated `X-Tenant-ID` header as the caller's tenant.
    pub trust_tenant_header: bool,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, RoutingError> {
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse()
            .map_err(|_| RoutingError::Configuration(format!("{}: cannot parse '{}'", key, v))),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, RoutingError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

impl RoutingConfig {
    pub fn from_env() -> Result<Self, RoutingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads every setting through `lookup`, so tests can supply a map instead of the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RoutingError> {
        let default_source = DataSourceSettings {
            url: lookup("DATABASE_URL"),
            host: lookup("DATABASE_HOST"),
            port: lookup("DATABASE_PORT")
                .map(|p| {
                    p.trim()
                        .parse()
                        .map_err(|_| RoutingError::Configuration(format!("DATABASE_PORT: cannot parse '{}'", p)))
                })
                .transpose()?,
            database: lookup("DATABASE_NAME"),
            username: lookup("DATABASE_USERNAME"),
            password: lookup("DATABASE_PASSWORD"),
        };
        default_source.validate()?;

        let base = PoolSettings::default();
        let default_pool = PoolSettings {
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", base.max_connections)?,
            min_connections: parse_or(&lookup, "DATABASE_MIN_CONNECTIONS", base.min_connections)?,
            acquire_timeout: secs_or(&lookup, "DATABASE_ACQUIRE_TIMEOUT_SECS", base.acquire_timeout)?,
            idle_timeout: Some(secs_or(
                &lookup,
                "DATABASE_IDLE_TIMEOUT_SECS",
                base.idle_timeout.unwrap_or(Duration::from_secs(600)),
            )?),
        };
        let tenant_pool = PoolSettings {
            max_connections: parse_or(&lookup, "TENANT_MAX_CONNECTIONS", base.max_connections)?,
            acquire_timeout: secs_or(&lookup, "TENANT_ACQUIRE_TIMEOUT_SECS", base.acquire_timeout)?,
            ..base
        };

        let provisioner = ProvisionerSettings {
            policy: parse_or(&lookup, "TENANT_PROVISION_POLICY", ProvisionPolicy::Flagged)?,
            changelog_path: lookup("TENANT_CHANGELOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("changelog")),
            schema: lookup("TENANT_SCHEMA").unwrap_or_else(|| "public".into()),
            drop_first: parse_or(&lookup, "TENANT_DROP_FIRST", false)?,
        };

        let poll_secs: u64 = parse_or(&lookup, "TENANT_POLL_INTERVAL_SECS", 30)?;

        Ok(RoutingConfig {
            default_source,
            default_pool,
            tenant_pool,
            inherit_default_pool: parse_or(&lookup, "TENANT_POOL_INHERIT", false)?,
            provisioner,
            registry_schema: lookup("TENANT_REGISTRY_SCHEMA").unwrap_or_else(|| "multitenant".into()),
            poll_interval: (poll_secs > 0).then(|| Duration::from_secs(poll_secs)),
            trust_tenant_header: parse_or(&lookup, "TENANT_TRUST_HEADER", false)?,
        })
    }

    /// Settings the tenant pool factory should use.
    pub fn tenant_pool_settings(&self) -> PoolSettings {
        if self.inherit_default_pool {
            self.default_pool.clone()
        } else {
            self.tenant_pool.clone()
        }
    }
}
