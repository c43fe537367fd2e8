//! Schema provisioning for admitted tenants: an ordered changelog of SQL change sets applied once
//! per database and recorded in a history table.

use crate::error::RoutingError;
use crate::tenant::TenantDescriptor;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// History table created inside the provisioned schema.
pub const HISTORY_TABLE: &str = "_changelog_history";

/// When admission runs the provisioner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionPolicy {
    /// Never migrate; pools are published as built.
    Never,
    /// Migrate only descriptors with `initialize = true`.
    Flagged,
    /// Migrate every admitted tenant regardless of its flag.
    Always,
}

impl ProvisionPolicy {
    pub fn should_provision(&self, descriptor: &TenantDescriptor) -> bool {
        match self {
            ProvisionPolicy::Never => false,
            ProvisionPolicy::Flagged => descriptor.initialize,
            ProvisionPolicy::Always => true,
        }
    }
}

impl std::str::FromStr for ProvisionPolicy {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(ProvisionPolicy::Never),
            "flagged" => Ok(ProvisionPolicy::Flagged),
            "always" => Ok(ProvisionPolicy::Always),
            _ => Err(RoutingError::Configuration(format!(
                "invalid provision policy: {} (expected never, flagged or always)",
                s
            ))),
        }
    }
}

/// Brings one tenant's schema to the expected version. Must be idempotent.
#[async_trait]
pub trait SchemaProvisioner<P>: Send + Sync {
    async fn provision(&self, tenant: &str, pool: &P) -> Result<(), RoutingError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet {
    pub id: String,
    pub sql: String,
    pub checksum: String,
}

impl ChangeSet {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = hex::encode(Sha256::digest(sql.as_bytes()));
        ChangeSet {
            id: id.into(),
            sql,
            checksum,
        }
    }
}

/// Ordered change sets. Ids are unique; order is by id.
#[derive(Clone, Debug, Default)]
pub struct Changelog {
    pub source: Option<PathBuf>,
    pub change_sets: Vec<ChangeSet>,
}

impl Changelog {
    pub fn from_change_sets(mut change_sets: Vec<ChangeSet>) -> Self {
        change_sets.sort_by(|a, b| a.id.cmp(&b.id));
        Changelog {
            source: None,
            change_sets,
        }
    }

    /// Reads every `*.sql` file in `dir`; the file stem is the change set id.
    pub async fn load(dir: &Path) -> Result<Self, RoutingError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            RoutingError::Configuration(format!("changelog {}: {}", dir.display(), e))
        })?;
        let mut change_sets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RoutingError::Configuration(format!("changelog {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let sql = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RoutingError::Configuration(format!("changelog {}: {}", path.display(), e)))?;
            change_sets.push(ChangeSet::new(id, sql));
        }
        let mut changelog = Self::from_change_sets(change_sets);
        changelog.source = Some(dir.to_path_buf());
        tracing::debug!(
            "loaded {} change sets from {}",
            changelog.change_sets.len(),
            dir.display()
        );
        Ok(changelog)
    }

    /// Change sets still to run given the applied `id -> checksum` history.
    /// An applied change set whose content changed since is an error.
    pub fn pending<'a>(&'a self, applied: &HashMap<String, String>) -> Result<Vec<&'a ChangeSet>, String> {
        let mut pending = Vec::new();
        for cs in &self.change_sets {
            match applied.get(&cs.id) {
                Some(sum) if *sum == cs.checksum => {}
                Some(_) => return Err(format!("change set {} was modified after it was applied", cs.id)),
                None => pending.push(cs),
            }
        }
        Ok(pending)
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Applies a [`Changelog`] to a PostgreSQL schema inside one transaction, guarded by an
/// advisory lock so concurrent runners against the same database wait for each other.
#[derive(Clone, Debug)]
pub struct ChangelogProvisioner {
    changelog: std::sync::Arc<Changelog>,
    schema: String,
    drop_first: bool,
}

impl ChangelogProvisioner {
    pub fn new(changelog: Changelog, schema: impl Into<String>) -> Self {
        ChangelogProvisioner {
            changelog: std::sync::Arc::new(changelog),
            schema: schema.into(),
            drop_first: false,
        }
    }

    /// Drop the schema before applying. Destroys tenant data.
    pub fn with_drop_first(mut self, drop_first: bool) -> Self {
        self.drop_first = drop_first;
        self
    }

    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn apply(&self, pool: &PgPool) -> Result<usize, RoutingError> {
        let schema = quote(&self.schema);
        let history = format!("{}.{}", schema, quote(HISTORY_TABLE));
        let mut tx = pool.begin().await?;
        let conn: &mut PgConnection = &mut tx;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("changelog:{}", self.schema))
            .execute(&mut *conn)
            .await?;
        if self.drop_first {
            tracing::warn!("dropping schema {} before provisioning", self.schema);
            sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            history
        ))
        .execute(&mut *conn)
        .await?;

        let applied: HashMap<String, String> =
            sqlx::query_as::<_, (String, String)>(&format!("SELECT id, checksum FROM {}", history))
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .collect();
        let pending: Vec<ChangeSet> = self
            .changelog
            .pending(&applied)
            .map_err(RoutingError::Configuration)?
            .into_iter()
            .cloned()
            .collect();
        let count = pending.len();

        sqlx::query(&format!("SET LOCAL search_path TO {}", schema))
            .execute(&mut *conn)
            .await?;
        let record = format!("INSERT INTO {} (id, checksum) VALUES ($1, $2)", history);
        for ChangeSet { id, sql, checksum } in pending {
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql)).await?;
            sqlx::query(&record)
                .bind(id)
                .bind(checksum)
                .execute(&mut *conn)
                .await?;
        }
        tx.commit().await?;
        Ok(count)
    }
}

#[async_trait]
impl SchemaProvisioner<PgPool> for ChangelogProvisioner {
    async fn provision(&self, tenant: &str, pool: &PgPool) -> Result<(), RoutingError> {
        match self.apply(pool).await {
            Ok(0) => {
                tracing::debug!(tenant = %tenant, "schema {} already up to date", self.schema);
                Ok(())
            }
            Ok(n) => {
                tracing::info!(tenant = %tenant, "applied {} change sets to schema {}", n, self.schema);
                Ok(())
            }
            Err(e) => Err(RoutingError::migration(tenant, e.to_string())),
        }
    }
}
