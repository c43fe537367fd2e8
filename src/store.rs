//! Tenant descriptor table and its persistence. The table lives in the default database, in the
//! schema named by `TENANT_REGISTRY_SCHEMA` (default `multitenant`).

use crate::admission::TenantSource;
use crate::error::{AppError, RoutingError};
use crate::tenant::TenantDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

pub const TENANT_TABLE: &str = "tenant_datasource";

type DescriptorRow = (i64, String, String, String, String, bool, DateTime<Utc>);

const COLUMNS: &str = "id, name, url, username, password, initialize, created_at";

fn from_row((id, name, url, username, password, initialize, created_at): DescriptorRow) -> TenantDescriptor {
    TenantDescriptor {
        id: Some(id),
        name,
        url,
        username,
        password,
        initialize,
        created_at: Some(created_at),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Read/write access to the tenant descriptor rows.
#[derive(Clone, Debug)]
pub struct TenantStore {
    pool: PgPool,
    schema: String,
}

impl TenantStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        TenantStore {
            pool,
            schema: schema.into(),
        }
    }

    /// Schema-qualified table name, e.g. `"multitenant"."tenant_datasource"`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(TENANT_TABLE))
    }

    /// Creates the schema and descriptor table if missing.
    pub async fn ensure_table(&self) -> Result<(), AppError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)))
            .execute(&self.pool)
            .await?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                initialize BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.qualified_table()
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<TenantDescriptor>, AppError> {
        let row = sqlx::query_as::<_, DescriptorRow>(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            COLUMNS,
            self.qualified_table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(from_row))
    }

    pub async fn insert(&self, descriptor: &TenantDescriptor) -> Result<TenantDescriptor, AppError> {
        descriptor.validate().map_err(AppError::Validation)?;
        let row = sqlx::query_as::<_, DescriptorRow>(&format!(
            "INSERT INTO {} (name, url, username, password, initialize) VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            self.qualified_table(),
            COLUMNS
        ))
        .bind(&descriptor.name)
        .bind(&descriptor.url)
        .bind(&descriptor.username)
        .bind(&descriptor.password)
        .bind(descriptor.initialize)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_name_conflict(e, &descriptor.name))?;
        Ok(from_row(row))
    }

    /// Overwrites every field of row `id`. Returns `None` when the row does not exist.
    pub async fn update(&self, id: i64, descriptor: &TenantDescriptor) -> Result<Option<TenantDescriptor>, AppError> {
        descriptor.validate().map_err(AppError::Validation)?;
        let row = sqlx::query_as::<_, DescriptorRow>(&format!(
            "UPDATE {} SET name = $2, url = $3, username = $4, password = $5, initialize = $6, updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            self.qualified_table(),
            COLUMNS
        ))
        .bind(id)
        .bind(&descriptor.name)
        .bind(&descriptor.url)
        .bind(&descriptor.username)
        .bind(&descriptor.password)
        .bind(descriptor.initialize)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unique_name_conflict(e, &descriptor.name))?;
        Ok(row.map(from_row))
    }

    /// Deletes row `id`, returning what was deleted.
    pub async fn delete(&self, id: i64) -> Result<Option<TenantDescriptor>, AppError> {
        let row = sqlx::query_as::<_, DescriptorRow>(&format!(
            "DELETE FROM {} WHERE id = $1 RETURNING {}",
            self.qualified_table(),
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(from_row))
    }
}

fn unique_name_conflict(e: sqlx::Error, name: &str) -> AppError {
    let unique = e
        .as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false);
    if unique {
        AppError::Conflict(format!("tenant '{}' already exists", name))
    } else {
        AppError::Db(e)
    }
}

#[async_trait]
impl TenantSource for TenantStore {
    async fn find_all(&self) -> Result<Vec<TenantDescriptor>, RoutingError> {
        let rows = sqlx::query_as::<_, DescriptorRow>(&format!(
            "SELECT {} FROM {} ORDER BY id",
            COLUMNS,
            self.qualified_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    async fn find_created_after(&self, id: i64) -> Result<Vec<TenantDescriptor>, RoutingError> {
        let rows = sqlx::query_as::<_, DescriptorRow>(&format!(
            "SELECT {} FROM {} WHERE id > $1 ORDER BY id",
            COLUMNS,
            self.qualified_table()
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// `postgres` maintenance database to run CREATE DATABASE. Call before connecting the default pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), RoutingError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| RoutingError::Configuration(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&db_name)))
            .execute(&mut conn)
            .await?;
        tracing::info!("created database {}", db_name);
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), RoutingError> {
    let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
    let path_start = url[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i + 1)
        .ok_or_else(|| RoutingError::Configuration("DATABASE_URL: no database path".into()))?;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let mut parts = path_and_query.splitn(2, '?');
    let db_name = parts.next().unwrap_or("").trim().to_string();
    let query = parts.next().map(|q| format!("?{}", q)).unwrap_or_default();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres{}", base, query), db_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_name_is_split_from_url() {
        let (admin, name) = parse_db_name_from_url("postgres://u:p@localhost:5432/tenants").unwrap();
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
        assert_eq!(name, "tenants");
    }

    #[test]
    fn query_string_is_kept_on_admin_url() {
        let (admin, name) = parse_db_name_from_url("postgres://localhost/app?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://localhost/postgres?sslmode=disable");
        assert_eq!(name, "app");
    }

    #[test]
    fn url_without_path_is_rejected() {
        assert!(parse_db_name_from_url("postgres://localhost").is_err());
    }

    #[tokio::test]
    async fn table_name_is_schema_qualified() {
        let pool = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://localhost/app").unwrap();
        let store = TenantStore::new(pool, "multitenant");
        assert_eq!(store.qualified_table(), "\"multitenant\".\"tenant_datasource\"");
    }
}
