//! Job store: build configurations, caches and run records.

use async_trait::async_trait;
use cachebuild_core::configuration::BuildConfiguration;
use cachebuild_core::run::{RunRecord, RunStatus, RunUpdate};
use cachebuild_core::store::{CacheRecord, JobStore};
use cachebuild_core::{CacheId, ConfigId, Result, RunId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A build configuration row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ConfigurationRow {
    id: i64,
    cache_id: i64,
    name: String,
    arch: String,
    allow_parallel: bool,
    source: serde_json::Value,
    invocation: serde_json::Value,
    push: serde_json::Value,
    trigger: serde_json::Value,
}

impl ConfigurationRow {
    fn into_configuration(self) -> DbResult<BuildConfiguration> {
        let decode = |field: &str, e: serde_json::Error| {
            DbError::Decode(format!("build configuration {} {}: {}", self.id, field, e))
        };
        Ok(BuildConfiguration {
            id: ConfigId::new(self.id),
            name: self.name.clone(),
            cache_id: CacheId::new(self.cache_id),
            arch: self.arch.clone(),
            allow_parallel: self.allow_parallel,
            source: serde_json::from_value(self.source.clone()).map_err(|e| decode("source", e))?,
            invocation: serde_json::from_value(self.invocation.clone())
                .map_err(|e| decode("invocation", e))?,
            push: serde_json::from_value(self.push.clone()).map_err(|e| decode("push", e))?,
            trigger: serde_json::from_value(self.trigger.clone())
                .map_err(|e| decode("trigger", e))?,
        })
    }
}

/// A run row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RunRow {
    id: i64,
    configuration_id: i64,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    log: String,
    revision: Option<String>,
}

impl RunRow {
    fn into_record(self) -> DbResult<RunRecord> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|e| DbError::Decode(format!("run {}: {}", self.id, e)))?;
        Ok(RunRecord {
            id: RunId::new(self.id),
            config_id: ConfigId::new(self.configuration_id),
            status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms,
            log: self.log,
            revision: self.revision,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CacheRow {
    id: i64,
    name: String,
}

/// PostgreSQL implementation of [`JobStore`].
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_run(&self, config_id: ConfigId, status: RunStatus) -> DbResult<RunId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO runs (configuration_id, status) VALUES ($1, $2) RETURNING id",
        )
        .bind(config_id.get())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(RunId::new(id))
    }

    async fn write_update(&self, id: RunId, update: &RunUpdate) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                log = COALESCE($3, log),
                started_at = COALESCE($4, started_at),
                ended_at = COALESCE($5, ended_at),
                duration_ms = COALESCE($6, duration_ms),
                revision = COALESCE($7, revision)
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(update.status.as_str())
        .bind(update.log.as_deref())
        .bind(update.started_at)
        .bind(update.ended_at)
        .bind(update.duration_ms)
        .bind(update.revision.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("run {}", id)));
        }
        Ok(())
    }

    async fn fetch_run(&self, id: RunId) -> DbResult<Option<RunRecord>> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, configuration_id, status, started_at, ended_at, duration_ms, log, revision
            FROM runs WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .map(RunRow::into_record)
        .transpose()
    }

    async fn fetch_configurations(&self) -> DbResult<Vec<BuildConfiguration>> {
        let rows = sqlx::query_as::<_, ConfigurationRow>(
            r#"
            SELECT id, cache_id, name, arch, allow_parallel, source, invocation, push, trigger
            FROM build_configurations ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(ConfigurationRow::into_configuration)
            .collect()
    }

    async fn fetch_configuration(&self, id: ConfigId) -> DbResult<Option<BuildConfiguration>> {
        sqlx::query_as::<_, ConfigurationRow>(
            r#"
            SELECT id, cache_id, name, arch, allow_parallel, source, invocation, push, trigger
            FROM build_configurations WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .map(ConfigurationRow::into_configuration)
        .transpose()
    }

    async fn fetch_cache(&self, id: CacheId) -> DbResult<Option<CacheRecord>> {
        let row = sqlx::query_as::<_, CacheRow>("SELECT id, name FROM caches WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| CacheRecord {
            id: CacheId::new(r.id),
            name: r.name,
        }))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_run(&self, config_id: ConfigId, status: RunStatus) -> Result<RunId> {
        Ok(self.insert_run(config_id, status).await?)
    }

    async fn update_run(&self, id: RunId, update: &RunUpdate) -> Result<()> {
        Ok(self.write_update(id, update).await?)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.fetch_run(id).await?)
    }

    async fn list_configurations(&self) -> Result<Vec<BuildConfiguration>> {
        Ok(self.fetch_configurations().await?)
    }

    async fn get_configuration(&self, id: ConfigId) -> Result<Option<BuildConfiguration>> {
        Ok(self.fetch_configuration(id).await?)
    }

    async fn get_cache(&self, id: CacheId) -> Result<Option<CacheRecord>> {
        Ok(self.fetch_cache(id).await?)
    }
}
