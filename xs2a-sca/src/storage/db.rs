use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::StorageError;
use super::models::{
    AuthenticationMethod, AuthorisationRecord, ChallengeData, ParentResource, ParentStatus,
    PsuIdData, ResourceKind,
};
use super::{AuthorisationRepository, ResourceStatusStore};
use crate::approach::ScaApproach;
use crate::state_machine::ScaStatus;

const AUTHORISATION_COLUMNS: &str = "authorisation_id, parent_id, resource_kind, psu_json, \
     sca_status, sca_approach, chosen_sca_method_json, available_sca_methods_json, \
     challenge_data_json, confirmation_code_hash, aspsp_data, failed_attempts, \
     redirect_url_expiration, authorisation_expiration, version, created_at, updated_at";

/// SQLite-backed storage for authorisations and parent resources
///
/// Timestamps are stored as fixed-width RFC 3339 strings so that expiry
/// queries can compare them as text.
///
/// # Example
///
/// ```no_run
/// use xs2a_sca::storage::{Storage, AuthorisationRepository};
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Storage::new(Some(PathBuf::from("./sca.db"))).await?;
/// let records = storage.list_by_parent("consent-1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Storage {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl Storage {
    /// Create a new in-memory storage instance for testing
    pub async fn new_in_memory() -> Result<Self, StorageError> {
        info!("Initializing in-memory SCA storage");

        // A single connection, otherwise every connection gets its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite://:memory:")
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(Storage {
            pool,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Create a new Storage instance
    ///
    /// Opens (or creates) the SQLite database, enables WAL mode and runs
    /// pending migrations.
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to the database file. If None, uses `XS2A_SCA_DB_PATH`
    ///   or `./xs2a-sca.db`
    pub async fn new(path: Option<PathBuf>) -> Result<Self, StorageError> {
        let db_path = path.unwrap_or_else(|| {
            env::var("XS2A_SCA_DB_PATH")
                .unwrap_or_else(|_| "xs2a-sca.db".to_string())
                .into()
        });

        info!("Initializing SCA storage at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(Storage { pool, db_path })
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("timestamp {}: {}", value, e)))
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, StorageError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

fn from_json_opt<T: serde::de::DeserializeOwned>(
    value: Option<String>,
) -> Result<Option<T>, StorageError> {
    value
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(StorageError::from)
}

fn record_from_row(row: &SqliteRow) -> Result<AuthorisationRecord, StorageError> {
    let resource_kind: String = row.try_get("resource_kind")?;
    let sca_status: String = row.try_get("sca_status")?;
    let sca_approach: String = row.try_get("sca_approach")?;
    let methods_json: String = row.try_get("available_sca_methods_json")?;
    let failed_attempts: i64 = row.try_get("failed_attempts")?;
    let redirect_url_expiration: String = row.try_get("redirect_url_expiration")?;
    let authorisation_expiration: String = row.try_get("authorisation_expiration")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(AuthorisationRecord {
        authorisation_id: row.try_get("authorisation_id")?,
        parent_id: row.try_get("parent_id")?,
        resource_kind: ResourceKind::try_from(resource_kind.as_str())
            .map_err(StorageError::InvalidData)?,
        psu: from_json_opt::<PsuIdData>(row.try_get("psu_json")?)?,
        sca_status: sca_status.parse::<ScaStatus>().map_err(StorageError::InvalidData)?,
        sca_approach: sca_approach
            .parse::<ScaApproach>()
            .map_err(StorageError::InvalidData)?,
        chosen_sca_method: from_json_opt::<AuthenticationMethod>(
            row.try_get("chosen_sca_method_json")?,
        )?,
        available_sca_methods: serde_json::from_str(&methods_json)?,
        challenge_data: from_json_opt::<ChallengeData>(row.try_get("challenge_data_json")?)?,
        confirmation_code_hash: row.try_get("confirmation_code_hash")?,
        aspsp_data: row.try_get("aspsp_data")?,
        failed_attempts: u32::try_from(failed_attempts).map_err(|_| {
            StorageError::InvalidData(format!("failed_attempts {}", failed_attempts))
        })?,
        redirect_url_expiration: parse_ts(&redirect_url_expiration)?,
        authorisation_expiration: parse_ts(&authorisation_expiration)?,
        version: row.try_get("version")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn resource_from_row(row: &SqliteRow) -> Result<ParentResource, StorageError> {
    let resource_kind: String = row.try_get("resource_kind")?;
    let kind = ResourceKind::try_from(resource_kind.as_str()).map_err(StorageError::InvalidData)?;
    let status: String = row.try_get("status")?;
    let psus_json: String = row.try_get("psus_json")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ParentResource {
        resource_id: row.try_get("resource_id")?,
        resource_kind: kind,
        status: ParentStatus::parse(kind, &status).map_err(StorageError::InvalidData)?,
        multilevel_sca_required: row.try_get("multilevel_sca_required")?,
        one_factor_authorisation: row.try_get("one_factor_authorisation")?,
        partial_authorisation_allowed: row.try_get("partial_authorisation_allowed")?,
        psus: serde_json::from_str(&psus_json)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl AuthorisationRepository for Storage {
    async fn insert(&self, record: &AuthorisationRecord) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO authorisations ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            AUTHORISATION_COLUMNS
        );

        let result = sqlx::query(&sql)
            .bind(&record.authorisation_id)
            .bind(&record.parent_id)
            .bind(record.resource_kind.to_string())
            .bind(to_json_opt(&record.psu)?)
            .bind(record.sca_status.to_string())
            .bind(record.sca_approach.to_string())
            .bind(to_json_opt(&record.chosen_sca_method)?)
            .bind(serde_json::to_string(&record.available_sca_methods)?)
            .bind(to_json_opt(&record.challenge_data)?)
            .bind(&record.confirmation_code_hash)
            .bind(&record.aspsp_data)
            .bind(i64::from(record.failed_attempts))
            .bind(format_ts(&record.redirect_url_expiration))
            .bind(format_ts(&record.authorisation_expiration))
            .bind(record.version)
            .bind(format_ts(&record.created_at))
            .bind(format_ts(&record.updated_at))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                debug!("Inserted authorisation {}", record.authorisation_id);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                StorageError::Duplicate(record.authorisation_id.clone()),
            ),
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    async fn get(
        &self,
        authorisation_id: &str,
    ) -> Result<Option<AuthorisationRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM authorisations WHERE authorisation_id = ?1",
            AUTHORISATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(authorisation_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn save(
        &self,
        record: &AuthorisationRecord,
    ) -> Result<AuthorisationRecord, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE authorisations SET
                psu_json = ?1,
                sca_status = ?2,
                chosen_sca_method_json = ?3,
                available_sca_methods_json = ?4,
                challenge_data_json = ?5,
                confirmation_code_hash = ?6,
                aspsp_data = ?7,
                failed_attempts = ?8,
                updated_at = ?9,
                version = version + 1
            WHERE authorisation_id = ?10 AND version = ?11
            "#,
        )
        .bind(to_json_opt(&record.psu)?)
        .bind(record.sca_status.to_string())
        .bind(to_json_opt(&record.chosen_sca_method)?)
        .bind(serde_json::to_string(&record.available_sca_methods)?)
        .bind(to_json_opt(&record.challenge_data)?)
        .bind(&record.confirmation_code_hash)
        .bind(&record.aspsp_data)
        .bind(i64::from(record.failed_attempts))
        .bind(format_ts(&record.updated_at))
        .bind(&record.authorisation_id)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(&record.authorisation_id).await? {
                Some(_) => Err(StorageError::Conflict {
                    id: record.authorisation_id.clone(),
                    expected: record.version,
                }),
                None => Err(StorageError::NotFound(record.authorisation_id.clone())),
            };
        }

        let mut updated = record.clone();
        updated.version += 1;
        Ok(updated)
    }

    async fn list_by_parent(
        &self,
        parent_id: &str,
    ) -> Result<Vec<AuthorisationRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM authorisations WHERE parent_id = ?1 ORDER BY created_at ASC",
            AUTHORISATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthorisationRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM authorisations \
             WHERE sca_status NOT IN ('finalised', 'failed', 'exempted') \
             AND (redirect_url_expiration < ?1 OR authorisation_expiration < ?1)",
            AUTHORISATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(format_ts(&now))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl ResourceStatusStore for Storage {
    async fn insert_resource(&self, resource: &ParentResource) -> Result<(), StorageError> {
        let now = format_ts(&Utc::now());
        sqlx::query(
            r#"
            INSERT INTO resources (
                resource_id, resource_kind, status, multilevel_sca_required,
                one_factor_authorisation, partial_authorisation_allowed, psus_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(resource_id) DO UPDATE SET
                status = excluded.status,
                multilevel_sca_required = excluded.multilevel_sca_required,
                one_factor_authorisation = excluded.one_factor_authorisation,
                partial_authorisation_allowed = excluded.partial_authorisation_allowed,
                psus_json = excluded.psus_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&resource.resource_id)
        .bind(resource.resource_kind.to_string())
        .bind(resource.status.to_string())
        .bind(resource.multilevel_sca_required)
        .bind(resource.one_factor_authorisation)
        .bind(resource.partial_authorisation_allowed)
        .bind(serde_json::to_string(&resource.psus)?)
        .bind(format_ts(&resource.created_at))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<ParentResource>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT resource_id, resource_kind, status, multilevel_sca_required,
                   one_factor_authorisation, partial_authorisation_allowed, psus_json, created_at
            FROM resources WHERE resource_id = ?1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(resource_from_row).transpose()
    }

    async fn set_parent_status(
        &self,
        resource_id: &str,
        status: ParentStatus,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE resources SET status = ?1, updated_at = ?2 WHERE resource_id = ?3")
                .bind(status.to_string())
                .bind(format_ts(&Utc::now()))
                .bind(resource_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(resource_id.to_string()));
        }
        Ok(())
    }
}
