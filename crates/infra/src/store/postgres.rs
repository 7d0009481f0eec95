//! Postgres-backed work store implementation.
//!
//! One table per object type. Rows are keyed by `UUID`; statuses are stored as their
//! text codes. Coordination relies only on row-level atomicity:
//!
//! - `claim_next` is one `UPDATE` over a `FOR UPDATE SKIP LOCKED` sub-select, so
//!   concurrent claimers pick disjoint rows and never block on each other
//! - `find_eligible` is a plain read; its rows are candidates, not reservations
//! - `claim` and `unlock` are single conditional `UPDATE`s whose `WHERE` clause carries
//!   the precondition; the affected-row count tells the caller who won
//! - `reset_stale_locks` is one bulk `UPDATE`
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (check constraint violation) | `23514` | `InvalidObject` |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | ColumnDecode / ColumnNotFound | N/A | `Decode` |
//! | Other | N/A | `Storage` |

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use leasehold_core::{DomainError, Lease, ObjectKey, ProcessableObject, ProcessingStatus};

use super::r#trait::{ClaimAttempt, ClaimRequest, StoreError, UnlockRequest, WorkStore};

const COLUMNS: &str = "id, status, lock_name, locked, next_processed, last_processed, processed, \
                       processing_attempts, processing_time, processing_suspended";

/// Postgres-backed work store.
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool, which is `Send + Sync`; the store can be shared
/// across every worker task behind an `Arc`.
///
/// ## Identifiers
///
/// Any key convertible to and from `Uuid` works (`ObjectId`, plain `Uuid`, domain
/// newtypes).
pub struct PostgresWorkStore<Id, S> {
    pool: Arc<PgPool>,
    table: String,
    _marker: PhantomData<fn() -> (Id, S)>,
}

impl<Id, S> std::fmt::Debug for PostgresWorkStore<Id, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresWorkStore")
            .field("table", &self.table)
            .finish()
    }
}

impl<Id, S> PostgresWorkStore<Id, S>
where
    Id: ObjectKey + Copy + Into<Uuid> + From<Uuid>,
    S: ProcessingStatus,
{
    /// Create a store over `table` (optionally schema-qualified, e.g. `jobs.documents`).
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool: Arc::new(pool),
            table,
            _marker: PhantomData,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// DDL for the backing table and its claim/sweep indexes.
    pub fn schema_sql(&self) -> String {
        schema_sql(&self.table)
    }

    /// Create the table and indexes if they do not exist yet.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = self.schema_sql();
        sqlx::raw_sql(&ddl)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl<Id, S> WorkStore<Id, S> for PostgresWorkStore<Id, S>
where
    Id: ObjectKey + Copy + Into<Uuid> + From<Uuid>,
    S: ProcessingStatus,
{
    #[instrument(skip(self, pending_statuses), fields(table = %self.table), err)]
    async fn find_eligible(
        &self,
        pending_statuses: &[S],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessableObject<Id, S>>, StoreError> {
        let codes: Vec<String> = pending_statuses.iter().map(|s| s.code().to_string()).collect();

        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM {table}
            WHERE status = ANY($1)
                AND next_processed <= $2
                AND NOT processing_suspended
                AND lock_name IS NULL
            ORDER BY next_processed ASC
            LIMIT $3
            "#,
            table = self.table
        );

        let rows = sqlx::query(&sql)
            .bind(codes)
            .bind(now)
            .bind(sql_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_eligible", e))?;

        rows.iter().map(decode_row::<Id, S>).collect()
    }

    #[instrument(
        skip(self, request),
        fields(table = %self.table, object_id = %request.id, owner = %request.owner),
        err
    )]
    async fn claim(&self, request: &ClaimRequest<Id, S>) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $1,
                lock_name = $2,
                locked = $3,
                processing_attempts = $4
            WHERE id = $5
                AND status = $6
                AND processing_attempts = $7
                AND next_processed <= $3
                AND lock_name IS NULL
                AND NOT processing_suspended
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(request.processing_status.code())
            .bind(&request.owner)
            .bind(request.now)
            .bind(request.attempts() as i32)
            .bind(Into::<Uuid>::into(request.id))
            .bind(request.pending_status.code())
            .bind(request.expected_attempts as i32)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, transitions), fields(table = %self.table), err)]
    async fn claim_next(
        &self,
        transitions: &[(S, S)],
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt<Id, S>, StoreError> {
        let (pending, processing): (Vec<String>, Vec<String>) = transitions
            .iter()
            .map(|(p, q)| (p.code().to_string(), q.code().to_string()))
            .unzip();

        let sql = format!(
            r#"
            UPDATE {table} AS t
            SET status = ($1::text[])[array_position($2::text[], t.status)],
                lock_name = $3,
                locked = $4,
                processing_attempts = t.processing_attempts + 1
            WHERE t.id = (
                SELECT c.id
                FROM {table} AS c
                WHERE c.status = ANY($2)
                    AND c.next_processed <= $4
                    AND NOT c.processing_suspended
                    AND c.lock_name IS NULL
                ORDER BY c.next_processed ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#,
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(processing)
            .bind(pending)
            .bind(owner)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        match row {
            Some(row) => Ok(ClaimAttempt::Claimed(decode_row::<Id, S>(&row)?)),
            None => Ok(ClaimAttempt::Idle),
        }
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn reset_stale_locks(
        &self,
        processing_status: S,
        pending_status: S,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $1,
                lock_name = NULL,
                locked = NULL
            WHERE status = $2
                AND locked <= $3
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(pending_status.code())
            .bind(processing_status.code())
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_stale_locks", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, request),
        fields(table = %self.table, object_id = %request.id, status = request.change.status.code()),
        err
    )]
    async fn unlock(&self, request: &UnlockRequest<Id, S>) -> Result<u64, StoreError> {
        let change = &request.change;
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $1,
                lock_name = NULL,
                locked = NULL,
                processing_time = processing_time + $2,
                last_processed = $3,
                next_processed = $4,
                processed = $5,
                processing_attempts = $6
            WHERE id = $7
                AND lock_name = $8
                AND locked = $9
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(change.status.code())
            .bind(change.duration_ms as i64)
            .bind(change.last_processed)
            .bind(change.next_processed)
            .bind(change.processed)
            .bind(change.attempts as i32)
            .bind(Into::<Uuid>::into(request.id))
            .bind(&request.lease.owner)
            .bind(request.lease.locked_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("unlock", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, object), fields(table = %self.table, object_id = %object.id), err)]
    async fn insert(&self, object: ProcessableObject<Id, S>) -> Result<(), StoreError> {
        object.check_invariants()?;

        let sql = format!(
            r#"
            INSERT INTO {table} ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            table = self.table
        );

        sqlx::query(&sql)
            .bind(Into::<Uuid>::into(object.id))
            .bind(object.status.code())
            .bind(object.lock_name())
            .bind(object.locked())
            .bind(object.next_processed)
            .bind(object.last_processed)
            .bind(object.processed)
            .bind(object.processing_attempts as i32)
            .bind(object.processing_time_ms as i64)
            .bind(object.processing_suspended)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(object.id.to_string())
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn get(&self, id: &Id) -> Result<Option<ProcessableObject<Id, S>>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1",
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(Into::<Uuid>::into(*id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row::<Id, S>).transpose()
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn set_suspended(&self, id: &Id, suspended: bool) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {table} SET processing_suspended = $1 WHERE id = $2",
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(suspended)
            .bind(Into::<Uuid>::into(*id))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_suspended", e))?;

        Ok(result.rows_affected())
    }
}

/// DDL for a processable-object table.
/// `LIMIT` value for a `usize` row count; counts past `i64::MAX` mean "no limit".
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub fn schema_sql(table: &str) -> String {
    let index_prefix = table.replace('.', "_");
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id UUID PRIMARY KEY,
            status TEXT NOT NULL,
            lock_name TEXT NULL,
            locked TIMESTAMPTZ NULL,
            next_processed TIMESTAMPTZ NOT NULL,
            last_processed TIMESTAMPTZ NULL,
            processed TIMESTAMPTZ NULL,
            processing_attempts INTEGER NOT NULL DEFAULT 0 CHECK (processing_attempts >= 0),
            processing_time BIGINT NOT NULL DEFAULT 0 CHECK (processing_time >= 0),
            processing_suspended BOOLEAN NOT NULL DEFAULT FALSE,
            CHECK ((lock_name IS NULL) = (locked IS NULL))
        );
        CREATE INDEX IF NOT EXISTS {index_prefix}_eligible_idx
            ON {table} (status, next_processed)
            WHERE NOT processing_suspended AND lock_name IS NULL;
        CREATE INDEX IF NOT EXISTS {index_prefix}_locked_idx
            ON {table} (status, locked)
            WHERE locked IS NOT NULL;
        "#
    )
}

/// Table names are interpolated into SQL, so only plain (optionally schema-qualified)
/// identifiers are accepted.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|p| {
            let mut chars = p.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && p.len() <= 63
        });

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}

fn decode_row<Id, S>(row: &PgRow) -> Result<ProcessableObject<Id, S>, StoreError>
where
    Id: From<Uuid>,
    S: ProcessingStatus,
{
    let get_err = |e: sqlx::Error| StoreError::Decode(e.to_string());

    let id: Uuid = row.try_get("id").map_err(get_err)?;
    let code: String = row.try_get("status").map_err(get_err)?;
    let status = S::from_code(&code)
        .ok_or_else(|| StoreError::Decode(format!("unknown status code '{code}' for row {id}")))?;

    let lock_name: Option<String> = row.try_get("lock_name").map_err(get_err)?;
    let locked: Option<DateTime<Utc>> = row.try_get("locked").map_err(get_err)?;
    let lease = match (lock_name, locked) {
        (Some(owner), Some(locked_at)) => Some(Lease { owner, locked_at }),
        (None, None) => None,
        _ => {
            return Err(StoreError::InvalidObject(DomainError::invariant(format!(
                "row {id} has only one of lock_name/locked set"
            ))))
        }
    };

    let attempts: i32 = row.try_get("processing_attempts").map_err(get_err)?;
    let processing_time: i64 = row.try_get("processing_time").map_err(get_err)?;

    Ok(ProcessableObject {
        id: Id::from(id),
        status,
        lease,
        next_processed: row.try_get("next_processed").map_err(get_err)?,
        last_processed: row.try_get("last_processed").map_err(get_err)?,
        processed: row.try_get("processed").map_err(get_err)?,
        processing_attempts: attempts.max(0) as u32,
        processing_time_ms: processing_time.max(0) as u64,
        processing_suspended: row.try_get("processing_suspended").map_err(get_err)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23514") => StoreError::InvalidObject(DomainError::invariant(msg)),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_qualified_table_names() {
        assert!(validate_table_name("documents").is_ok());
        assert!(validate_table_name("jobs.mail_templates").is_ok());
        assert!(validate_table_name("_private2").is_ok());
    }

    #[test]
    fn rejects_injection_and_odd_names() {
        for bad in [
            "",
            "documents; DROP TABLE x",
            "a.b.c",
            "1documents",
            "docs-2",
            "\"quoted\"",
            &"x".repeat(64),
        ] {
            assert!(
                matches!(validate_table_name(bad), Err(StoreError::InvalidTableName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn schema_names_indexes_after_table() {
        let ddl = schema_sql("jobs.documents");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS jobs.documents"));
        assert!(ddl.contains("jobs_documents_eligible_idx"));
        assert!(ddl.contains("jobs_documents_locked_idx"));
        assert!(ddl.contains("CHECK ((lock_name IS NULL) = (locked IS NULL))"));
    }

    #[test]
    fn huge_limits_saturate() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn pool_closed_maps_to_storage() {
        let err = map_sqlx_error("claim", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Storage(msg) if msg.contains("claim")));
    }
}
