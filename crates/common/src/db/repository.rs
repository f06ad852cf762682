//! Repository pattern for database operations
//!
//! Provides a clean interface for all query-ledger data access
//! with status-machine enforcement at the storage boundary.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{extension::postgres::PgExpr, Expr, LikeExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbBackend,
    DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Select, Set,
    Statement,
};
use tracing::debug;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_query_records.sql");

/// Escape LIKE wildcards so user text matches literally under `ESCAPE '\'`
fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 4);
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn contains_pattern(needle: &str) -> LikeExpr {
    LikeExpr::new(format!("%{}%", escape_like(&needle.to_lowercase()))).escape('\\')
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check & Schema
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    /// Create the ledger table and its indexes if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        self.write_conn().execute_unprepared(SCHEMA_SQL).await?;
        debug!("Query ledger schema ensured");
        Ok(())
    }

    // ========================================================================
    // Query Record Operations
    // ========================================================================

    /// Insert a new record in `pending`
    pub async fn create_query(&self, new: NewQueryRecord) -> Result<QueryRecord> {
        let model = new.into_model(Uuid::new_v4(), Utc::now());
        let active: QueryRecordActiveModel = model.into();

        // `into()` marks fields unchanged; an insert needs them all set
        active
            .reset_all()
            .insert(self.write_conn())
            .await
            .map_err(Into::into)
    }

    /// Find record by ID
    pub async fn find_query_by_id(&self, id: Uuid) -> Result<Option<QueryRecord>> {
        QueryRecordEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Apply a status transition, rejecting illegal ones.
    ///
    /// The update is conditioned on the status read, so a concurrent writer
    /// surfaces as `InvalidTransition` rather than a lost update.
    pub async fn transition_query(
        &self,
        id: Uuid,
        transition: QueryTransition,
    ) -> Result<QueryRecord> {
        let current = QueryRecordEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::QueryNotFound { id: id.to_string() })?;

        transition.validate(&current)?;

        let from = current.status.clone();
        let to = transition.status;
        let mut next = current.clone();
        transition.apply(&mut next, Utc::now());

        let mut active: QueryRecordActiveModel = current.into();
        active.status = Set(next.status);
        active.found = Set(next.found);
        active.result_count = Set(next.result_count);
        active.result_preview = Set(next.result_preview);
        active.result_html_path = Set(next.result_html_path);
        active.result_file_path = Set(next.result_file_path);
        active.raw_response = Set(next.raw_response);
        active.error_message = Set(next.error_message);
        active.needs_review = Set(next.needs_review);
        active.updated_at = Set(next.updated_at);
        active.completed_at = Set(next.completed_at);

        QueryRecordEntity::update(active)
            .filter(QueryRecordColumn::Status.eq(from.clone()))
            .exec(self.write_conn())
            .await
            .map_err(|e| match e {
                DbErr::RecordNotUpdated => AppError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to: to.to_string(),
                },
                other => other.into(),
            })
    }

    /// Most recent completed lookup of the same value against the same bot
    pub async fn find_reusable_query(
        &self,
        query_type: QueryType,
        normalized_value: &str,
        bot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<QueryRecord>> {
        QueryRecordEntity::find()
            .filter(QueryRecordColumn::QueryType.eq(query_type.as_str()))
            .filter(QueryRecordColumn::NormalizedValue.eq(normalized_value))
            .filter(QueryRecordColumn::BotId.eq(bot_id))
            .filter(QueryRecordColumn::Status.eq(QueryStatus::Completed.as_str()))
            .filter(QueryRecordColumn::CreatedAt.gte(since))
            .order_by_desc(QueryRecordColumn::CreatedAt)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// List records newest first, with the total count matching the filter
    pub async fn list_queries(
        &self,
        filter: &HistoryFilter,
        page: Pagination,
    ) -> Result<(Vec<QueryRecord>, u64)> {
        let total = Self::filtered(filter).count(self.read_conn()).await?;

        let records = Self::filtered(filter)
            .order_by_desc(QueryRecordColumn::CreatedAt)
            .offset(page.offset)
            .limit(page.effective_limit())
            .all(self.read_conn())
            .await?;

        Ok((records, total))
    }

    fn filtered(filter: &HistoryFilter) -> Select<QueryRecordEntity> {
        let mut select = QueryRecordEntity::find();

        if let Some(query_type) = filter.query_type {
            select = select.filter(QueryRecordColumn::QueryType.eq(query_type.as_str()));
        }
        if let Some(status) = filter.status {
            select = select.filter(QueryRecordColumn::Status.eq(status.as_str()));
        }
        if let Some(found) = filter.found {
            select = select.filter(QueryRecordColumn::Found.eq(found));
        }
        if let Some(ref actor) = filter.requested_by {
            select = select.filter(QueryRecordColumn::RequestedBy.eq(actor.as_str()));
        }
        if let Some(ref bot_id) = filter.bot_id {
            select = select.filter(QueryRecordColumn::BotId.eq(bot_id.as_str()));
        }
        if let Some(ref needle) = filter.search {
            select = select.filter(
                Condition::any()
                    .add(Expr::col(QueryRecordColumn::QueryValue).ilike(contains_pattern(needle)))
                    .add(QueryRecordColumn::NormalizedValue.like(contains_pattern(needle))),
            );
        }

        select
    }

    /// Aggregate totals, per-type counts, found rate and latency
    pub async fn query_stats(&self) -> Result<LedgerStats> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            r#"
            SELECT
                query_type,
                status,
                COUNT(*)::BIGINT AS total,
                (COUNT(*) FILTER (WHERE found))::BIGINT AS found,
                AVG(EXTRACT(EPOCH FROM (completed_at - created_at)) * 1000)::DOUBLE PRECISION
                    AS avg_latency_ms
            FROM query_records
            GROUP BY query_type, status
            "#,
        );

        let groups = self
            .read_conn()
            .query_all(stmt)
            .await?
            .into_iter()
            .filter_map(|row| {
                Some(StatsGroup {
                    query_type: row.try_get_by_index::<String>(0).ok()?,
                    status: row.try_get_by_index::<String>(1).ok()?,
                    count: row.try_get_by_index::<i64>(2).ok()?.max(0) as u64,
                    found: row.try_get_by_index::<i64>(3).ok()?.max(0) as u64,
                    avg_latency_ms: row.try_get_by_index::<Option<f64>>(4).ok()?,
                })
            });

        Ok(LedgerStats::from_groups(groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::QueryTrait;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off"), r"50\%\_off");
        assert_eq!(escape_like(r"a\b"), r"a\\b");
        assert_eq!(escape_like("plain@example.com"), "plain@example.com");
    }

    #[test]
    fn test_search_uses_escape_clause() {
        let filter = HistoryFilter {
            search: Some("50%_OFF".into()),
            ..Default::default()
        };
        let sql = Repository::filtered(&filter)
            .build(DbBackend::Postgres)
            .to_string();

        assert!(sql.contains("ILIKE"), "{}", sql);
        assert!(sql.contains("ESCAPE"), "{}", sql);
        assert!(!sql.contains("'%50%_off%'"), "{}", sql);
    }
}
