use super::QueryLedger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intelforge_common::config::DatabaseConfig;
use intelforge_common::db::models::{
    HistoryFilter, LedgerStats, NewQueryRecord, Pagination, QueryRecord, QueryTransition,
    QueryType,
};
use intelforge_common::{DbPool, Repository, Result};
use tracing::info;
use uuid::Uuid;

/// PostgreSQL ledger backed by the shared repository
#[derive(Clone)]
pub struct PgLedger {
    repo: Repository,
}

impl PgLedger {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Connect and make sure the schema exists
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let repo = Repository::new(DbPool::new(config).await?);
        repo.ensure_schema().await?;
        info!("PostgreSQL query ledger ready");
        Ok(Self::new(repo))
    }
}

#[async_trait]
impl QueryLedger for PgLedger {
    async fn create(&self, new: NewQueryRecord) -> Result<QueryRecord> {
        self.repo.create_query(new).await
    }

    async fn transition(&self, id: Uuid, transition: QueryTransition) -> Result<QueryRecord> {
        self.repo.transition_query(id, transition).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueryRecord>> {
        self.repo.find_query_by_id(id).await
    }

    async fn list(
        &self,
        filter: &HistoryFilter,
        page: Pagination,
    ) -> Result<(Vec<QueryRecord>, u64)> {
        self.repo.list_queries(filter, page).await
    }

    async fn stats(&self) -> Result<LedgerStats> {
        self.repo.query_stats().await
    }

    async fn find_reusable(
        &self,
        query_type: QueryType,
        normalized_value: &str,
        bot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<QueryRecord>> {
        self.repo
            .find_reusable_query(query_type, normalized_value, bot_id, since)
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.repo.ping().await
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
