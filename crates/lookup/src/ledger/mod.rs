//! Query ledger: durable audit record of every lookup attempt.
//!
//! Both backends enforce the status machine at the storage boundary; an
//! illegal transition is rejected, never silently applied.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intelforge_common::config::DatabaseConfig;
use intelforge_common::db::models::{
    HistoryFilter, LedgerStats, NewQueryRecord, Pagination, QueryRecord, QueryTransition,
    QueryType,
};
use intelforge_common::Result;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait QueryLedger: Send + Sync {
    /// Insert a new record in `pending`
    async fn create(&self, new: NewQueryRecord) -> Result<QueryRecord>;

    async fn transition(&self, id: Uuid, transition: QueryTransition) -> Result<QueryRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<QueryRecord>>;

    /// Newest first, with the total matching the filter
    async fn list(&self, filter: &HistoryFilter, page: Pagination)
        -> Result<(Vec<QueryRecord>, u64)>;

    async fn stats(&self) -> Result<LedgerStats>;

    /// Most recent `completed` record for the same value and bot since `since`
    async fn find_reusable(
        &self,
        query_type: QueryType,
        normalized_value: &str,
        bot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<QueryRecord>>;

    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

/// Open the ledger selected by the database URL
pub async fn open_ledger(config: &DatabaseConfig) -> Result<Arc<dyn QueryLedger>> {
    if config.is_memory() {
        tracing::warn!("Using in-memory query ledger; records are lost on restart");
        return Ok(Arc::new(MemoryLedger::new()));
    }
    Ok(Arc::new(PgLedger::connect(config).await?))
}
