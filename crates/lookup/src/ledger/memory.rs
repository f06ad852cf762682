use super::QueryLedger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intelforge_common::db::models::{
    HistoryFilter, LedgerStats, NewQueryRecord, Pagination, QueryRecord, QueryStatus,
    QueryTransition, QueryType, StatsGroup,
};
use intelforge_common::{AppError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as creation order
    records: Vec<QueryRecord>,
    index: HashMap<Uuid, usize>,
}

/// In-process ledger for development and tests
#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl QueryLedger for MemoryLedger {
    async fn create(&self, new: NewQueryRecord) -> Result<QueryRecord> {
        let record = new.into_model(Uuid::new_v4(), Utc::now());
        let mut inner = self.inner.write().await;
        let position = inner.records.len();
        inner.index.insert(record.id, position);
        inner.records.push(record.clone());
        Ok(record)
    }

    async fn transition(&self, id: Uuid, transition: QueryTransition) -> Result<QueryRecord> {
        let mut inner = self.inner.write().await;
        let position = *inner
            .index
            .get(&id)
            .ok_or_else(|| AppError::QueryNotFound { id: id.to_string() })?;
        let record = &mut inner.records[position];

        transition.validate(record)?;
        transition.apply(record, Utc::now());
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueryRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.index.get(&id).map(|&i| inner.records[i].clone()))
    }

    async fn list(
        &self,
        filter: &HistoryFilter,
        page: Pagination,
    ) -> Result<(Vec<QueryRecord>, u64)> {
        let inner = self.inner.read().await;
        let matching: Vec<&QueryRecord> = inner
            .records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .collect();
        let total = matching.len() as u64;
        let records = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.effective_limit() as usize)
            .cloned()
            .collect();
        Ok((records, total))
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let inner = self.inner.read().await;
        Ok(LedgerStats::from_groups(
            inner.records.iter().map(StatsGroup::from_record),
        ))
    }

    async fn find_reusable(
        &self,
        query_type: QueryType,
        normalized_value: &str,
        bot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<QueryRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .find(|r| {
                r.query_type == query_type.as_str()
                    && r.normalized_value == normalized_value
                    && r.bot_id == bot_id
                    && r.status == QueryStatus::Completed.as_str()
                    && r.created_at >= since
            })
            .cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_record(value: &str) -> NewQueryRecord {
        NewQueryRecord {
            query_type: QueryType::Email,
            query_value: value.to_string(),
            normalized_value: value.to_lowercase(),
            bot_id: "lookup".into(),
            bot_name: "Lookup Bot".into(),
            requested_by: "analyst".into(),
            raw_response: json!({}),
        }
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let ledger = MemoryLedger::new();
        let record = ledger.create(new_record("a@b.io")).await.unwrap();
        assert_eq!(record.query_status(), QueryStatus::Pending);
        assert!(ledger.get(record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_illegal_transitions() {
        let ledger = MemoryLedger::new();
        let record = ledger.create(new_record("a@b.io")).await.unwrap();

        let err = ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Processing))
            .await
            .unwrap();
        ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Timeout))
            .await
            .unwrap();

        let err = ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let stored = ledger.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.query_status(), QueryStatus::Timeout);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .transition(Uuid::new_v4(), QueryTransition::to(QueryStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QueryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_total() {
        let ledger = MemoryLedger::new();
        for i in 0..5 {
            ledger.create(new_record(&format!("user{}@b.io", i))).await.unwrap();
        }

        let (page, total) = ledger
            .list(&HistoryFilter::default(), Pagination::new(1, 2))
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].query_value, "user3@b.io");

        let filter = HistoryFilter {
            search: Some("USER4".into()),
            ..Default::default()
        };
        let (page, total) = ledger.list(&filter, Pagination::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].query_value, "user4@b.io");
    }

    #[tokio::test]
    async fn test_find_reusable_only_completed() {
        let ledger = MemoryLedger::new();
        let since = Utc::now() - chrono::Duration::minutes(5);
        let record = ledger.create(new_record("a@b.io")).await.unwrap();

        let found = ledger
            .find_reusable(QueryType::Email, "a@b.io", "lookup", since)
            .await
            .unwrap();
        assert!(found.is_none());

        ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Processing))
            .await
            .unwrap();
        ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Completed))
            .await
            .unwrap();

        let found = ledger
            .find_reusable(QueryType::Email, "a@b.io", "lookup", since)
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(record.id));

        let other_bot = ledger
            .find_reusable(QueryType::Email, "a@b.io", "other", since)
            .await
            .unwrap();
        assert!(other_bot.is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let ledger = MemoryLedger::new();
        let a = ledger.create(new_record("a@b.io")).await.unwrap();
        ledger.create(new_record("b@b.io")).await.unwrap();

        ledger
            .transition(a.id, QueryTransition::to(QueryStatus::Processing))
            .await
            .unwrap();
        ledger
            .transition(
                a.id,
                QueryTransition {
                    found: Some(true),
                    result_count: Some(2),
                    ..QueryTransition::to(QueryStatus::Completed)
                },
            )
            .await
            .unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type["email"], 2);
        assert_eq!(stats.by_status["pending"], 1);
        assert!((stats.found_rate - 1.0).abs() < f64::EPSILON);
        assert!(stats.avg_latency_ms.is_some());
    }
}
