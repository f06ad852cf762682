//! Query record entity: one row per external lookup attempt

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::AppError;

/// Kind of value being looked up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Email,
    DocumentId,
    Phone,
    Domain,
    Username,
    Ip,
    Unknown,
}

impl QueryType {
    pub const ALL: [QueryType; 7] = [
        QueryType::Email,
        QueryType::DocumentId,
        QueryType::Phone,
        QueryType::Domain,
        QueryType::Username,
        QueryType::Ip,
        QueryType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Email => "email",
            QueryType::DocumentId => "document_id",
            QueryType::Phone => "phone",
            QueryType::Domain => "domain",
            QueryType::Username => "username",
            QueryType::Ip => "ip",
            QueryType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for QueryType {
    fn from(s: String) -> Self {
        QueryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or(QueryType::Unknown)
    }
}

impl From<QueryType> for String {
    fn from(t: QueryType) -> Self {
        t.as_str().to_string()
    }
}

/// Query status state machine:
/// `pending -> processing -> {completed | error | timeout}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Timeout,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Processing => "processing",
            QueryStatus::Completed => "completed",
            QueryStatus::Error => "error",
            QueryStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStatus::Completed | QueryStatus::Error | QueryStatus::Timeout
        )
    }

    /// Whether `self -> next` is a legal, forward-only transition.
    ///
    /// `pending -> error` covers failures before the gateway was engaged.
    pub fn can_transition_to(&self, next: QueryStatus) -> bool {
        matches!(
            (self, next),
            (QueryStatus::Pending, QueryStatus::Processing)
                | (QueryStatus::Pending, QueryStatus::Error)
                | (QueryStatus::Processing, QueryStatus::Completed)
                | (QueryStatus::Processing, QueryStatus::Error)
                | (QueryStatus::Processing, QueryStatus::Timeout)
        )
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for QueryStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => QueryStatus::Pending,
            "processing" => QueryStatus::Processing,
            "completed" => QueryStatus::Completed,
            "error" => QueryStatus::Error,
            "timeout" => QueryStatus::Timeout,
            _ => QueryStatus::Pending,
        }
    }
}

impl From<QueryStatus> for String {
    fn from(status: QueryStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "query_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub query_type: String,

    #[sea_orm(column_type = "Text")]
    pub query_value: String,

    #[sea_orm(column_type = "Text")]
    pub normalized_value: String,

    #[sea_orm(column_type = "Text")]
    pub bot_id: String,

    #[sea_orm(column_type = "Text")]
    pub bot_name: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub found: bool,

    pub result_count: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub result_preview: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub result_html_path: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub result_file_path: Option<String>,

    /// Audit payload: command sent, event summaries, timings
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_response: serde_json::Value,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    /// Set when the bot's reply matched none of the detection rules
    pub needs_review: bool,

    #[sea_orm(column_type = "Text")]
    pub requested_by: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    pub fn query_type(&self) -> QueryType {
        QueryType::from(self.query_type.clone())
    }

    pub fn query_status(&self) -> QueryStatus {
        QueryStatus::from(self.status.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.query_status().is_terminal()
    }

    /// Milliseconds from creation to the terminal transition
    pub fn latency_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.created_at).num_milliseconds())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Input for a new ledger entry; always created `pending`
#[derive(Debug, Clone)]
pub struct NewQueryRecord {
    pub query_type: QueryType,
    pub query_value: String,
    pub normalized_value: String,
    pub bot_id: String,
    pub bot_name: String,
    pub requested_by: String,
    pub raw_response: serde_json::Value,
}

impl NewQueryRecord {
    /// Build the initial `pending` model
    pub fn into_model(self, id: Uuid, now: DateTime<Utc>) -> Model {
        let mut query_value = self.query_value;
        if query_value.chars().count() > crate::MAX_QUERY_VALUE_LEN {
            query_value = query_value.chars().take(crate::MAX_QUERY_VALUE_LEN).collect();
        }

        Model {
            id,
            query_type: self.query_type.into(),
            query_value,
            normalized_value: self.normalized_value,
            bot_id: self.bot_id,
            bot_name: self.bot_name,
            status: QueryStatus::Pending.into(),
            found: false,
            result_count: 0,
            result_preview: None,
            result_html_path: None,
            result_file_path: None,
            raw_response: self.raw_response,
            error_message: None,
            needs_review: false,
            requested_by: self.requested_by,
            created_at: now.into(),
            updated_at: now.into(),
            completed_at: None,
        }
    }
}

/// A status transition plus the fields that change with it
#[derive(Debug, Clone)]
pub struct QueryTransition {
    pub status: QueryStatus,
    pub found: Option<bool>,
    pub result_count: Option<i32>,
    pub result_preview: Option<String>,
    pub result_html_path: Option<String>,
    pub result_file_path: Option<String>,
    pub raw_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub needs_review: Option<bool>,
}

impl QueryTransition {
    pub fn to(status: QueryStatus) -> Self {
        Self {
            status,
            found: None,
            result_count: None,
            result_preview: None,
            result_html_path: None,
            result_file_path: None,
            raw_response: None,
            error_message: None,
            needs_review: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::to(QueryStatus::Error)
        }
    }

    pub fn with_raw_response(mut self, raw: serde_json::Value) -> Self {
        self.raw_response = Some(raw);
        self
    }

    /// Check the transition against `current` without applying it
    pub fn validate(&self, current: &Model) -> crate::errors::Result<()> {
        let from = current.query_status();
        if !from.can_transition_to(self.status) {
            return Err(AppError::InvalidTransition {
                id: current.id.to_string(),
                from: from.to_string(),
                to: self.status.to_string(),
            });
        }

        let violation = |message: &str| AppError::InvariantViolation {
            id: current.id.to_string(),
            message: message.to_string(),
        };

        let found = self.found.unwrap_or(current.found);
        let count = self.result_count.unwrap_or(current.result_count);
        if count < 0 {
            return Err(violation("result_count must be non-negative"));
        }
        if found && count < 1 {
            return Err(violation("found implies result_count >= 1"));
        }
        if self.error_message.is_some() && self.status != QueryStatus::Error {
            return Err(violation("error_message is only allowed on error"));
        }
        if self.status == QueryStatus::Error && found {
            return Err(violation("an errored record cannot be found"));
        }
        if found && self.status != QueryStatus::Completed {
            return Err(violation("found is only meaningful on completed"));
        }
        Ok(())
    }

    /// Apply to a model already validated with [`QueryTransition::validate`]
    pub fn apply(self, model: &mut Model, now: DateTime<Utc>) {
        model.status = self.status.into();
        if let Some(found) = self.found {
            model.found = found;
        }
        if let Some(count) = self.result_count {
            model.result_count = count;
        }
        if self.result_preview.is_some() {
            model.result_preview = self.result_preview;
        }
        if self.result_html_path.is_some() {
            model.result_html_path = self.result_html_path;
        }
        if self.result_file_path.is_some() {
            model.result_file_path = self.result_file_path;
        }
        if let Some(raw) = self.raw_response {
            model.raw_response = raw;
        }
        if self.error_message.is_some() {
            model.error_message = self.error_message;
        }
        if let Some(review) = self.needs_review {
            model.needs_review = review;
        }
        model.updated_at = now.into();
        if self.status.is_terminal() {
            model.completed_at = Some(now.into());
        }
    }
}

/// History listing filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    pub query_type: Option<QueryType>,
    pub status: Option<QueryStatus>,
    pub found: Option<bool>,
    pub requested_by: Option<String>,
    pub bot_id: Option<String>,
    /// Substring of the original or normalized value
    pub search: Option<String>,
}

impl HistoryFilter {
    /// In-process evaluation, mirroring the SQL filter
    pub fn matches(&self, record: &Model) -> bool {
        if let Some(t) = self.query_type {
            if record.query_type != t.as_str() {
                return false;
            }
        }
        if let Some(s) = self.status {
            if record.status != s.as_str() {
                return false;
            }
        }
        if let Some(found) = self.found {
            if record.found != found {
                return false;
            }
        }
        if let Some(actor) = &self.requested_by {
            if &record.requested_by != actor {
                return false;
            }
        }
        if let Some(bot) = &self.bot_id {
            if &record.bot_id != bot {
                return false;
            }
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            if !record.query_value.to_lowercase().contains(&needle)
                && !record.normalized_value.contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Offset pagination, newest first
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_page_limit")]
    pub limit: u64,
}

pub const MAX_PAGE_LIMIT: u64 = 100;

fn default_page_limit() -> u64 {
    20
}

impl Pagination {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Limit clamped to `1..=MAX_PAGE_LIMIT`
    pub fn effective_limit(&self) -> u64 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_page_limit(),
        }
    }
}

/// Aggregate ledger statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    /// Share of completed lookups that found something
    pub found_rate: f64,
    /// Mean creation-to-terminal latency over terminal records
    pub avg_latency_ms: Option<f64>,
}

/// One `(query_type, status)` bucket of the ledger
#[derive(Debug, Clone)]
pub struct StatsGroup {
    pub query_type: String,
    pub status: String,
    pub count: u64,
    pub found: u64,
    pub avg_latency_ms: Option<f64>,
}

impl StatsGroup {
    pub fn from_record(record: &Model) -> Self {
        Self {
            query_type: record.query_type.clone(),
            status: record.status.clone(),
            count: 1,
            found: u64::from(record.found),
            avg_latency_ms: record.latency_ms().map(|ms| ms as f64),
        }
    }
}

impl LedgerStats {
    pub fn from_groups(groups: impl IntoIterator<Item = StatsGroup>) -> Self {
        let mut stats = LedgerStats::default();
        let mut completed = 0u64;
        let mut found = 0u64;
        let mut latency_total = 0.0;
        let mut latency_n = 0u64;

        for group in groups {
            stats.total += group.count;
            *stats.by_type.entry(group.query_type).or_default() += group.count;
            if group.status == QueryStatus::Completed.as_str() {
                completed += group.count;
                found += group.found;
            }
            if let Some(avg) = group.avg_latency_ms {
                latency_total += avg * group.count as f64;
                latency_n += group.count;
            }
            *stats.by_status.entry(group.status).or_default() += group.count;
        }

        if completed > 0 {
            stats.found_rate = found as f64 / completed as f64;
        }
        if latency_n > 0 {
            stats.avg_latency_ms = Some(latency_total / latency_n as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Model {
        NewQueryRecord {
            query_type: QueryType::Email,
            query_value: "a@b.io".into(),
            normalized_value: "a@b.io".into(),
            bot_id: "lookup".into(),
            bot_name: "Lookup Bot".into(),
            requested_by: "analyst".into(),
            raw_response: serde_json::json!({}),
        }
        .into_model(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn test_entity_columns_and_active_model() {
        use std::str::FromStr;

        assert!(matches!(Column::from_str("status"), Ok(Column::Status)));
        assert!(Column::from_str("tenant_id").is_err());

        let record = pending();
        let active: ActiveModel = record.clone().into();
        assert_eq!(active.id.clone().unwrap(), record.id);
        assert_eq!(active.status.clone().unwrap(), "pending");
    }

    #[test]
    fn test_status_machine_is_forward_only() {
        use QueryStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Timeout));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Timeout.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_string_round_trip_defaults() {
        assert_eq!(QueryType::from("document_id".to_string()), QueryType::DocumentId);
        assert_eq!(QueryType::from("bogus".to_string()), QueryType::Unknown);
        assert_eq!(String::from(QueryStatus::Timeout), "timeout");
    }

    #[test]
    fn test_found_requires_entries() {
        let mut record = pending();
        QueryTransition::to(QueryStatus::Processing).apply(&mut record, Utc::now());

        let bad = QueryTransition {
            found: Some(true),
            result_count: Some(0),
            ..QueryTransition::to(QueryStatus::Completed)
        };
        assert!(matches!(
            bad.validate(&record),
            Err(AppError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_error_message_only_on_error() {
        let mut record = pending();
        QueryTransition::to(QueryStatus::Processing).apply(&mut record, Utc::now());

        let bad = QueryTransition {
            error_message: Some("boom".into()),
            ..QueryTransition::to(QueryStatus::Timeout)
        };
        tokio_test::assert_err!(bad.validate(&record));
        tokio_test::assert_ok!(QueryTransition::failed("boom").validate(&record));
    }

    #[test]
    fn test_apply_sets_completed_at() {
        let mut record = pending();
        QueryTransition::to(QueryStatus::Processing).apply(&mut record, Utc::now());
        assert!(record.completed_at.is_none());

        QueryTransition::to(QueryStatus::Timeout).apply(&mut record, Utc::now());
        assert!(record.is_terminal());
        assert!(record.latency_ms().is_some());
    }

    #[test]
    fn test_long_values_are_bounded() {
        let record = NewQueryRecord {
            query_value: "x".repeat(1000),
            ..NewQueryRecord {
                query_type: QueryType::Unknown,
                query_value: String::new(),
                normalized_value: "x".into(),
                bot_id: "b".into(),
                bot_name: "B".into(),
                requested_by: "a".into(),
                raw_response: serde_json::Value::Null,
            }
        }
        .into_model(Uuid::new_v4(), Utc::now());
        assert_eq!(record.query_value.chars().count(), crate::MAX_QUERY_VALUE_LEN);
    }

    #[test]
    fn test_history_filter() {
        let record = pending();
        let by_type = HistoryFilter {
            query_type: Some(QueryType::Email),
            ..Default::default()
        };
        assert!(by_type.matches(&record));

        let by_search = HistoryFilter {
            search: Some("B.IO".into()),
            ..Default::default()
        };
        assert!(by_search.matches(&record));

        let wrong_bot = HistoryFilter {
            bot_id: Some("other".into()),
            ..Default::default()
        };
        assert!(!wrong_bot.matches(&record));
    }

    #[test]
    fn test_stats_from_groups() {
        let groups = vec![
            StatsGroup {
                query_type: "email".into(),
                status: "completed".into(),
                count: 4,
                found: 3,
                avg_latency_ms: Some(1000.0),
            },
            StatsGroup {
                query_type: "phone".into(),
                status: "timeout".into(),
                count: 1,
                found: 0,
                avg_latency_ms: Some(6000.0),
            },
            StatsGroup {
                query_type: "phone".into(),
                status: "pending".into(),
                count: 2,
                found: 0,
                avg_latency_ms: None,
            },
        ];

        let stats = LedgerStats::from_groups(groups);
        assert_eq!(stats.total, 7);
        assert_eq!(stats.by_type["phone"], 3);
        assert_eq!(stats.by_status["completed"], 4);
        assert!((stats.found_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.avg_latency_ms, Some(2000.0));
    }

    #[test]
    fn test_pagination_clamps() {
        assert_eq!(Pagination::new(0, 0).effective_limit(), 1);
        assert_eq!(Pagination::new(0, 1000).effective_limit(), MAX_PAGE_LIMIT);
    }
}
