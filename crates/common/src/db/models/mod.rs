//! SeaORM entity models
//!
//! Database entities for the lookup ledger

mod query_record;

pub use query_record::{
    Entity as QueryRecordEntity,
    Model as QueryRecord,
    ActiveModel as QueryRecordActiveModel,
    Column as QueryRecordColumn,
    HistoryFilter,
    LedgerStats,
    NewQueryRecord,
    Pagination,
    QueryStatus,
    QueryTransition,
    QueryType,
    StatsGroup,
    MAX_PAGE_LIMIT,
};
