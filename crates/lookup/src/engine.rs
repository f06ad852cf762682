//! Correlation engine
//!
//! Drives one query record from `pending` to a terminal status:
//!
//! ```text
//! Created -> AwaitingGateway -> Sent -> Collecting -> Resolved | TimedOut | Failed
//! ```
//!
//! Cycles run on their own task, so a caller that stops waiting never
//! abandons a command already sent to the bot. Gateway and bot failures end
//! up in the record's terminal status; only ledger failures are returned.

use crate::bots::{BotProfile, BotRegistry, BotSummary};
use crate::classifier::{classify, Classification};
use crate::collector::{CollectOutcome, CycleTiming, ReplyActions, ReplyCollector};
use crate::errors::{GatewayError, LookupError, Result};
use crate::ledger::QueryLedger;
use crate::materializer::{
    content_type_for, ArtifactKind, FsArtifactStore, Materialized, ResultMaterializer,
};
use crate::session::{SessionGateway, SessionLease};
use async_trait::async_trait;
use chrono::Utc;
use intelforge_common::config::LookupConfig;
use intelforge_common::db::models::{
    HistoryFilter, LedgerStats, NewQueryRecord, Pagination, QueryRecord, QueryStatus,
    QueryTransition,
};
use intelforge_common::errors::AppError;
use intelforge_common::AppConfig;
use intelforge_common::metrics;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A lookup as submitted by a caller
#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub value: String,
    pub bot_id: Option<String>,
    pub requested_by: String,
    /// Skip ledger reuse and always ask the bot
    pub force_refresh: bool,
}

impl LookupRequest {
    pub fn new(value: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            bot_id: None,
            requested_by: requested_by.into(),
            force_refresh: false,
        }
    }
}

/// Result of a submission with a wait budget
#[derive(Debug, Clone)]
pub enum Submission {
    /// The cycle reached a terminal status inside the budget
    Finished(QueryRecord),
    /// Still queued or collecting; the cycle keeps running
    Running(QueryRecord),
}

impl Submission {
    pub fn record(&self) -> &QueryRecord {
        match self {
            Submission::Finished(r) | Submission::Running(r) => r,
        }
    }
}

/// Artifact bytes ready to serve
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

struct Plan {
    classification: Classification,
    bot: Arc<BotProfile>,
    force_refresh: bool,
}

/// How a cycle ended, before it is written to the ledger
enum CycleResult {
    /// Failed before the command was delivered
    NotSent(LookupError),
    Collected(CollectOutcome),
}

struct LeaseActions<'a> {
    lease: &'a SessionLease,
    contact: &'a str,
}

#[async_trait]
impl ReplyActions for LeaseActions<'_> {
    async fn press_button(&self, message_id: i64, label: &str) -> std::result::Result<(), GatewayError> {
        self.lease.press_button(self.contact, message_id, label).await
    }
}

struct EngineInner {
    gateway: Arc<SessionGateway>,
    ledger: Arc<dyn QueryLedger>,
    bots: BotRegistry,
    materializer: ResultMaterializer,
    timing: CycleTiming,
    reuse_window: Option<chrono::Duration>,
    finished: broadcast::Sender<Uuid>,
}

/// Cheap to clone; all clones share one gateway and ledger
#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<EngineInner>,
}

impl CorrelationEngine {
    pub fn new(
        gateway: Arc<SessionGateway>,
        ledger: Arc<dyn QueryLedger>,
        bots: BotRegistry,
        materializer: ResultMaterializer,
        config: &LookupConfig,
    ) -> Self {
        let (finished, _) = broadcast::channel(256);
        let reuse_window = (config.reuse_window_secs > 0)
            .then(|| chrono::Duration::seconds(config.reuse_window_secs as i64));

        Self {
            inner: Arc::new(EngineInner {
                gateway,
                ledger,
                bots,
                materializer,
                timing: CycleTiming::from(config),
                reuse_window,
                finished,
            }),
        }
    }

    /// Wire bots and the filesystem artifact store from configuration
    pub fn from_config(
        config: &AppConfig,
        gateway: Arc<SessionGateway>,
        ledger: Arc<dyn QueryLedger>,
    ) -> Result<Self> {
        let bots = BotRegistry::from_config(&config.bots)?;
        let store = Arc::new(FsArtifactStore::new(&config.artifacts.root));
        let materializer = ResultMaterializer::new(store, config.lookup.preview_limit);
        Ok(Self::new(gateway, ledger, bots, materializer, &config.lookup))
    }

    pub fn gateway(&self) -> &Arc<SessionGateway> {
        &self.inner.gateway
    }

    pub fn ledger(&self) -> &Arc<dyn QueryLedger> {
        &self.inner.ledger
    }

    pub fn bots(&self) -> Vec<BotSummary> {
        self.inner.bots.summaries()
    }

    /// Classification preview; creates no record
    pub fn classify(&self, raw: &str) -> Classification {
        classify(raw)
    }

    /// Create the record and start the cycle in the background.
    /// Returns the record as created (`pending`).
    pub async fn submit(&self, request: LookupRequest) -> Result<QueryRecord> {
        let (record, plan) = self.accept(request).await?;
        self.spawn_cycle(record.clone(), plan);
        Ok(record)
    }

    /// Create the record and wait for its terminal status
    pub async fn run(&self, request: LookupRequest) -> Result<QueryRecord> {
        let (record, plan) = self.accept(request).await?;
        self.spawn_cycle(record, plan).await.map_err(|e| {
            LookupError::Ledger(AppError::Internal {
                message: format!("lookup task failed: {}", e),
            })
        })?
    }

    /// Submit and wait up to `budget` for the terminal status
    pub async fn submit_and_wait(
        &self,
        request: LookupRequest,
        budget: Duration,
    ) -> Result<Submission> {
        let record = self.submit(request).await?;
        match self.wait_for(record.id, budget).await {
            Ok(done) => Ok(Submission::Finished(done)),
            Err(LookupError::GatewayBusyTimeout { waited_ms }) => {
                debug!(query_id = %record.id, waited_ms, "Wait budget exhausted, lookup continues");
                let current = self.inner.ledger.get(record.id).await?.unwrap_or(record);
                Ok(Submission::Running(current))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for a record to reach a terminal status.
    ///
    /// Fails with `GatewayBusyTimeout` when `budget` runs out first; the
    /// cycle itself is not affected.
    pub async fn wait_for(&self, id: Uuid, budget: Duration) -> Result<QueryRecord> {
        let started = Instant::now();
        let mut finished = self.inner.finished.subscribe();
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let record = self
                .inner
                .ledger
                .get(id)
                .await?
                .ok_or_else(|| AppError::QueryNotFound { id: id.to_string() })?;
            if record.is_terminal() {
                return Ok(record);
            }

            loop {
                match tokio::time::timeout_at(deadline, finished.recv()).await {
                    Err(_) => {
                        return Err(LookupError::GatewayBusyTimeout {
                            waited_ms: started.elapsed().as_millis() as u64,
                        })
                    }
                    Ok(Ok(done)) if done != id => continue,
                    // Ours, lagged or closed: re-read the ledger
                    Ok(_) => break,
                }
            }
        }
    }

    pub async fn get_query(&self, id: Uuid) -> Result<QueryRecord> {
        Ok(self
            .inner
            .ledger
            .get(id)
            .await?
            .ok_or_else(|| AppError::QueryNotFound { id: id.to_string() })?)
    }

    pub async fn list_history(
        &self,
        filter: &HistoryFilter,
        page: Pagination,
    ) -> Result<(Vec<QueryRecord>, u64)> {
        Ok(self.inner.ledger.list(filter, page).await?)
    }

    pub async fn get_stats(&self) -> Result<LedgerStats> {
        Ok(self.inner.ledger.stats().await?)
    }

    pub async fn get_artifact(&self, id: Uuid, kind: ArtifactKind) -> Result<Artifact> {
        let record = self.get_query(id).await?;
        let missing = || AppError::ArtifactNotFound {
            id: id.to_string(),
            kind: kind.as_str().to_string(),
        };

        let key = match kind {
            ArtifactKind::Html => record.result_html_path,
            ArtifactKind::File => record.result_file_path,
        }
        .ok_or_else(missing)?;
        let bytes = self.inner.materializer.open(&key).await?.ok_or_else(missing)?;

        Ok(Artifact {
            bytes,
            content_type: content_type_for(&key),
            file_name: key.rsplit('/').next().unwrap_or(&key).to_string(),
        })
    }

    /// Classify, pick the bot and write the `pending` record
    async fn accept(&self, request: LookupRequest) -> Result<(QueryRecord, Plan)> {
        let bot = self.inner.bots.resolve(request.bot_id.as_deref())?;
        let classification = classify(&request.value);

        if classification.is_ambiguous() {
            let ambiguity = LookupError::ClassificationAmbiguous {
                chosen: classification.query_type,
                alternatives: classification.alternatives.clone(),
            };
            info!(error = %ambiguity, "Proceeding with highest-priority classification");
        }

        let record = self
            .inner
            .ledger
            .create(NewQueryRecord {
                query_type: classification.query_type,
                query_value: request.value.trim().to_string(),
                normalized_value: classification.normalized.clone(),
                bot_id: bot.id.clone(),
                bot_name: bot.name.clone(),
                requested_by: request.requested_by,
                raw_response: json!({ "alternatives": classification.alternatives }),
            })
            .await?;

        metrics::record_lookup_started(classification.query_type.as_str(), &bot.id);
        info!(
            query_id = %record.id,
            query_type = %classification.query_type,
            bot_id = %bot.id,
            "Lookup accepted"
        );

        Ok((
            record,
            Plan {
                classification,
                bot,
                force_refresh: request.force_refresh,
            },
        ))
    }

    fn spawn_cycle(
        &self,
        record: QueryRecord,
        plan: Plan,
    ) -> tokio::task::JoinHandle<Result<QueryRecord>> {
        let engine = self.clone();
        tokio::spawn(async move {
            let id = record.id;
            let result = engine.run_cycle(record, plan).await;
            if let Err(ref e) = result {
                error!(query_id = %id, error = %e, "Lookup cycle could not be recorded");
                engine.record_unfinished(id, e).await;
            }
            let _ = engine.inner.finished.send(id);
            result
        })
    }

    #[instrument(
        skip(self, record, plan),
        fields(
            query_id = %record.id,
            query_type = %plan.classification.query_type,
            bot_id = %plan.bot.id
        )
    )]
    async fn run_cycle(&self, record: QueryRecord, plan: Plan) -> Result<QueryRecord> {
        if let Some(previous) = self.reusable(&plan).await? {
            return self.complete_from(record, &previous).await;
        }

        // AwaitingGateway
        let lease = self.inner.gateway.acquire().await;
        let queued_ms = lease.queued_for().as_millis() as u64;
        let command = plan
            .bot
            .command_for(plan.classification.query_type, &plan.classification.normalized);

        let record = self
            .inner
            .ledger
            .transition(
                record.id,
                QueryTransition::to(QueryStatus::Processing).with_raw_response(json!({
                    "command": command,
                    "contact": plan.bot.contact,
                    "queued_ms": queued_ms,
                    "alternatives": plan.classification.alternatives,
                })),
            )
            .await?;
        info!(queued_ms, "Gateway acquired, lookup processing");

        let cycle = self.correlate(&lease, &plan.bot, &command).await;
        lease.release();

        self.finish(record, &plan, &command, queued_ms, cycle).await
    }

    /// Sent + Collecting, under the caller's lease
    async fn correlate(&self, lease: &SessionLease, bot: &BotProfile, command: &str) -> CycleResult {
        if let Err(e) = lease.ensure_connected().await {
            return CycleResult::NotSent(e.into());
        }

        // The ceiling covers the send as well as the collection
        let ceiling = tokio::time::Instant::now() + self.inner.timing.max_wait;

        // Subscribe first: replies are not buffered for late subscribers
        let mut events = lease.events(&bot.contact);
        let sent = match tokio::time::timeout_at(ceiling, lease.send(&bot.contact, command)).await {
            Ok(sent) => sent,
            Err(_) => Err(GatewayError::Network(format!(
                "send did not complete within {}ms",
                self.inner.timing.max_wait.as_millis()
            ))),
        };
        if let Err(e) = sent {
            warn!(error = %e, "Command send failed");
            return CycleResult::NotSent(e.into());
        }
        debug!("Command sent, collecting reply");

        let actions = LeaseActions {
            lease,
            contact: &bot.contact,
        };
        let timing = CycleTiming {
            max_wait: ceiling.saturating_duration_since(tokio::time::Instant::now()),
            ..self.inner.timing
        };
        let outcome = ReplyCollector::new(&bot.rules, timing)
            .collect(&mut events, &actions)
            .await;

        if let CollectOutcome::Failed { error, .. } = &outcome {
            lease.session_lost(error);
        }
        CycleResult::Collected(outcome)
    }

    /// Write the terminal status for a finished cycle
    async fn finish(
        &self,
        record: QueryRecord,
        plan: &Plan,
        command: &str,
        queued_ms: u64,
        cycle: CycleResult,
    ) -> Result<QueryRecord> {
        let bot = &plan.bot;
        let excerpt_limit = self.inner.materializer.preview_limit();
        let transition = match cycle {
            CycleResult::NotSent(e) => QueryTransition::failed(e.to_string()).with_raw_response(
                json!({
                    "command": command,
                    "queued_ms": queued_ms,
                    "stage": "send",
                    "error": e.to_string(),
                }),
            ),

            CycleResult::Collected(CollectOutcome::Resolved(reply)) => {
                let mut raw = json!({
                    "command": command,
                    "queued_ms": queued_ms,
                    "reply": reply.summary(excerpt_limit),
                });
                let summary = match self
                    .inner
                    .materializer
                    .materialize(record.id, &reply, &bot.rules)
                    .await
                {
                    Ok(materialized) => {
                        raw["artifacts"] = json!(materialized.artifacts);
                        materialized
                    }
                    Err(e) => {
                        let failure = match e {
                            LookupError::MaterializationError(_) => e,
                            other => LookupError::MaterializationError(other.to_string()),
                        };
                        warn!(error = %failure, "Reply resolved but artifacts were not stored");
                        metrics::record_materialization_failure();
                        raw["materialization_error"] = json!(failure.to_string());
                        Materialized::unstored(&reply, &bot.rules, excerpt_limit)
                    }
                };

                QueryTransition {
                    found: Some(summary.found),
                    result_count: Some(summary.result_count),
                    result_preview: Some(summary.preview),
                    result_html_path: summary.html_path,
                    result_file_path: summary.file_path,
                    raw_response: Some(raw),
                    ..QueryTransition::to(QueryStatus::Completed)
                }
            }

            CycleResult::Collected(CollectOutcome::TimedOut { reply, ceiling_hit }) => {
                let timeout = LookupError::BotTimeout {
                    waited_ms: reply.elapsed_ms,
                };
                let needs_review = !reply.unrecognized.is_empty();
                if needs_review {
                    warn!(
                        unrecognized = reply.unrecognized.len(),
                        "Bot replied but no detection rule matched; flagged for review"
                    );
                    metrics::record_review_flag(&bot.id);
                }

                QueryTransition {
                    needs_review: Some(needs_review),
                    raw_response: Some(json!({
                        "command": command,
                        "queued_ms": queued_ms,
                        "reason": timeout.to_string(),
                        "ceiling_hit": ceiling_hit,
                        "reply": reply.summary(excerpt_limit),
                    })),
                    ..QueryTransition::to(QueryStatus::Timeout)
                }
            }

            CycleResult::Collected(CollectOutcome::Failed { reply, error }) => {
                let failure = LookupError::from(error);
                QueryTransition::failed(failure.to_string()).with_raw_response(json!({
                    "command": command,
                    "queued_ms": queued_ms,
                    "stage": "collect",
                    "reply": reply.summary(excerpt_limit),
                }))
            }
        };

        let done = self.inner.ledger.transition(record.id, transition).await?;
        self.record_finished(&done);
        Ok(done)
    }

    async fn reusable(&self, plan: &Plan) -> Result<Option<QueryRecord>> {
        let Some(window) = self.inner.reuse_window else {
            return Ok(None);
        };
        if plan.force_refresh {
            return Ok(None);
        }

        Ok(self
            .inner
            .ledger
            .find_reusable(
                plan.classification.query_type,
                &plan.classification.normalized,
                &plan.bot.id,
                Utc::now() - window,
            )
            .await?)
    }

    /// Answer from a recent completed record without engaging the bot
    async fn complete_from(&self, record: QueryRecord, previous: &QueryRecord) -> Result<QueryRecord> {
        info!(reused_from = %previous.id, "Reusing recent lookup result");
        metrics::record_lookup_reused(&previous.query_type);

        self.inner
            .ledger
            .transition(record.id, QueryTransition::to(QueryStatus::Processing))
            .await?;

        let done = self
            .inner
            .ledger
            .transition(
                record.id,
                QueryTransition {
                    found: Some(previous.found),
                    result_count: Some(previous.result_count),
                    result_preview: previous.result_preview.clone(),
                    result_html_path: previous.result_html_path.clone(),
                    result_file_path: previous.result_file_path.clone(),
                    raw_response: Some(json!({ "reused_from": previous.id })),
                    ..QueryTransition::to(QueryStatus::Completed)
                },
            )
            .await?;
        self.record_finished(&done);
        Ok(done)
    }

    /// Best-effort `error` status for a cycle whose own ledger writes
    /// failed, so the record never stays `pending` or `processing`
    async fn record_unfinished(&self, id: Uuid, cause: &LookupError) {
        let message = format!("ledger write failed: {}", cause);
        let transition = QueryTransition::failed(message.clone())
            .with_raw_response(json!({ "stage": "ledger", "error": message }));

        match self.inner.ledger.transition(id, transition).await {
            Ok(done) => self.record_finished(&done),
            Err(e) => error!(
                query_id = %id,
                error = %e,
                "Could not mark lookup as failed; record left unfinished"
            ),
        }
    }

    fn record_finished(&self, record: &QueryRecord) {
        let latency_secs = record.latency_ms().unwrap_or(0) as f64 / 1000.0;
        metrics::record_lookup_finished(&record.query_type, &record.status, latency_secs);
        info!(
            status = %record.status,
            found = record.found,
            result_count = record.result_count,
            "Lookup finished"
        );
    }
}
