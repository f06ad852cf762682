//! Reply collection for one correlation cycle.
//!
//! Consumes the inbound event stream until the bot's answer is complete,
//! the inactivity timer fires, the hard ceiling is reached or the transport
//! fails. Only substantive events (text, edits, files, button follow-ups)
//! reset the inactivity timer; typing and progress messages never do.

use crate::bots::{DetectionRules, TextVerdict};
use crate::errors::GatewayError;
use crate::session::{Attachment, EventItem, InboundEvent};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use intelforge_common::config::LookupConfig;
use intelforge_common::metrics;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

const EXCERPT_LEN: usize = 120;

/// Entries of each kind kept in a reply summary
const SUMMARY_ENTRIES: usize = 20;

/// Side effects the collector may trigger while a cycle is live
#[async_trait]
pub trait ReplyActions: Send + Sync {
    async fn press_button(&self, message_id: i64, label: &str) -> Result<(), GatewayError>;
}

/// For cycles that never press buttons
pub struct NoActions;

#[async_trait]
impl ReplyActions for NoActions {
    async fn press_button(&self, _message_id: i64, _label: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    pub idle: Duration,
    pub max_wait: Duration,
    pub settle: Duration,
}

impl From<&LookupConfig> for CycleTiming {
    fn from(config: &LookupConfig) -> Self {
        Self {
            idle: config.idle_timeout(),
            max_wait: config.max_wait(),
            settle: config.settle(),
        }
    }
}

/// Audit trail entry for one inbound event
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub kind: &'static str,
    pub at_ms: u64,
    pub disposition: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplyText {
    pub message_id: i64,
    pub text: String,
}

/// Everything gathered during a cycle
#[derive(Debug, Clone, Default)]
pub struct CollectedReply {
    /// Result and not-found texts, edits replacing their original
    pub result_texts: Vec<ReplyText>,
    pub attachments: Vec<Attachment>,
    pub not_found: bool,
    /// Substantive texts no detection rule recognized
    pub unrecognized: Vec<String>,
    pub buttons_pressed: Vec<String>,
    pub events: Vec<EventRecord>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentSummary {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: usize,
}

/// Bounded view of a reply for the ledger's `raw_response`. Full content
/// lives in the artifact store, never inline.
#[derive(Debug, Clone, Serialize)]
pub struct ReplySummary {
    pub texts: usize,
    pub excerpts: Vec<String>,
    pub not_found: bool,
    pub unrecognized: Vec<String>,
    pub unrecognized_total: usize,
    pub attachments: Vec<AttachmentSummary>,
    pub buttons_pressed: Vec<String>,
    pub events: Vec<EventRecord>,
    pub events_total: usize,
    pub elapsed_ms: u64,
}

impl CollectedReply {
    /// Summary with every text clipped to `excerpt_limit` characters
    pub fn summary(&self, excerpt_limit: usize) -> ReplySummary {
        let clip = |text: &str| text.chars().take(excerpt_limit).collect::<String>();
        ReplySummary {
            texts: self.result_texts.len(),
            excerpts: self
                .result_texts
                .iter()
                .take(SUMMARY_ENTRIES)
                .map(|t| clip(&t.text))
                .collect(),
            not_found: self.not_found,
            unrecognized: self
                .unrecognized
                .iter()
                .take(SUMMARY_ENTRIES)
                .map(|t| clip(t))
                .collect(),
            unrecognized_total: self.unrecognized.len(),
            attachments: self
                .attachments
                .iter()
                .take(SUMMARY_ENTRIES)
                .map(|a| AttachmentSummary {
                    file_name: clip(&a.file_name),
                    mime_type: a.mime_type.clone(),
                    bytes: a.bytes.len(),
                })
                .collect(),
            buttons_pressed: self.buttons_pressed.clone(),
            events: self.events.iter().take(SUMMARY_ENTRIES).cloned().collect(),
            events_total: self.events.len(),
            elapsed_ms: self.elapsed_ms,
        }
    }

    pub fn has_answer(&self) -> bool {
        self.not_found || !self.result_texts.is_empty() || !self.attachments.is_empty()
    }

    /// All result text joined in arrival order
    pub fn joined_text(&self) -> String {
        self.result_texts
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn upsert_text(&mut self, message_id: i64, text: &str) {
        match self.result_texts.iter_mut().find(|t| t.message_id == message_id) {
            Some(existing) => existing.text = text.to_string(),
            None => self.result_texts.push(ReplyText {
                message_id,
                text: text.to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum CollectOutcome {
    Resolved(CollectedReply),
    TimedOut {
        reply: CollectedReply,
        /// The hard ceiling fired rather than the inactivity timer
        ceiling_hit: bool,
    },
    Failed {
        reply: CollectedReply,
        error: GatewayError,
    },
}

impl CollectOutcome {
    pub fn reply(&self) -> &CollectedReply {
        match self {
            CollectOutcome::Resolved(reply)
            | CollectOutcome::TimedOut { reply, .. }
            | CollectOutcome::Failed { reply, .. } => reply,
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_LEN).collect()
}

pub struct ReplyCollector<'a> {
    rules: &'a DetectionRules,
    timing: CycleTiming,
}

impl<'a> ReplyCollector<'a> {
    pub fn new(rules: &'a DetectionRules, timing: CycleTiming) -> Self {
        Self { rules, timing }
    }

    pub async fn collect<S, A>(&self, events: &mut S, actions: &A) -> CollectOutcome
    where
        S: Stream<Item = EventItem> + Unpin + Send,
        A: ReplyActions + ?Sized,
    {
        let started = Instant::now();
        let ceiling = started + self.timing.max_wait;
        let mut idle_deadline = (started + self.timing.idle).min(ceiling);
        let mut settle_deadline: Option<Instant> = None;
        let mut awaiting_followup = false;
        let mut reply = CollectedReply::default();

        let finish = |mut reply: CollectedReply| {
            reply.elapsed_ms = started.elapsed().as_millis() as u64;
            reply
        };

        loop {
            let deadline = match settle_deadline {
                Some(settle) => settle.min(ceiling),
                None => idle_deadline,
            };

            let item = match timeout_at(deadline, events.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    if reply.has_answer() {
                        return CollectOutcome::Resolved(finish(reply));
                    }
                    return CollectOutcome::Failed {
                        reply: finish(reply),
                        error: GatewayError::Closed,
                    };
                }
                Err(_) => {
                    if reply.has_answer() {
                        return CollectOutcome::Resolved(finish(reply));
                    }
                    return CollectOutcome::TimedOut {
                        ceiling_hit: deadline >= ceiling,
                        reply: finish(reply),
                    };
                }
            };

            let event = match item {
                Ok(event) => event,
                Err(error) if reply.has_answer() => {
                    warn!(error = %error, "Transport error after answer, keeping reply");
                    return CollectOutcome::Resolved(finish(reply));
                }
                Err(error) => {
                    return CollectOutcome::Failed {
                        reply: finish(reply),
                        error,
                    }
                }
            };

            let at_ms = started.elapsed().as_millis() as u64;
            let kind = event.kind();
            let (disposition, text_excerpt, substantive, terminal) = match event {
                InboundEvent::Typing => ("progress", None, false, false),

                InboundEvent::Text {
                    message_id,
                    text,
                    buttons,
                }
                | InboundEvent::Edited {
                    message_id,
                    text,
                    buttons,
                } => {
                    let verdict = self.rules.judge_text(&text);
                    let mut pressed = false;
                    if verdict != TextVerdict::Progress {
                        if let Some(label) = self.rules.button_to_follow(&buttons) {
                            if !reply.buttons_pressed.iter().any(|p| p == label) {
                                debug!(label, message_id, "Following reply button");
                                match timeout_at(ceiling, actions.press_button(message_id, label))
                                    .await
                                {
                                    Ok(Ok(())) => {}
                                    Ok(Err(error)) => {
                                        return CollectOutcome::Failed {
                                            reply: finish(reply),
                                            error,
                                        }
                                    }
                                    Err(_) => {
                                        warn!(label, "Button press still pending at the cycle ceiling");
                                        if verdict == TextVerdict::Result {
                                            reply.upsert_text(message_id, &text);
                                        }
                                        if reply.has_answer() {
                                            return CollectOutcome::Resolved(finish(reply));
                                        }
                                        return CollectOutcome::TimedOut {
                                            ceiling_hit: true,
                                            reply: finish(reply),
                                        };
                                    }
                                }
                                reply.buttons_pressed.push(label.to_string());
                                pressed = true;
                            }
                        }
                    }

                    match verdict {
                        TextVerdict::NotFound => {
                            reply.not_found = true;
                            reply.upsert_text(message_id, &text);
                            reply.events.push(EventRecord {
                                kind,
                                at_ms,
                                disposition: "terminal",
                                excerpt: Some(excerpt(&text)),
                            });
                            metrics::record_inbound_event(kind, "terminal");
                            return CollectOutcome::Resolved(finish(reply));
                        }
                        TextVerdict::Result => {
                            reply.upsert_text(message_id, &text);
                            awaiting_followup |= pressed;
                            ("terminal", Some(excerpt(&text)), true, !awaiting_followup)
                        }
                        TextVerdict::Progress => ("progress", Some(excerpt(&text)), false, false),
                        TextVerdict::Unrecognized => {
                            if pressed {
                                awaiting_followup = true;
                            } else {
                                reply.unrecognized.push(text.clone());
                            }
                            ("partial", Some(excerpt(&text)), true, false)
                        }
                    }
                }

                InboundEvent::File {
                    message_id,
                    attachment,
                    caption,
                } => {
                    if let Some(caption) = caption.filter(|c| !c.trim().is_empty()) {
                        reply.upsert_text(message_id, &caption);
                    }
                    let name = attachment.file_name.clone();
                    reply.attachments.push(attachment);
                    awaiting_followup = false;
                    ("terminal", Some(name), true, true)
                }
            };

            metrics::record_inbound_event(kind, disposition);
            debug!(kind, disposition, at_ms, "Inbound event");
            reply.events.push(EventRecord {
                kind,
                at_ms,
                disposition,
                excerpt: text_excerpt,
            });

            let now = Instant::now();
            if substantive {
                idle_deadline = (now + self.timing.idle).min(ceiling);
            }
            if terminal || (settle_deadline.is_some() && substantive && !awaiting_followup) {
                settle_deadline = Some(now + self.timing.settle);
            } else if awaiting_followup {
                settle_deadline = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotRegistry;
    use futures::stream;
    use intelforge_common::AppConfig;
    use std::sync::Mutex;

    fn rules() -> DetectionRules {
        let mut bots = AppConfig::default().bots;
        bots[0].detection.follow_buttons = vec!["download html".into()];
        BotRegistry::from_config(&bots)
            .unwrap()
            .resolve(None)
            .unwrap()
            .rules
            .clone()
    }

    fn timing() -> CycleTiming {
        CycleTiming {
            idle: Duration::from_millis(200),
            max_wait: Duration::from_millis(600),
            settle: Duration::from_millis(30),
        }
    }

    fn text(id: i64, s: &str) -> EventItem {
        Ok(InboundEvent::Text {
            message_id: id,
            text: s.into(),
            buttons: vec![],
        })
    }

    /// Events first, then a stream that never ends
    fn open_stream(items: Vec<EventItem>) -> impl Stream<Item = EventItem> + Unpin + Send {
        stream::iter(items).chain(stream::pending())
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ReplyActions for Recorder {
        async fn press_button(&self, _id: i64, label: &str) -> Result<(), GatewayError> {
            self.0.lock().unwrap().push(label.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_summary_is_bounded() {
        let reply = CollectedReply {
            result_texts: (0..50)
                .map(|n| ReplyText {
                    message_id: n,
                    text: "x".repeat(5_000),
                })
                .collect(),
            unrecognized: vec!["menu ".repeat(400)],
            attachments: vec![Attachment {
                file_name: "dump.csv".into(),
                mime_type: "text/csv".into(),
                bytes: vec![b'a'; 100_000],
            }],
            ..Default::default()
        };

        let summary = reply.summary(64);
        assert_eq!(summary.texts, 50);
        assert_eq!(summary.excerpts.len(), SUMMARY_ENTRIES);
        assert!(summary.excerpts.iter().all(|e| e.chars().count() == 64));
        assert_eq!(summary.unrecognized[0].chars().count(), 64);
        assert_eq!(summary.attachments[0].bytes, 100_000);
        assert!(serde_json::to_string(&summary).unwrap().len() < 4_000);
    }

    #[tokio::test]
    async fn test_not_found_resolves_immediately() {
        let rules = rules();
        let mut events = open_stream(vec![text(1, "No results found")]);
        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;

        match outcome {
            CollectOutcome::Resolved(reply) => {
                assert!(reply.not_found);
                assert!(reply.elapsed_ms < 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let rules = rules();
        let mut events = open_stream(vec![]);
        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;
        assert!(matches!(
            outcome,
            CollectOutcome::TimedOut {
                ceiling_hit: false,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_does_not_extend_wait() {
        let rules = rules();
        let typing = stream::unfold((), |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Some((Ok(InboundEvent::Typing), ()))
        });
        let mut events = Box::pin(typing);
        let started = Instant::now();

        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;

        assert!(matches!(outcome, CollectOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_bounds_streaming_partials() {
        let rules = rules();
        let chatter = stream::unfold(0i64, |n| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some((text(n, "still here, more soon"), n + 1))
        });
        let mut events = Box::pin(chatter);

        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;

        match outcome {
            CollectOutcome::TimedOut { reply, ceiling_hit } => {
                assert!(ceiling_hit);
                assert!(!reply.unrecognized.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_then_file_within_settle_window() {
        let rules = rules();
        let mut events = open_stream(vec![
            Ok(InboundEvent::Typing),
            text(1, "Results:\n1. first\n2. second"),
            Ok(InboundEvent::File {
                message_id: 2,
                attachment: Attachment {
                    file_name: "r.html".into(),
                    mime_type: "text/html".into(),
                    bytes: b"<html></html>".to_vec(),
                },
                caption: None,
            }),
        ]);

        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;

        match outcome {
            CollectOutcome::Resolved(reply) => {
                assert_eq!(reply.result_texts.len(), 1);
                assert_eq!(reply.attachments.len(), 1);
                assert_eq!(reply.events.len(), 3);
                assert_eq!(reply.events[0].disposition, "progress");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_edit_replaces_text() {
        let rules = rules();
        let mut events = open_stream(vec![
            text(7, "Searching..."),
            Ok(InboundEvent::Edited {
                message_id: 7,
                text: "Results:\n1. only".into(),
                buttons: vec![],
            }),
        ]);

        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;
        let reply = outcome.reply();
        assert_eq!(reply.result_texts.len(), 1);
        assert_eq!(reply.result_texts[0].text, "Results:\n1. only");
    }

    #[tokio::test]
    async fn test_follow_button_waits_for_file() {
        let rules = rules();
        let actions = Recorder::default();
        let items = vec![
            Ok(InboundEvent::Text {
                message_id: 1,
                text: "Results:\n1. one".into(),
                buttons: vec!["Download HTML".into()],
            }),
        ];
        let file = stream::once(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(InboundEvent::File {
                message_id: 2,
                attachment: Attachment {
                    file_name: "full.html".into(),
                    mime_type: "text/html".into(),
                    bytes: b"<html>1</html>".to_vec(),
                },
                caption: None,
            })
        });
        let mut events = Box::pin(stream::iter(items).chain(file).chain(stream::pending()));

        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &actions)
            .await;

        assert_eq!(*actions.0.lock().unwrap(), vec!["Download HTML".to_string()]);
        match outcome {
            CollectOutcome::Resolved(reply) => assert_eq!(reply.attachments.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    struct Stalled;

    #[async_trait]
    impl ReplyActions for Stalled {
        async fn press_button(&self, _id: i64, _label: &str) -> Result<(), GatewayError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_button_press_stops_at_ceiling() {
        let rules = rules();
        let mut events = open_stream(vec![Ok(InboundEvent::Text {
            message_id: 1,
            text: "Results:\n1. one".into(),
            buttons: vec!["Download HTML".into()],
        })]);
        let started = Instant::now();

        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &Stalled)
            .await;

        assert!(started.elapsed() <= timing().max_wait + Duration::from_millis(5));
        match outcome {
            CollectOutcome::Resolved(reply) => {
                assert_eq!(reply.result_texts.len(), 1);
                assert_eq!(reply.buttons_pressed.len(), 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_fails_cycle() {
        let rules = rules();
        let mut events = open_stream(vec![Err(GatewayError::Network("reset".into()))]);
        let outcome = ReplyCollector::new(&rules, timing())
            .collect(&mut events, &NoActions)
            .await;
        assert!(matches!(
            outcome,
            CollectOutcome::Failed {
                error: GatewayError::Network(_),
                ..
            }
        ));
    }
}
